//! # Beacon Engine
//!
//! Periodic transmitter: an immediate tick on start, then one tick every
//! interval. A tick transmits the configured message fire-and-log style;
//! errors never stop the loop. The next tick is scheduled only after the
//! transmit call returns, so ticks cannot overlap even when a TX runs
//! long. `tx_count` counts submissions; failed submissions additionally
//! count in `tx_fail_count`.

use crate::config;
use crate::error::ResponderError;
use crate::event_log::EventSink;
use crate::radio::facade::FacadeHandle;
use crate::radio::{Reply, TxOutcome};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Overrides for [`BeaconHandle::start`]; unset fields keep their
/// previous values.
#[derive(Debug, Clone, Default)]
pub struct BeaconOptions {
    pub message: Option<Vec<u8>>,
    pub interval_ms: Option<u64>,
}

/// Snapshot of the beacon state.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconStats {
    pub running: bool,
    pub message: Vec<u8>,
    pub interval_ms: u64,
    pub tx_count: u64,
    pub tx_fail_count: u64,
}

enum BeaconMsg {
    Start { opts: BeaconOptions, reply: Reply<()> },
    Stop { reply: Reply<()> },
    Stats { reply: Reply<BeaconStats> },
    Tick(u64),
}

/// Cloneable handle to the beacon actor.
#[derive(Clone)]
pub struct BeaconHandle {
    tx: mpsc::UnboundedSender<BeaconMsg>,
}

impl BeaconHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> BeaconMsg,
    ) -> Result<T, ResponderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ResponderError::NotConnected)?;
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResponderError::NotConnected),
            Err(_) => Err(ResponderError::Timeout("beacon call")),
        }
    }

    /// Start beaconing. Fails with `AlreadyRunning` if already started.
    pub async fn start(&self, opts: BeaconOptions) -> Result<(), ResponderError> {
        self.call(|reply| BeaconMsg::Start { opts, reply }).await
    }

    /// Stop beaconing. Idempotent.
    pub async fn stop(&self) -> Result<(), ResponderError> {
        self.call(|reply| BeaconMsg::Stop { reply }).await
    }

    pub async fn stats(&self) -> Result<BeaconStats, ResponderError> {
        self.call(|reply| BeaconMsg::Stats { reply }).await
    }
}

/// The beacon actor.
pub struct BeaconEngine {
    facade: FacadeHandle,
    sink: Arc<dyn EventSink>,
    inbox: mpsc::UnboundedReceiver<BeaconMsg>,
    self_tx: mpsc::UnboundedSender<BeaconMsg>,
    running: bool,
    message: Vec<u8>,
    interval: Duration,
    tx_count: u64,
    tx_fail_count: u64,
    /// Ticks carry the generation they were scheduled in; stale ones no-op.
    tick_id: u64,
}

impl BeaconEngine {
    /// Start the actor in the stopped state, seeded from configuration.
    pub fn spawn(facade: FacadeHandle, sink: Arc<dyn EventSink>) -> BeaconHandle {
        let defaults = &config::global().beacon;
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = BeaconEngine {
            facade,
            sink,
            inbox: rx,
            self_tx: tx.clone(),
            running: false,
            message: defaults.message.clone().into_bytes(),
            interval: Duration::from_millis(defaults.interval_ms),
            tx_count: 0,
            tx_fail_count: 0,
            tick_id: 0,
        };
        tokio::spawn(engine.run());
        BeaconHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                BeaconMsg::Start { opts, reply } => {
                    let _ = reply.send(self.start(opts));
                }
                BeaconMsg::Stop { reply } => {
                    self.stop();
                    let _ = reply.send(Ok(()));
                }
                BeaconMsg::Stats { reply } => {
                    let _ = reply.send(Ok(BeaconStats {
                        running: self.running,
                        message: self.message.clone(),
                        interval_ms: self.interval.as_millis() as u64,
                        tx_count: self.tx_count,
                        tx_fail_count: self.tx_fail_count,
                    }));
                }
                BeaconMsg::Tick(id) => self.tick(id).await,
            }
        }
        debug!("beacon actor stopped");
    }

    fn start(&mut self, opts: BeaconOptions) -> Result<(), ResponderError> {
        if self.running {
            return Err(ResponderError::AlreadyRunning("beacon"));
        }
        if let Some(message) = opts.message {
            self.message = message;
        }
        if let Some(interval_ms) = opts.interval_ms {
            self.interval = Duration::from_millis(interval_ms);
        }
        self.tick_id += 1;
        self.running = true;
        // First beacon goes out immediately
        let _ = self.self_tx.send(BeaconMsg::Tick(self.tick_id));
        self.sink.event("beacon_started");
        info!(
            "beacon started: {:?} every {:?}",
            String::from_utf8_lossy(&self.message),
            self.interval
        );
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        // Invalidate any tick already in flight
        self.tick_id += 1;
        self.sink.event("beacon_stopped");
        info!("beacon stopped after {} transmissions", self.tx_count);
    }

    async fn tick(&mut self, id: u64) {
        if !self.running || id != self.tick_id {
            return;
        }

        let message = self.message.clone();
        // Counts the submission, whether or not the radio succeeds
        self.tx_count += 1;
        self.sink.tx(&message);
        match self.facade.transmit(message).await {
            Ok(TxOutcome::Ok) => {}
            Ok(outcome) => {
                self.tx_fail_count += 1;
                self.sink.event("tx_error");
                warn!("beacon transmit ended with {outcome:?}");
            }
            Err(e) => {
                self.tx_fail_count += 1;
                self.sink.event("tx_error");
                warn!("beacon transmit failed: {e}");
            }
        }

        // Scheduled only after the transmit returned, so ticks never
        // overlap
        let tx = self.self_tx.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(BeaconMsg::Tick(id));
        });
    }
}

//! # Echo Responder
//!
//! Receive-and-echo turnaround: listen, and answer every received frame
//! with `prefix || frame` after a configurable delay, then re-arm
//! reception. The delay exists because half-duplex peers need time to
//! turn their radio around before we transmit back; the re-arm delay
//! exists for the same reason on our side.
//!
//! State machine: `Idle -> Listening -> Echoing -> WaitingTxDone ->
//! Listening`. Exactly one echo is in flight per received frame; frames
//! arriving outside `Listening` are logged and dropped. Timers carry the
//! generation they were scheduled in, so anything scheduled before a
//! stop (or restart) no-ops.

use crate::config;
use crate::error::ResponderError;
use crate::event_log::EventSink;
use crate::radio::facade::FacadeHandle;
use crate::radio::{RadioEvent, Reply, SubscriberId, TxOutcome};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Facade subscriber id of the echo responder.
pub const ECHO_SUBSCRIBER_ID: SubscriberId = 2;

/// Delay before (re-)arming reception.
const ARM_DELAY: Duration = Duration::from_millis(100);

/// Retry delay after a failed receive arm.
const ARM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Overrides for [`EchoHandle::start`]; unset fields keep their
/// previous values.
#[derive(Debug, Clone, Default)]
pub struct EchoOptions {
    pub prefix: Option<Vec<u8>>,
    pub delay_ms: Option<u64>,
}

/// Snapshot of the responder state.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoStats {
    pub running: bool,
    pub rx_count: u64,
    pub tx_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    Echoing,
    WaitingTxDone,
}

enum EchoMsg {
    Start { opts: EchoOptions, reply: Reply<()> },
    Stop { reply: Reply<()> },
    Stats { reply: Reply<EchoStats> },
    ArmRx(u64),
    EchoTx { generation: u64, payload: Vec<u8> },
    Event(RadioEvent),
}

/// Cloneable handle to the echo actor.
#[derive(Clone)]
pub struct EchoHandle {
    tx: mpsc::UnboundedSender<EchoMsg>,
}

impl EchoHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> EchoMsg) -> Result<T, ResponderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ResponderError::NotConnected)?;
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResponderError::NotConnected),
            Err(_) => Err(ResponderError::Timeout("echo call")),
        }
    }

    /// Start responding. Fails with `AlreadyRunning` if already started.
    pub async fn start(&self, opts: EchoOptions) -> Result<(), ResponderError> {
        self.call(|reply| EchoMsg::Start { opts, reply }).await
    }

    /// Stop responding. Idempotent.
    pub async fn stop(&self) -> Result<(), ResponderError> {
        self.call(|reply| EchoMsg::Stop { reply }).await
    }

    pub async fn stats(&self) -> Result<EchoStats, ResponderError> {
        self.call(|reply| EchoMsg::Stats { reply }).await
    }
}

/// The echo responder actor.
pub struct EchoResponder {
    facade: FacadeHandle,
    sink: Arc<dyn EventSink>,
    inbox: mpsc::UnboundedReceiver<EchoMsg>,
    self_tx: mpsc::UnboundedSender<EchoMsg>,
    running: bool,
    phase: Phase,
    prefix: Vec<u8>,
    echo_delay: Duration,
    rx_count: u64,
    tx_count: u64,
    /// Timers carry the generation they were scheduled in; stale ones no-op.
    generation: u64,
}

impl EchoResponder {
    /// Start the actor in the idle state, seeded from configuration.
    pub fn spawn(facade: FacadeHandle, sink: Arc<dyn EventSink>) -> EchoHandle {
        let defaults = &config::global().echo;
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = EchoResponder {
            facade,
            sink,
            inbox: rx,
            self_tx: tx.clone(),
            running: false,
            phase: Phase::Idle,
            prefix: defaults.prefix.clone().into_bytes(),
            echo_delay: Duration::from_millis(defaults.delay_ms),
            rx_count: 0,
            tx_count: 0,
            generation: 0,
        };
        tokio::spawn(responder.run());
        EchoHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                EchoMsg::Start { opts, reply } => {
                    let result = self.start(opts).await;
                    let _ = reply.send(result);
                }
                EchoMsg::Stop { reply } => {
                    self.stop().await;
                    let _ = reply.send(Ok(()));
                }
                EchoMsg::Stats { reply } => {
                    let _ = reply.send(Ok(EchoStats {
                        running: self.running,
                        rx_count: self.rx_count,
                        tx_count: self.tx_count,
                    }));
                }
                EchoMsg::ArmRx(generation) => self.arm_rx(generation).await,
                EchoMsg::EchoTx { generation, payload } => self.echo_tx(generation, payload).await,
                EchoMsg::Event(event) => self.handle_event(event),
            }
        }
        debug!("echo responder actor stopped");
    }

    async fn start(&mut self, opts: EchoOptions) -> Result<(), ResponderError> {
        if self.running {
            return Err(ResponderError::AlreadyRunning("echo responder"));
        }
        if let Some(prefix) = opts.prefix {
            self.prefix = prefix;
        }
        if let Some(delay_ms) = opts.delay_ms {
            self.echo_delay = Duration::from_millis(delay_ms);
        }

        // Tap the facade event stream
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let forward = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward.send(EchoMsg::Event(event)).is_err() {
                    break;
                }
            }
        });
        self.facade.subscribe(ECHO_SUBSCRIBER_ID, event_tx).await?;

        self.generation += 1;
        self.running = true;
        self.phase = Phase::Listening;
        self.schedule(ARM_DELAY, EchoMsg::ArmRx(self.generation));
        self.sink.event("echo_started");
        info!(
            "echo responder started: prefix {:?}, delay {:?}",
            String::from_utf8_lossy(&self.prefix),
            self.echo_delay
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.running {
            return;
        }
        let _ = self.facade.unsubscribe(ECHO_SUBSCRIBER_ID).await;
        self.running = false;
        self.phase = Phase::Idle;
        // Invalidate timers already in flight
        self.generation += 1;
        self.sink.event("echo_stopped");
        info!(
            "echo responder stopped after {} rx / {} tx",
            self.rx_count, self.tx_count
        );
    }

    async fn arm_rx(&mut self, generation: u64) {
        if !self.running || generation != self.generation {
            return;
        }
        match self.facade.receive_mode(0).await {
            Ok(()) => debug!("reception armed"),
            Err(e) => {
                warn!("receive arm failed ({e}), retrying in {ARM_RETRY_DELAY:?}");
                self.schedule(ARM_RETRY_DELAY, EchoMsg::ArmRx(generation));
            }
        }
    }

    async fn echo_tx(&mut self, generation: u64, payload: Vec<u8>) {
        if !self.running || generation != self.generation || self.phase != Phase::Echoing {
            return;
        }
        // Counts the submission, whether or not the radio succeeds
        self.tx_count += 1;
        self.sink.tx(&payload);
        match self.facade.transmit(payload).await {
            Ok(TxOutcome::Ok) => {
                self.phase = Phase::WaitingTxDone;
            }
            Ok(outcome) => {
                warn!("echo transmit ended with {outcome:?}");
                self.rearm();
            }
            Err(e) => {
                warn!("echo transmit failed: {e}");
                self.rearm();
            }
        }
    }

    fn handle_event(&mut self, event: RadioEvent) {
        if !self.running {
            return;
        }
        match event {
            RadioEvent::Frame(frame) => {
                self.sink
                    .rx(&frame.bytes, frame.rssi_dbm, frame.snr_db);
                if self.phase != Phase::Listening {
                    debug!(
                        "frame while {:?}; one echo at a time, dropping",
                        self.phase
                    );
                    return;
                }
                self.rx_count += 1;
                let mut payload = self.prefix.clone();
                payload.extend_from_slice(&frame.bytes);
                self.phase = Phase::Echoing;
                // Give the peer time to turn its radio around
                self.schedule(
                    self.echo_delay,
                    EchoMsg::EchoTx {
                        generation: self.generation,
                        payload,
                    },
                );
            }
            RadioEvent::TxDone => {
                if self.phase == Phase::WaitingTxDone {
                    self.sink.event("tx_ok");
                    self.rearm();
                }
            }
            RadioEvent::TxError => {
                if self.phase == Phase::WaitingTxDone {
                    self.sink.event("tx_error");
                    self.rearm();
                }
            }
        }
    }

    fn rearm(&mut self) {
        self.phase = Phase::Listening;
        self.schedule(ARM_DELAY, EchoMsg::ArmRx(self.generation));
    }

    fn schedule(&self, delay: Duration, msg: EchoMsg) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }
}

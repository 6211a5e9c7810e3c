//! # Radio Facade
//!
//! One capability set over whichever backend the configuration selected:
//! connect, disconnect, transmit, receive_mode, subscribe, unsubscribe,
//! settings, connected. The facade is a thin dispatch over a tagged
//! backend variant plus a fan-out point: it subscribes to the backend
//! once and forwards every event to every current subscriber, preserving
//! per-subscriber arrival order.

use crate::config::RadioConfig;
use crate::error::ResponderError;
use crate::radio::mock::MockBackendHandle;
use crate::radio::rn2903::Rn2903Handle;
use crate::radio::sx1276::Sx1276Handle;
use crate::radio::{EventSender, RadioEvent, Reply, SubscriberId, TxOutcome};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Subscriber id the facade uses on its backend.
const BACKEND_TAP_ID: SubscriberId = 0;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const TX_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The backend actually driving the link, chosen once at startup.
pub enum RadioBackend {
    Sx1276(Sx1276Handle),
    Rn2903(Rn2903Handle),
    Mock(MockBackendHandle),
}

impl RadioBackend {
    async fn connect(&self) -> Result<(), ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => {
                let settings = h.settings().await?;
                h.begin(settings.frequency_hz).await
            }
            RadioBackend::Rn2903(h) => h.connect().await.map(|_| ()),
            RadioBackend::Mock(h) => h.connect().await,
        }
    }

    async fn disconnect(&self) -> Result<(), ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => h.disconnect().await,
            RadioBackend::Rn2903(h) => h.disconnect().await,
            RadioBackend::Mock(h) => h.disconnect().await,
        }
    }

    async fn transmit(&self, payload: Vec<u8>) -> Result<TxOutcome, ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => h.transmit(payload).await,
            RadioBackend::Rn2903(h) => h.transmit(payload).await,
            RadioBackend::Mock(h) => h.transmit(payload).await,
        }
    }

    async fn receive_mode(&self, timeout_ms: u32) -> Result<(), ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => h.receive_mode(timeout_ms).await,
            RadioBackend::Rn2903(h) => h.receive_mode(timeout_ms).await,
            RadioBackend::Mock(h) => h.receive_mode(timeout_ms).await,
        }
    }

    async fn subscribe(&self, id: SubscriberId, sender: EventSender) -> Result<(), ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => h.subscribe(id, sender).await,
            RadioBackend::Rn2903(h) => h.subscribe(id, sender).await,
            RadioBackend::Mock(h) => h.subscribe(id, sender).await,
        }
    }

    async fn settings(&self) -> Result<RadioConfig, ResponderError> {
        match self {
            RadioBackend::Sx1276(h) => h.settings().await,
            RadioBackend::Rn2903(h) => h.settings().await,
            RadioBackend::Mock(h) => h.settings().await,
        }
    }

    async fn connected(&self) -> bool {
        match self {
            RadioBackend::Sx1276(h) => h.connected().await,
            RadioBackend::Rn2903(h) => h.connected().await,
            RadioBackend::Mock(h) => h.connected().await,
        }
    }
}

enum FacadeMsg {
    Connect { reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    Transmit { payload: Vec<u8>, reply: Reply<TxOutcome> },
    ReceiveMode { timeout_ms: u32, reply: Reply<()> },
    Subscribe { id: SubscriberId, sender: EventSender, reply: Reply<()> },
    Unsubscribe { id: SubscriberId, reply: Reply<()> },
    Settings { reply: Reply<RadioConfig> },
    Connected { reply: Reply<bool> },
    Event(RadioEvent),
}

/// Cloneable handle to the facade actor.
#[derive(Clone)]
pub struct FacadeHandle {
    tx: mpsc::UnboundedSender<FacadeMsg>,
}

impl FacadeHandle {
    async fn call<T>(
        &self,
        deadline: Duration,
        build: impl FnOnce(Reply<T>) -> FacadeMsg,
    ) -> Result<T, ResponderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ResponderError::NotConnected)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResponderError::NotConnected),
            Err(_) => Err(ResponderError::Timeout("facade call")),
        }
    }

    pub async fn connect(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Connect { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Disconnect { reply })
            .await
    }

    pub async fn transmit(&self, payload: Vec<u8>) -> Result<TxOutcome, ResponderError> {
        self.call(TX_CALL_TIMEOUT, |reply| FacadeMsg::Transmit { payload, reply })
            .await
    }

    pub async fn receive_mode(&self, timeout_ms: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::ReceiveMode { timeout_ms, reply })
            .await
    }

    /// Register an event subscriber. Never fails while the actor lives.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        sender: EventSender,
    ) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Subscribe { id, sender, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Unsubscribe { id, reply })
            .await
    }

    pub async fn settings(&self) -> Result<RadioConfig, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Settings { reply }).await
    }

    pub async fn connected(&self) -> bool {
        self.call(CALL_TIMEOUT, |reply| FacadeMsg::Connected { reply })
            .await
            .unwrap_or(false)
    }
}

/// The facade actor.
pub struct RadioFacade {
    backend: RadioBackend,
    inbox: mpsc::UnboundedReceiver<FacadeMsg>,
    subscribers: HashMap<SubscriberId, EventSender>,
}

impl RadioFacade {
    /// Start the facade over the chosen backend and tap its event stream.
    pub fn spawn(backend: RadioBackend) -> FacadeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        // Forward backend events into the facade inbox
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward_tx.send(FacadeMsg::Event(event)).is_err() {
                    break;
                }
            }
        });

        let facade = RadioFacade {
            backend,
            inbox: rx,
            subscribers: HashMap::new(),
        };
        tokio::spawn(async move {
            if let Err(e) = facade.backend.subscribe(BACKEND_TAP_ID, event_tx).await {
                warn!("facade could not tap backend events: {e}");
            }
            facade.run().await;
        });
        FacadeHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                FacadeMsg::Connect { reply } => {
                    let _ = reply.send(self.backend.connect().await);
                }
                FacadeMsg::Disconnect { reply } => {
                    let _ = reply.send(self.backend.disconnect().await);
                }
                FacadeMsg::Transmit { payload, reply } => {
                    let _ = reply.send(self.backend.transmit(payload).await);
                }
                FacadeMsg::ReceiveMode { timeout_ms, reply } => {
                    let _ = reply.send(self.backend.receive_mode(timeout_ms).await);
                }
                FacadeMsg::Subscribe { id, sender, reply } => {
                    self.subscribers.insert(id, sender);
                    let _ = reply.send(Ok(()));
                }
                FacadeMsg::Unsubscribe { id, reply } => {
                    self.subscribers.remove(&id);
                    let _ = reply.send(Ok(()));
                }
                FacadeMsg::Settings { reply } => {
                    let _ = reply.send(self.backend.settings().await);
                }
                FacadeMsg::Connected { reply } => {
                    let _ = reply.send(Ok(self.backend.connected().await));
                }
                FacadeMsg::Event(event) => {
                    self.subscribers
                        .retain(|id, sender| match sender.send(event.clone()) {
                            Ok(()) => true,
                            Err(_) => {
                                debug!("dropping gone subscriber {id}");
                                false
                            }
                        });
                }
            }
        }
        debug!("radio facade actor stopped");
    }
}

//! # Mock Radio Backend
//!
//! An in-tree test double satisfying the facade capability set. Records
//! transmit and receive-arm calls with timestamps, lets tests inject
//! received frames, and can be scripted to fail. Timestamps use the
//! tokio clock so paused-time tests can assert turnaround delays.

use crate::config::RadioConfig;
use crate::error::ResponderError;
use crate::radio::{validate_payload, EventSender, RadioEvent, RxFrame, SubscriberId, TxOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// One recorded transmit call.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub at: Instant,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct MockBackendState {
    connected: bool,
    settings: RadioConfig,
    subscribers: HashMap<SubscriberId, EventSender>,
    transmits: Vec<TxRecord>,
    receive_arms: Vec<u32>,
    tx_outcome: Option<TxOutcome>,
    /// Fail this many upcoming receive_mode calls.
    fail_receive_modes: u32,
}

/// Shared-state mock backend.
#[derive(Clone, Default)]
pub struct MockBackendHandle {
    state: Arc<Mutex<MockBackendState>>,
}

impl MockBackendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    // -- capability set -------------------------------------------------

    pub async fn connect(&self) -> Result<(), ResponderError> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ResponderError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    pub async fn transmit(&self, payload: Vec<u8>) -> Result<TxOutcome, ResponderError> {
        validate_payload(&payload)?;
        let outcome;
        {
            let mut state = self.state.lock().unwrap();
            state.transmits.push(TxRecord {
                at: Instant::now(),
                payload,
            });
            outcome = state.tx_outcome.unwrap_or(TxOutcome::Ok);
        }
        // Completion events land before the call returns, mirroring the
        // real backends
        match outcome {
            TxOutcome::Ok => self.broadcast(RadioEvent::TxDone),
            TxOutcome::Err => self.broadcast(RadioEvent::TxError),
            TxOutcome::Timeout => {}
        }
        Ok(outcome)
    }

    pub async fn receive_mode(&self, timeout_ms: u32) -> Result<(), ResponderError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_receive_modes > 0 {
            state.fail_receive_modes -= 1;
            return Err(ResponderError::io("receive arm", "mock receive fault"));
        }
        state.receive_arms.push(timeout_ms);
        Ok(())
    }

    pub async fn subscribe(
        &self,
        id: SubscriberId,
        sender: EventSender,
    ) -> Result<(), ResponderError> {
        self.state.lock().unwrap().subscribers.insert(id, sender);
        Ok(())
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), ResponderError> {
        self.state.lock().unwrap().subscribers.remove(&id);
        Ok(())
    }

    pub async fn settings(&self) -> Result<RadioConfig, ResponderError> {
        Ok(self.state.lock().unwrap().settings.clone())
    }

    pub async fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    // -- test scripting -------------------------------------------------

    /// Deliver a frame to every subscriber, as if the radio received it.
    pub fn inject_frame(&self, frame: RxFrame) {
        self.broadcast(RadioEvent::Frame(frame));
    }

    /// Force the outcome of subsequent transmit calls.
    pub fn set_tx_outcome(&self, outcome: TxOutcome) {
        self.state.lock().unwrap().tx_outcome = Some(outcome);
    }

    /// Make the next `n` receive_mode calls fail.
    pub fn fail_next_receive_modes(&self, n: u32) {
        self.state.lock().unwrap().fail_receive_modes = n;
    }

    /// All transmit calls so far.
    pub fn transmit_log(&self) -> Vec<TxRecord> {
        self.state.lock().unwrap().transmits.clone()
    }

    /// Timeout arguments of all receive_mode calls so far.
    pub fn receive_arms(&self) -> Vec<u32> {
        self.state.lock().unwrap().receive_arms.clone()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    fn broadcast(&self, event: RadioEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }
}

//! # Radio Backends and Facade
//!
//! Two backends produce and consume raw LoRa frames: the register-level
//! SX1276 driver ([`sx1276`]) and the RN2903 AT-style modem ([`rn2903`]).
//! The [`facade`] presents one capability set over whichever backend the
//! configuration selected and fans events out to subscribers. [`mock`]
//! ships an in-tree backend double for tests.

pub mod facade;
pub mod mock;
pub mod rn2903;
pub mod sx1276;

use crate::error::ResponderError;
use tokio::sync::{mpsc, oneshot};

/// Largest payload either backend accepts, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Identifies one event subscriber.
pub type SubscriberId = u64;

/// Channel end a subscriber receives [`RadioEvent`]s on.
pub type EventSender = mpsc::UnboundedSender<RadioEvent>;

/// Reply side of a request/reply call into an actor.
pub(crate) type Reply<T> = oneshot::Sender<Result<T, ResponderError>>;

/// One received frame with whatever link metrics the backend reports.
///
/// The SX1276 path always fills in RSSI and SNR; the RN2903 does not
/// report them, so that path leaves both unset.
#[derive(Debug, Clone, PartialEq)]
pub struct RxFrame {
    pub bytes: Vec<u8>,
    pub rssi_dbm: Option<i16>,
    pub snr_db: Option<f32>,
}

/// Result of a transmit call.
///
/// `Err` is the radio-reported failure (`radio_err` on the modem);
/// call-level failures surface as [`ResponderError`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Ok,
    Timeout,
    Err,
}

/// Event fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Frame(RxFrame),
    TxDone,
    TxError,
}

/// Reject empty and oversized payloads before they reach a backend.
pub(crate) fn validate_payload(payload: &[u8]) -> Result<(), ResponderError> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
        return Err(ResponderError::InvalidParam(format!(
            "payload length {} outside 1..={MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_bounds() {
        assert!(validate_payload(&[]).is_err());
        assert!(validate_payload(&[0u8; 1]).is_ok());
        assert!(validate_payload(&[0u8; 255]).is_ok());
        assert!(validate_payload(&[0u8; 256]).is_err());
    }
}

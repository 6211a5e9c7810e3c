//! # Responder Error Handling
//!
//! This module defines the ResponderError enum, which represents the different
//! error types that can occur in the lora-responder crate.

use crate::radio::sx1276::hal::HalError;
use crate::util::hex::HexError;
use thiserror::Error;

/// Represents the different error types that can occur in the responder.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The radio backend has not been connected (or has been disconnected).
    #[error("radio not connected")]
    NotConnected,

    /// A service that may only run once was started twice.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// The SX1276 version register did not read back the expected silicon id.
    #[error("unexpected chip version 0x{0:02X} (expected 0x12)")]
    InvalidChip(u8),

    /// An SPI, GPIO or serial transfer failed.
    #[error("I/O error during {op}: {detail}")]
    Io { op: String, detail: String },

    /// An operation did not complete within its deadline.
    #[error("timeout during {0}")]
    Timeout(&'static str),

    /// A parameter was outside its permitted range.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A hex payload string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] HexError),

    /// A resource that admits one owner was requested again.
    #[error("resource busy: {0}")]
    ResourceBusy(&'static str),
}

impl ResponderError {
    /// Wrap a lower-level failure, naming the operation it interrupted.
    pub fn io(op: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ResponderError::Io {
            op: op.into(),
            detail: err.to_string(),
        }
    }
}

impl From<HalError> for ResponderError {
    fn from(err: HalError) -> Self {
        ResponderError::io("hardware access", err)
    }
}

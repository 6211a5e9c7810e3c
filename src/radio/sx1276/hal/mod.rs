//! # Hardware Access Surface for the SX1276
//!
//! The driver talks to the chip exclusively through the [`RadioHal`]
//! trait: single-register SPI transfers framed by a manually driven
//! chip-select line, a hardware reset pulse, and delivery of DIO0
//! rising edges into a channel. The Raspberry Pi implementation lives
//! behind the `raspberry-pi` feature; tests use the scriptable mock in
//! [`crate::radio::sx1276::mock`].

use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during HAL operations
#[derive(Debug, Error)]
pub enum HalError {
    #[error("SPI transfer failed: {0}")]
    Spi(String),

    #[error("GPIO operation failed: {0}")]
    Gpio(String),

    #[error("Invalid hardware configuration: {0}")]
    InvalidConfig(String),
}

/// Register-level access to the radio plus its reset and DIO0 lines.
///
/// Each register access is exactly one chip-select-framed transfer of
/// two bytes: the address (MSB set for writes) and the data byte.
pub trait RadioHal: Send {
    /// Read a single 8-bit register.
    fn read_register(&mut self, addr: u8) -> Result<u8, HalError>;

    /// Write a single 8-bit register.
    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), HalError>;

    /// Pulse the hardware reset line: low 10 ms, high 10 ms.
    fn reset_pulse(&mut self) -> Result<(), HalError>;

    /// Route DIO0 rising edges into `edges`. Edges must be delivered
    /// asynchronously; the receiver serializes them with command
    /// processing.
    fn attach_dio0(&mut self, edges: mpsc::UnboundedSender<()>) -> Result<(), HalError>;
}

// Platform implementations
#[cfg(feature = "raspberry-pi")]
pub mod raspberry_pi;

#[cfg(feature = "raspberry-pi")]
pub use raspberry_pi::{RpiRadioHal, RpiRadioHalBuilder};

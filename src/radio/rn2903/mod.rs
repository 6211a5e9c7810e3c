//! # RN2903 Backend
//!
//! UART-attached LoRa modem speaking the Microchip AT-style line
//! protocol. [`modem`] owns the serial port and runs the transport actor.

pub mod modem;

pub use modem::{Rn2903Handle, Rn2903Modem};

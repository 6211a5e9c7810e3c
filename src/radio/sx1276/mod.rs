//! # SX1276 Backend
//!
//! Register-level driver for the Semtech SX1276 family over SPI with a
//! manually driven chip-select line (Dragino HAT wiring). [`hal`] is the
//! hardware surface, [`driver`] the actor that owns it, [`registers`] and
//! [`irq`] the chip's register map, [`mock`] a scriptable HAL for tests.

pub mod driver;
pub mod hal;
pub mod irq;
pub mod mock;
pub mod registers;

pub use driver::{RadioMode, Sx1276Driver, Sx1276Handle};
pub use irq::IrqFlags;

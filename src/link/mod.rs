//! # Link Modes
//!
//! The two coordinated services built on the radio facade: a periodic
//! [`beacon`] transmitter and the receive-and-echo [`echo`] responder.
//! Each runs as its own actor; timers are cancelled by generation id so
//! a stopped service ignores stragglers.

pub mod beacon;
pub mod echo;

pub use beacon::{BeaconEngine, BeaconHandle, BeaconOptions, BeaconStats};
pub use echo::{EchoHandle, EchoOptions, EchoResponder, EchoStats};

//! # lora-responder - Field-Test Responder for Device-to-Device LoRa Links
//!
//! The lora-responder crate exercises point-to-point LoRa links from a
//! single-board computer. It drives either a raw Semtech SX1276 over SPI
//! (Dragino HAT class wiring, with a manually driven chip-select line and
//! a DIO0 interrupt) or a Microchip RN2903 modem over a serial port, and
//! runs two link modes on top: a periodic beacon transmitter and a
//! receive-and-echo responder that turns the radio around on every frame.
//!
//! ## Features
//!
//! - Register-level SX1276 driver: init sequence, parameter setters,
//!   blocking transmit with a 5 s budget, interrupt-driven reception
//! - RN2903 AT-style line transport with wake-up and async notification
//!   parsing
//! - One facade over both backends with subscriber fan-out of RX frames
//!   and TX completions
//! - Beacon and echo services with turnaround sequencing and counters
//! - Append-only event sink for field-test logs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lora_responder::{RadioBackend, RadioFacade, Rn2903Modem};
//!
//! # async fn run() -> Result<(), lora_responder::ResponderError> {
//! let cfg = lora_responder::config::global();
//! let modem = Rn2903Modem::spawn(cfg.serial_port.clone(), cfg.radio.clone());
//! let facade = RadioFacade::spawn(RadioBackend::Rn2903(modem));
//! facade.connect().await?;
//! facade.transmit(b"HELLO".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event_log;
pub mod link;
pub mod logging;
pub mod radio;
pub mod util;

pub use crate::config::{LoraBackend, RadioConfig, ResponderConfig};
pub use crate::error::ResponderError;
pub use crate::event_log::{EventSink, LogEventSink, NullEventSink};
pub use crate::logging::{init_logger, log_info};

// Radio layer
pub use crate::radio::facade::{FacadeHandle, RadioBackend, RadioFacade};
pub use crate::radio::rn2903::{Rn2903Handle, Rn2903Modem};
pub use crate::radio::sx1276::{RadioMode, Sx1276Driver, Sx1276Handle};
pub use crate::radio::{RadioEvent, RxFrame, SubscriberId, TxOutcome};

// Link modes
pub use crate::link::beacon::{BeaconEngine, BeaconHandle, BeaconOptions, BeaconStats};
pub use crate::link::echo::{EchoHandle, EchoOptions, EchoResponder, EchoStats};

//! # Responder Configuration
//!
//! Configuration for the responder process: backend selection, bus/pin
//! wiring, radio parameters and the link-mode services. Loadable from a
//! JSON file; every field has a default so a missing file or a partial
//! file both work. The resolved configuration is frozen process-wide at
//! startup and read through [`global`] afterwards.
//!
//! ```json
//! {
//!   "lora_backend": "sx1276",
//!   "spi_bus": "spidev0.0",
//!   "reset_pin": 17,
//!   "cs_pin": 25,
//!   "dio0_pin": 4,
//!   "frequency_hz": 915000000
//! }
//! ```

use crate::error::ResponderError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Environment variable that overrides the configured backend.
pub const BACKEND_ENV_VAR: &str = "LORA_BACKEND";

/// Permitted LoRa bandwidths in Hz, in register-encoding order.
pub const BANDWIDTHS_HZ: [u32; 10] = [
    7_800, 10_400, 15_600, 20_800, 31_250, 41_700, 62_500, 125_000, 250_000, 500_000,
];

/// Which radio backend drives the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoraBackend {
    /// Raw SX1276 over SPI (Dragino HAT class wiring).
    Sx1276,
    /// RN2903 AT-style modem over a serial port.
    Rn2903,
}

impl FromStr for LoraBackend {
    type Err = ResponderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sx1276" => Ok(LoraBackend::Sx1276),
            "rn2903" => Ok(LoraBackend::Rn2903),
            other => Err(ResponderError::InvalidParam(format!(
                "unknown backend {other:?} (expected sx1276 or rn2903)"
            ))),
        }
    }
}

/// Current radio parameters shared by both backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: u32,
    #[serde(default = "default_spreading_factor")]
    pub spreading_factor: u8,
    #[serde(default = "default_bandwidth_hz")]
    pub bandwidth_hz: u32,
    #[serde(default = "default_coding_rate")]
    pub coding_rate: u8,
    #[serde(default = "default_tx_power_dbm")]
    pub tx_power_dbm: i8,
    #[serde(default = "default_sync_word")]
    pub sync_word: u8,
    #[serde(default = "default_preamble_len")]
    pub preamble_len: u16,
    #[serde(default = "default_crc_on")]
    pub crc_on: bool,
    #[serde(default)]
    pub implicit_header: bool,
}

fn default_frequency_hz() -> u32 {
    915_000_000
}
fn default_spreading_factor() -> u8 {
    7
}
fn default_bandwidth_hz() -> u32 {
    125_000
}
fn default_coding_rate() -> u8 {
    5
}
fn default_tx_power_dbm() -> i8 {
    14
}
// 0x34 interoperates with the RN2903 factory default; private networks
// use 0x12.
fn default_sync_word() -> u8 {
    0x34
}
fn default_preamble_len() -> u16 {
    8
}
fn default_crc_on() -> bool {
    true
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            frequency_hz: default_frequency_hz(),
            spreading_factor: default_spreading_factor(),
            bandwidth_hz: default_bandwidth_hz(),
            coding_rate: default_coding_rate(),
            tx_power_dbm: default_tx_power_dbm(),
            sync_word: default_sync_word(),
            preamble_len: default_preamble_len(),
            crc_on: default_crc_on(),
            implicit_header: false,
        }
    }
}

impl RadioConfig {
    /// Check every parameter against its permitted range.
    pub fn validate(&self) -> Result<(), ResponderError> {
        if !(137_000_000..=1_020_000_000).contains(&self.frequency_hz) {
            return Err(ResponderError::InvalidParam(format!(
                "frequency {} Hz outside 137-1020 MHz",
                self.frequency_hz
            )));
        }
        if !(6..=12).contains(&self.spreading_factor) {
            return Err(ResponderError::InvalidParam(format!(
                "spreading factor {} outside 6..=12",
                self.spreading_factor
            )));
        }
        if self.spreading_factor == 6 && !self.implicit_header {
            return Err(ResponderError::InvalidParam(
                "spreading factor 6 requires implicit header mode".into(),
            ));
        }
        if !BANDWIDTHS_HZ.contains(&self.bandwidth_hz) {
            return Err(ResponderError::InvalidParam(format!(
                "bandwidth {} Hz is not a LoRa bandwidth",
                self.bandwidth_hz
            )));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(ResponderError::InvalidParam(format!(
                "coding rate denominator {} outside 5..=8",
                self.coding_rate
            )));
        }
        if !(2..=20).contains(&self.tx_power_dbm) {
            return Err(ResponderError::InvalidParam(format!(
                "TX power {} dBm outside 2..=20",
                self.tx_power_dbm
            )));
        }
        Ok(())
    }
}

/// Beacon service parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_beacon_message")]
    pub message: String,
    #[serde(default = "default_beacon_interval_ms")]
    pub interval_ms: u64,
}

fn default_beacon_message() -> String {
    "BEACON".into()
}
fn default_beacon_interval_ms() -> u64 {
    5000
}

impl Default for BeaconConfig {
    fn default() -> Self {
        BeaconConfig {
            message: default_beacon_message(),
            interval_ms: default_beacon_interval_ms(),
        }
    }
}

/// Echo responder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_echo_prefix")]
    pub prefix: String,
    #[serde(default = "default_echo_delay_ms")]
    pub delay_ms: u64,
}

fn default_echo_prefix() -> String {
    "ECHO:".into()
}
// Half-duplex peers need time to turn their radio around before we
// transmit back.
fn default_echo_delay_ms() -> u64 {
    150
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig {
            prefix: default_echo_prefix(),
            delay_ms: default_echo_delay_ms(),
        }
    }
}

/// Top-level responder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default = "default_backend")]
    pub lora_backend: LoraBackend,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_spi_bus")]
    pub spi_bus: String,
    #[serde(default = "default_spi_speed_hz")]
    pub spi_speed_hz: u32,
    #[serde(default = "default_reset_pin")]
    pub reset_pin: u8,
    #[serde(default = "default_cs_pin")]
    pub cs_pin: u8,
    #[serde(default = "default_dio0_pin")]
    pub dio0_pin: u8,
    #[serde(flatten)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub echo: EchoConfig,
}

fn default_backend() -> LoraBackend {
    LoraBackend::Rn2903
}
fn default_serial_port() -> String {
    "/dev/ttyACM0".into()
}
fn default_spi_bus() -> String {
    "spidev0.0".into()
}
fn default_spi_speed_hz() -> u32 {
    8_000_000
}
fn default_reset_pin() -> u8 {
    17
}
fn default_cs_pin() -> u8 {
    25
}
fn default_dio0_pin() -> u8 {
    4
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            lora_backend: default_backend(),
            serial_port: default_serial_port(),
            spi_bus: default_spi_bus(),
            spi_speed_hz: default_spi_speed_hz(),
            reset_pin: default_reset_pin(),
            cs_pin: default_cs_pin(),
            dio0_pin: default_dio0_pin(),
            radio: RadioConfig::default(),
            beacon: BeaconConfig::default(),
            echo: EchoConfig::default(),
        }
    }
}

impl ResponderConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ResponderError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResponderError::io(format!("read config {}", path.display()), e))?;
        serde_json::from_str(&text)
            .map_err(|e| ResponderError::InvalidParam(format!("config parse error: {e}")))
    }

    /// Apply environment overrides (currently `LORA_BACKEND`).
    pub fn apply_env(&mut self) -> Result<(), ResponderError> {
        if let Ok(value) = std::env::var(BACKEND_ENV_VAR) {
            self.lora_backend = value.parse()?;
        }
        Ok(())
    }

    /// SPI bus index parsed from the `spidevB.S` identifier.
    pub fn spi_bus_index(&self) -> Result<u8, ResponderError> {
        let rest = self.spi_bus.strip_prefix("spidev").ok_or_else(|| {
            ResponderError::InvalidParam(format!("spi_bus {:?} is not a spidev id", self.spi_bus))
        })?;
        let bus = rest.split('.').next().unwrap_or("");
        bus.parse().map_err(|_| {
            ResponderError::InvalidParam(format!("spi_bus {:?} is not a spidev id", self.spi_bus))
        })
    }
}

static CONFIG: OnceCell<ResponderConfig> = OnceCell::new();

/// Freeze the process-wide configuration. May be called once.
pub fn freeze(config: ResponderConfig) -> Result<(), ResponderError> {
    CONFIG
        .set(config)
        .map_err(|_| ResponderError::ResourceBusy("configuration already frozen"))
}

/// The process-wide configuration. Defaults apply if nothing was frozen.
pub fn global() -> &'static ResponderConfig {
    CONFIG.get_or_init(ResponderConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_field_kit() {
        let cfg = ResponderConfig::default();
        assert_eq!(cfg.lora_backend, LoraBackend::Rn2903);
        assert_eq!(cfg.serial_port, "/dev/ttyACM0");
        assert_eq!(cfg.spi_bus, "spidev0.0");
        assert_eq!(cfg.spi_speed_hz, 8_000_000);
        assert_eq!((cfg.reset_pin, cfg.cs_pin, cfg.dio0_pin), (17, 25, 4));
        assert_eq!(cfg.radio.frequency_hz, 915_000_000);
        assert_eq!(cfg.radio.sync_word, 0x34);
        assert_eq!(cfg.beacon.message, "BEACON");
        assert_eq!(cfg.beacon.interval_ms, 5000);
        assert_eq!(cfg.echo.prefix, "ECHO:");
        assert_eq!(cfg.echo.delay_ms, 150);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ResponderConfig =
            serde_json::from_str(r#"{"lora_backend":"sx1276","frequency_hz":868100000}"#).unwrap();
        assert_eq!(cfg.lora_backend, LoraBackend::Sx1276);
        assert_eq!(cfg.radio.frequency_hz, 868_100_000);
        assert_eq!(cfg.radio.spreading_factor, 7);
        assert_eq!(cfg.echo.delay_ms, 150);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut radio = RadioConfig::default();
        radio.frequency_hz = 100_000_000;
        assert!(radio.validate().is_err());

        let mut radio = RadioConfig::default();
        radio.spreading_factor = 13;
        assert!(radio.validate().is_err());

        let mut radio = RadioConfig::default();
        radio.bandwidth_hz = 100_000;
        assert!(radio.validate().is_err());

        let mut radio = RadioConfig::default();
        radio.coding_rate = 9;
        assert!(radio.validate().is_err());

        let mut radio = RadioConfig::default();
        radio.tx_power_dbm = 21;
        assert!(radio.validate().is_err());
    }

    #[test]
    fn test_sf6_requires_implicit_header() {
        let mut radio = RadioConfig::default();
        radio.spreading_factor = 6;
        assert!(radio.validate().is_err());
        radio.implicit_header = true;
        assert!(radio.validate().is_ok());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("sx1276".parse::<LoraBackend>().unwrap(), LoraBackend::Sx1276);
        assert_eq!("RN2903".parse::<LoraBackend>().unwrap(), LoraBackend::Rn2903);
        assert!("lr1110".parse::<LoraBackend>().is_err());
    }

    #[test]
    fn test_spi_bus_index() {
        let mut cfg = ResponderConfig::default();
        assert_eq!(cfg.spi_bus_index().unwrap(), 0);
        cfg.spi_bus = "spidev1.2".into();
        assert_eq!(cfg.spi_bus_index().unwrap(), 1);
        cfg.spi_bus = "/dev/spi".into();
        assert!(cfg.spi_bus_index().is_err());
    }
}

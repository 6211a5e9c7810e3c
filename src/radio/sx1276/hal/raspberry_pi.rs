//! # Raspberry Pi HAL Implementation
//!
//! SPI and GPIO access for an SX1276 wired Dragino-HAT style: the radio's
//! NSS pin hangs off an ordinary GPIO rather than the controller's CE0,
//! so every transfer frames itself by driving that line manually.
//!
//! ## Pinout (BCM numbering, Dragino LoRa/GPS HAT defaults)
//!
//! ```text
//! BCM GPIO │ SX1276 Pin │ Function
//! ─────────┼────────────┼────────────────────────
//! 17       │ NRESET     │ Reset (output, active low)
//! 25       │ NSS        │ Chip select (output, manual)
//! 4        │ DIO0       │ RxDone/TxDone interrupt (input, rising edge)
//! ```
//!
//! MOSI/MISO/SCLK ride the normal SPI0 pins (`/dev/spidev0.0`). SPI is
//! mode 0, MSB first, 8 MHz ceiling.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lora_responder::radio::sx1276::hal::raspberry_pi::RpiRadioHalBuilder;
//!
//! let hal = RpiRadioHalBuilder::new()
//!     .spi_bus(0)
//!     .spi_speed(8_000_000)
//!     .reset_pin(17)
//!     .cs_pin(25)
//!     .dio0_pin(4)
//!     .build()?;
//! # Ok::<(), lora_responder::radio::sx1276::hal::raspberry_pi::RpiHalError>(())
//! ```

use crate::config::ResponderConfig;
use crate::radio::sx1276::hal::{HalError, RadioHal};
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use rppal::spi::{BitOrder, Bus, Error as SpiError, Mode, SlaveSelect, Spi};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// SX1276 SPI clock ceiling in Hz.
const MAX_SPI_SPEED_HZ: u32 = 8_000_000;

/// Reset pulse halves, per the power-on-reset timing in the datasheet.
const RESET_PULSE: Duration = Duration::from_millis(10);

/// Errors specific to the Raspberry Pi HAL implementation
#[derive(Error, Debug)]
pub enum RpiHalError {
    /// SPI bus initialization failed
    #[error("SPI initialization failed: {0}")]
    SpiInit(#[from] SpiError),
    /// GPIO initialization failed
    #[error("GPIO initialization failed: {0}")]
    GpioInit(#[from] rppal::gpio::Error),
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Raspberry Pi HAL for the SX1276.
///
/// Owns the SPI handle and the three GPIO lines for its entire lifetime;
/// no other task touches them. Field order mirrors acquisition order so
/// that a failed construction (or a drop) releases the handles newest
/// first.
pub struct RpiRadioHal {
    spi: Spi,
    reset_pin: OutputPin,
    cs_pin: OutputPin,
    dio0_pin: InputPin,
}

impl RpiRadioHal {
    /// Open SPI and the reset, chip-select and DIO0 lines.
    ///
    /// The reset line opens as an output driven low (the chip is held in
    /// reset until [`RadioHal::reset_pulse`] releases it); chip select
    /// opens high (deselected).
    pub fn new(
        spi_bus: u8,
        spi_speed_hz: u32,
        reset: u8,
        cs: u8,
        dio0: u8,
    ) -> Result<Self, RpiHalError> {
        let bus = match spi_bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            _ => {
                return Err(RpiHalError::InvalidConfig(format!(
                    "Invalid SPI bus {spi_bus}, only 0 and 1 are supported"
                )))
            }
        };

        let spi = Spi::new(bus, SlaveSelect::Ss0, spi_speed_hz, Mode::Mode0)?;
        spi.set_bit_order(BitOrder::MsbFirst)?;

        let gpio = Gpio::new()?;
        let reset_pin = gpio.get(reset)?.into_output_low();
        let cs_pin = gpio.get(cs)?.into_output_high();
        let dio0_pin = gpio.get(dio0)?.into_input();

        log::info!("SX1276 HAL initialized:");
        log::info!("  SPI: bus {spi_bus} at {spi_speed_hz} Hz, mode 0");
        log::info!("  RESET: GPIO {reset}");
        log::info!("  CS: GPIO {cs} (manual)");
        log::info!("  DIO0: GPIO {dio0}");

        Ok(Self {
            spi,
            reset_pin,
            cs_pin,
            dio0_pin,
        })
    }

    /// Build a HAL from the responder configuration.
    pub fn from_config(config: &ResponderConfig) -> Result<Self, RpiHalError> {
        let bus = config
            .spi_bus_index()
            .map_err(|e| RpiHalError::InvalidConfig(e.to_string()))?;
        RpiRadioHalBuilder::new()
            .spi_bus(bus)
            .spi_speed(config.spi_speed_hz)
            .reset_pin(config.reset_pin)
            .cs_pin(config.cs_pin)
            .dio0_pin(config.dio0_pin)
            .build()
    }

    /// One chip-select-framed 2-byte transfer.
    fn transfer(&mut self, header: u8, value: u8) -> Result<u8, HalError> {
        let write_buf = [header, value];
        let mut read_buf = [0u8; 2];

        self.cs_pin.set_low();
        let result = self.spi.transfer(&mut read_buf, &write_buf);
        self.cs_pin.set_high();

        match result {
            Ok(_) => Ok(read_buf[1]),
            Err(e) => {
                log::error!("SPI transfer failed: {e}");
                Err(HalError::Spi(e.to_string()))
            }
        }
    }
}

impl RadioHal for RpiRadioHal {
    fn read_register(&mut self, addr: u8) -> Result<u8, HalError> {
        let value = self.transfer(addr & 0x7F, 0x00)?;
        log::trace!("SPI read 0x{addr:02X} -> 0x{value:02X}");
        Ok(value)
    }

    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), HalError> {
        self.transfer(addr | 0x80, value)?;
        log::trace!("SPI write 0x{addr:02X} <- 0x{value:02X}");
        Ok(())
    }

    fn reset_pulse(&mut self) -> Result<(), HalError> {
        log::debug!("Pulsing SX1276 reset");
        self.reset_pin.set_low();
        thread::sleep(RESET_PULSE);
        self.reset_pin.set_high();
        thread::sleep(RESET_PULSE);
        Ok(())
    }

    fn attach_dio0(&mut self, edges: mpsc::UnboundedSender<()>) -> Result<(), HalError> {
        self.dio0_pin
            .set_async_interrupt(Trigger::RisingEdge, move |_| {
                let _ = edges.send(());
            })
            .map_err(|e| HalError::Gpio(e.to_string()))
    }
}

/// Builder for the Raspberry Pi HAL with validation and defaults
/// matching the Dragino HAT wiring.
pub struct RpiRadioHalBuilder {
    spi_bus: u8,
    spi_speed: u32,
    reset: u8,
    cs: u8,
    dio0: u8,
}

impl Default for RpiRadioHalBuilder {
    fn default() -> Self {
        Self {
            spi_bus: 0,
            spi_speed: MAX_SPI_SPEED_HZ,
            reset: 17,
            cs: 25,
            dio0: 4,
        }
    }
}

impl RpiRadioHalBuilder {
    /// Create a new HAL builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SPI bus number (0 or 1)
    pub fn spi_bus(mut self, bus: u8) -> Self {
        self.spi_bus = bus;
        self
    }

    /// Set the SPI clock speed in Hz (clamped to the 8 MHz ceiling)
    pub fn spi_speed(mut self, speed: u32) -> Self {
        self.spi_speed = speed.min(MAX_SPI_SPEED_HZ);
        self
    }

    /// Set the RESET pin GPIO number
    pub fn reset_pin(mut self, pin: u8) -> Self {
        self.reset = pin;
        self
    }

    /// Set the chip-select pin GPIO number
    pub fn cs_pin(mut self, pin: u8) -> Self {
        self.cs = pin;
        self
    }

    /// Set the DIO0 pin GPIO number
    pub fn dio0_pin(mut self, pin: u8) -> Self {
        self.dio0 = pin;
        self
    }

    /// Build the HAL instance with current configuration
    pub fn build(self) -> Result<RpiRadioHal, RpiHalError> {
        if self.spi_bus > 1 {
            return Err(RpiHalError::InvalidConfig(format!(
                "Invalid SPI bus {}, only 0 and 1 supported",
                self.spi_bus
            )));
        }
        if self.spi_speed == 0 {
            return Err(RpiHalError::InvalidConfig(
                "SPI speed must be non-zero".to_string(),
            ));
        }

        RpiRadioHal::new(self.spi_bus, self.spi_speed, self.reset, self.cs, self.dio0)
    }
}

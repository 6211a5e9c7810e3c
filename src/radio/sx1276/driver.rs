//! # SX1276 Driver
//!
//! The radio state machine, run as a single actor that owns the hardware
//! surface for its entire lifetime. All register sequences, mode
//! transitions and DIO0 dispatch happen inside one message loop, so no
//! two accesses ever interleave.
//!
//! Half-duplex discipline: the chip transits through Standby before every
//! parameter change, every TX setup and every RX arm. A transmit blocks
//! its caller until TxDone (or the 5 s budget expires); reception is
//! armed explicitly and delivers frames to subscribers via DIO0.
//!
//! The meaning of a DIO0 rising edge depends on the mode the chip was in
//! when the event latched, and edges can race mode transitions. The
//! handler therefore always reads the IRQ flags register and dispatches
//! on the bits it finds, clearing exactly what it observed.

use crate::config::RadioConfig;
use crate::error::ResponderError;
use crate::radio::sx1276::hal::RadioHal;
use crate::radio::sx1276::irq::{IrqFlags, IRQ_ALL, IRQ_PAYLOAD_CRC_ERROR, IRQ_RX_DONE, IRQ_TX_DONE};
use crate::radio::sx1276::registers::*;
use crate::radio::{
    validate_payload, EventSender, RadioEvent, Reply, RxFrame, SubscriberId, TxOutcome,
};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Budget for one in-flight transmission.
const TX_TIMEOUT: Duration = Duration::from_secs(5);

/// IRQ poll interval while a transmission is in flight.
const TX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Delay after entering sleep so the LoRa mode bit latches.
const MODE_LATCH_DELAY: Duration = Duration::from_millis(10);

/// Reply deadline for ordinary driver calls. Covers commands queued
/// behind an in-flight 5 s transmit.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Reply deadline for transmit calls (covers the internal 5 s budget).
const TX_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Operating modes of the radio. Every mode write is ORed with the
/// LoRa-mode bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Sleep,
    Standby,
    Tx,
    RxContinuous,
    RxSingle,
}

impl RadioMode {
    fn bits(self) -> u8 {
        match self {
            RadioMode::Sleep => MODE_SLEEP,
            RadioMode::Standby => MODE_STDBY,
            RadioMode::Tx => MODE_TX,
            RadioMode::RxContinuous => MODE_RX_CONTINUOUS,
            RadioMode::RxSingle => MODE_RX_SINGLE,
        }
    }
}

enum Command {
    Begin {
        freq_hz: u32,
        reply: Reply<()>,
    },
    SetFrequency {
        freq_hz: u32,
        reply: Reply<()>,
    },
    SetSpreadingFactor {
        sf: u8,
        reply: Reply<()>,
    },
    SetBandwidth {
        bandwidth_hz: u32,
        reply: Reply<()>,
    },
    SetCodingRate {
        denominator: u8,
        reply: Reply<()>,
    },
    SetTxPower {
        dbm: i8,
        reply: Reply<()>,
    },
    SetSyncWord {
        word: u8,
        reply: Reply<()>,
    },
    Transmit {
        payload: Vec<u8>,
        reply: Reply<TxOutcome>,
    },
    ReceiveMode {
        timeout_ms: u32,
        reply: Reply<()>,
    },
    Standby {
        reply: Reply<()>,
    },
    Sleep {
        reply: Reply<()>,
    },
    HardwareReset {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    GetRssi {
        reply: Reply<i16>,
    },
    GetVersion {
        reply: Reply<u8>,
    },
    Connected {
        reply: Reply<bool>,
    },
    GetSettings {
        reply: Reply<RadioConfig>,
    },
    Subscribe {
        id: SubscriberId,
        sender: EventSender,
        reply: Reply<()>,
    },
    Unsubscribe {
        id: SubscriberId,
        reply: Reply<()>,
    },
}

enum Step {
    Cmd(Option<Command>),
    Edge(Option<()>),
}

/// Cloneable handle to the driver actor.
#[derive(Clone)]
pub struct Sx1276Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Sx1276Handle {
    async fn call<T>(
        &self,
        deadline: Duration,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ResponderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ResponderError::NotConnected)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResponderError::NotConnected),
            Err(_) => Err(ResponderError::Timeout("driver call")),
        }
    }

    /// Run the chip initialization sequence at the given frequency.
    pub async fn begin(&self, freq_hz: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Begin { freq_hz, reply })
            .await
    }

    pub async fn set_frequency(&self, freq_hz: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetFrequency { freq_hz, reply })
            .await
    }

    pub async fn set_spreading_factor(&self, sf: u8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetSpreadingFactor { sf, reply })
            .await
    }

    pub async fn set_bandwidth(&self, bandwidth_hz: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetBandwidth {
            bandwidth_hz,
            reply,
        })
        .await
    }

    pub async fn set_coding_rate(&self, denominator: u8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetCodingRate {
            denominator,
            reply,
        })
        .await
    }

    pub async fn set_tx_power(&self, dbm: i8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetTxPower { dbm, reply })
            .await
    }

    pub async fn set_sync_word(&self, word: u8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::SetSyncWord { word, reply })
            .await
    }

    /// Transmit a payload, blocking until TxDone or the 5 s budget.
    pub async fn transmit(&self, payload: Vec<u8>) -> Result<TxOutcome, ResponderError> {
        self.call(TX_CALL_TIMEOUT, |reply| Command::Transmit { payload, reply })
            .await
    }

    /// Arm reception. `0` selects continuous mode, anything else a
    /// single-shot window.
    pub async fn receive_mode(&self, timeout_ms: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::ReceiveMode { timeout_ms, reply })
            .await
    }

    pub async fn standby(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Standby { reply }).await
    }

    pub async fn sleep(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Sleep { reply }).await
    }

    /// Pulse the reset line; the chip must be re-initialized afterwards.
    pub async fn hardware_reset(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::HardwareReset { reply })
            .await
    }

    /// Release the SPI and GPIO handles.
    pub async fn disconnect(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Disconnect { reply })
            .await
    }

    /// Current RSSI in dBm.
    pub async fn rssi(&self) -> Result<i16, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::GetRssi { reply }).await
    }

    /// Silicon revision read during `begin`.
    pub async fn version(&self) -> Result<u8, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::GetVersion { reply })
            .await
    }

    pub async fn connected(&self) -> bool {
        self.call(CALL_TIMEOUT, |reply| Command::Connected { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn settings(&self) -> Result<RadioConfig, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::GetSettings { reply })
            .await
    }

    /// Register an event subscriber. Never fails while the actor lives.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        sender: EventSender,
    ) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Subscribe { id, sender, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| Command::Unsubscribe { id, reply })
            .await
    }
}

/// The driver actor. Owns the hardware surface exclusively.
pub struct Sx1276Driver<H: RadioHal> {
    hal: Option<H>,
    inbox: mpsc::UnboundedReceiver<Command>,
    dio0_rx: mpsc::UnboundedReceiver<()>,
    dio0_open: bool,
    config: RadioConfig,
    mode: RadioMode,
    connected: bool,
    rx_armed: bool,
    version: Option<u8>,
    subscribers: HashMap<SubscriberId, EventSender>,
}

impl<H: RadioHal + 'static> Sx1276Driver<H> {
    /// Attach DIO0 and start the actor. The chip is untouched until
    /// [`Sx1276Handle::begin`] runs the init sequence.
    pub fn spawn(mut hal: H, config: RadioConfig) -> Result<Sx1276Handle, ResponderError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dio0_tx, dio0_rx) = mpsc::unbounded_channel();
        hal.attach_dio0(dio0_tx)?;

        let driver = Sx1276Driver {
            hal: Some(hal),
            inbox: cmd_rx,
            dio0_rx,
            dio0_open: true,
            config,
            mode: RadioMode::Sleep,
            connected: false,
            rx_armed: false,
            version: None,
            subscribers: HashMap::new(),
        };
        tokio::spawn(driver.run());
        Ok(Sx1276Handle { tx: cmd_tx })
    }

    async fn run(mut self) {
        loop {
            let step = if self.dio0_open {
                tokio::select! {
                    cmd = self.inbox.recv() => Step::Cmd(cmd),
                    edge = self.dio0_rx.recv() => Step::Edge(edge),
                }
            } else {
                Step::Cmd(self.inbox.recv().await)
            };
            match step {
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Step::Cmd(None) => break,
                Step::Edge(Some(())) => self.handle_dio0(),
                Step::Edge(None) => self.dio0_open = false,
            }
        }
        debug!("SX1276 driver actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Begin { freq_hz, reply } => {
                let _ = reply.send(self.begin(freq_hz));
            }
            Command::SetFrequency { freq_hz, reply } => {
                let _ = reply.send(self.set_frequency(freq_hz));
            }
            Command::SetSpreadingFactor { sf, reply } => {
                let _ = reply.send(self.set_spreading_factor(sf));
            }
            Command::SetBandwidth { bandwidth_hz, reply } => {
                let _ = reply.send(self.set_bandwidth(bandwidth_hz));
            }
            Command::SetCodingRate { denominator, reply } => {
                let _ = reply.send(self.set_coding_rate(denominator));
            }
            Command::SetTxPower { dbm, reply } => {
                let _ = reply.send(self.set_tx_power(dbm));
            }
            Command::SetSyncWord { word, reply } => {
                let _ = reply.send(self.set_sync_word(word));
            }
            Command::Transmit { payload, reply } => {
                let result = self.transmit(&payload).await;
                let _ = reply.send(result);
            }
            Command::ReceiveMode { timeout_ms, reply } => {
                let _ = reply.send(self.receive_mode(timeout_ms));
            }
            Command::Standby { reply } => {
                let _ = reply.send(self.require_connected().and_then(|_| self.set_mode(RadioMode::Standby)));
            }
            Command::Sleep { reply } => {
                let _ = reply.send(self.require_connected().and_then(|_| self.set_mode(RadioMode::Sleep)));
            }
            Command::HardwareReset { reply } => {
                let _ = reply.send(self.hardware_reset());
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(Ok(()));
            }
            Command::GetRssi { reply } => {
                let _ = reply.send(self.get_rssi());
            }
            Command::GetVersion { reply } => {
                let _ = reply.send(self.version.ok_or(ResponderError::NotConnected));
            }
            Command::Connected { reply } => {
                let _ = reply.send(Ok(self.connected));
            }
            Command::GetSettings { reply } => {
                let _ = reply.send(Ok(self.config.clone()));
            }
            Command::Subscribe { id, sender, reply } => {
                self.subscribers.insert(id, sender);
                let _ = reply.send(Ok(()));
            }
            Command::Unsubscribe { id, reply } => {
                self.subscribers.remove(&id);
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------

    fn read(&mut self, addr: u8) -> Result<u8, ResponderError> {
        let hal = self.hal.as_mut().ok_or(ResponderError::NotConnected)?;
        match hal.read_register(addr) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.connected = false;
                Err(ResponderError::io(format!("read register 0x{addr:02X}"), e))
            }
        }
    }

    fn write(&mut self, addr: u8, value: u8) -> Result<(), ResponderError> {
        let hal = self.hal.as_mut().ok_or(ResponderError::NotConnected)?;
        match hal.write_register(addr, value) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connected = false;
                Err(ResponderError::io(format!("write register 0x{addr:02X}"), e))
            }
        }
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), ResponderError> {
        self.write(REG_OP_MODE, LONG_RANGE_MODE | mode.bits())?;
        trace!("mode {:?} -> {mode:?}", self.mode);
        self.mode = mode;
        self.rx_armed = matches!(mode, RadioMode::RxContinuous | RadioMode::RxSingle);
        Ok(())
    }

    fn require_connected(&self) -> Result<(), ResponderError> {
        if self.connected {
            Ok(())
        } else {
            Err(ResponderError::NotConnected)
        }
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    fn begin(&mut self, freq_hz: u32) -> Result<(), ResponderError> {
        if self.connected {
            return Err(ResponderError::ResourceBusy("radio already initialized"));
        }
        let hal = self.hal.as_mut().ok_or(ResponderError::NotConnected)?;
        hal.reset_pulse()
            .map_err(|e| ResponderError::io("hardware reset", e))?;

        let version = self.read(REG_VERSION)?;
        if version != CHIP_VERSION {
            // Wrong or absent silicon: give the handles back
            self.hal = None;
            self.dio0_open = false;
            return Err(ResponderError::InvalidChip(version));
        }
        self.version = Some(version);

        self.set_mode(RadioMode::Sleep)?;
        // The LoRa-mode bit only latches while the chip sleeps
        std::thread::sleep(MODE_LATCH_DELAY);

        self.write_frf(freq_hz)?;
        self.config.frequency_hz = freq_hz;

        self.write(REG_FIFO_TX_BASE_ADDR, 0x00)?;
        self.write(REG_FIFO_RX_BASE_ADDR, 0x00)?;

        let lna = self.read(REG_LNA)?;
        self.write(REG_LNA, lna | LNA_BOOST_HF)?;
        self.write(REG_MODEM_CONFIG_3, MC3_AGC_AUTO_ON)?;

        let defaults = self.config.clone();
        self.apply_tx_power(defaults.tx_power_dbm)?;
        self.apply_spreading_factor(defaults.spreading_factor)?;
        self.apply_bandwidth(defaults.bandwidth_hz)?;
        self.apply_coding_rate(defaults.coding_rate)?;
        self.apply_crc(defaults.crc_on)?;
        self.apply_header_mode(defaults.implicit_header)?;
        self.apply_preamble_len(defaults.preamble_len)?;
        self.write(REG_SYNC_WORD, defaults.sync_word)?;

        self.set_mode(RadioMode::Standby)?;
        self.connected = true;
        info!(
            "SX1276 initialized at {} Hz (silicon rev 0x{version:02X})",
            freq_hz
        );
        Ok(())
    }

    fn hardware_reset(&mut self) -> Result<(), ResponderError> {
        let hal = self.hal.as_mut().ok_or(ResponderError::NotConnected)?;
        hal.reset_pulse()
            .map_err(|e| ResponderError::io("hardware reset", e))?;
        self.connected = false;
        self.rx_armed = false;
        self.mode = RadioMode::Sleep;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.hal = None;
        self.dio0_open = false;
        self.connected = false;
        self.rx_armed = false;
        self.version = None;
        info!("SX1276 disconnected, handles released");
    }

    // ------------------------------------------------------------------
    // Parameter setters
    // ------------------------------------------------------------------

    fn set_frequency(&mut self, freq_hz: u32) -> Result<(), ResponderError> {
        self.require_connected()?;
        if !(137_000_000..=1_020_000_000).contains(&freq_hz) {
            return Err(ResponderError::InvalidParam(format!(
                "frequency {freq_hz} Hz outside 137-1020 MHz"
            )));
        }
        self.set_mode(RadioMode::Standby)?;
        self.write_frf(freq_hz)?;
        self.config.frequency_hz = freq_hz;
        Ok(())
    }

    fn write_frf(&mut self, freq_hz: u32) -> Result<(), ResponderError> {
        let frf = frf_from_hz(freq_hz);
        self.write(REG_FRF_MSB, (frf >> 16) as u8)?;
        self.write(REG_FRF_MID, (frf >> 8) as u8)?;
        self.write(REG_FRF_LSB, frf as u8)?;
        Ok(())
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), ResponderError> {
        self.require_connected()?;
        if !(6..=12).contains(&sf) {
            return Err(ResponderError::InvalidParam(format!(
                "spreading factor {sf} outside 6..=12"
            )));
        }
        if sf == 6 && !self.config.implicit_header {
            return Err(ResponderError::InvalidParam(
                "spreading factor 6 requires implicit header mode".into(),
            ));
        }
        self.set_mode(RadioMode::Standby)?;
        self.apply_spreading_factor(sf)
    }

    fn apply_spreading_factor(&mut self, sf: u8) -> Result<(), ResponderError> {
        let cfg2 = self.read(REG_MODEM_CONFIG_2)?;
        self.write(REG_MODEM_CONFIG_2, (cfg2 & 0x0F) | (sf << 4))?;
        if sf == 6 {
            self.write(REG_DETECTION_OPTIMIZE, DETECT_OPT_SF6)?;
            self.write(REG_DETECTION_THRESHOLD, DETECT_THRESH_SF6)?;
        } else {
            self.write(REG_DETECTION_OPTIMIZE, DETECT_OPT_SF7_12)?;
            self.write(REG_DETECTION_THRESHOLD, DETECT_THRESH_SF7_12)?;
        }
        self.config.spreading_factor = sf;
        Ok(())
    }

    fn set_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), ResponderError> {
        self.require_connected()?;
        self.set_mode(RadioMode::Standby)?;
        self.apply_bandwidth(bandwidth_hz)
    }

    fn apply_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), ResponderError> {
        let bits = bandwidth_bits(bandwidth_hz).ok_or_else(|| {
            ResponderError::InvalidParam(format!("bandwidth {bandwidth_hz} Hz is not a LoRa bandwidth"))
        })?;
        let cfg1 = self.read(REG_MODEM_CONFIG_1)?;
        self.write(REG_MODEM_CONFIG_1, (cfg1 & 0x0F) | bits)?;
        self.config.bandwidth_hz = bandwidth_hz;
        Ok(())
    }

    fn set_coding_rate(&mut self, denominator: u8) -> Result<(), ResponderError> {
        self.require_connected()?;
        if !(5..=8).contains(&denominator) {
            return Err(ResponderError::InvalidParam(format!(
                "coding rate denominator {denominator} outside 5..=8"
            )));
        }
        self.set_mode(RadioMode::Standby)?;
        self.apply_coding_rate(denominator)
    }

    fn apply_coding_rate(&mut self, denominator: u8) -> Result<(), ResponderError> {
        let cfg1 = self.read(REG_MODEM_CONFIG_1)?;
        self.write(REG_MODEM_CONFIG_1, (cfg1 & 0xF1) | ((denominator - 4) << 1))?;
        self.config.coding_rate = denominator;
        Ok(())
    }

    fn set_tx_power(&mut self, dbm: i8) -> Result<(), ResponderError> {
        self.require_connected()?;
        if !(2..=20).contains(&dbm) {
            return Err(ResponderError::InvalidParam(format!(
                "TX power {dbm} dBm outside 2..=20"
            )));
        }
        self.set_mode(RadioMode::Standby)?;
        self.apply_tx_power(dbm)
    }

    fn apply_tx_power(&mut self, dbm: i8) -> Result<(), ResponderError> {
        // PA_BOOST output in both ranges; above 17 dBm the PA DAC high
        // power option changes the PA-config offset
        if dbm <= 17 {
            self.write(REG_PA_DAC, PA_DAC_DEFAULT)?;
            self.write(REG_OCP, OCP_100_MA)?;
            self.write(REG_PA_CONFIG, PA_SELECT_BOOST | (dbm - 2) as u8)?;
        } else {
            self.write(REG_PA_DAC, PA_DAC_BOOST)?;
            self.write(REG_OCP, OCP_240_MA)?;
            self.write(REG_PA_CONFIG, PA_SELECT_BOOST | (dbm - 5) as u8)?;
        }
        self.config.tx_power_dbm = dbm;
        Ok(())
    }

    fn set_sync_word(&mut self, word: u8) -> Result<(), ResponderError> {
        self.require_connected()?;
        self.set_mode(RadioMode::Standby)?;
        self.write(REG_SYNC_WORD, word)?;
        self.config.sync_word = word;
        Ok(())
    }

    fn apply_crc(&mut self, on: bool) -> Result<(), ResponderError> {
        let cfg2 = self.read(REG_MODEM_CONFIG_2)?;
        let value = if on {
            cfg2 | MC2_RX_PAYLOAD_CRC_ON
        } else {
            cfg2 & !MC2_RX_PAYLOAD_CRC_ON
        };
        self.write(REG_MODEM_CONFIG_2, value)?;
        self.config.crc_on = on;
        Ok(())
    }

    fn apply_header_mode(&mut self, implicit: bool) -> Result<(), ResponderError> {
        let cfg1 = self.read(REG_MODEM_CONFIG_1)?;
        let value = if implicit {
            cfg1 | MC1_IMPLICIT_HEADER
        } else {
            cfg1 & !MC1_IMPLICIT_HEADER
        };
        self.write(REG_MODEM_CONFIG_1, value)?;
        self.config.implicit_header = implicit;
        Ok(())
    }

    fn apply_preamble_len(&mut self, len: u16) -> Result<(), ResponderError> {
        self.write(REG_PREAMBLE_MSB, (len >> 8) as u8)?;
        self.write(REG_PREAMBLE_LSB, len as u8)?;
        self.config.preamble_len = len;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transmit / receive
    // ------------------------------------------------------------------

    async fn transmit(&mut self, payload: &[u8]) -> Result<TxOutcome, ResponderError> {
        self.require_connected()?;
        validate_payload(payload)?;

        self.set_mode(RadioMode::Standby)?;
        self.write(REG_FIFO_ADDR_PTR, 0x00)?;
        for &byte in payload {
            self.write(REG_FIFO, byte)?;
        }
        self.write(REG_PAYLOAD_LENGTH, payload.len() as u8)?;
        self.write(REG_IRQ_FLAGS, IRQ_ALL)?;
        self.set_mode(RadioMode::Tx)?;

        // Completion: DIO0 edge or the 10 ms poll, whichever first. The
        // actor has no other work while a TX is in flight.
        let deadline = Instant::now() + TX_TIMEOUT;
        loop {
            if self.dio0_open {
                tokio::select! {
                    _ = tokio::time::sleep(TX_POLL_INTERVAL) => {}
                    edge = self.dio0_rx.recv() => {
                        if edge.is_none() {
                            self.dio0_open = false;
                        }
                    }
                }
            } else {
                tokio::time::sleep(TX_POLL_INTERVAL).await;
            }

            let flags = IrqFlags::from(self.read(REG_IRQ_FLAGS)?);
            if flags.tx_done() {
                self.write(REG_IRQ_FLAGS, IRQ_TX_DONE)?;
                self.set_mode(RadioMode::Standby)?;
                debug!("TX done ({} bytes)", payload.len());
                self.broadcast(RadioEvent::TxDone);
                return Ok(TxOutcome::Ok);
            }
            if Instant::now() >= deadline {
                warn!("TX timed out after {TX_TIMEOUT:?}");
                self.set_mode(RadioMode::Standby)?;
                return Ok(TxOutcome::Timeout);
            }
        }
    }

    fn receive_mode(&mut self, timeout_ms: u32) -> Result<(), ResponderError> {
        self.require_connected()?;
        self.set_mode(RadioMode::Standby)?;
        self.write(REG_FIFO_ADDR_PTR, 0x00)?;
        self.write(REG_IRQ_FLAGS, IRQ_ALL)?;
        self.write(REG_DIO_MAPPING_1, DIO0_RX_DONE)?;
        if timeout_ms == 0 {
            self.set_mode(RadioMode::RxContinuous)?;
            debug!("RX armed (continuous)");
        } else {
            self.set_mode(RadioMode::RxSingle)?;
            debug!("RX armed ({timeout_ms} ms window)");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DIO0 dispatch
    // ------------------------------------------------------------------

    fn handle_dio0(&mut self) {
        if self.hal.is_none() {
            return;
        }
        let flags = match self.read(REG_IRQ_FLAGS) {
            Ok(raw) => IrqFlags::from(raw),
            Err(e) => {
                warn!("DIO0 edge but IRQ register unreadable: {e}");
                return;
            }
        };

        if flags.rx_done() {
            if flags.crc_error() {
                // Corrupt frame: clear and tell no one
                let _ = self.write(REG_IRQ_FLAGS, IRQ_RX_DONE | IRQ_PAYLOAD_CRC_ERROR);
                debug!("dropped frame with CRC error");
                return;
            }
            match self.read_frame() {
                Ok(frame) => {
                    debug!(
                        "RX {} bytes, rssi {:?} dBm, snr {:?} dB",
                        frame.bytes.len(),
                        frame.rssi_dbm,
                        frame.snr_db
                    );
                    self.broadcast(RadioEvent::Frame(frame));
                }
                Err(e) => warn!("failed to read received frame: {e}"),
            }
            let _ = self.write(REG_IRQ_FLAGS, IRQ_RX_DONE);
        } else if flags.tx_done() {
            // Edge raced a completed transmit; nothing is waiting on it
            let _ = self.write(REG_IRQ_FLAGS, IRQ_TX_DONE);
        } else if flags.has_any() {
            trace!("spurious DIO0 edge, flags 0x{:02X}", flags.raw());
            let _ = self.write(REG_IRQ_FLAGS, flags.raw());
        }
    }

    fn read_frame(&mut self) -> Result<RxFrame, ResponderError> {
        let current = self.read(REG_FIFO_RX_CURRENT_ADDR)?;
        self.write(REG_FIFO_ADDR_PTR, current)?;
        let len = self.read(REG_RX_NB_BYTES)? as usize;
        // One transfer per byte; burst access is untested on this part
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read(REG_FIFO)?);
        }
        let rssi = self.read(REG_PKT_RSSI_VALUE)? as i16 - RSSI_OFFSET_HF;
        let raw_snr = self.read(REG_PKT_SNR_VALUE)?;
        let snr = if raw_snr > 127 {
            (raw_snr as i16 - 256) as f32 / 4.0
        } else {
            raw_snr as f32 / 4.0
        };
        Ok(RxFrame {
            bytes,
            rssi_dbm: Some(rssi),
            snr_db: Some(snr),
        })
    }

    fn get_rssi(&mut self) -> Result<i16, ResponderError> {
        self.require_connected()?;
        Ok(self.read(REG_RSSI_VALUE)? as i16 - RSSI_OFFSET_HF)
    }

    fn broadcast(&mut self, event: RadioEvent) {
        self.subscribers
            .retain(|id, sender| match sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!("dropping gone subscriber {id}");
                    false
                }
            });
    }
}

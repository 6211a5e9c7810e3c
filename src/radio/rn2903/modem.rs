//! # RN2903 Modem Driver
//!
//! Line-framed request/response transport for the Microchip RN2903 LoRa
//! modem: 57600 8N1, no flow control, `\r\n` separators. One command is
//! in flight at a time and its reply is the next complete line; the
//! modem also emits unsolicited `radio_rx` / `radio_tx_ok` / `radio_err`
//! lines, which are parsed for subscriber fan-out whether or not a
//! command is waiting.
//!
//! The modem reports no RSSI/SNR for received frames, so frames from
//! this backend carry no link metrics.

use crate::config::RadioConfig;
use crate::error::ResponderError;
use crate::radio::{
    validate_payload, EventSender, RadioEvent, Reply, RxFrame, SubscriberId, TxOutcome,
};
use crate::util::hex::{decode_hex, encode_hex};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Line speed of the RN2903 UART.
const BAUD_RATE: u32 = 57_600;

/// Reply deadline for ordinary commands.
const CMD_TIMEOUT: Duration = Duration::from_secs(3);

/// Budget for a transmission after the modem accepted `radio tx`.
const TX_COMPLETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wake-up retry schedule.
const WAKE_ATTEMPTS: u32 = 3;
const WAKE_REPLY_TIMEOUT: Duration = Duration::from_millis(200);
const WAKE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reply deadline for calls into the actor.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const TX_CALL_TIMEOUT: Duration = Duration::from_secs(30);

enum ModemCommand {
    Connect { reply: Reply<String> },
    Disconnect { reply: Reply<()> },
    Transmit { payload: Vec<u8>, reply: Reply<TxOutcome> },
    ReceiveMode { timeout_ms: u32, reply: Reply<()> },
    RawCommand { cmd: String, reply: Reply<String> },
    SetFrequency { freq_hz: u32, reply: Reply<()> },
    SetSpreadingFactor { sf: u8, reply: Reply<()> },
    SetBandwidth { bandwidth_hz: u32, reply: Reply<()> },
    SetTxPower { dbm: i8, reply: Reply<()> },
    GetVersion { reply: Reply<String> },
    GetSettings { reply: Reply<RadioConfig> },
    Connected { reply: Reply<bool> },
    Subscribe { id: SubscriberId, sender: EventSender, reply: Reply<()> },
    Unsubscribe { id: SubscriberId, reply: Reply<()> },
}

enum Step {
    Cmd(Option<ModemCommand>),
    Line(Option<String>),
}

/// Cloneable handle to the modem actor.
#[derive(Clone)]
pub struct Rn2903Handle {
    tx: mpsc::UnboundedSender<ModemCommand>,
}

impl Rn2903Handle {
    async fn call<T>(
        &self,
        deadline: Duration,
        build: impl FnOnce(Reply<T>) -> ModemCommand,
    ) -> Result<T, ResponderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ResponderError::NotConnected)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResponderError::NotConnected),
            Err(_) => Err(ResponderError::Timeout("modem call")),
        }
    }

    /// Open the serial port, wake the modem and apply the radio settings.
    /// Returns the modem's version banner.
    pub async fn connect(&self) -> Result<String, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::Connect { reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::Disconnect { reply })
            .await
    }

    /// Transmit a payload, blocking until `radio_tx_ok` / `radio_err`.
    pub async fn transmit(&self, payload: Vec<u8>) -> Result<TxOutcome, ResponderError> {
        self.call(TX_CALL_TIMEOUT, |reply| ModemCommand::Transmit { payload, reply })
            .await
    }

    /// Arm reception; `0` keeps the receiver open until a packet arrives.
    pub async fn receive_mode(&self, timeout_ms: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::ReceiveMode { timeout_ms, reply })
            .await
    }

    /// Send a raw protocol line and return the modem's reply.
    pub async fn raw_command(&self, cmd: impl Into<String>) -> Result<String, ResponderError> {
        let cmd = cmd.into();
        self.call(CALL_TIMEOUT, |reply| ModemCommand::RawCommand { cmd, reply })
            .await
    }

    pub async fn set_frequency(&self, freq_hz: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::SetFrequency { freq_hz, reply })
            .await
    }

    pub async fn set_spreading_factor(&self, sf: u8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::SetSpreadingFactor { sf, reply })
            .await
    }

    pub async fn set_bandwidth(&self, bandwidth_hz: u32) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::SetBandwidth { bandwidth_hz, reply })
            .await
    }

    pub async fn set_tx_power(&self, dbm: i8) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::SetTxPower { dbm, reply })
            .await
    }

    /// Version banner recorded during wake-up.
    pub async fn version(&self) -> Result<String, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::GetVersion { reply })
            .await
    }

    pub async fn settings(&self) -> Result<RadioConfig, ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::GetSettings { reply })
            .await
    }

    pub async fn connected(&self) -> bool {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::Connected { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn subscribe(
        &self,
        id: SubscriberId,
        sender: EventSender,
    ) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::Subscribe { id, sender, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), ResponderError> {
        self.call(CALL_TIMEOUT, |reply| ModemCommand::Unsubscribe { id, reply })
            .await
    }
}

/// The modem actor. Owns the serial port for its entire lifetime.
pub struct Rn2903Modem {
    port_path: String,
    inbox: mpsc::UnboundedReceiver<ModemCommand>,
    writer: Option<WriteHalf<SerialStream>>,
    line_rx: Option<mpsc::UnboundedReceiver<String>>,
    reader_task: Option<JoinHandle<()>>,
    connected: bool,
    version: Option<String>,
    settings: RadioConfig,
    subscribers: HashMap<SubscriberId, EventSender>,
}

impl Rn2903Modem {
    /// Start the actor. The port is untouched until
    /// [`Rn2903Handle::connect`] opens it.
    pub fn spawn(port_path: String, settings: RadioConfig) -> Rn2903Handle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let modem = Rn2903Modem {
            port_path,
            inbox: cmd_rx,
            writer: None,
            line_rx: None,
            reader_task: None,
            connected: false,
            version: None,
            settings,
            subscribers: HashMap::new(),
        };
        tokio::spawn(modem.run());
        Rn2903Handle { tx: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            let step = match self.line_rx {
                Some(ref mut line_rx) => tokio::select! {
                    cmd = self.inbox.recv() => Step::Cmd(cmd),
                    line = line_rx.recv() => Step::Line(line),
                },
                None => Step::Cmd(self.inbox.recv().await),
            };
            match step {
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Step::Cmd(None) => break,
                Step::Line(Some(line)) => self.process_line(&line),
                Step::Line(None) => {
                    warn!("serial reader ended, marking modem disconnected");
                    self.teardown();
                }
            }
        }
        self.teardown();
        debug!("RN2903 modem actor stopped");
    }

    async fn handle_command(&mut self, cmd: ModemCommand) {
        match cmd {
            ModemCommand::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            ModemCommand::Disconnect { reply } => {
                self.teardown();
                let _ = reply.send(Ok(()));
            }
            ModemCommand::Transmit { payload, reply } => {
                let result = self.transmit(&payload).await;
                let _ = reply.send(result);
            }
            ModemCommand::ReceiveMode { timeout_ms, reply } => {
                let result = self.receive_mode(timeout_ms).await;
                let _ = reply.send(result);
            }
            ModemCommand::RawCommand { cmd, reply } => {
                let result = self.send_command(&cmd, CMD_TIMEOUT).await;
                let _ = reply.send(result);
            }
            ModemCommand::SetFrequency { freq_hz, reply } => {
                let result = self.command_expect_ok(&format!("radio set freq {freq_hz}")).await;
                if result.is_ok() {
                    self.settings.frequency_hz = freq_hz;
                }
                let _ = reply.send(result);
            }
            ModemCommand::SetSpreadingFactor { sf, reply } => {
                let result = if (6..=12).contains(&sf) {
                    let r = self.command_expect_ok(&format!("radio set sf sf{sf}")).await;
                    if r.is_ok() {
                        self.settings.spreading_factor = sf;
                    }
                    r
                } else {
                    Err(ResponderError::InvalidParam(format!(
                        "spreading factor {sf} outside 6..=12"
                    )))
                };
                let _ = reply.send(result);
            }
            ModemCommand::SetBandwidth { bandwidth_hz, reply } => {
                let result = self.set_bandwidth(bandwidth_hz).await;
                let _ = reply.send(result);
            }
            ModemCommand::SetTxPower { dbm, reply } => {
                let result = self.command_expect_ok(&format!("radio set pwr {dbm}")).await;
                if result.is_ok() {
                    self.settings.tx_power_dbm = dbm;
                }
                let _ = reply.send(result);
            }
            ModemCommand::GetVersion { reply } => {
                let _ = reply.send(self.version.clone().ok_or(ResponderError::NotConnected));
            }
            ModemCommand::GetSettings { reply } => {
                let _ = reply.send(Ok(self.settings.clone()));
            }
            ModemCommand::Connected { reply } => {
                let _ = reply.send(Ok(self.connected));
            }
            ModemCommand::Subscribe { id, sender, reply } => {
                self.subscribers.insert(id, sender);
                let _ = reply.send(Ok(()));
            }
            ModemCommand::Unsubscribe { id, reply } => {
                self.subscribers.remove(&id);
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn connect(&mut self) -> Result<String, ResponderError> {
        if self.connected {
            return Err(ResponderError::ResourceBusy("modem already connected"));
        }
        let port = tokio_serial::new(&self.port_path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ResponderError::io(format!("open serial port {}", self.port_path), e)
            })?;

        let (reader, writer) = tokio::io::split(port);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        self.writer = Some(writer);
        self.line_rx = Some(line_rx);
        self.reader_task = Some(tokio::spawn(read_lines(reader, line_tx)));

        match self.initialize().await {
            Ok(version) => {
                self.connected = true;
                info!("RN2903 connected on {}: {version}", self.port_path);
                Ok(version)
            }
            Err(e) => {
                // Leave no half-open port behind
                self.teardown();
                Err(e)
            }
        }
    }

    async fn initialize(&mut self) -> Result<String, ResponderError> {
        let version = self.wake_up().await?;
        self.version = Some(version.clone());

        // The LoRaWAN stack must be paused before raw radio commands work
        let pause = self.send_command("mac pause", CMD_TIMEOUT).await?;
        trace!("mac pause -> {pause}");

        self.apply_settings().await?;
        Ok(version)
    }

    /// Wake the modem: flush with empty lines, then ask for the version
    /// until a `RN...` banner appears. The first attempt routinely earns
    /// an `invalid_param` for the stray CRLFs; that is expected.
    async fn wake_up(&mut self) -> Result<String, ResponderError> {
        for attempt in 1..=WAKE_ATTEMPTS {
            self.write_raw(b"\r\n\r\n\r\n").await?;
            self.write_line("sys get ver").await?;
            loop {
                match self.await_line(WAKE_REPLY_TIMEOUT).await {
                    Ok(line) if line.starts_with("RN") => return Ok(line),
                    Ok(line) => {
                        debug!("wake-up attempt {attempt}: ignoring {line:?}");
                    }
                    Err(_) => break,
                }
            }
            tokio::time::sleep(WAKE_RETRY_DELAY).await;
        }
        Err(ResponderError::Timeout("modem wake-up"))
    }

    async fn apply_settings(&mut self) -> Result<(), ResponderError> {
        let settings = self.settings.clone();
        self.command_expect_ok(&format!("radio set freq {}", settings.frequency_hz))
            .await?;
        self.command_expect_ok(&format!("radio set sf sf{}", settings.spreading_factor))
            .await?;
        self.set_bandwidth(settings.bandwidth_hz).await?;
        self.command_expect_ok(&format!("radio set pwr {}", settings.tx_power_dbm))
            .await?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.line_rx = None;
        self.connected = false;
    }

    // ------------------------------------------------------------------
    // Command transport
    // ------------------------------------------------------------------

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ResponderError> {
        let writer = self.writer.as_mut().ok_or(ResponderError::NotConnected)?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("serial write failed: {e}");
            self.teardown();
            return Err(ResponderError::io("serial write", e));
        }
        Ok(())
    }

    async fn write_line(&mut self, cmd: &str) -> Result<(), ResponderError> {
        trace!("-> {cmd}");
        let mut framed = cmd.as_bytes().to_vec();
        framed.extend_from_slice(b"\r\n");
        self.write_raw(&framed).await
    }

    async fn await_line(&mut self, deadline: Duration) -> Result<String, ResponderError> {
        let line_rx = self.line_rx.as_mut().ok_or(ResponderError::NotConnected)?;
        match tokio::time::timeout(deadline, line_rx.recv()).await {
            Ok(Some(line)) => {
                trace!("<- {line}");
                Ok(line)
            }
            Ok(None) => {
                self.teardown();
                Err(ResponderError::NotConnected)
            }
            Err(_) => Err(ResponderError::Timeout("serial reply")),
        }
    }

    /// Send one command; the reply is the next complete line. Unsolicited
    /// lines that arrive as the "reply" still fan out to subscribers.
    async fn send_command(
        &mut self,
        cmd: &str,
        deadline: Duration,
    ) -> Result<String, ResponderError> {
        self.write_line(cmd).await?;
        let line = self.await_line(deadline).await?;
        self.process_line(&line);
        Ok(line)
    }

    /// Send a command and insist on an `ok`, skimming past any async
    /// notifications that slipped in ahead of the reply.
    async fn command_expect_ok(&mut self, cmd: &str) -> Result<(), ResponderError> {
        let mut reply = self.send_command(cmd, CMD_TIMEOUT).await?;
        let mut skimmed = 0;
        while is_async_notification(&reply) && skimmed < 4 {
            reply = self.await_line(CMD_TIMEOUT).await?;
            self.process_line(&reply);
            skimmed += 1;
        }
        match reply.as_str() {
            "ok" => Ok(()),
            "invalid_param" => Err(ResponderError::InvalidParam(format!("{cmd} rejected"))),
            "busy" => Err(ResponderError::ResourceBusy("modem radio busy")),
            other => Err(ResponderError::io(
                cmd.to_string(),
                format!("unexpected reply {other:?}"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Radio operations
    // ------------------------------------------------------------------

    async fn transmit(&mut self, payload: &[u8]) -> Result<TxOutcome, ResponderError> {
        if !self.connected {
            return Err(ResponderError::NotConnected);
        }
        validate_payload(payload)?;
        self.command_expect_ok(&format!("radio tx {}", encode_hex(payload)))
            .await?;

        // The modem signals completion asynchronously
        let deadline = Instant::now() + TX_COMPLETE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("TX completion timed out after {TX_COMPLETE_TIMEOUT:?}");
                return Ok(TxOutcome::Timeout);
            }
            let line = match self.await_line(remaining).await {
                Ok(line) => line,
                Err(ResponderError::Timeout(_)) => {
                    warn!("TX completion timed out after {TX_COMPLETE_TIMEOUT:?}");
                    return Ok(TxOutcome::Timeout);
                }
                Err(e) => return Err(e),
            };
            self.process_line(&line);
            match line.split_whitespace().next() {
                Some("radio_tx_ok") => return Ok(TxOutcome::Ok),
                Some("radio_err") => return Ok(TxOutcome::Err),
                _ => continue,
            }
        }
    }

    async fn receive_mode(&mut self, timeout_ms: u32) -> Result<(), ResponderError> {
        if !self.connected {
            return Err(ResponderError::NotConnected);
        }
        self.command_expect_ok(&format!("radio rx {timeout_ms}")).await
    }

    async fn set_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), ResponderError> {
        let khz = match bandwidth_hz {
            125_000 => 125,
            250_000 => 250,
            500_000 => 500,
            other => {
                return Err(ResponderError::InvalidParam(format!(
                    "bandwidth {other} Hz unsupported by RN2903 (125/250/500 kHz)"
                )))
            }
        };
        self.command_expect_ok(&format!("radio set bw {khz}")).await?;
        self.settings.bandwidth_hz = bandwidth_hz;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Async line parsing
    // ------------------------------------------------------------------

    fn process_line(&mut self, line: &str) {
        if let Some(event) = parse_event(line) {
            self.broadcast(event);
        }
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

fn is_async_notification(line: &str) -> bool {
    matches!(
        line.split_whitespace().next(),
        Some("radio_rx") | Some("radio_tx_ok") | Some("radio_err")
    )
}

/// Map an unsolicited modem line to a radio event. Lines that are
/// command replies (or malformed notifications, which are dropped with
/// a warning) map to nothing.
fn parse_event(line: &str) -> Option<RadioEvent> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("radio_rx") => {
            let Some(hex_payload) = parts.next() else {
                warn!("radio_rx line without payload");
                return None;
            };
            match decode_hex(hex_payload) {
                Ok(bytes) if !bytes.is_empty() => {
                    debug!("RX {} bytes via modem", bytes.len());
                    // No link metrics on this backend
                    Some(RadioEvent::Frame(RxFrame {
                        bytes,
                        rssi_dbm: None,
                        snr_db: None,
                    }))
                }
                Ok(_) => {
                    warn!("dropping empty radio_rx payload");
                    None
                }
                Err(e) => {
                    warn!("dropping radio_rx with bad hex: {e}");
                    None
                }
            }
        }
        Some("radio_tx_ok") => Some(RadioEvent::TxDone),
        Some("radio_err") => Some(RadioEvent::TxError),
        // Everything else is a command reply; the waiter consumes it
        _ => None,
    }
}

/// Reader task: split the byte stream on `\r\n` and forward complete,
/// non-empty lines into the actor.
async fn read_lines(reader: ReadHalf<SerialStream>, lines: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.is_empty() && lines.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("serial read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_notification_detection() {
        assert!(is_async_notification("radio_rx 48495A"));
        assert!(is_async_notification("  radio_rx  48495A"));
        assert!(is_async_notification("radio_tx_ok"));
        assert!(is_async_notification("radio_err"));
        assert!(!is_async_notification("ok"));
        assert!(!is_async_notification("invalid_param"));
        assert!(!is_async_notification("RN2903 1.0.3 Aug  8 2017 15:11:09"));
    }

    #[test]
    fn test_parse_radio_rx() {
        // The modem pads notifications with double spaces
        let event = parse_event("radio_rx  48495A").unwrap();
        assert_eq!(
            event,
            RadioEvent::Frame(RxFrame {
                bytes: vec![0x48, 0x49, 0x5A],
                rssi_dbm: None,
                snr_db: None,
            })
        );
        // Case-insensitive hex
        let event = parse_event("radio_rx 48495a").unwrap();
        assert!(matches!(event, RadioEvent::Frame(_)));
    }

    #[test]
    fn test_parse_tx_completion() {
        assert_eq!(parse_event("radio_tx_ok"), Some(RadioEvent::TxDone));
        assert_eq!(parse_event("radio_err"), Some(RadioEvent::TxError));
    }

    #[test]
    fn test_parse_drops_bad_lines() {
        // Odd-length and non-hex payloads recover locally as drops
        assert_eq!(parse_event("radio_rx 484"), None);
        assert_eq!(parse_event("radio_rx GG"), None);
        assert_eq!(parse_event("radio_rx"), None);
        assert_eq!(parse_event("radio_rx "), None);
        // Opaque replies are not events
        assert_eq!(parse_event("ok"), None);
        assert_eq!(parse_event("4294967245"), None);
        assert_eq!(parse_event("RN2903 1.0.3 Aug  8 2017 15:11:09"), None);
    }
}

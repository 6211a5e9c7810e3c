//! # Event Sink
//!
//! Contract for the timestamped append-only field-test log. The core
//! emits TX payloads, RX payloads with optional link metrics, and
//! lifecycle tags; sinks must accept them without ever applying
//! backpressure. [`LogEventSink`] writes through the process logger,
//! [`RecordingEventSink`] captures events for test assertions.

use crate::util::hex::encode_hex;
use chrono::Utc;
use log::info;
use std::sync::Mutex;

/// Best-effort sink for TX/RX/lifecycle events.
pub trait EventSink: Send + Sync {
    /// An outbound payload was submitted.
    fn tx(&self, payload: &[u8]);

    /// An inbound payload arrived, with whatever metrics the backend had.
    fn rx(&self, payload: &[u8], rssi_dbm: Option<i16>, snr_db: Option<f32>);

    /// A lifecycle marker (`tx_ok`, `tx_error`, service start/stop tags).
    fn event(&self, tag: &str);
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Sink that appends events to the process log.
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn tx(&self, payload: &[u8]) {
        info!(
            "{} TX {} ({} bytes)",
            timestamp(),
            encode_hex(payload),
            payload.len()
        );
    }

    fn rx(&self, payload: &[u8], rssi_dbm: Option<i16>, snr_db: Option<f32>) {
        let rssi = rssi_dbm.map_or("-".to_string(), |r| format!("{r} dBm"));
        let snr = snr_db.map_or("-".to_string(), |s| format!("{s} dB"));
        info!(
            "{} RX {} ({} bytes, rssi {rssi}, snr {snr})",
            timestamp(),
            encode_hex(payload),
            payload.len()
        );
    }

    fn event(&self, tag: &str) {
        info!("{} EVENT {tag}", timestamp());
    }
}

/// Sink that discards everything.
#[derive(Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn tx(&self, _payload: &[u8]) {}
    fn rx(&self, _payload: &[u8], _rssi_dbm: Option<i16>, _snr_db: Option<f32>) {}
    fn event(&self, _tag: &str) {}
}

/// One captured sink record.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Tx(Vec<u8>),
    Rx(Vec<u8>, Option<i16>, Option<f32>),
    Event(String),
}

/// Sink that records everything for test assertions.
#[derive(Default)]
pub struct RecordingEventSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                SinkRecord::Event(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn tx(&self, payload: &[u8]) {
        self.records
            .lock()
            .unwrap()
            .push(SinkRecord::Tx(payload.to_vec()));
    }

    fn rx(&self, payload: &[u8], rssi_dbm: Option<i16>, snr_db: Option<f32>) {
        self.records
            .lock()
            .unwrap()
            .push(SinkRecord::Rx(payload.to_vec(), rssi_dbm, snr_db));
    }

    fn event(&self, tag: &str) {
        self.records
            .lock()
            .unwrap()
            .push(SinkRecord::Event(tag.to_string()));
    }
}

//! # SX1276 Driver Tests
//!
//! Exercises the driver actor against the scriptable mock HAL: the init
//! sequence, bit-exact parameter setters, the transmit/receive register
//! choreography and the DIO0 dispatch state machine.

use lora_responder::radio::sx1276::irq::{IRQ_PAYLOAD_CRC_ERROR, IRQ_RX_DONE, IRQ_TX_DONE};
use lora_responder::radio::sx1276::mock::{Access, MockHal};
use lora_responder::radio::sx1276::registers::*;
use lora_responder::radio::sx1276::{Sx1276Driver, Sx1276Handle};
use lora_responder::{RadioConfig, RadioEvent, ResponderError, RxFrame, TxOutcome};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Instant;

fn chip() -> MockHal {
    let mock = MockHal::new();
    mock.set_reg(REG_VERSION, CHIP_VERSION);
    mock
}

async fn begun(mock: &MockHal) -> Sx1276Handle {
    let driver = Sx1276Driver::spawn(mock.clone(), RadioConfig::default()).unwrap();
    driver.begin(915_000_000).await.unwrap();
    driver
}

#[tokio::test]
async fn test_begin_programs_defaults() {
    let mock = chip();
    let driver = begun(&mock).await;

    assert!(driver.connected().await);
    assert_eq!(driver.version().await.unwrap(), 0x12);
    assert_eq!(mock.reset_pulses(), 1);

    // Left in LoRa standby
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_STDBY);
    // First mode write entered LoRa sleep to latch the mode bit
    assert_eq!(mock.writes_to(REG_OP_MODE)[0], LONG_RANGE_MODE | MODE_SLEEP);

    // Explicit header (bit 0 clear), CRC on (bit 2 set)
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0x01, 0x00);
    assert_eq!(mock.reg(REG_MODEM_CONFIG_2) & 0x04, 0x04);
    // SF7 in the high nibble, BW 125 kHz, CR 4/5
    assert_eq!(mock.reg(REG_MODEM_CONFIG_2) >> 4, 7);
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0xF0, 0x70);
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0x0E, 0x02);

    assert_eq!(mock.reg(REG_SYNC_WORD), 0x34);
    assert_eq!(mock.reg(REG_PREAMBLE_MSB), 0x00);
    assert_eq!(mock.reg(REG_PREAMBLE_LSB), 0x08);
    assert_eq!(mock.reg(REG_MODEM_CONFIG_3), 0x04);
    assert_eq!(mock.reg(REG_LNA) & 0x03, 0x03);
    assert_eq!(mock.reg(REG_FIFO_TX_BASE_ADDR), 0x00);
    assert_eq!(mock.reg(REG_FIFO_RX_BASE_ADDR), 0x00);

    // 915 MHz -> Frf 14_991_360 = 0xE4_C0_00
    assert_eq!(mock.reg(REG_FRF_MSB), 0xE4);
    assert_eq!(mock.reg(REG_FRF_MID), 0xC0);
    assert_eq!(mock.reg(REG_FRF_LSB), 0x00);

    // Default 14 dBm on PA_BOOST
    assert_eq!(mock.reg(REG_PA_DAC), 0x84);
    assert_eq!(mock.reg(REG_OCP), 0x2B);
    assert_eq!(mock.reg(REG_PA_CONFIG), 0x80 | 12);
}

#[tokio::test]
async fn test_begin_rejects_wrong_silicon() {
    let mock = MockHal::new();
    mock.set_reg(REG_VERSION, 0x11);
    let driver = Sx1276Driver::spawn(mock.clone(), RadioConfig::default()).unwrap();

    match driver.begin(915_000_000).await {
        Err(ResponderError::InvalidChip(0x11)) => {}
        other => panic!("expected InvalidChip(0x11), got {other:?}"),
    }
    // Handles were released: nothing works until a fresh spawn
    assert!(!driver.connected().await);
    assert!(matches!(
        driver.standby().await,
        Err(ResponderError::NotConnected)
    ));
    assert!(matches!(
        driver.transmit(b"X".to_vec()).await,
        Err(ResponderError::NotConnected)
    ));
}

#[tokio::test]
async fn test_rx_done_delivers_frame() {
    let mock = chip();
    let driver = begun(&mock).await;
    let (tx, mut rx) = unbounded_channel();
    driver.subscribe(1, tx).await.unwrap();

    driver.receive_mode(0).await.unwrap();
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_RX_CONTINUOUS);
    assert_eq!(mock.reg(REG_DIO_MAPPING_1), DIO0_RX_DONE);

    // Scripted packet: IRQ RxDone, two bytes in the FIFO, rssi raw 157,
    // snr raw 20 (5.0 dB)
    mock.set_reg(REG_IRQ_FLAGS, IRQ_RX_DONE);
    mock.set_reg(REG_FIFO_RX_CURRENT_ADDR, 0x10);
    mock.set_reg(REG_RX_NB_BYTES, 2);
    mock.load_fifo_rx(&[0x48, 0x49]);
    mock.set_reg(REG_PKT_RSSI_VALUE, 157);
    mock.set_reg(REG_PKT_SNR_VALUE, 20);
    assert!(mock.fire_dio0());

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event within 1s")
        .unwrap();
    assert_eq!(
        event,
        RadioEvent::Frame(RxFrame {
            bytes: vec![0x48, 0x49],
            rssi_dbm: Some(0),
            snr_db: Some(5.0),
        })
    );

    // RxDone cleared, FIFO pointer moved to the packet start
    assert_eq!(mock.reg(REG_IRQ_FLAGS) & IRQ_RX_DONE, 0);
    assert_eq!(mock.reg(REG_FIFO_ADDR_PTR), 0x10);
    // Byte-at-a-time FIFO reads: one access per payload byte
    let fifo_reads = mock
        .journal()
        .iter()
        .filter(|a| matches!(a, Access::Read { addr, .. } if *addr == REG_FIFO))
        .count();
    assert_eq!(fifo_reads, 2);
}

#[tokio::test]
async fn test_crc_error_drops_frame_silently() {
    let mock = chip();
    let driver = begun(&mock).await;
    let (tx, mut rx) = unbounded_channel();
    driver.subscribe(1, tx).await.unwrap();
    driver.receive_mode(0).await.unwrap();

    mock.set_reg(REG_IRQ_FLAGS, IRQ_RX_DONE | IRQ_PAYLOAD_CRC_ERROR);
    assert!(mock.fire_dio0());

    tokio::time::sleep(Duration::from_millis(100)).await;
    // No subscriber notification, both bits cleared
    assert!(rx.try_recv().is_err());
    assert_eq!(mock.reg(REG_IRQ_FLAGS), 0x00);
}

#[tokio::test]
async fn test_spurious_edge_clears_flags() {
    let mock = chip();
    let driver = begun(&mock).await;
    let (tx, mut rx) = unbounded_channel();
    driver.subscribe(1, tx).await.unwrap();

    // ValidHeader only: neither RxDone nor TxDone
    mock.set_reg(REG_IRQ_FLAGS, 0x10);
    assert!(mock.fire_dio0());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(mock.reg(REG_IRQ_FLAGS), 0x00);
}

#[tokio::test]
async fn test_transmit_streams_payload_and_reports_done() {
    let mock = chip();
    let driver = begun(&mock).await;
    mock.set_auto_tx_done(true);
    let (tx, mut rx) = unbounded_channel();
    driver.subscribe(1, tx).await.unwrap();

    let outcome = driver.transmit(b"HELLO".to_vec()).await.unwrap();
    assert_eq!(outcome, TxOutcome::Ok);

    assert_eq!(mock.fifo_tx(), b"HELLO".to_vec());
    assert_eq!(mock.reg(REG_PAYLOAD_LENGTH), 5);
    // TxDone cleared, chip back in standby
    assert_eq!(mock.reg(REG_IRQ_FLAGS) & IRQ_TX_DONE, 0);
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_STDBY);
    // Subscribers saw the completion
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RadioEvent::TxDone);
}

#[tokio::test(start_paused = true)]
async fn test_transmit_times_out_after_budget() {
    let mock = chip();
    let driver = begun(&mock).await;
    // TxDone never fires
    mock.set_auto_tx_done(false);

    let t0 = Instant::now();
    let outcome = driver.transmit(b"LOST".to_vec()).await.unwrap();
    assert_eq!(outcome, TxOutcome::Timeout);
    assert!(t0.elapsed() >= Duration::from_secs(5));
    // Recoverable: chip parked in standby, driver still connected
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_STDBY);
    assert!(driver.connected().await);
}

#[tokio::test]
async fn test_payload_bounds() {
    let mock = chip();
    let driver = begun(&mock).await;
    mock.set_auto_tx_done(true);

    assert!(matches!(
        driver.transmit(Vec::new()).await,
        Err(ResponderError::InvalidParam(_))
    ));
    assert!(matches!(
        driver.transmit(vec![0u8; 256]).await,
        Err(ResponderError::InvalidParam(_))
    ));
    assert_eq!(driver.transmit(vec![0xAA]).await.unwrap(), TxOutcome::Ok);
    assert_eq!(
        driver.transmit(vec![0x55; 255]).await.unwrap(),
        TxOutcome::Ok
    );
    assert_eq!(mock.reg(REG_PAYLOAD_LENGTH), 255);
}

#[tokio::test]
async fn test_sf6_programs_detection_constants() {
    let mock = chip();
    let mut config = RadioConfig::default();
    config.implicit_header = true;
    let driver = Sx1276Driver::spawn(mock.clone(), config).unwrap();
    driver.begin(915_000_000).await.unwrap();

    driver.set_spreading_factor(6).await.unwrap();
    assert_eq!(mock.reg(REG_DETECTION_OPTIMIZE), 0xC5);
    assert_eq!(mock.reg(REG_DETECTION_THRESHOLD), 0x0C);
    assert_eq!(mock.reg(REG_MODEM_CONFIG_2) >> 4, 6);

    driver.set_spreading_factor(7).await.unwrap();
    assert_eq!(mock.reg(REG_DETECTION_OPTIMIZE), 0xC3);
    assert_eq!(mock.reg(REG_DETECTION_THRESHOLD), 0x0A);
}

#[tokio::test]
async fn test_sf6_requires_implicit_header() {
    let mock = chip();
    let driver = begun(&mock).await;
    // Default config keeps the explicit header
    assert!(matches!(
        driver.set_spreading_factor(6).await,
        Err(ResponderError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn test_tx_power_pa_dac_boundary() {
    let mock = chip();
    let driver = begun(&mock).await;

    driver.set_tx_power(17).await.unwrap();
    assert_eq!(mock.reg(REG_PA_DAC), 0x84);
    assert_eq!(mock.reg(REG_OCP), 0x2B);
    assert_eq!(mock.reg(REG_PA_CONFIG), 0x80 | 15);

    driver.set_tx_power(18).await.unwrap();
    assert_eq!(mock.reg(REG_PA_DAC), 0x87);
    assert_eq!(mock.reg(REG_OCP), 0x3F);
    assert_eq!(mock.reg(REG_PA_CONFIG), 0x80 | 13);

    assert!(driver.set_tx_power(1).await.is_err());
    assert!(driver.set_tx_power(21).await.is_err());
}

#[tokio::test]
async fn test_setters_leave_chip_in_standby() {
    let mock = chip();
    let driver = begun(&mock).await;

    driver.receive_mode(0).await.unwrap();
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_RX_CONTINUOUS);

    driver.set_sync_word(0x12).await.unwrap();
    assert_eq!(mock.reg(REG_SYNC_WORD), 0x12);
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_STDBY);

    driver.receive_mode(0).await.unwrap();
    driver.set_coding_rate(8).await.unwrap();
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0x0E, 0x08);
    assert_eq!(mock.reg(REG_OP_MODE), LONG_RANGE_MODE | MODE_STDBY);
}

#[tokio::test]
async fn test_bandwidth_bits_and_rejection() {
    let mock = chip();
    let driver = begun(&mock).await;

    driver.set_bandwidth(500_000).await.unwrap();
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0xF0, 0x90);
    driver.set_bandwidth(7_800).await.unwrap();
    assert_eq!(mock.reg(REG_MODEM_CONFIG_1) & 0xF0, 0x00);
    assert!(matches!(
        driver.set_bandwidth(100_000).await,
        Err(ResponderError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn test_io_error_marks_disconnected() {
    let mock = chip();
    let driver = begun(&mock).await;

    mock.set_fail_io(true);
    assert!(matches!(
        driver.standby().await,
        Err(ResponderError::Io { .. })
    ));
    mock.set_fail_io(false);
    assert!(!driver.connected().await);
    assert!(matches!(
        driver.transmit(b"X".to_vec()).await,
        Err(ResponderError::NotConnected)
    ));
}

#[tokio::test]
async fn test_hardware_reset_requires_new_begin() {
    let mock = chip();
    let driver = begun(&mock).await;

    driver.hardware_reset().await.unwrap();
    assert_eq!(mock.reset_pulses(), 2);
    assert!(!driver.connected().await);

    // A fresh begin brings it back
    driver.begin(868_100_000).await.unwrap();
    assert!(driver.connected().await);
    let settings = driver.settings().await.unwrap();
    assert_eq!(settings.frequency_hz, 868_100_000);
}

#[tokio::test]
async fn test_rssi_uses_hf_offset() {
    let mock = chip();
    let driver = begun(&mock).await;
    mock.set_reg(REG_RSSI_VALUE, 107);
    assert_eq!(driver.rssi().await.unwrap(), -50);
}

//! # Link Mode Tests
//!
//! Beacon and echo turnaround behavior over the mock backend, plus
//! facade subscriber fan-out. Timing assertions run under the paused
//! tokio clock so the turnaround delays are exact.

use lora_responder::event_log::{RecordingEventSink, SinkRecord};
use lora_responder::radio::mock::MockBackendHandle;
use lora_responder::{
    BeaconEngine, BeaconOptions, EchoOptions, EchoResponder, RadioBackend, RadioEvent,
    RadioFacade, ResponderError, RxFrame, TxOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Instant;

fn frame(bytes: &[u8]) -> RxFrame {
    RxFrame {
        bytes: bytes.to_vec(),
        rssi_dbm: None,
        snr_db: None,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let sink = Arc::new(RecordingEventSink::new());
    let echo = EchoResponder::spawn(facade, sink.clone());

    echo.start(EchoOptions::default()).await.unwrap();
    // Reception arms 100 ms after start
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(backend.receive_arms(), vec![0]);

    let t0 = Instant::now();
    backend.inject_frame(frame(b"HI"));
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Exactly one echo, prefixed, no earlier than the turnaround delay
    let log = backend.transmit_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].payload, b"ECHO:HI".to_vec());
    assert!(log[0].at - t0 >= Duration::from_millis(150));

    let stats = echo.stats().await.unwrap();
    assert!(stats.running);
    assert_eq!((stats.rx_count, stats.tx_count), (1, 1));

    // TxDone sends it back to listening: a second arm follows
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.receive_arms(), vec![0, 0]);

    // The sink saw rx, tx and the completion tag
    let records = sink.records();
    assert!(records.contains(&SinkRecord::Rx(b"HI".to_vec(), None, None)));
    assert!(records.contains(&SinkRecord::Tx(b"ECHO:HI".to_vec())));
    assert!(sink.events().contains(&"tx_ok".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_echo_one_in_flight_per_frame() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let echo = EchoResponder::spawn(facade, Arc::new(RecordingEventSink::new()));

    echo.start(EchoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    backend.inject_frame(frame(b"ONE"));
    settle().await;
    // Second frame lands while the first echo is still pending
    backend.inject_frame(frame(b"TWO"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let log = backend.transmit_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].payload, b"ECHO:ONE".to_vec());
    let stats = echo.stats().await.unwrap();
    assert_eq!(stats.rx_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_echo_arm_retry_after_failure() {
    let backend = MockBackendHandle::new();
    backend.fail_next_receive_modes(1);
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let echo = EchoResponder::spawn(facade, Arc::new(RecordingEventSink::new()));

    echo.start(EchoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    // First arm failed
    assert!(backend.receive_arms().is_empty());
    // Retry lands a second later
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(backend.receive_arms(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_echo_failed_tx_rearms() {
    let backend = MockBackendHandle::new();
    backend.set_tx_outcome(TxOutcome::Err);
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let echo = EchoResponder::spawn(facade, Arc::new(RecordingEventSink::new()));

    echo.start(EchoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    backend.inject_frame(frame(b"HI"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The failed echo was submitted, then reception re-armed
    assert_eq!(backend.transmit_log().len(), 1);
    assert_eq!(backend.receive_arms(), vec![0, 0]);
    let stats = echo.stats().await.unwrap();
    assert_eq!((stats.rx_count, stats.tx_count), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_echo_stop_invalidates_timers() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let echo = EchoResponder::spawn(facade, Arc::new(RecordingEventSink::new()));

    echo.start(EchoOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    backend.inject_frame(frame(b"HI"));
    settle().await;
    // Stop while the echo timer is pending; the timer must observe
    // stopped state and no-op
    echo.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(backend.transmit_log().is_empty());

    let stats = echo.stats().await.unwrap();
    assert!(!stats.running);

    // Stop is idempotent, restart works
    echo.stop().await.unwrap();
    echo.start(EchoOptions::default()).await.unwrap();
    assert!(matches!(
        echo.start(EchoOptions::default()).await,
        Err(ResponderError::AlreadyRunning("echo responder"))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_echo_custom_prefix_and_delay() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let echo = EchoResponder::spawn(facade, Arc::new(RecordingEventSink::new()));

    echo.start(EchoOptions {
        prefix: Some(b"PONG/".to_vec()),
        delay_ms: Some(50),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let t0 = Instant::now();
    backend.inject_frame(frame(b"ping"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log = backend.transmit_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].payload, b"PONG/ping".to_vec());
    let elapsed = log[0].at - t0;
    assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_beacon_tick_schedule() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let sink = Arc::new(RecordingEventSink::new());
    let beacon = BeaconEngine::spawn(facade, sink.clone());

    beacon
        .start(BeaconOptions {
            message: Some(b"B".to_vec()),
            interval_ms: Some(200),
        })
        .await
        .unwrap();

    // Immediate beacon plus ticks at 200..1000 ms: six by t=1050 ms
    tokio::time::sleep(Duration::from_millis(1050)).await;
    beacon.stop().await.unwrap();

    let log = backend.transmit_log();
    assert_eq!(log.len(), 6);
    assert!(log.iter().all(|r| r.payload == b"B".to_vec()));

    let stats = beacon.stats().await.unwrap();
    assert!(!stats.running);
    assert_eq!(stats.tx_count, 6);
    assert_eq!(stats.tx_fail_count, 0);

    // No stragglers after stop
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(backend.transmit_log().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_beacon_counts_failed_submissions() {
    let backend = MockBackendHandle::new();
    backend.set_tx_outcome(TxOutcome::Err);
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let sink = Arc::new(RecordingEventSink::new());
    let beacon = BeaconEngine::spawn(facade, sink.clone());

    beacon
        .start(BeaconOptions {
            message: Some(b"B".to_vec()),
            interval_ms: Some(100),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    beacon.stop().await.unwrap();

    let stats = beacon.stats().await.unwrap();
    // Submissions count even though every one failed
    assert_eq!(stats.tx_count, 2);
    assert_eq!(stats.tx_fail_count, 2);
    assert!(sink.events().contains(&"tx_error".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_beacon_already_running_and_option_fallback() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));
    let beacon = BeaconEngine::spawn(facade, Arc::new(RecordingEventSink::new()));

    beacon
        .start(BeaconOptions {
            message: Some(b"FIELD1".to_vec()),
            interval_ms: Some(300),
        })
        .await
        .unwrap();
    assert!(matches!(
        beacon.start(BeaconOptions::default()).await,
        Err(ResponderError::AlreadyRunning("beacon"))
    ));
    settle().await;
    beacon.stop().await.unwrap();

    // Restart without options keeps the previous message and interval
    beacon.start(BeaconOptions::default()).await.unwrap();
    settle().await;
    beacon.stop().await.unwrap();

    let stats = beacon.stats().await.unwrap();
    assert_eq!(stats.message, b"FIELD1".to_vec());
    assert_eq!(stats.interval_ms, 300);
    let log = backend.transmit_log();
    assert!(log.iter().all(|r| r.payload == b"FIELD1".to_vec()));
}

#[tokio::test]
async fn test_facade_fans_out_to_all_subscribers() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));

    let (tx_a, mut rx_a) = unbounded_channel();
    let (tx_b, mut rx_b) = unbounded_channel();
    facade.subscribe(10, tx_a).await.unwrap();
    facade.subscribe(11, tx_b).await.unwrap();

    backend.inject_frame(frame(b"X"));
    backend.inject_frame(frame(b"Y"));

    for rx in [&mut rx_a, &mut rx_b] {
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Arrival order per subscriber matches the backend's
        assert_eq!(first, RadioEvent::Frame(frame(b"X")));
        assert_eq!(second, RadioEvent::Frame(frame(b"Y")));
    }

    facade.unsubscribe(10).await.unwrap();
    backend.inject_frame(frame(b"Z"));
    let event = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RadioEvent::Frame(frame(b"Z")));
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_facade_dispatch_to_backend() {
    let backend = MockBackendHandle::new();
    let facade = RadioFacade::spawn(RadioBackend::Mock(backend.clone()));

    facade.connect().await.unwrap();
    assert!(facade.connected().await);

    assert_eq!(
        facade.transmit(b"VIA-FACADE".to_vec()).await.unwrap(),
        TxOutcome::Ok
    );
    assert_eq!(backend.transmit_log()[0].payload, b"VIA-FACADE".to_vec());

    facade.receive_mode(500).await.unwrap();
    assert_eq!(backend.receive_arms(), vec![500]);

    let settings = facade.settings().await.unwrap();
    assert_eq!(settings.frequency_hz, 915_000_000);

    facade.disconnect().await.unwrap();
    assert!(!facade.connected().await);
}

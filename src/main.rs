use anyhow::Context;
use clap::{Parser, Subcommand};
use lora_responder::{
    config, init_logger, log_info, BeaconEngine, BeaconOptions, EchoOptions, EchoResponder,
    EventSink, FacadeHandle, LogEventSink, LoraBackend, RadioBackend, RadioEvent, RadioFacade,
    ResponderConfig, ResponderError, Rn2903Modem,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lora-responder")]
#[command(about = "Field-test responder for device-to-device LoRa links")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Radio backend (sx1276 or rn2903); LORA_BACKEND also works
    #[arg(short, long)]
    backend: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transmit a periodic beacon until interrupted
    Beacon {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },
    /// Answer every received frame with a prefixed echo until interrupted
    Echo {
        #[arg(short, long)]
        prefix: Option<String>,
        #[arg(short, long)]
        delay_ms: Option<u64>,
    },
    /// Transmit a single payload
    Send { payload: String },
    /// Log received frames until interrupted
    Listen,
    /// Print the active radio settings
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => ResponderConfig::from_file(path)?,
        None => ResponderConfig::default(),
    };
    cfg.apply_env()?;
    if let Some(backend) = &cli.backend {
        cfg.lora_backend = backend.parse()?;
    }
    cfg.radio.validate()?;
    config::freeze(cfg)?;
    let cfg = config::global();

    // A failed radio bring-up is fatal and exits non-zero
    let facade = build_facade(cfg)
        .await
        .context("radio initialization failed")?;
    let sink: Arc<dyn EventSink> = Arc::new(LogEventSink);

    match cli.command {
        Commands::Beacon { message, interval_ms } => {
            let beacon = BeaconEngine::spawn(facade, sink);
            beacon
                .start(BeaconOptions {
                    message: message.map(String::into_bytes),
                    interval_ms,
                })
                .await?;
            tokio::signal::ctrl_c().await?;
            beacon.stop().await?;
            let stats = beacon.stats().await?;
            log_info(&format!(
                "beacon done: {} sent, {} failed",
                stats.tx_count, stats.tx_fail_count
            ));
        }
        Commands::Echo { prefix, delay_ms } => {
            let echo = EchoResponder::spawn(facade, sink);
            echo.start(EchoOptions {
                prefix: prefix.map(String::into_bytes),
                delay_ms,
            })
            .await?;
            tokio::signal::ctrl_c().await?;
            echo.stop().await?;
            let stats = echo.stats().await?;
            log_info(&format!(
                "echo done: {} received, {} echoed",
                stats.rx_count, stats.tx_count
            ));
        }
        Commands::Send { payload } => {
            sink.tx(payload.as_bytes());
            let outcome = facade.transmit(payload.into_bytes()).await?;
            println!("{outcome:?}");
        }
        Commands::Listen => {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            facade.subscribe(100, tx).await?;
            facade.receive_mode(0).await?;
            log_info("listening; ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = rx.recv() => match event {
                        Some(RadioEvent::Frame(frame)) => {
                            sink.rx(&frame.bytes, frame.rssi_dbm, frame.snr_db);
                            println!(
                                "{} (rssi {:?}, snr {:?})",
                                String::from_utf8_lossy(&frame.bytes),
                                frame.rssi_dbm,
                                frame.snr_db
                            );
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            facade.unsubscribe(100).await?;
        }
        Commands::Settings => {
            let settings = facade.settings().await?;
            println!("{settings:#?}");
        }
    }

    Ok(())
}

/// Bring up the configured backend behind a facade.
async fn build_facade(cfg: &ResponderConfig) -> Result<FacadeHandle, ResponderError> {
    let backend = match cfg.lora_backend {
        LoraBackend::Rn2903 => {
            let modem = Rn2903Modem::spawn(cfg.serial_port.clone(), cfg.radio.clone());
            let version = modem.connect().await?;
            log_info(&format!("RN2903 modem ready: {version}"));
            RadioBackend::Rn2903(modem)
        }
        #[cfg(feature = "raspberry-pi")]
        LoraBackend::Sx1276 => {
            use lora_responder::radio::sx1276::hal::RpiRadioHal;
            use lora_responder::Sx1276Driver;

            let hal = RpiRadioHal::from_config(cfg)
                .map_err(|e| ResponderError::io("open SPI/GPIO", e))?;
            let driver = Sx1276Driver::spawn(hal, cfg.radio.clone())?;
            driver.begin(cfg.radio.frequency_hz).await?;
            let version = driver.version().await?;
            log_info(&format!("SX1276 ready, silicon rev 0x{version:02X}"));
            RadioBackend::Sx1276(driver)
        }
        #[cfg(not(feature = "raspberry-pi"))]
        LoraBackend::Sx1276 => {
            return Err(ResponderError::InvalidParam(
                "sx1276 backend requires a build with the raspberry-pi feature".into(),
            ));
        }
    };
    Ok(RadioFacade::spawn(backend))
}

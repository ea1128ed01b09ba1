use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oxilink_core::{Config, ConnectionStatus, OximeterCore, OximeterEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "oxilink")]
#[command(about = "Connect to a BLE pulse-oximeter and stream readings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby devices and print what is found
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
    /// Connect to a device and stream readings until interrupted
    Monitor {
        /// Hardware address of the oximeter
        address: String,

        /// Print every reading as a JSON line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load_or_default(),
    };

    match cli.command {
        Commands::Scan { duration } => run_scan(config, duration).await,
        Commands::Monitor { address, json } => run_monitor(config, address, json).await,
    }
}

async fn run_scan(config: Config, duration: u64) -> Result<()> {
    let config = config.with_scan_timeout(duration.max(1));
    let core = OximeterCore::new(config)
        .await
        .context("could not initialize the Bluetooth stack")?;
    let mut events = core
        .take_event_receiver()
        .await
        .context("event receiver already taken")?;

    core.start_scan()?;
    println!("🔍 Scanning for {duration}s...");

    let mut status = core.watch_status();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(OximeterEvent::DeviceDiscovered { address, name, rssi }) => {
                    println!("  {address}  {}  ({rssi} dBm)", name.as_deref().unwrap_or("unknown"));
                }
                Some(OximeterEvent::Notice { message }) => eprintln!("! {message}"),
                Some(_) => {}
                None => break,
            },
            result = status.changed() => {
                result?;
                let current = *status.borrow();
                if current != ConnectionStatus::Scanning && current != ConnectionStatus::Idle {
                    eprintln!("❌ scan stopped: {current}");
                    break;
                }
                if current == ConnectionStatus::Idle {
                    break;
                }
            }
        }
    }

    let discovered = core.discovered().await;
    if discovered.is_empty() {
        println!("No devices found.");
    } else {
        println!("\n{} device(s) discovered:", discovered.len());
        for device in discovered {
            println!(
                "  {}  {}  ({} dBm)",
                device.address,
                device.display_name(),
                device.rssi
            );
        }
    }

    core.shutdown().await;
    Ok(())
}

async fn run_monitor(config: Config, address: String, json: bool) -> Result<()> {
    let core = OximeterCore::new(config)
        .await
        .context("could not initialize the Bluetooth stack")?;
    let mut events = core
        .take_event_receiver()
        .await
        .context("event receiver already taken")?;

    println!("🔗 Connecting to {address} (ctrl-c to stop)...");
    core.connect(address.as_str())?;

    // Readings arrive at waveform rate; print a summary line once a second
    // unless raw JSON output was requested.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n⏹️ Disconnecting...");
                core.disconnect()?;
                // Give the teardown a moment to confirm before exiting.
                tokio::time::sleep(Duration::from_millis(500)).await;
                break;
            }
            event = events.recv() => match event {
                Some(OximeterEvent::StatusChanged { status }) => {
                    println!("• {status}");
                    if status == ConnectionStatus::DisconnectedByUser {
                        break;
                    }
                }
                Some(OximeterEvent::ReadingUpdated { reading }) if json => {
                    println!("{}", serde_json::to_string(&reading)?);
                }
                Some(OximeterEvent::Notice { message }) => eprintln!("! {message}"),
                Some(_) => {}
                None => {
                    tracing::warn!("event channel closed, stopping monitor");
                    break;
                }
            },
            _ = ticker.tick(), if !json => {
                if let Some(reading) = core.latest_reading() {
                    if reading.finger_present {
                        println!(
                            "SpO2 {}%  pulse {} bpm  signal {}/15",
                            reading
                                .spo2
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "--".into()),
                            reading
                                .pulse_rate
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "--".into()),
                            reading.signal_strength
                        );
                    } else {
                        println!("(no finger detected)");
                    }
                }
            }
        }
    }

    core.shutdown().await;
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracker_bridge::bridge::TrackerBridge;
use tracker_bridge::domain::models::{SerialStart, StartRequest, StopRequest};
use tracker_bridge::domain::settings::SettingsService;
use tracker_bridge::infrastructure::{ipc, logging, serial};

#[derive(Parser, Debug)]
#[command(name = "tracker_bridge", version, about = "Forward tracker data to a SlimeVR server")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dongle serial ports to open, e.g. --serial COM3 --serial COM4
    #[arg(short, long)]
    serial: Vec<String>,

    /// Scan for and connect to BLE trackers
    #[arg(short, long)]
    bluetooth: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Print the available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::load(path.clone()),
        None => SettingsService::new()?,
    };
    if let Some(level) = &cli.log_level {
        settings.get_mut().log_settings.level = level.clone();
    }
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;

    if cli.list_ports {
        for port in serial::list_ports()? {
            println!("{port}");
        }
        return Ok(());
    }

    info!(config = %settings.path().display(), "Starting tracker bridge");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tracker-bridge")
        .build()
        .context("Failed to create tokio runtime")?;
    runtime.block_on(run(cli, settings))
}

async fn run(cli: Cli, mut settings: SettingsService) -> anyhow::Result<()> {
    let config = settings.get().clone();
    let bridge = TrackerBridge::spawn(&config).await?;

    if config.ipc.enabled {
        ipc::spawn_server(&config.ipc.socket_name, bridge.clone())?;
    }

    let serial_ports = if !cli.serial.is_empty() {
        Some(cli.serial.clone())
    } else if config.autostart_serial && !config.serial.ports.is_empty() {
        Some(config.serial.ports.clone())
    } else {
        None
    };
    let bluetooth = cli.bluetooth || config.autostart_bluetooth;

    if serial_ports.is_some() || bluetooth {
        let failures = bridge
            .start(StartRequest {
                bluetooth,
                serial: serial_ports.clone().map(|ports| SerialStart { ports }),
            })
            .await?;
        for failure in &failures {
            warn!("{}", failure);
        }
        if !cli.serial.is_empty() {
            if let Err(e) = settings.remember_serial_ports(&cli.serial) {
                warn!("Failed to save serial ports: {}", e);
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");
    bridge.stop(StopRequest::all()).await?;
    bridge.shutdown().await?;
    Ok(())
}

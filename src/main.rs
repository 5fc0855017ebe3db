//! ==============================================================================
//! main.rs - thermo-bridge entry point
//! ==============================================================================
//!
//! purpose:
//!     operator front end for the bridge. each subcommand is one of the actions
//!     the old desktop window offered, plus `serve` for the data service.
//!
//! commands:
//!     serve          run the reference data service
//!     bridge         connect to the board and relay until ctrl-c / unplug
//!     ports          list serial ports
//!     latest         show the latest reading + threshold once
//!     set-threshold  push a new minimum temperature
//!     monitor        show the latest reading every few seconds
//!
//! architecture:
//!
//!     ┌───────────────────────┐          ┌────────────────────────┐
//!     │ thermo-bridge bridge  │   http   │ thermo-bridge serve    │
//!     │  controller ─► loop   │ ───────► │  (or any server with   │
//!     │        │              │          │   the same contract)   │
//!     │     serial port       │          └───────────▲────────────┘
//!     └────────┼──────────────┘                      │ http
//!              ▼                         ┌───────────┴────────────┐
//!        microcontroller                 │ monitor / latest /     │
//!                                        │ set-threshold          │
//!                                        └────────────────────────┘
//!
//!     the bridge and the monitor never share memory; they only meet at the
//!     data service.
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;

use thermo_bridge::client::{DataService, HttpDataService};
use thermo_bridge::config::{BridgeConfig, ConfigSource};
use thermo_bridge::controller::BridgeController;
use thermo_bridge::service::{self, Store};
use thermo_bridge::session::{self, SerialOpener};
use thermo_bridge::{logging, BridgeState, LatestData};

#[derive(Parser)]
#[command(name = "thermo-bridge", version, about = "Temperature threshold bridge for a serial sensor board")]
struct Cli {
    /// path to bridge.toml (default: ./config/bridge.toml or ../config/bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reference data service
    Serve {
        /// listen address, overrides [server].bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Connect to the board and relay readings / threshold
    Bridge {
        /// serial port, overrides [serial].port
        #[arg(long)]
        port: Option<String>,
        /// baud rate, overrides [serial].baud_rate
        #[arg(long)]
        baud: Option<u32>,
    },
    /// List available serial ports
    Ports,
    /// Print the latest reading and threshold
    Latest,
    /// Set the minimum temperature pushed to the board
    SetThreshold {
        /// degrees celsius
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },
    /// Print the latest reading on a fixed refresh timer
    Monitor,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: load configuration
    let (config, source) = match &cli.config {
        Some(path) => (
            BridgeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            ConfigSource::File(path.clone()),
        ),
        None => BridgeConfig::load_or_default(),
    };

    // step 2: logging
    logging::init(&config.logging);
    config.log_summary(&source);

    // step 3: dispatch
    match cli.command {
        Command::Serve { bind } => serve(&config, bind).await,
        Command::Bridge { port, baud } => bridge(&config, port, baud).await,
        Command::Ports => ports(),
        Command::Latest => {
            let client = client(&config)?;
            let latest = client.latest().await.context("fetching latest data")?;
            print_latest(&latest);
            Ok(())
        }
        Command::SetThreshold { value } => {
            let client = client(&config)?;
            let updated = client.update_config(value).await.context("updating threshold")?;
            println!("Threshold set to {:.1}°C ({})", updated.min_temperature, updated.last_update);
            Ok(())
        }
        Command::Monitor => monitor(&config).await,
    }
}

fn client(config: &BridgeConfig) -> Result<HttpDataService> {
    HttpDataService::new(&config.service.base_url, config.request_timeout())
        .context("building http client")
}

// ==============================================================================
// commands
// ==============================================================================

async fn serve(config: &BridgeConfig, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let store = Arc::new(RwLock::new(Store::default()));
    service::run_server(listener, store, async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down data service");
    })
    .await
}

async fn bridge(config: &BridgeConfig, port: Option<String>, baud: Option<u32>) -> Result<()> {
    let port = port
        .or_else(|| config.serial.port.clone())
        .ok_or_else(|| anyhow!("no serial port given; use --port or set [serial].port (see `thermo-bridge ports`)"))?;
    let baud_rate = baud.unwrap_or(config.serial.baud_rate);

    let service: Arc<dyn DataService> = Arc::new(client(config)?);
    let opener = Arc::new(SerialOpener::new(baud_rate, config.settle()));
    let mut controller = BridgeController::new(opener, service, config.bridge_settings());

    controller.connect(&port).await?;
    let mut status = controller.subscribe();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received"),
        _ = status.wait_for(|s| s.state == BridgeState::Idle) => tracing::warn!("Bridge stopped on its own"),
    }

    controller.disconnect().await;

    let summary = controller.status();
    tracing::info!(
        frames = summary.frames_received,
        forwarded = summary.readings_forwarded,
        rejected = summary.frames_rejected,
        service_errors = summary.service_errors,
        thresholds_sent = summary.thresholds_sent,
        "Bridge summary"
    );
    if let Some(fault) = summary.last_error {
        tracing::info!(kind = ?fault.kind, message = %fault.message, "Last fault");
    }
    Ok(())
}

fn ports() -> Result<()> {
    let ports = session::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for (name, kind) in ports {
        println!("{:<24} {}", name, kind);
    }
    Ok(())
}

async fn monitor(config: &BridgeConfig) -> Result<()> {
    let client = client(config)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(config.monitor.refresh_seconds.max(1)));
    tracing::info!(every_s = config.monitor.refresh_seconds, "Monitoring {}", client.base_url());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {}
        }

        match client.latest().await {
            Ok(latest) => print_latest(&latest),
            Err(e) => tracing::warn!(class = %e.class(), error = %e, "Could not fetch latest data"),
        }
    }
}

fn print_latest(latest: &LatestData) {
    match &latest.reading {
        Some(r) => {
            let at = latest.recorded_at.map(|t| t.to_string()).unwrap_or_default();
            println!(
                "{} Temp: {:.1}°C | Humidity: {:.1}% | Min: {:.1}°C  {}",
                r.sensor, r.temperature, r.humidity, latest.config.min_temperature, at
            );
        }
        None => println!("No readings yet | Min: {:.1}°C", latest.config.min_temperature),
    }
}

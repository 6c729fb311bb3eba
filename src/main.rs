//! ViBus Live - Main Entry Point
//!
//! Runs the live telemetry service against the configured broker, or prints
//! the resolved configuration.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use vibus_live::config::LiveConfig;
use vibus_live::domain::ParsedUpdate;
use vibus_live::observability::init_with_default_level;
use vibus_live::service::LiveService;
use vibus_live::transport::MqttTransport;

/// Live bus telemetry over MQTT
#[derive(Parser)]
#[command(name = "vibus-live")]
#[command(about = "Live bus telemetry over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "VIBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the cache live until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["vibus.toml", "config/vibus.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_with_default_level(match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    });

    info!("Starting vibus-live v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<LiveConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LiveConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LiveConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_service(config: LiveConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = LiveService::new(config, Arc::new(MqttTransport::new()));
    let mut updates = service.subscribe_updates();

    service.start().await?;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    info!("Service running, waiting for telemetry...");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => log_update(&update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Update log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stats = service.manager().connection_stats().await;
    info!(
        messages_received = stats.messages_received,
        messages_lost = stats.messages_lost,
        reconnects = stats.reconnect_count,
        cached = service.cache().len(),
        "Session summary"
    );

    service.stop().await?;
    Ok(())
}

fn log_update(update: &ParsedUpdate) {
    match update {
        ParsedUpdate::BusPosition(bus) => debug!(
            bus = %bus.id,
            line = %bus.line,
            lat = bus.position.lat,
            lon = bus.position.lon,
            delay = bus.delay_minutes,
            status = %bus.status,
            "Bus position"
        ),
        ParsedUpdate::LineStatistics(stats) => debug!(
            line = %stats.line,
            active_buses = stats.active_buses,
            on_time = stats.on_time_percentage,
            "Line statistics"
        ),
        ParsedUpdate::SystemStatus(status) => info!(
            active_buses = status.active_buses,
            total_buses = status.total_buses,
            health = ?status.system_health,
            "System status"
        ),
    }
}

fn handle_config_command(config: &LiveConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    // Fails on unresolvable broker settings
    let broker = config.broker_config()?;

    if show {
        println!("# Resolved configuration (broker: {})", broker.broker_url());
        println!("{}", toml::to_string_pretty(config)?);
        if config.subscriptions.is_none() {
            println!("# Default subscriptions");
            for entry in config.subscription_entries() {
                println!("#   {} (qos {})", entry.topic, entry.qos);
            }
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

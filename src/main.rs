//! MQTT log shipper - main entry point
//!
//! Reads log lines from stdin and ships them to the configured broker.
//! SIGHUP reloads the `[mqtt]` section of the configuration file; SIGINT,
//! SIGTERM or end of input drain the queue and exit.

use clap::{Parser, Subcommand};
use mqtt_log_shipper::observability::logging::{format_from_env, spans_from_env};
use mqtt_log_shipper::observability::{init_default_logging, init_logging, metrics};
use mqtt_log_shipper::transport::mqtt::TopicBuilder;
use mqtt_log_shipper::{
    HandlerConfiguration, LogShipper, MqttLogHandler, MqttTransportFactory, ShipperConfig,
    StructuredLogEntry,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

/// Ship log lines to an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-log-shipper")]
#[command(about = "Publish log lines read from stdin to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read stdin and ship every line
    Run {
        /// Origin for lines that do not carry one
        #[arg(long)]
        origin: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, format_from_env(), spans_from_env()),
        _ => init_logging(Level::TRACE, format_from_env(), spans_from_env()),
    }

    info!("Starting mqtt-log-shipper v{}", env!("CARGO_PKG_VERSION"));

    let (config, config_path) = match load_configuration(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { origin } => run_shipper(config, config_path, origin).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<(ShipperConfig, PathBuf), Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => {
            let default_paths = ["log-shipper.toml", "config/log-shipper.toml"];
            default_paths
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
                .ok_or(
                    "No configuration file found. Provide one with -c/--config or create log-shipper.toml",
                )?
        }
    };

    info!("Loading configuration from: {}", path.display());
    let config = ShipperConfig::load_from_file(&path)?;
    Ok((config, path))
}

async fn run_shipper(
    config: ShipperConfig,
    config_path: PathBuf,
    origin: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_origin = origin.unwrap_or_else(|| config.shipper.default_origin().to_string());
    // Fail at startup rather than dropping every line later
    TopicBuilder::new(&config.mqtt.topic_prefix)
        .build_log_topic(&default_origin)
        .map_err(|reason| format!("Invalid origin '{default_origin}': {reason}"))?;

    let handler = Arc::new(MqttLogHandler::<MqttTransportFactory>::from_config(&config));
    info!(
        client_id = %handler.client_id(),
        origin = %default_origin,
        broker = %config.mqtt.connection_string,
        "Shipping stdin"
    );

    let (shipper, handle) =
        LogShipper::new(handler.clone(), &config.buffer, config.to_reconnect_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut stop = shutdown_rx.clone();
    let worker = tokio::spawn(shipper.run(shutdown_rx));

    // Signals are watched on their own task so a producer blocked on a full
    // queue still sees them
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let terminator = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });
    let mut sighup = signal(SignalKind::hangup())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = sighup.recv() => reload_configuration(&handler, &config_path),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry = StructuredLogEntry::from_line(&default_origin, &line);
                    if handle.submit(entry).await.is_err() {
                        warn!("Shipper stopped accepting entries");
                        break;
                    }
                }
                Ok(None) => {
                    info!("End of input, draining queue");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
        }
    }

    drop(handle);
    let report = worker.await?;
    terminator.abort();

    if report.dropped > 0 || report.abandoned > 0 {
        warn!(
            dropped = report.dropped,
            abandoned = report.abandoned,
            "Some entries were not delivered"
        );
    }

    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to serialize metrics"),
    }

    Ok(())
}

fn reload_configuration(handler: &MqttLogHandler<MqttTransportFactory>, path: &Path) {
    info!("Received SIGHUP, reloading {}", path.display());

    let config = match ShipperConfig::load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to reload configuration, keeping current");
            return;
        }
    };

    match handler.apply_configuration(HandlerConfiguration::Mqtt(config.mqtt)) {
        Ok(applied) => info!(
            live_qos_updated = applied.live_qos_updated,
            topic_prefix_updated = applied.topic_prefix_updated,
            address_change_pending = applied.address_change_pending,
            "Configuration reloaded"
        ),
        Err(e) => warn!(error = %e, "Reloaded configuration rejected, keeping current"),
    }
}

fn handle_config_command(
    config: &ShipperConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

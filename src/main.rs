//! Roomlink binary
//!
//! Connects to one rig, opens the client, and logs every observation
//! published on the bus until Ctrl-C.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use roomlink::config::AppConfig;
use roomlink::events::Observation;
use roomlink::hub::FetchOutcome;
use roomlink::tasks::TaskOutcome;
use roomlink::RigClient;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(name = "roomlink", version, about = "Live operational picture of a remote sensor rig")]
struct CliArgs {
    /// Rig telemetry endpoint, e.g. ws://rig.local:5000/ws
    #[arg(short = 'u', long)]
    rig_url: Option<String>,

    /// Rig HTTP base URL, e.g. http://rig.local:5000
    #[arg(long)]
    api_url: Option<String>,

    /// Path to a JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(level: LogLevel, verbose: u8) {
    let level = match verbose {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match level {
        LogLevel::Error => "roomlink=error,webrtc=error",
        LogLevel::Warn => "roomlink=warn,webrtc=error",
        LogLevel::Info => "roomlink=info,webrtc=error",
        LogLevel::Verbose => "roomlink=debug,webrtc=warn",
        LogLevel::Debug => "roomlink=debug,webrtc=info",
        LogLevel::Trace => "roomlink=trace,webrtc=debug",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("ROOMLINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("roomlink.json"))
}

fn log_observation(observation: &Observation) {
    match observation {
        Observation::ConnectionStateChanged { state } => {
            tracing::info!(?state, "Channel state changed");
        }
        Observation::Telemetry { sample } => {
            tracing::debug!(
                temperature = sample.temperature,
                humidity = sample.humidity,
                light = sample.light,
                led_on = sample.led_on,
                "Telemetry sample"
            );
        }
        Observation::VideoFrame {
            frame,
            person_count,
            ..
        } => {
            tracing::debug!(
                sequence = frame.sequence,
                bytes = frame.len(),
                person_count,
                "Video frame"
            );
        }
        Observation::SignalingStateChanged { state } => {
            tracing::info!(?state, "Signaling state changed");
        }
        Observation::SignalingFailed { reason } => {
            tracing::warn!(%reason, "Signaling failed, falling back to discrete frames");
        }
        Observation::TaskResult {
            task_id,
            class,
            outcome,
        } => match outcome {
            TaskOutcome::Completed(value) => {
                tracing::info!(%class, %task_id, %value, "Analysis task completed");
            }
            TaskOutcome::TimedOut => {
                tracing::warn!(%class, %task_id, "Analysis task timed out");
            }
            TaskOutcome::Failed(reason) => {
                tracing::warn!(%class, %task_id, %reason, "Analysis task failed");
            }
        },
        Observation::FetchResult { kind, outcome } => match outcome {
            FetchOutcome::Value(value) => {
                tracing::info!(%kind, %value, "Fetch updated");
            }
            FetchOutcome::Error(reason) => {
                tracing::warn!(%kind, %reason, "Fetch failed");
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting roomlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(&default_config_path())?,
    };
    if let Some(url) = args.rig_url {
        config.channel.url = url;
    }
    if let Some(url) = args.api_url {
        config.api.base_url = url;
    }

    let client = RigClient::new(config)?;
    let mut observations = client.observe();
    client.open();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            observation = observations.recv() => match observation {
                Ok(observation) => log_observation(&observation),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Observation log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

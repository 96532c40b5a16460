//! Meshbridge Daemon - Main entry point
//!
//! Runs the bridge with JSON-lines radio and broker endpoints: events come in
//! on stdin (or a replay file), publishes and radio commands go out on
//! stdout. Logs go to stderr.

mod config;
mod stdio;

use anyhow::Result;
use clap::Parser;
use futures_util::future::{self, Either};
use meshbridge_bridge::Bridge;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(about = "Bridge between a mesh radio network and a pub/sub broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshbridge.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// State file (defaults to state.json next to the configuration file)
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// JSON-lines input to replay instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_target(true)
        .with_writer(std::io::stderr);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?,
        Err(_) => tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?,
    }

    info!("Meshbridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = config::load_config(&args.config)?;
    let state_path = args
        .state
        .clone()
        .unwrap_or_else(|| config::default_state_path(&args.config));

    info!(
        base_topic = %settings.mqtt.base_topic,
        state = %state_path.display(),
        devices = settings.devices.len(),
        groups = settings.groups.len(),
        "Configuration loaded"
    );

    let output = stdio::stdout();
    let mut bridge = Bridge::new(
        settings,
        Arc::new(stdio::EchoRadio::new(output.clone())),
        Arc::new(stdio::LineBroker::new(output)),
        Some(state_path),
    );

    // Feed input on its own task; EOF ends the run
    let tx = bridge.inbound();
    let reader = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            info!(path = %path.display(), "Replaying input file");
            tokio::spawn(stdio::read_input(BufReader::new(file), tx))
        }
        None => tokio::spawn(stdio::read_input(BufReader::new(tokio::io::stdin()), tx)),
    };

    let shutdown = async move {
        let ctrl_c = Box::pin(tokio::signal::ctrl_c());
        match future::select(ctrl_c, reader).await {
            Either::Left((result, _)) => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for interrupt");
                }
                info!("Interrupted");
            }
            Either::Right((Ok(Ok(forwarded)), _)) => info!(forwarded, "Input finished"),
            Either::Right((Ok(Err(e)), _)) => warn!(error = %e, "Input failed"),
            Either::Right((Err(e), _)) => warn!(error = %e, "Input task failed"),
        }
    };

    bridge.run(shutdown).await;
    Ok(())
}

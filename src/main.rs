//! Secnode - SECoP node server
//!
//! Serves the modules of one configuration file over TCP and WebSocket,
//! optionally routing further nodes.

use clap::Parser;
use secnode_core::{Interface, NodeConfig, ServerControl};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Secnode server
#[derive(Parser, Debug)]
#[command(name = "secnode", version, about = "SECoP node server", long_about = None)]
struct Args {
    /// Node configuration file (TOML)
    #[arg(env = "SECNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Replace the configured interfaces, e.g. tcp://10767 or ws://8080
    #[arg(short, long = "interface")]
    interfaces: Vec<Interface>,

    /// Debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging(args: &Args) {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    tracing::info!("Starting secnode v{}", secnode_core::VERSION);

    let path = match args.config.clone() {
        Some(path) => Some(path),
        None => secnode_core::config::default_config_path(),
    };
    let Some(path) = path else {
        anyhow::bail!("no configuration file given and no default location available");
    };
    let mut config = NodeConfig::load(&path)?;
    if !args.interfaces.is_empty() {
        config.node.interfaces = args.interfaces.clone();
    }
    tracing::info!(config = %path.display(), equipment_id = %config.node.equipment_id, "configuration loaded");

    let control = ServerControl::new();
    let on_signal = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown();
        }
    });

    // interface overrides do not survive a reload
    let reload = args.interfaces.is_empty().then_some(path);
    secnode_core::core::server::serve(config, reload, control).await
}

//! Strata CLI: serve the memory substrate over HTTP or run one-shot
//! maintenance commands against its store.

mod cli;
mod cmd;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;
use strata_types::config::SubstrateConfig;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &SubstrateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref());
    init_tracing(&config);

    match cli.command {
        Commands::Serve { listen } => cmd::serve::cmd_serve(config, listen).await,
        Commands::Ingest { file } => cmd::ingest::cmd_ingest(config, &file).await,
        Commands::Gc => cmd::system::cmd_gc(config).await,
        Commands::Reconcile { limit } => cmd::system::cmd_reconcile(config, limit).await,
        Commands::Health => cmd::system::cmd_health(config),
    }
}

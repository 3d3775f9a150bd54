//! Clap CLI definitions for Strata.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  strata serve                  Start the HTTP API with background housekeeping
  strata ingest events.json     Ingest one packet or a JSON array of packets
  strata gc                     Run a full housekeeping pass
  strata reconcile --limit 100  Retry deferred enrichment work
  strata health                 Probe the stores";

/// Strata: an append-only memory substrate for agent systems.
#[derive(Parser)]
#[command(name = "strata", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API until Ctrl+C.
    Serve {
        /// Listen address (overrides `api_listen`).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Ingest packets from a JSON file.
    Ingest {
        /// File holding one packet object or an array of them.
        file: PathBuf,
    },
    /// Run a full housekeeping pass and print the report.
    Gc,
    /// Resume unfinished pipelines and retry deferred enrichment stages.
    Reconcile {
        /// Packets examined per category.
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Print store health; exits non-zero when degraded.
    Health,
}

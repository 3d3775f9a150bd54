//! Subcommand implementations.

pub mod ingest;
pub mod serve;
pub mod system;

use std::sync::Arc;
use strata_memory::MemorySubstrate;
use strata_types::config::SubstrateConfig;

/// Open the substrate for a one-shot command.
pub(crate) fn open_substrate(config: &SubstrateConfig) -> anyhow::Result<Arc<MemorySubstrate>> {
    let substrate = MemorySubstrate::open(config)?;
    Ok(Arc::new(substrate))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

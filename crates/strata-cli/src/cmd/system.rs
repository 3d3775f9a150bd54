//! Maintenance commands: `gc`, `reconcile`, `health`.

use super::{open_substrate, print_json};
use strata_types::config::SubstrateConfig;

pub async fn cmd_gc(config: SubstrateConfig) -> anyhow::Result<()> {
    let substrate = open_substrate(&config)?;
    let report = substrate.run_gc().await?;
    print_json(&report)
}

pub async fn cmd_reconcile(config: SubstrateConfig, limit: usize) -> anyhow::Result<()> {
    let substrate = open_substrate(&config)?;
    let report = substrate.reconcile(limit).await?;
    print_json(&report)
}

pub fn cmd_health(config: SubstrateConfig) -> anyhow::Result<()> {
    let substrate = open_substrate(&config)?;
    let report = substrate.health();
    print_json(&report)?;
    if !report.is_ok() {
        anyhow::bail!("substrate is degraded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SubstrateConfig {
        let mut config = SubstrateConfig::in_memory();
        config.ingestion.gc_trigger_probability = 0.0;
        config
    }

    #[tokio::test]
    async fn test_maintenance_commands_on_empty_store() {
        cmd_gc(config()).await.unwrap();
        cmd_reconcile(config(), 10).await.unwrap();
        cmd_health(config()).unwrap();
    }
}

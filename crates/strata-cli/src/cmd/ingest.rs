//! `strata ingest <file.json>`.

use anyhow::Context;
use serde_json::Value;
use std::path::Path;
use strata_types::config::SubstrateConfig;
use strata_types::packet::NewPacket;
use tracing::warn;

/// Parse a file body holding one packet object or an array of them.
pub fn parse_packets(contents: &str) -> anyhow::Result<Vec<NewPacket>> {
    let value: Value = serde_json::from_str(contents).context("input is not valid JSON")?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => anyhow::bail!("expected a packet object or an array of packets"),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item).with_context(|| format!("packet #{i} is malformed"))
        })
        .collect()
}

pub async fn cmd_ingest(config: SubstrateConfig, file: &Path) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let packets = parse_packets(&contents)?;
    let substrate = super::open_substrate(&config)?;

    let mut failed = 0usize;
    for (i, packet) in packets.into_iter().enumerate() {
        match substrate.ingest(packet).await {
            Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
            Err(e) => {
                failed += 1;
                warn!(index = i, "Packet rejected: {e}");
                eprintln!("packet #{i}: {e}");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} packet(s) rejected");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_object() {
        let packets = parse_packets(r#"{"type": "event", "payload": {"a": 1}}"#).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, "event");
    }

    #[test]
    fn test_array() {
        let packets = parse_packets(
            r#"[{"type": "event", "thread_id": "t1"}, {"type": "analysis", "tags": ["x"]}]"#,
        )
        .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].thread_id.as_deref(), Some("t1"));
        assert_eq!(packets[1].tags, vec!["x".to_string()]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_packets("not json").is_err());
        assert!(parse_packets("42").is_err());
        let err = parse_packets(r#"[{"type": "event"}, {"payload": {}}]"#).unwrap_err();
        assert!(err.to_string().contains("#1"));
    }

    #[tokio::test]
    async fn test_ingest_file_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packets.json");
        std::fs::write(&path, r#"[{"type": "event", "payload": {"n": 1}}]"#).unwrap();
        let mut config = SubstrateConfig::in_memory();
        config.ingestion.gc_trigger_probability = 0.0;
        cmd_ingest(config, &path).await.unwrap();
    }
}

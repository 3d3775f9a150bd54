//! Configuration types for the Strata substrate.
//!
//! Every section is `#[serde(default)]` so partial TOML files deserialize
//! cleanly and new fields never break old configs.

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};

/// Top-level substrate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    /// Log level filter (overridden by `RUST_LOG`).
    pub log_level: String,
    /// `pretty` or `json`.
    pub log_format: String,
    /// HTTP listen address.
    pub api_listen: String,
    /// Request budget per client IP per minute (0 disables rate limiting).
    pub api_rate_limit: u32,
    /// Structured store location: `sqlite://<path>`, a bare path, or `:memory:`.
    pub database_url: String,
    /// Embedding provider settings.
    pub embedding: EmbeddingSettings,
    /// Store access bounds.
    pub pool: PoolConfig,
    /// Ingestion pipeline settings.
    pub ingestion: IngestionConfig,
    /// World-model notification settings.
    pub world_model: WorldModelConfig,
    /// Housekeeping settings.
    pub housekeeping: HousekeepingConfig,
    /// Insight extraction rules.
    pub insights: InsightConfig,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            api_listen: "127.0.0.1:4300".to_string(),
            api_rate_limit: 500,
            database_url: "sqlite://~/.strata/strata.db".to_string(),
            embedding: EmbeddingSettings::default(),
            pool: PoolConfig::default(),
            ingestion: IngestionConfig::default(),
            world_model: WorldModelConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            insights: InsightConfig::default(),
        }
    }
}

impl SubstrateConfig {
    /// An in-memory configuration with the stub embedder, for tests and demos.
    pub fn in_memory() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            ..Default::default()
        }
    }

    /// Check cross-field bounds.
    pub fn validate(&self) -> StrataResult<()> {
        self.pool.validate()?;
        let p = self.ingestion.gc_trigger_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(StrataError::Config(format!(
                "ingestion.gc_trigger_probability must be within [0, 1], got {p}"
            )));
        }
        if self.housekeeping.batch_size == 0 {
            return Err(StrataError::Config(
                "housekeeping.batch_size must be at least 1".to_string(),
            ));
        }
        if self.embedding.provider.trim().is_empty() {
            return Err(StrataError::Config(
                "embedding.provider must not be empty".to_string(),
            ));
        }
        if self.insights.anomaly_z_threshold <= 0.0 {
            return Err(StrataError::Config(
                "insights.anomaly_z_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `stub` or an OpenAI-compatible provider name.
    pub provider: String,
    /// Model identifier; part of every embedding record.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Override the provider's base URL.
    pub base_url: Option<String>,
    /// Vector size for the stub provider.
    pub dimensions: usize,
    /// Per-call timeout.
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "stub".to_string(),
            model: "stub-hash-v1".to_string(),
            api_key_env: String::new(),
            base_url: None,
            dimensions: 256,
            timeout_ms: 5_000,
        }
    }
}

/// Bounds on concurrent store access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Permits reserved for housekeeping and reconciliation.
    pub min_connections: usize,
    /// Total permits.
    pub max_connections: usize,
    /// How long to wait for a permit before failing with `StorageUnavailable`.
    pub acquire_timeout_ms: u64,
    /// SQLite busy timeout.
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 8,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Check `1 <= min <= max`.
    pub fn validate(&self) -> StrataResult<()> {
        if self.min_connections == 0 || self.min_connections > self.max_connections {
            return Err(StrataError::Config(format!(
                "pool bounds must satisfy 1 <= min_connections ({}) <= max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Permits available to foreground ingestion and reads.
    pub fn foreground_permits(&self) -> usize {
        self.max_connections
            .saturating_sub(self.min_connections)
            .max(1)
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Maximum serialized payload size.
    pub max_payload_bytes: usize,
    /// Accept parent ids that do not exist at write time.
    pub allow_dangling_parents: bool,
    /// Probability that an ingestion schedules a housekeeping pass.
    pub gc_trigger_probability: f64,
    /// Timeout for the durable write.
    pub storage_timeout_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            allow_dangling_parents: false,
            gc_trigger_probability: 0.01,
            storage_timeout_ms: 5_000,
        }
    }
}

/// World-model notification target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldModelConfig {
    /// POST extraction events here when set.
    pub webhook_url: Option<String>,
    /// Per-notification timeout.
    pub timeout_ms: u64,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 2_000,
        }
    }
}

/// Housekeeping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Rows per committed batch.
    pub batch_size: usize,
    /// How long a derived packet may stay parentless before removal.
    pub parentless_grace_secs: u64,
    /// Packet types considered intermediate/derived data.
    pub derived_types: Vec<String>,
    /// Tag index entries with fewer uses are collected.
    pub tag_low_watermark: u64,
    /// Periodic full pass interval (0 = disabled).
    pub interval_secs: u64,
    /// Periodic reconciliation interval (0 = disabled).
    pub reconcile_interval_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            parentless_grace_secs: 86_400,
            derived_types: vec![
                "insight".to_string(),
                "analysis".to_string(),
                "summary".to_string(),
            ],
            tag_low_watermark: 1,
            interval_secs: 0,
            reconcile_interval_secs: 0,
        }
    }
}

/// Insight extraction rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Payload keys whose string values are decisions.
    pub decision_keys: Vec<String>,
    /// Words that mark a decision when they appear in the text.
    pub decision_words: Vec<String>,
    /// Minimum repeats for a pattern.
    pub pattern_min_repeats: usize,
    /// Prior packets in the anomaly history window.
    pub anomaly_window: usize,
    /// Minimum samples before anomalies are reported.
    pub anomaly_min_samples: usize,
    /// Z-score that triggers a numeric anomaly.
    pub anomaly_z_threshold: f64,
    /// Payload keys whose string values are recommendations.
    pub recommendation_keys: Vec<String>,
    /// Line prefixes that mark a recommendation.
    pub recommendation_prefixes: Vec<String>,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            decision_keys: vec![
                "decision".to_string(),
                "verdict".to_string(),
                "outcome".to_string(),
            ],
            decision_words: vec![
                "approved".to_string(),
                "rejected".to_string(),
                "decided".to_string(),
                "concluded".to_string(),
            ],
            pattern_min_repeats: 3,
            anomaly_window: 50,
            anomaly_min_samples: 5,
            anomaly_z_threshold: 3.0,
            recommendation_keys: vec![
                "recommendation".to_string(),
                "next_action".to_string(),
                "suggested_action".to_string(),
            ],
            recommendation_prefixes: vec![
                "recommend:".to_string(),
                "next step:".to_string(),
                "todo:".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SubstrateConfig::default().validate().unwrap();
        SubstrateConfig::in_memory().validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config: SubstrateConfig = toml::from_str(
            r#"
            database_url = ":memory:"
            [pool]
            max_connections = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.embedding.provider, "stub");
        assert_eq!(config.insights.pattern_min_repeats, 3);
    }

    #[test]
    fn test_pool_bounds_rejected() {
        let mut config = SubstrateConfig::in_memory();
        config.pool.min_connections = 10;
        config.pool.max_connections = 2;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_gc_probability_rejected() {
        let mut config = SubstrateConfig::in_memory();
        config.ingestion.gc_trigger_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_foreground_permits() {
        let pool = PoolConfig {
            min_connections: 2,
            max_connections: 8,
            ..Default::default()
        };
        assert_eq!(pool.foreground_permits(), 6);
        let tight = PoolConfig {
            min_connections: 1,
            max_connections: 1,
            ..Default::default()
        };
        assert_eq!(tight.foreground_permits(), 1);
    }
}

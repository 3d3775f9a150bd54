//! `MemorySubstrate`: the stores, pipeline, retrieval and housekeeping wired
//! together from one `SubstrateConfig`.

use crate::embedding::{create_embedding_driver, EmbeddingDriver};
use crate::housekeeping::HousekeepingEngine;
use crate::knowledge::KnowledgeStore;
use crate::notifier::{create_notifier, BroadcastNotifier, WorldModelNotifier};
use crate::pipeline::IngestionPipeline;
use crate::pool::StorePool;
use crate::retrieval::Retrieval;
use crate::semantic::EmbeddingIndex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_types::config::SubstrateConfig;
use strata_types::error::{StrataError, StrataResult};
use strata_types::housekeeping::GcReport;
use strata_types::knowledge::FactQuery;
use strata_types::packet::NewPacket;
use strata_types::pipeline::{IngestOutcome, ReconcileReport, WorldModelEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Packets examined per category by each periodic reconciliation sweep.
const RECONCILE_BATCH: usize = 500;

/// Liveness and readiness of the substrate's stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// The database answered a trivial query.
    pub database: bool,
    /// Stored packets, when the packet store is readable.
    pub packets: Option<u64>,
    /// Stored vectors, when the embedding index is readable.
    pub embeddings: Option<u64>,
    /// The knowledge store is readable.
    pub knowledge: bool,
    /// Configured embedding provider.
    pub embedding_provider: String,
    /// Model id recorded on new vectors.
    pub embedding_model: String,
    /// World-model notifier in use.
    pub notifier: &'static str,
    /// Foreground store permits currently free.
    pub available_permits: usize,
    /// A housekeeping pass is running.
    pub gc_running: bool,
}

impl HealthReport {
    /// Whether every store is reachable.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// The memory substrate.
pub struct MemorySubstrate {
    config: SubstrateConfig,
    pool: StorePool,
    pipeline: IngestionPipeline,
    retrieval: Retrieval,
    broadcast: Arc<BroadcastNotifier>,
    notifier: Arc<dyn WorldModelNotifier>,
}

impl MemorySubstrate {
    /// Open the substrate described by `config`.
    pub fn open(config: &SubstrateConfig) -> StrataResult<Self> {
        config.validate()?;
        let embedder: Arc<dyn EmbeddingDriver> = Arc::from(
            create_embedding_driver(&config.embedding)
                .map_err(|e| StrataError::Config(format!("embedding: {e}")))?,
        );
        let broadcast = Arc::new(BroadcastNotifier::default());
        let notifier = create_notifier(&config.world_model, broadcast.clone())?;
        Self::open_with(config, embedder, notifier, broadcast)
    }

    /// An in-memory substrate with the stub embedder.
    pub fn open_in_memory() -> StrataResult<Self> {
        Self::open(&SubstrateConfig::in_memory())
    }

    /// Open with explicit collaborators.
    pub fn open_with(
        config: &SubstrateConfig,
        embedder: Arc<dyn EmbeddingDriver>,
        notifier: Arc<dyn WorldModelNotifier>,
        broadcast: Arc<BroadcastNotifier>,
    ) -> StrataResult<Self> {
        config.validate()?;
        let pool = StorePool::open(&config.database_url, &config.pool)?;
        let pipeline =
            IngestionPipeline::new(pool.clone(), embedder.clone(), notifier.clone(), config);
        let retrieval = Retrieval::new(
            pool.clone(),
            embedder.clone(),
            Duration::from_millis(config.embedding.timeout_ms),
        );
        info!(
            provider = %config.embedding.provider,
            model = %embedder.model_id(),
            notifier = notifier.name(),
            "Memory substrate ready"
        );
        Ok(Self {
            config: config.clone(),
            pool,
            pipeline,
            retrieval,
            broadcast,
            notifier,
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    /// The ingestion pipeline.
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// The shared store connection pool.
    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    /// The read side.
    pub fn retrieval(&self) -> &Retrieval {
        &self.retrieval
    }

    /// The housekeeping engine.
    pub fn housekeeping(&self) -> &HousekeepingEngine {
        self.pipeline.housekeeping()
    }

    /// Ingest one packet.
    pub async fn ingest(&self, new: NewPacket) -> StrataResult<IngestOutcome> {
        self.pipeline.ingest(new).await
    }

    /// Run a full housekeeping pass and wait for it.
    pub async fn run_gc(&self) -> StrataResult<GcReport> {
        let _permit = self.pool.acquire_background().await?;
        let engine = self.housekeeping().clone();
        tokio::task::spawn_blocking(move || engine.run_full_gc())
            .await
            .map_err(|e| StrataError::Internal(format!("housekeeping task failed: {e}")))?
    }

    /// Start a full housekeeping pass in the background. `false` when one is
    /// already running.
    pub fn schedule_gc(&self) -> bool {
        self.pipeline.schedule_gc()
    }

    /// The most recent housekeeping report.
    pub fn last_gc_report(&self) -> StrataResult<Option<GcReport>> {
        self.housekeeping().last_report()
    }

    /// Run one reconciliation sweep.
    pub async fn reconcile(&self, limit: usize) -> StrataResult<ReconcileReport> {
        self.pipeline.reconcile(limit).await
    }

    /// Receive world-model events in process.
    ///
    /// Only fed when no webhook is configured.
    pub fn subscribe(&self) -> broadcast::Receiver<WorldModelEvent> {
        self.broadcast.subscribe()
    }

    /// Probe every store.
    pub fn health(&self) -> HealthReport {
        let database = self.pool.ping().is_ok();
        let packets = self.pipeline.packets().count().ok();
        let embeddings = EmbeddingIndex::new(self.pool.connection()).count().ok();
        let knowledge = KnowledgeStore::new(self.pool.connection())
            .query_facts(&FactQuery {
                limit: Some(1),
                ..Default::default()
            })
            .is_ok();
        let ok = database && packets.is_some() && embeddings.is_some() && knowledge;
        HealthReport {
            status: if ok { "ok" } else { "degraded" },
            database,
            packets,
            embeddings,
            knowledge,
            embedding_provider: self.config.embedding.provider.clone(),
            embedding_model: self.pipeline.embedder().model_id().to_string(),
            notifier: self.notifier.name(),
            available_permits: self.pool.available_permits(),
            gc_running: self.pipeline.gc_running(),
        }
    }

    /// Spawn the periodic housekeeping and reconciliation loops configured
    /// in `[housekeeping]`. Each loop exits when `shutdown` flips.
    pub fn start_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let gc_secs = self.config.housekeeping.interval_secs;
        if gc_secs > 0 {
            let pipeline = self.pipeline.clone();
            let interval = Duration::from_secs(gc_secs);
            let mut shutdown = shutdown.clone();
            info!(interval_secs = gc_secs, "Starting periodic housekeeping loop");
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {
                            info!("Housekeeping loop: shutdown signal received");
                            break;
                        }
                    }
                    if !pipeline.schedule_gc() {
                        debug!("Housekeeping loop: skipping tick (busy)");
                    }
                }
            }));
        }

        let reconcile_secs = self.config.housekeeping.reconcile_interval_secs;
        if reconcile_secs > 0 {
            let pipeline = self.pipeline.clone();
            let interval = Duration::from_secs(reconcile_secs);
            let mut shutdown = shutdown;
            let busy = Arc::new(AtomicBool::new(false));
            info!(interval_secs = reconcile_secs, "Starting periodic reconciliation loop");
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {
                            info!("Reconciliation loop: shutdown signal received");
                            break;
                        }
                    }
                    if busy
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        debug!("Reconciliation loop: skipping tick (busy)");
                        continue;
                    }
                    let pipeline = pipeline.clone();
                    let busy = busy.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pipeline.reconcile(RECONCILE_BATCH).await {
                            warn!("Reconciliation sweep failed: {e}");
                        }
                        busy.store(false, Ordering::SeqCst);
                    });
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn setup() -> MemorySubstrate {
        let mut config = SubstrateConfig::in_memory();
        config.ingestion.gc_trigger_probability = 0.0;
        MemorySubstrate::open(&config).unwrap()
    }

    #[tokio::test]
    async fn test_open_ingest_and_health() {
        let substrate = setup();
        substrate
            .ingest(NewPacket::new("event", json!({"action": "login"})).in_thread("t1"))
            .await
            .unwrap();

        let health = substrate.health();
        assert!(health.is_ok());
        assert_eq!(health.packets, Some(1));
        assert_eq!(health.embeddings, Some(1));
        assert_eq!(health.embedding_provider, "stub");
        assert_eq!(health.notifier, "broadcast");
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let substrate = setup();
        let mut rx = substrate.subscribe();
        let out = substrate
            .ingest(NewPacket::new("event", json!({"action": "login"})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().packet.id, out.id);
    }

    #[tokio::test]
    async fn test_run_gc_and_last_report() {
        let substrate = setup();
        assert!(substrate.last_gc_report().unwrap().is_none());
        substrate
            .ingest(
                NewPacket::new("event", json!({"n": 1}))
                    .expires_at(Utc::now() - chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();
        let report = substrate.run_gc().await.unwrap();
        assert_eq!(report.ttl_evicted, 1);
        assert_eq!(report.orphan_embeddings, 1);
        assert_eq!(substrate.last_gc_report().unwrap(), Some(report));
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let mut config = SubstrateConfig::in_memory();
        config.embedding.provider = "nowhere".into();
        assert!(matches!(
            MemorySubstrate::open(&config),
            Err(StrataError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let mut config = SubstrateConfig::in_memory();
        config.housekeeping.interval_secs = 3600;
        config.housekeeping.reconcile_interval_secs = 3600;
        let substrate = MemorySubstrate::open(&config).unwrap();
        let (tx, rx) = watch::channel(false);
        let handles = substrate.start_background(rx);
        assert_eq!(handles.len(), 2);
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

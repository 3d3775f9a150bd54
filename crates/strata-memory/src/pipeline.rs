//! The ingestion pipeline.
//!
//! Every packet runs through the stages of [`Stage`] in order. Intake,
//! reasoning and the durable write are fatal on failure and surface to the
//! caller; everything after the write is enrichment: a failure is logged,
//! recorded on the checkpoint row and left for [`IngestionPipeline::reconcile`].
//!
//! State is carried stage to stage in an explicit [`IngestContext`].

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::embedding::EmbeddingDriver;
use crate::housekeeping::HousekeepingEngine;
use crate::insights::InsightEngine;
use crate::knowledge::KnowledgeStore;
use crate::notifier::WorldModelNotifier;
use crate::packet_store::{prepare, PacketStore, PreparedPacket};
use crate::pool::StorePool;
use crate::reasoning::{derive_annotation, packet_text};
use crate::semantic::EmbeddingIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_types::config::{IngestionConfig, SubstrateConfig};
use strata_types::error::{StrataError, StrataResult};
use strata_types::knowledge::Extraction;
use strata_types::packet::{NewPacket, Packet, PacketId, ReasoningAnnotation, WriteResult};
use strata_types::pipeline::{IngestOutcome, ReconcileReport, Stage, WorldModelEvent};
use tracing::{debug, error, info, warn};

/// Checkpoints that advanced more recently than this are assumed to belong
/// to an ingestion that is still in flight. Reconciliation and duplicate
/// resumption leave them alone.
const RECONCILE_GRACE_SECS: i64 = 30;

/// Per-ingestion state threaded through the enrichment stages.
#[derive(Debug, Clone)]
pub struct IngestContext {
    /// The validated draft, when the run started at intake.
    pub draft: Option<PreparedPacket>,
    /// The stored packet.
    pub packet: Packet,
    /// Its reasoning annotation.
    pub annotation: ReasoningAnnotation,
    /// Whether a vector for the current model is stored.
    pub embedded: bool,
    /// Extraction result, once computed.
    pub extraction: Option<Extraction>,
    /// Stages that failed during this run.
    pub degraded: Vec<Stage>,
}

impl IngestContext {
    fn new(packet: Packet, annotation: ReasoningAnnotation) -> Self {
        Self {
            draft: None,
            packet,
            annotation,
            embedded: false,
            extraction: None,
            degraded: Vec::new(),
        }
    }
}

/// Runs packets through the stage sequence.
#[derive(Clone)]
pub struct IngestionPipeline {
    pool: StorePool,
    packets: PacketStore,
    checkpoints: CheckpointStore,
    embeddings: EmbeddingIndex,
    knowledge: KnowledgeStore,
    housekeeping: HousekeepingEngine,
    embedder: Arc<dyn EmbeddingDriver>,
    notifier: Arc<dyn WorldModelNotifier>,
    engine: InsightEngine,
    config: IngestionConfig,
    embed_timeout: Duration,
    notify_timeout: Duration,
    gc_busy: Arc<AtomicBool>,
}

impl IngestionPipeline {
    /// Build a pipeline over `pool` with the given collaborators.
    pub fn new(
        pool: StorePool,
        embedder: Arc<dyn EmbeddingDriver>,
        notifier: Arc<dyn WorldModelNotifier>,
        config: &SubstrateConfig,
    ) -> Self {
        let conn = pool.connection();
        Self {
            packets: PacketStore::new(conn.clone())
                .with_dangling_parents(config.ingestion.allow_dangling_parents),
            checkpoints: CheckpointStore::new(conn.clone()),
            embeddings: EmbeddingIndex::new(conn.clone()),
            knowledge: KnowledgeStore::new(conn.clone()),
            housekeeping: HousekeepingEngine::new(conn, config.housekeeping.clone()),
            pool,
            embedder,
            notifier,
            engine: InsightEngine::new(config.insights.clone()),
            config: config.ingestion.clone(),
            embed_timeout: Duration::from_millis(config.embedding.timeout_ms),
            notify_timeout: Duration::from_millis(config.world_model.timeout_ms),
            gc_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The packet store.
    pub fn packets(&self) -> &PacketStore {
        &self.packets
    }

    /// The checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The embedding index.
    pub fn embeddings(&self) -> &EmbeddingIndex {
        &self.embeddings
    }

    /// The knowledge store.
    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// The housekeeping engine.
    pub fn housekeeping(&self) -> &HousekeepingEngine {
        &self.housekeeping
    }

    /// The embedding driver.
    pub fn embedder(&self) -> &Arc<dyn EmbeddingDriver> {
        &self.embedder
    }

    /// Ingest one packet.
    ///
    /// Returns once the packet is durable and every enrichment stage has run
    /// or been deferred. A duplicate returns the original id; if the
    /// original's pipeline never finished it is resumed first.
    pub async fn ingest(&self, new: NewPacket) -> StrataResult<IngestOutcome> {
        let _permit = self.pool.acquire().await?;

        // intake
        let prepared = prepare(new, &self.config).map_err(|e| {
            debug!(stage = %Stage::Intake, "Rejected packet: {e}");
            e
        })?;

        // reasoning
        let annotation = derive_annotation(
            &prepared.packet_type,
            &prepared.payload,
            self.engine.config(),
        );

        // memory_write
        let written = self.memory_write(&prepared, &annotation).await?;
        if written.duplicate {
            let degraded = match self.claim_stale(written.id)? {
                Some(state) => {
                    info!(packet_id = %written.id, "Duplicate of an unfinished ingestion, resuming");
                    self.resume_state(state).await?
                }
                None => Vec::new(),
            };
            return Ok(IngestOutcome {
                id: written.id,
                thread_id: written.thread_id,
                sequence: written.sequence,
                duplicate: true,
                degraded,
            });
        }

        let packet = self.packets.read(written.id)?;
        let mut ctx = IngestContext::new(packet, annotation);
        ctx.draft = Some(prepared);
        self.run_from(&mut ctx, Stage::SemanticEmbed).await;

        debug!(
            packet_id = %written.id,
            thread = %written.thread_id,
            sequence = written.sequence,
            degraded = ctx.degraded.len(),
            "Ingestion complete"
        );
        Ok(IngestOutcome {
            id: written.id,
            thread_id: written.thread_id,
            sequence: written.sequence,
            duplicate: false,
            degraded: ctx.degraded,
        })
    }

    async fn memory_write(
        &self,
        prepared: &PreparedPacket,
        annotation: &ReasoningAnnotation,
    ) -> StrataResult<WriteResult> {
        let store = self.packets.clone();
        let packet = prepared.clone();
        let annotation = annotation.clone();
        let task =
            tokio::task::spawn_blocking(move || store.write_prepared(&packet, Some(&annotation), true));
        let timeout = Duration::from_millis(self.config.storage_timeout_ms);
        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StrataError::Internal(format!("write task failed: {e}"))),
            Err(_) => Err(StrataError::StorageUnavailable(format!(
                "durable write timed out after {}ms",
                timeout.as_millis()
            ))),
        };
        result.map_err(|e| {
            match &e {
                StrataError::Validation(_) | StrataError::LineageIntegrity(_) => {
                    debug!(packet_id = %prepared.id, stage = %Stage::MemoryWrite, "Write rejected: {e}");
                }
                _ => {
                    error!(packet_id = %prepared.id, stage = %Stage::MemoryWrite, "Durable write failed: {e}");
                }
            }
            e
        })
    }

    /// Continue an unfinished pipeline from the stage after its checkpoint.
    ///
    /// A no-op for completed packets, for packets written outside the
    /// pipeline, and for pipelines that advanced within the last
    /// `RECONCILE_GRACE_SECS` seconds. Returns the stages that failed during
    /// this run.
    pub async fn resume(&self, id: PacketId) -> StrataResult<Vec<Stage>> {
        if let Some(state) = self.claim_stale(id)? {
            return self.resume_state(state).await;
        }
        if self.checkpoints.get(id)?.is_none() {
            // Surfaces NotFound for unknown ids.
            self.packets.read(id)?;
        }
        Ok(Vec::new())
    }

    fn claim_stale(&self, id: PacketId) -> StrataResult<Option<CheckpointState>> {
        let stale_before = chrono::Utc::now() - chrono::Duration::seconds(RECONCILE_GRACE_SECS);
        let claimed = self.checkpoints.claim(id, stale_before)?;
        if claimed.is_none() {
            debug!(packet_id = %id, "Pipeline complete or still in flight, not resuming");
        }
        Ok(claimed)
    }

    /// Run the rest of a pipeline whose checkpoint the caller has claimed.
    async fn resume_state(&self, state: CheckpointState) -> StrataResult<Vec<Stage>> {
        let Some(start) = state.last_stage.next() else {
            self.checkpoints.mark_complete(state.packet_id)?;
            return Ok(Vec::new());
        };
        let start = start.max(Stage::SemanticEmbed);
        let mut ctx = self.load_context(state.packet_id)?;
        debug!(packet_id = %state.packet_id, from = %start, "Resuming pipeline");
        self.run_from(&mut ctx, start).await;
        Ok(ctx.degraded)
    }

    fn load_context(&self, id: PacketId) -> StrataResult<IngestContext> {
        let packet = self.packets.read(id)?;
        let annotation = match self.packets.annotation(id)? {
            Some(a) => a,
            None => derive_annotation(&packet.packet_type, &packet.payload, self.engine.config()),
        };
        Ok(IngestContext::new(packet, annotation))
    }

    /// Run every enrichment stage from `start` through checkpoint.
    async fn run_from(&self, ctx: &mut IngestContext, start: Stage) {
        let id = ctx.packet.id;
        for stage in Stage::ALL.into_iter().filter(|s| *s >= start) {
            if stage.is_durability_path() {
                continue;
            }
            if stage == Stage::Checkpoint {
                match self.checkpoints.mark_complete(id) {
                    Ok(()) => {}
                    Err(e) => warn!(packet_id = %id, stage = %stage, "Could not complete checkpoint: {e}"),
                }
                break;
            }

            if let Err(e) = self.run_stage(ctx, stage).await {
                warn!(packet_id = %id, stage = %stage, "Enrichment stage failed, deferring: {e}");
                ctx.degraded.push(stage);
                if let Err(e) = self.checkpoints.record_failure(id, stage) {
                    warn!(packet_id = %id, stage = %stage, "Could not record stage failure: {e}");
                }
            }
            if let Err(e) = self.checkpoints.set_stage(id, stage) {
                warn!(packet_id = %id, stage = %stage, "Could not advance checkpoint: {e}");
            }
        }
    }

    async fn run_stage(&self, ctx: &mut IngestContext, stage: Stage) -> StrataResult<()> {
        match stage {
            Stage::SemanticEmbed => self.semantic_embed(ctx).await,
            Stage::ExtractInsights => self.extract_insights(ctx),
            Stage::StoreInsights => self.store_insights(ctx),
            Stage::WorldModelTrigger => self.world_model_trigger(ctx).await,
            Stage::GcTrigger => {
                self.gc_trigger();
                Ok(())
            }
            Stage::Intake | Stage::Reasoning | Stage::MemoryWrite | Stage::Checkpoint => Ok(()),
        }
    }

    async fn semantic_embed(&self, ctx: &mut IngestContext) -> StrataResult<()> {
        let text = packet_text(&ctx.packet.packet_type, &ctx.packet.payload);
        let vector = match tokio::time::timeout(self.embed_timeout, self.embedder.embed_one(&text)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StrataError::ProviderDegraded(format!(
                    "embedding timed out after {}ms",
                    self.embed_timeout.as_millis()
                )))
            }
        };
        self.embeddings
            .store(ctx.packet.id, self.embedder.model_id(), &vector)?;
        ctx.embedded = true;
        Ok(())
    }

    fn extract_insights(&self, ctx: &mut IngestContext) -> StrataResult<()> {
        let history = self.packets.recent_in_segment(
            &ctx.annotation.segment,
            ctx.packet.id,
            self.engine.config().anomaly_window,
        )?;
        ctx.extraction = Some(self.engine.extract(&ctx.packet, &ctx.annotation, &history));
        Ok(())
    }

    fn store_insights(&self, ctx: &mut IngestContext) -> StrataResult<()> {
        if ctx.extraction.is_none() {
            self.extract_insights(ctx)?;
        }
        let Some(extraction) = ctx.extraction.as_ref() else {
            return Ok(());
        };
        if extraction.is_empty() || !self.knowledge.store_extraction(ctx.packet.id, extraction)? {
            return Ok(());
        }
        debug!(
            packet_id = %ctx.packet.id,
            insights = extraction.insights.len(),
            facts = extraction.facts.len(),
            "Stored extraction"
        );
        Ok(())
    }

    async fn world_model_trigger(&self, ctx: &mut IngestContext) -> StrataResult<()> {
        if ctx.extraction.is_none() {
            self.extract_insights(ctx)?;
        }
        let event = WorldModelEvent {
            packet: ctx.packet.clone(),
            extraction: ctx.extraction.clone().unwrap_or_default(),
        };
        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(&event)).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::ProviderDegraded(format!(
                "{} notification timed out after {}ms",
                self.notifier.name(),
                self.notify_timeout.as_millis()
            ))),
        }
    }

    fn gc_trigger(&self) {
        let p = self.config.gc_trigger_probability;
        if p > 0.0 && rand::random::<f64>() < p {
            self.schedule_gc();
        }
    }

    /// Start a full housekeeping pass in the background.
    ///
    /// Returns `false` when a pass is already running.
    pub fn schedule_gc(&self) -> bool {
        if self
            .gc_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Housekeeping pass already running, skipping trigger");
            return false;
        }
        let pool = self.pool.clone();
        let engine = self.housekeeping.clone();
        let busy = self.gc_busy.clone();
        tokio::spawn(async move {
            match pool.acquire_background().await {
                Ok(permit) => {
                    let result = tokio::task::spawn_blocking(move || engine.run_full_gc()).await;
                    drop(permit);
                    match result {
                        Ok(Ok(report)) => debug!(total = report.total(), "Scheduled housekeeping finished"),
                        Ok(Err(e)) => warn!("Scheduled housekeeping failed: {e}"),
                        Err(e) => warn!("Scheduled housekeeping task panicked: {e}"),
                    }
                }
                Err(e) => warn!("Scheduled housekeeping could not start: {e}"),
            }
            busy.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Whether a scheduled housekeeping pass is running.
    pub fn gc_running(&self) -> bool {
        self.gc_busy.load(Ordering::SeqCst)
    }

    /// Reconciliation sweep over at most `limit` items per category.
    ///
    /// Resumes stale unfinished pipelines, retries failed enrichment stages,
    /// and embeds packets that have no vector for the current model.
    pub async fn reconcile(&self, limit: usize) -> StrataResult<ReconcileReport> {
        self.reconcile_older_than(limit, chrono::Duration::seconds(RECONCILE_GRACE_SECS))
            .await
    }

    /// [`reconcile`](Self::reconcile) with an explicit staleness threshold
    /// for unfinished pipelines.
    pub async fn reconcile_older_than(
        &self,
        limit: usize,
        min_age: chrono::Duration,
    ) -> StrataResult<ReconcileReport> {
        let _permit = self.pool.acquire_background().await?;
        let mut report = ReconcileReport::default();
        let cutoff = chrono::Utc::now() - min_age;

        for pending in self.checkpoints.incomplete(limit)? {
            let id = pending.packet_id;
            let Some(state) = self.checkpoints.claim(id, cutoff)? else {
                continue;
            };
            match self.resume_state(state).await {
                Ok(degraded) if degraded.is_empty() => report.resumed += 1,
                Ok(degraded) => report.still_failing += degraded.len() as u64,
                Err(e) => {
                    warn!(packet_id = %id, "Resume failed: {e}");
                    report.still_failing += 1;
                }
            }
        }

        for state in self.checkpoints.with_failures(limit)? {
            let mut ctx = match self.load_context(state.packet_id) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(packet_id = %state.packet_id, "Cannot retry stages: {e}");
                    report.still_failing += state.failed_stages.len() as u64;
                    continue;
                }
            };
            for stage in state.failed_stages {
                match self.run_stage(&mut ctx, stage).await {
                    Ok(()) => {
                        self.checkpoints.clear_failure(state.packet_id, stage)?;
                        report.retried += 1;
                    }
                    Err(e) => {
                        debug!(packet_id = %state.packet_id, stage = %stage, "Retry failed: {e}");
                        report.still_failing += 1;
                    }
                }
            }
        }

        let model = self.embedder.model_id().to_string();
        for id in self.embeddings.missing_for_model(&model, limit)? {
            let mut ctx = match self.packets.get(id)? {
                Some(packet) => IngestContext::new(packet, ReasoningAnnotation::default()),
                None => continue,
            };
            match self.semantic_embed(&mut ctx).await {
                Ok(()) => report.embedded += 1,
                Err(e) => {
                    debug!(packet_id = %id, "Embedding still failing: {e}");
                    report.still_failing += 1;
                }
            }
        }

        info!(
            resumed = report.resumed,
            retried = report.retried,
            embedded = report.embedded,
            still_failing = report.still_failing,
            "Reconciliation sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, StubEmbeddingDriver};
    use crate::fmt_ts;
    use crate::notifier::{BroadcastNotifier, NoopNotifier};
    use async_trait::async_trait;
    use serde_json::json;
    use strata_types::config::InsightConfig;
    use strata_types::knowledge::{InsightKind, InsightQuery};

    struct FlakyEmbedder {
        failing: AtomicBool,
        inner: StubEmbeddingDriver,
    }

    impl FlakyEmbedder {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
                inner: StubEmbeddingDriver::new("stub-hash-v1", 64),
            }
        }
    }

    #[async_trait]
    impl EmbeddingDriver for FlakyEmbedder {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Http("connection refused".into()));
            }
            self.inner.embed(texts).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    struct SlowEmbedder(StubEmbeddingDriver);

    #[async_trait]
    impl EmbeddingDriver for SlowEmbedder {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.embed(texts).await
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }

        fn model_id(&self) -> &str {
            self.0.model_id()
        }
    }

    struct DownNotifier;

    #[async_trait]
    impl WorldModelNotifier for DownNotifier {
        async fn notify(&self, _event: &WorldModelEvent) -> StrataResult<()> {
            Err(StrataError::ProviderDegraded("world model offline".into()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn setup_with(
        embedder: Arc<dyn EmbeddingDriver>,
        notifier: Arc<dyn WorldModelNotifier>,
    ) -> IngestionPipeline {
        let mut config = SubstrateConfig::in_memory();
        config.ingestion.gc_trigger_probability = 0.0;
        let pool = StorePool::open(":memory:", &config.pool).unwrap();
        IngestionPipeline::new(pool, embedder, notifier, &config)
    }

    fn setup() -> IngestionPipeline {
        setup_with(
            Arc::new(StubEmbeddingDriver::new("stub-hash-v1", 64)),
            Arc::new(NoopNotifier),
        )
    }

    #[tokio::test]
    async fn test_ingest_runs_every_stage() {
        let pipeline = setup();
        let out = pipeline
            .ingest(NewPacket::new("event", json!({"action": "login"})).in_thread("t1"))
            .await
            .unwrap();
        assert!(!out.duplicate);
        assert_eq!(out.sequence, 1);
        assert!(out.degraded.is_empty());

        let state = pipeline.checkpoints().get(out.id).unwrap().unwrap();
        assert!(state.completed);
        assert_eq!(state.last_stage, Stage::Checkpoint);
        assert!(pipeline.packets().annotation(out.id).unwrap().is_some());
        assert!(pipeline.embeddings().get(out.id, "stub-hash-v1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_returns_original() {
        let pipeline = setup();
        let new = NewPacket::new("event", json!({"action": "login"})).in_thread("t1");
        let first = pipeline.ingest(new.clone()).await.unwrap();
        let second = pipeline.ingest(new).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.duplicate);
        assert_eq!(pipeline.packets().thread_len("t1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let pipeline = setup();
        let err = pipeline
            .ingest(NewPacket::new("  ", json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
        assert_eq!(pipeline.packets().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embed_failure_degrades_then_reconciles() {
        let embedder = Arc::new(FlakyEmbedder::new(true));
        let pipeline = setup_with(embedder.clone(), Arc::new(NoopNotifier));

        let out = pipeline
            .ingest(NewPacket::new("event", json!({"action": "login"})))
            .await
            .unwrap();
        assert_eq!(out.degraded, vec![Stage::SemanticEmbed]);
        // Still readable by id, just not searchable yet.
        assert!(pipeline.packets().exists(out.id).unwrap());
        let state = pipeline.checkpoints().get(out.id).unwrap().unwrap();
        assert!(state.completed);
        assert_eq!(state.failed_stages, vec![Stage::SemanticEmbed]);

        embedder.failing.store(false, Ordering::SeqCst);
        let report = pipeline.reconcile(10).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.still_failing, 0);
        assert!(pipeline.embeddings().get(out.id, "stub-hash-v1").unwrap().is_some());
        let state = pipeline.checkpoints().get(out.id).unwrap().unwrap();
        assert!(state.failed_stages.is_empty());
    }

    #[tokio::test]
    async fn test_notifier_failure_is_not_fatal() {
        let pipeline = setup_with(
            Arc::new(StubEmbeddingDriver::new("stub-hash-v1", 64)),
            Arc::new(DownNotifier),
        );
        let out = pipeline
            .ingest(NewPacket::new("event", json!({"action": "login"})))
            .await
            .unwrap();
        assert_eq!(out.degraded, vec![Stage::WorldModelTrigger]);
        assert!(pipeline.checkpoints().get(out.id).unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_insights_stored_and_broadcast() {
        let broadcast = Arc::new(BroadcastNotifier::new(8));
        let mut rx = broadcast.subscribe();
        let pipeline = setup_with(
            Arc::new(StubEmbeddingDriver::new("stub-hash-v1", 64)),
            broadcast,
        );
        let out = pipeline
            .ingest(NewPacket::new("review", json!({"decision": "approved", "item": "rfc-7"})))
            .await
            .unwrap();

        let insights = pipeline
            .knowledge()
            .query_insights(&InsightQuery {
                packet_id: Some(out.id),
                kind: Some(InsightKind::Conclusion),
                ..Default::default()
            })
            .unwrap();
        assert!(!insights.is_empty());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.packet.id, out.id);
        assert!(!event.extraction.insights.is_empty());
    }

    #[tokio::test]
    async fn test_resume_after_interrupted_run() {
        let pipeline = setup();
        let config = InsightConfig::default();
        let prepared = prepare(
            NewPacket::new("event", json!({"action": "deploy"})),
            &IngestionConfig::default(),
        )
        .unwrap();
        let annotation = derive_annotation(&prepared.packet_type, &prepared.payload, &config);
        // Durable write only, as if the process died right after commit.
        let written = pipeline
            .packets()
            .write_prepared(&prepared, Some(&annotation), true)
            .unwrap();
        let state = pipeline.checkpoints().get(written.id).unwrap().unwrap();
        assert_eq!(state.last_stage, Stage::MemoryWrite);
        assert!(!state.completed);

        let report = pipeline
            .reconcile_older_than(10, chrono::Duration::zero())
            .await
            .unwrap();
        assert_eq!(report.resumed, 1);
        let state = pipeline.checkpoints().get(written.id).unwrap().unwrap();
        assert!(state.completed);
        assert_eq!(state.attempts, 2);
        assert!(pipeline.embeddings().get(written.id, "stub-hash-v1").unwrap().is_some());

        // Completed pipelines are left alone.
        assert!(pipeline.resume(written.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_resumes_unfinished_pipeline() {
        let pipeline = setup();
        let new = NewPacket::new("event", json!({"action": "deploy"}));
        let prepared = prepare(new.clone(), &IngestionConfig::default()).unwrap();
        let annotation = derive_annotation(
            &prepared.packet_type,
            &prepared.payload,
            &InsightConfig::default(),
        );
        let written = pipeline
            .packets()
            .write_prepared(&prepared, Some(&annotation), true)
            .unwrap();
        let stale = fmt_ts(chrono::Utc::now() - chrono::Duration::minutes(5));
        pipeline
            .pool
            .connection()
            .lock()
            .unwrap()
            .execute(
                "UPDATE pipeline_checkpoints SET updated_at = ?1 WHERE packet_id = ?2",
                rusqlite::params![stale, written.id.to_string()],
            )
            .unwrap();

        let out = pipeline.ingest(new).await.unwrap();
        assert!(out.duplicate);
        assert_eq!(out.id, written.id);
        assert!(pipeline.checkpoints().get(out.id).unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_reconcile_embeds_packets_written_directly() {
        let pipeline = setup();
        let id = pipeline
            .packets()
            .write(NewPacket::new("event", json!({"action": "logout"})))
            .unwrap()
            .id;
        let report = pipeline.reconcile(10).await.unwrap();
        assert_eq!(report.embedded, 1);
        assert!(pipeline.embeddings().get(id, "stub-hash-v1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_during_ingest_does_not_rerun_stages() {
        let broadcast = Arc::new(BroadcastNotifier::new(8));
        let mut rx = broadcast.subscribe();
        let pipeline = setup_with(
            Arc::new(SlowEmbedder(StubEmbeddingDriver::new("stub-hash-v1", 64))),
            broadcast,
        );
        let new = NewPacket::new("review", json!({"decision": "approved", "item": "rfc-9"}));

        let (first, second) = tokio::join!(pipeline.ingest(new.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pipeline.ingest(new.clone()).await
        });
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);
        assert!(second.degraded.is_empty());

        let mut events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.packet.id == first.id {
                events += 1;
            }
        }
        assert_eq!(events, 1);

        let state = pipeline.checkpoints().get(first.id).unwrap().unwrap();
        assert!(state.completed);
        assert_eq!(state.attempts, 1);

        let insights = pipeline
            .knowledge()
            .query_insights(&InsightQuery {
                packet_id: Some(first.id),
                ..Default::default()
            })
            .unwrap();
        assert!(!insights.is_empty());
        let mut distinct: Vec<_> = insights.iter().map(|i| (i.kind, i.content.clone())).collect();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), insights.len());
    }

    #[tokio::test]
    async fn test_resume_unknown_packet() {
        let pipeline = setup();
        let err = pipeline.resume(PacketId::new()).await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_schedule_gc_skips_while_busy() {
        let pipeline = setup();
        assert!(pipeline.schedule_gc());
        // The spawned pass has not been polled yet on this runtime.
        assert!(!pipeline.schedule_gc());
        assert!(pipeline.gc_running());
    }
}

//! Retrieval: semantic and hybrid search, thread and lineage reads, and
//! knowledge queries.
//!
//! Searches only ever return `active` packets. Reads by id or thread return
//! whatever is stored.

use crate::embedding::EmbeddingDriver;
use crate::knowledge::KnowledgeStore;
use crate::lineage::LineageTracer;
use crate::packet_store::PacketStore;
use crate::pool::StorePool;
use crate::semantic::{EmbeddingIndex, ScoredId};
use std::sync::Arc;
use std::time::Duration;
use strata_types::error::{StrataError, StrataResult};
use strata_types::knowledge::{ExtractedInsight, FactQuery, InsightQuery, KnowledgeFact};
use strata_types::lineage::{LineageDirection, LineageGraph};
use strata_types::packet::{Packet, PacketId};
use strata_types::retrieval::{HybridFilters, ScoredPacket};
use tracing::{debug, warn};

/// Default upper bound on ids a structured pre-filter may hand to the ranker.
pub const MAX_PREFILTER_CANDIDATES: usize = 10_000;

/// Read side of the substrate.
#[derive(Clone)]
pub struct Retrieval {
    pool: StorePool,
    packets: PacketStore,
    embeddings: EmbeddingIndex,
    knowledge: KnowledgeStore,
    lineage: LineageTracer,
    embedder: Arc<dyn EmbeddingDriver>,
    embed_timeout: Duration,
    prefilter_cap: usize,
}

impl Retrieval {
    /// Create the read side over `pool`, embedding queries with `embedder`.
    pub fn new(pool: StorePool, embedder: Arc<dyn EmbeddingDriver>, embed_timeout: Duration) -> Self {
        let conn = pool.connection();
        let packets = PacketStore::new(conn.clone());
        Self {
            embeddings: EmbeddingIndex::new(conn.clone()),
            knowledge: KnowledgeStore::new(conn),
            lineage: LineageTracer::new(packets.clone()),
            packets,
            pool,
            embedder,
            embed_timeout,
            prefilter_cap: MAX_PREFILTER_CANDIDATES,
        }
    }

    /// Limit how many pre-filter matches a hybrid search ranks.
    pub fn with_prefilter_cap(mut self, cap: usize) -> Self {
        self.prefilter_cap = cap.max(1);
        self
    }

    /// Read one packet.
    pub fn read(&self, id: PacketId) -> StrataResult<Packet> {
        self.packets.read(id)
    }

    /// The `top_k` packets most similar to `query`, scoring at least
    /// `min_score`, by descending similarity then most recent first.
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        min_score: Option<f32>,
    ) -> StrataResult<Vec<ScoredPacket>> {
        self.ranked(query, None, top_k, min_score).await
    }

    /// Semantic search restricted by structured filters.
    ///
    /// When the filters are selective, only the newest
    /// [`MAX_PREFILTER_CANDIDATES`] matching packets (or the cap set with
    /// [`with_prefilter_cap`](Self::with_prefilter_cap)) are ranked. Older
    /// matches beyond the cap are not considered, and a warning is logged.
    pub async fn hybrid_search(
        &self,
        query: &str,
        filters: &HybridFilters,
        top_k: usize,
        min_score: Option<f32>,
    ) -> StrataResult<Vec<ScoredPacket>> {
        self.ranked(query, Some(filters), top_k, min_score).await
    }

    async fn ranked(
        &self,
        query: &str,
        filters: Option<&HybridFilters>,
        top_k: usize,
        min_score: Option<f32>,
    ) -> StrataResult<Vec<ScoredPacket>> {
        if query.trim().is_empty() {
            return Err(StrataError::Validation("query must not be empty".to_string()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let _permit = self.pool.acquire().await?;

        let vector = match tokio::time::timeout(self.embed_timeout, self.embedder.embed_one(query)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StrataError::ProviderDegraded(format!(
                    "query embedding timed out after {}ms",
                    self.embed_timeout.as_millis()
                )))
            }
        };

        let packets = self.packets.clone();
        let embeddings = self.embeddings.clone();
        let model = self.embedder.model_id().to_string();
        let prefilter = filters.filter(|f| f.is_selective()).map(|f| f.structured());
        let cap = self.prefilter_cap;
        let scored = tokio::task::spawn_blocking(move || -> StrataResult<Vec<ScoredId>> {
            match prefilter {
                Some(filter) => {
                    let candidates = packets.ids_matching(&filter, cap)?;
                    if candidates.len() >= cap {
                        warn!(cap, "Pre-filter matched more packets than the cap; ranking only the newest");
                    }
                    embeddings.search(&vector, &model, Some(&candidates))
                }
                None => embeddings.search(&vector, &model, None),
            }
        })
        .await
        .map_err(|e| StrataError::Internal(format!("search task failed: {e}")))??;

        let threshold = min_score.unwrap_or(f32::MIN);
        let mut scored: Vec<ScoredId> = scored
            .into_iter()
            .filter(|s| s.score >= threshold)
            .collect();
        rank(&mut scored);

        let mut results = Vec::with_capacity(top_k.min(scored.len()));
        for hit in scored {
            if results.len() >= top_k {
                break;
            }
            let Some(packet) = self.packets.get(hit.id)? else {
                continue;
            };
            if filters.is_some_and(|f| !f.admits(&packet)) {
                continue;
            }
            results.push(ScoredPacket {
                packet,
                score: hit.score,
            });
        }
        debug!(query_len = query.len(), hits = results.len(), "Search complete");
        Ok(results)
    }

    /// Packets of a thread in sequence order.
    pub fn fetch_thread(&self, thread_id: &str) -> StrataResult<Vec<Packet>> {
        self.packets.fetch_thread(thread_id)
    }

    /// The lineage subgraph around `id`.
    pub fn fetch_lineage(
        &self,
        id: PacketId,
        direction: LineageDirection,
        max_depth: Option<usize>,
    ) -> StrataResult<LineageGraph> {
        self.lineage.trace(id, direction, max_depth)
    }

    /// Stored facts matching `query`.
    pub fn query_facts(&self, query: &FactQuery) -> StrataResult<Vec<KnowledgeFact>> {
        self.knowledge.query_facts(query)
    }

    /// Stored insights matching `query`.
    pub fn query_insights(&self, query: &InsightQuery) -> StrataResult<Vec<ExtractedInsight>> {
        self.knowledge.query_insights(query)
    }
}

/// Descending score; ties go to the most recently created packet.
fn rank(scored: &mut [ScoredId]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
    });
}

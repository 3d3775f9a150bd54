//! Route handlers.
//!
//! - POST /packet             ingest (201 new, 200 duplicate)
//! - GET  /packet/{id}        read one packet
//! - POST /semantic/search    ranked similarity search
//! - POST /hybrid/search      similarity search under structured filters
//! - GET  /thread/{id}        packets of a thread in sequence order
//! - GET  /lineage/{id}       ancestors or descendants subgraph
//! - GET  /facts              knowledge facts
//! - GET  /insights           extracted insights
//! - POST /gc/run             full housekeeping pass (inline or background)
//! - GET  /gc/stats           last housekeeping report
//! - GET  /health             store readiness

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use strata_memory::retrieval::Retrieval;
use strata_memory::MemorySubstrate;
use strata_types::error::{StrataError, StrataResult};
use strata_types::knowledge::{FactQuery, InsightKind, InsightQuery};
use strata_types::lineage::LineageDirection;
use strata_types::packet::{NewPacket, PacketId};
use strata_types::retrieval::HybridFilters;

/// Results returned when a search body omits `top_k`.
const DEFAULT_TOP_K: usize = 10;
/// Hard cap on `top_k`.
const MAX_TOP_K: usize = 1000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub substrate: Arc<MemorySubstrate>,
}

/// All routes, without middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/packet", post(create_packet))
        .route("/packet/{id}", get(get_packet))
        .route("/semantic/search", post(semantic_search))
        .route("/hybrid/search", post(hybrid_search))
        .route("/thread/{id}", get(get_thread))
        .route("/lineage/{id}", get(get_lineage))
        .route("/facts", get(get_facts))
        .route("/insights", get(get_insights))
        .route("/gc/run", post(run_gc))
        .route("/gc/stats", get(gc_stats))
        .route("/health", get(health))
        .with_state(state)
}

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SemanticSearchRequest {
    query: String,
    top_k: Option<usize>,
    min_score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct HybridSearchRequest {
    query: String,
    #[serde(default)]
    filters: HybridFilters,
    top_k: Option<usize>,
    min_score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct LineageParams {
    direction: Option<String>,
    max_depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FactParams {
    subject: Option<String>,
    predicate: Option<String>,
    source_packet: Option<String>,
    min_confidence: Option<f32>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct InsightParams {
    packet_id: Option<String>,
    kind: Option<String>,
    min_confidence: Option<f32>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GcRunRequest {
    #[serde(default)]
    background: bool,
}

fn parse_packet_id(raw: &str) -> Result<PacketId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid packet id '{raw}'")))
}

fn top_k(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_TOP_K).min(MAX_TOP_K)
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Run a synchronous store read on the blocking pool.
async fn blocking_read<T, F>(state: &AppState, read: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Retrieval) -> StrataResult<T> + Send + 'static,
{
    let retrieval = state.substrate.retrieval().clone();
    let value = tokio::task::spawn_blocking(move || read(&retrieval))
        .await
        .map_err(|e| StrataError::Internal(format!("read task failed: {e}")))??;
    Ok(value)
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /packet
async fn create_packet(
    State(state): State<AppState>,
    body: Result<Json<NewPacket>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let new = json_body(body)?;
    let outcome = state.substrate.ingest(new).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// GET /packet/{id}
async fn get_packet(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_packet_id(&id)?;
    Ok(Json(blocking_read(&state, move |r| r.read(id)).await?))
}

/// POST /semantic/search
async fn semantic_search(
    State(state): State<AppState>,
    body: Result<Json<SemanticSearchRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let results = state
        .substrate
        .retrieval()
        .semantic_search(&req.query, top_k(req.top_k), req.min_score)
        .await?;
    Ok(Json(results))
}

/// POST /hybrid/search
async fn hybrid_search(
    State(state): State<AppState>,
    body: Result<Json<HybridSearchRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let results = state
        .substrate
        .retrieval()
        .hybrid_search(&req.query, &req.filters, top_k(req.top_k), req.min_score)
        .await?;
    Ok(Json(results))
}

/// GET /thread/{id}
async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(blocking_read(&state, move |r| r.fetch_thread(&thread_id)).await?))
}

/// GET /lineage/{id}?direction=ancestors|descendants&max_depth=N
async fn get_lineage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LineageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_packet_id(&id)?;
    let direction = match params.direction.as_deref() {
        Some(raw) => raw.parse::<LineageDirection>().map_err(ApiError::bad_request)?,
        None => LineageDirection::default(),
    };
    let max_depth = params.max_depth;
    let graph = blocking_read(&state, move |r| r.fetch_lineage(id, direction, max_depth)).await?;
    Ok(Json(graph))
}

/// GET /facts
async fn get_facts(
    State(state): State<AppState>,
    Query(params): Query<FactParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = FactQuery {
        subject: params.subject,
        predicate: params.predicate,
        source_packet: params
            .source_packet
            .as_deref()
            .map(parse_packet_id)
            .transpose()?,
        min_confidence: params.min_confidence,
        limit: params.limit,
    };
    Ok(Json(blocking_read(&state, move |r| r.query_facts(&query)).await?))
}

/// GET /insights
async fn get_insights(
    State(state): State<AppState>,
    Query(params): Query<InsightParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = InsightQuery {
        packet_id: params.packet_id.as_deref().map(parse_packet_id).transpose()?,
        kind: params
            .kind
            .as_deref()
            .map(|k| k.parse::<InsightKind>().map_err(ApiError::bad_request))
            .transpose()?,
        min_confidence: params.min_confidence,
        limit: params.limit,
    };
    Ok(Json(blocking_read(&state, move |r| r.query_insights(&query)).await?))
}

/// POST /gc/run with an optional body `{"background": bool}`, optional.
async fn run_gc(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let req: GcRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        GcRunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };

    if req.background {
        let status = if state.substrate.schedule_gc() {
            "scheduled"
        } else {
            "already_running"
        };
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": status })),
        ));
    }
    let report = state.substrate.run_gc().await?;
    let body = serde_json::to_value(report).map_err(StrataError::from)?;
    Ok((StatusCode::OK, Json(body)))
}

/// GET /gc/stats
async fn gc_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let last = state.substrate.last_gc_report()?;
    Ok(Json(serde_json::json!({
        "last_run": last,
        "running": state.substrate.pipeline().gc_running(),
    })))
}

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.substrate.health();
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

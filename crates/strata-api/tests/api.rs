//! End-to-end route tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_api::server::build_router;
use strata_memory::MemorySubstrate;
use strata_types::config::SubstrateConfig;
use tower::ServiceExt;

fn app_with(configure: impl FnOnce(&mut SubstrateConfig)) -> Router {
    let mut config = SubstrateConfig::in_memory();
    config.ingestion.gc_trigger_probability = 0.0;
    configure(&mut config);
    let substrate = MemorySubstrate::open(&config).unwrap();
    build_router(Arc::new(substrate))
}

fn app() -> Router {
    app_with(|_| {})
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 64)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post(app: &Router, uri: &str, body: Value) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ingest_duplicate_and_thread() {
    let app = app();
    let packet = json!({"type": "event", "payload": {"action": "login"}, "thread_id": "t1"});

    let first = post(&app, "/packet", packet.clone()).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = body_json(first).await;
    assert_eq!(first["duplicate"], false);
    assert_eq!(first["sequence"], 1);

    let second = post(&app, "/packet", packet).await;
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second).await;
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["id"], first["id"]);

    let thread = body_json(get(&app, "/thread/t1").await).await;
    assert_eq!(thread.as_array().unwrap().len(), 1);
    assert_eq!(thread[0]["id"], first["id"]);
}

#[tokio::test]
async fn test_get_packet_statuses() {
    let app = app();
    let created = body_json(
        post(&app, "/packet", json!({"type": "event", "payload": {"n": 1}})).await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let found = get(&app, &format!("/packet/{id}")).await;
    assert_eq!(found.status(), StatusCode::OK);
    let found = body_json(found).await;
    assert_eq!(found["type"], "event");
    assert_eq!(found["payload"]["n"], 1);

    let missing = get(&app, "/packet/00000000-0000-4000-8000-000000000000").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(missing).await["kind"], "not_found");

    let invalid = get(&app, "/packet/not-a-uuid").await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reads_leave_runtime_free_while_store_is_busy() {
    let mut config = SubstrateConfig::in_memory();
    config.ingestion.gc_trigger_probability = 0.0;
    let substrate = Arc::new(MemorySubstrate::open(&config).unwrap());
    let app = build_router(substrate.clone());
    let created = body_json(
        post(&app, "/packet", json!({"type": "event", "payload": {"n": 1}})).await,
    )
    .await;
    let uri = format!("/packet/{}", created["id"].as_str().unwrap());

    let conn = substrate.pool().connection();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let _guard = conn.lock().unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
    });
    locked_rx.recv().unwrap();

    let read = tokio::spawn({
        let app = app.clone();
        async move { get(&app, &uri).await }
    });
    // Single-threaded runtime: this timer only fires on time if the read
    // handler is not parked on the store lock.
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() < Duration::from_millis(200));

    let response = read.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    holder.join().unwrap();
}

#[tokio::test]
async fn test_rejects_malformed_packets() {
    let app = app();
    let no_type = post(&app, "/packet", json!({"payload": {}})).await;
    assert_eq!(no_type.status(), StatusCode::BAD_REQUEST);

    let unknown_parent = post(
        &app,
        "/packet",
        json!({
            "type": "event",
            "payload": {},
            "parent_ids": ["00000000-0000-4000-8000-000000000000"]
        }),
    )
    .await;
    assert_eq!(unknown_parent.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_semantic_search() {
    let app = app();
    let login = body_json(
        post(&app, "/packet", json!({"type": "event", "payload": {"text": "user login"}})).await,
    )
    .await;
    post(
        &app,
        "/packet",
        json!({"type": "event", "payload": {"text": "disk usage report"}}),
    )
    .await;

    let resp = post(
        &app,
        "/semantic/search",
        json!({"query": "user login", "top_k": 5, "min_score": 0.7}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let hits = body_json(resp).await;
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["packet"]["id"], login["id"]);
    assert!(hits[0]["score"].as_f64().unwrap() > 0.99);

    let empty = post(&app, "/semantic/search", json!({"query": ""})).await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hybrid_search() {
    let app = app();
    let tagged = body_json(
        post(
            &app,
            "/packet",
            json!({"type": "event", "payload": {"text": "user login"}, "tags": ["auth"]}),
        )
        .await,
    )
    .await;
    post(&app, "/packet", json!({"type": "event", "payload": {"text": "user login"}})).await;

    let hits = body_json(
        post(
            &app,
            "/hybrid/search",
            json!({"query": "user login", "filters": {"tags": ["auth"]}}),
        )
        .await,
    )
    .await;
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["packet"]["id"], tagged["id"]);
}

#[tokio::test]
async fn test_lineage() {
    let app = app();
    let root = body_json(post(&app, "/packet", json!({"type": "event", "payload": {"step": 1}})).await).await;
    let child = body_json(
        post(
            &app,
            "/packet",
            json!({"type": "event", "payload": {"step": 2}, "parent_ids": [root["id"]]}),
        )
        .await,
    )
    .await;

    let child_id = child["id"].as_str().unwrap();
    let resp = get(&app, &format!("/lineage/{child_id}?direction=ancestors")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let graph = body_json(resp).await;
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 2);

    let root_id = root["id"].as_str().unwrap();
    let graph = body_json(get(&app, &format!("/lineage/{root_id}?direction=descendants&max_depth=1")).await).await;
    assert_eq!(graph["direction"], "descendants");
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 2);

    let bad = get(&app, &format!("/lineage/{child_id}?direction=sideways")).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_facts_and_insights() {
    let app = app();
    let created = body_json(
        post(
            &app,
            "/packet",
            json!({
                "type": "review",
                "payload": {"subject": "rfc-7", "predicate": "status", "object": "accepted", "decision": "approved"}
            }),
        )
        .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let facts = body_json(get(&app, "/facts?subject=rfc-7").await).await;
    let facts = facts.as_array().unwrap();
    assert!(!facts.is_empty());
    assert!(facts.iter().all(|f| f["source_packet"] == created["id"]));

    let insights = body_json(get(&app, &format!("/insights?packet_id={id}")).await).await;
    assert!(!insights.as_array().unwrap().is_empty());

    let bad_kind = get(&app, "/insights?kind=rumour").await;
    assert_eq!(bad_kind.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gc_run_and_stats() {
    let app = app();
    let stats = body_json(get(&app, "/gc/stats").await).await;
    assert!(stats["last_run"].is_null());

    post(
        &app,
        "/packet",
        json!({"type": "event", "payload": {"n": 1}, "ttl": "2000-01-01T00:00:00Z"}),
    )
    .await;

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/gc/run")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let report = body_json(resp).await;
    assert_eq!(report["ttl_evicted"], 1);

    let stats = body_json(get(&app, "/gc/stats").await).await;
    assert_eq!(stats["last_run"]["ttl_evicted"], 1);

    let scheduled = post(&app, "/gc/run", json!({"background": true})).await;
    assert_eq!(scheduled.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(scheduled).await["status"], "scheduled");
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let resp = get(&app, "/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let health = body_json(resp).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["database"], true);
    assert_eq!(health["packets"], 0);
}

#[tokio::test]
async fn test_rate_limit_exhaustion() {
    let app = app_with(|c| c.api_rate_limit = 2);
    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);
    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);
    let limited = get(&app, "/health").await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["retry-after"], "60");
}

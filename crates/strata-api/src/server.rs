//! HTTP server assembly: routes, middleware layers and the serve loop.

use crate::rate_limiter::{create_rate_limiter, gcra_rate_limit};
use crate::routes::{router, AppState};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use strata_memory::MemorySubstrate;
use strata_types::error::{StrataError, StrataResult};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// The full application: routes plus rate limiting, tracing and CORS.
///
/// Rate limiting is skipped when `api_rate_limit` is 0.
pub fn build_router(substrate: Arc<MemorySubstrate>) -> Router {
    let per_minute = NonZeroU32::new(substrate.config().api_rate_limit);
    let mut app = router(AppState { substrate });

    if let Some(per_minute) = per_minute {
        let limiter = create_rate_limiter(per_minute);
        app = app.layer(middleware::from_fn_with_state(limiter, gcra_rate_limit));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API on `listen` until `shutdown` flips to `true`.
pub async fn run_server(
    substrate: Arc<MemorySubstrate>,
    listen: &str,
    mut shutdown: watch::Receiver<bool>,
) -> StrataResult<()> {
    let app = build_router(substrate);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| StrataError::Config(format!("cannot bind {listen}: {e}")))?;
    let local = listener.local_addr()?;
    info!("Strata API listening on http://{local}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|v| *v).await;
        info!("API server received shutdown signal");
    });

    if let Err(e) = server.await {
        error!("API server error: {e}");
        return Err(StrataError::Io(e));
    }
    Ok(())
}

//! Cost-aware rate limiting using GCRA (Generic Cell Rate Algorithm).
//!
//! Each route has a token cost (health=1, packet read=2, search=10,
//! gc run=100). Every client IP gets `api_rate_limit` tokens per minute.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

const fn cost(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => NonZeroU32::MIN,
    }
}

pub fn operation_cost(method: &str, path: &str) -> NonZeroU32 {
    match (method, path) {
        (_, "/health") => cost(1),
        ("GET", "/gc/stats") => cost(1),
        ("GET", p) if p.starts_with("/packet/") => cost(2),
        ("GET", p) if p.starts_with("/thread/") => cost(2),
        ("GET", "/facts") | ("GET", "/insights") => cost(3),
        ("GET", p) if p.starts_with("/lineage/") => cost(5),
        ("POST", "/packet") => cost(5),
        ("POST", p) if p.ends_with("/search") => cost(10),
        ("POST", "/gc/run") => cost(100),
        _ => cost(5),
    }
}

pub type KeyedRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// `per_minute` tokens per minute per IP.
pub fn create_rate_limiter(per_minute: NonZeroU32) -> Arc<KeyedRateLimiter> {
    Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)))
}

/// GCRA rate limiting middleware.
///
/// Extracts the client IP from `ConnectInfo`, computes the cost for the
/// requested route, and checks the GCRA limiter. Returns 429 if the
/// client has exhausted its token budget. A cost above the whole budget
/// is always rejected.
pub async fn gcra_rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let path = request.uri().path().to_string();
    let cost = operation_cost(request.method().as_str(), &path);

    let allowed = matches!(limiter.check_key_n(&ip, cost), Ok(Ok(())));
    if !allowed {
        tracing::warn!(ip = %ip, cost = cost.get(), path = %path, "GCRA rate limit exceeded");
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", "60")
            .body(Body::from(
                serde_json::json!({"error": "Rate limit exceeded", "kind": "rate_limited"})
                    .to_string(),
            ))
            .unwrap_or_default();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs() {
        assert_eq!(operation_cost("GET", "/health").get(), 1);
        assert_eq!(operation_cost("GET", "/packet/abc").get(), 2);
        assert_eq!(operation_cost("GET", "/thread/t1").get(), 2);
        assert_eq!(operation_cost("GET", "/facts").get(), 3);
        assert_eq!(operation_cost("GET", "/lineage/abc").get(), 5);
        assert_eq!(operation_cost("POST", "/packet").get(), 5);
        assert_eq!(operation_cost("POST", "/semantic/search").get(), 10);
        assert_eq!(operation_cost("POST", "/hybrid/search").get(), 10);
        assert_eq!(operation_cost("POST", "/gc/run").get(), 100);
        assert_eq!(operation_cost("DELETE", "/unknown").get(), 5);
    }

    #[test]
    fn test_budget_exhaustion() {
        let limiter = create_rate_limiter(cost(3));
        let ip = IpAddr::from([10, 0, 0, 1]);
        assert!(matches!(limiter.check_key_n(&ip, cost(2)), Ok(Ok(()))));
        assert!(!matches!(limiter.check_key_n(&ip, cost(2)), Ok(Ok(()))));
        // Other clients keep their own budget.
        let other = IpAddr::from([10, 0, 0, 2]);
        assert!(matches!(limiter.check_key_n(&other, cost(3)), Ok(Ok(()))));
        // More than the whole budget never fits.
        assert!(limiter.check_key_n(&other, cost(4)).is_err());
    }
}

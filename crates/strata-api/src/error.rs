//! Mapping of substrate errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use strata_types::error::StrataError;

/// A substrate error on its way out as an HTTP response.
///
/// The body is always `{"error": "<message>", "kind": "<variant>"}`.
#[derive(Debug)]
pub struct ApiError(pub StrataError);

impl ApiError {
    /// A 400 for malformed request input.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(StrataError::Validation(msg.into()))
    }

    /// The status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self.0 {
            StrataError::Validation(_) => StatusCode::BAD_REQUEST,
            StrataError::NotFound(_) => StatusCode::NOT_FOUND,
            StrataError::LineageIntegrity(_) => StatusCode::CONFLICT,
            StrataError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StrataError::ProviderDegraded(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StrataError> for ApiError {
    fn from(e: StrataError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), "Request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (StrataError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (StrataError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StrataError::LineageIntegrity("x".into()), StatusCode::CONFLICT),
            (StrataError::StorageUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StrataError::ProviderDegraded("x".into()), StatusCode::BAD_GATEWAY),
            (StrataError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}

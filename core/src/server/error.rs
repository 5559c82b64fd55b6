//! HTTP error mapping
//!
//! Every externally visible failure carries a stable code and a human
//! message in a `{detail, code}` body; internals are logged, never exposed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::HarveyError;

/// Wrapper turning `HarveyError` into an HTTP response
pub struct ApiError(pub HarveyError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            HarveyError::BadRequest { .. }
            | HarveyError::SchemaMismatch { .. }
            | HarveyError::ArgumentInvalid { .. }
            | HarveyError::UnknownFeature { .. }
            | HarveyError::UnknownUsageLimit { .. }
            | HarveyError::UnitMismatch { .. }
            | HarveyError::InvalidRange { .. } => StatusCode::BAD_REQUEST,

            HarveyError::NotFound { .. } | HarveyError::SessionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }

            HarveyError::Timeout { .. }
            | HarveyError::ConnectionLost { .. }
            | HarveyError::HttpStatus { .. }
            | HarveyError::UpstreamUnavailable { .. }
            | HarveyError::SolverError { .. }
            | HarveyError::TransportLost { .. } => StatusCode::BAD_GATEWAY,

            HarveyError::ToolNotFound { .. }
            | HarveyError::ToolInternal { .. }
            | HarveyError::Cancelled
            | HarveyError::ConfigError { .. }
            | HarveyError::BindError { .. }
            | HarveyError::CorruptCacheEntry { .. }
            | HarveyError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.0.kind_code(), error = %self.0, "request failed");
        }
        let body = json!({
            "detail": self.0.to_string(),
            "code": self.0.kind_code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<HarveyError> for ApiError {
    fn from(err: HarveyError) -> Self {
        Self(err)
    }
}

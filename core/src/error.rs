//! Structured error types for Harvey
//!
//! One taxonomy for the whole core: input validation, grounding, transport,
//! solver, tool and lifecycle failures. Each variant carries a stable kind
//! code for clients; retryability drives the adapter retry policy.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for Harvey operations
#[derive(Error, Debug, Clone)]
pub enum HarveyError {
    // =========================================================================
    // Input validation
    // =========================================================================
    /// Malformed client request (empty question, conflicting context fields)
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Request body does not match the declared schema
    #[error("schema mismatch at {path}: {reason}")]
    SchemaMismatch { path: String, reason: String },

    // =========================================================================
    // Grounding
    // =========================================================================
    /// Feature name could not be matched against the pricing catalog
    #[error("unknown feature: {name}")]
    UnknownFeature { name: String },

    /// Usage limit name could not be matched against the pricing catalog
    #[error("unknown usage limit: {name}")]
    UnknownUsageLimit { name: String },

    /// Filter value type does not match the catalog's declared unit
    #[error("unit mismatch for '{name}': expected {expected}, got {provided}")]
    UnitMismatch {
        name: String,
        expected: String,
        provided: String,
    },

    /// Price bounds are negative or inverted
    #[error("invalid range: {message}")]
    InvalidRange { message: String },

    // =========================================================================
    // Transport
    // =========================================================================
    /// Operation exceeded its deadline
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Connection to an upstream service failed or dropped mid-request
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    /// Upstream returned an HTTP error status
    #[error("upstream returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Upstream exhausted the retry budget
    #[error("upstream unavailable: {service}")]
    UpstreamUnavailable { service: String },

    // =========================================================================
    // Solver / tools
    // =========================================================================
    /// The CSP solver rejected or failed the submitted job
    #[error("solver error: {message}")]
    SolverError { message: String },

    /// Tool name is not registered
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// Tool arguments failed schema validation
    #[error("invalid argument at {path}: {reason}")]
    ArgumentInvalid { path: String, reason: String },

    /// Tool implementation failed; `code` preserves a JSON-RPC error code
    /// when the failure crossed the MCP boundary
    #[error("tool '{name}' failed: {message}")]
    ToolInternal {
        name: String,
        message: String,
        code: Option<i64>,
    },

    /// The MCP transport died while requests were in flight
    #[error("MCP transport lost: {message}")]
    TransportLost { message: String },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// The surrounding session or request was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Session does not exist or was garbage-collected
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Blob or pricing artifact does not exist
    #[error("not found: {id}")]
    NotFound { id: String },

    // =========================================================================
    // Fatal (process-scoped)
    // =========================================================================
    /// Invalid or missing configuration; aborts startup with exit code 2
    #[error("configuration error: {message}")]
    ConfigError { message: String },

    /// Listener could not bind; aborts startup with exit code 3
    #[error("failed to bind {addr}: {message}")]
    BindError { addr: String, message: String },

    /// Cache entry violated an internal invariant
    #[error("corrupt cache entry for {key}: {message}")]
    CorruptCacheEntry { key: String, message: String },

    // =========================================================================
    // Internal
    // =========================================================================
    /// Catch-all for unexpected internal failures
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HarveyError {
    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ConnectionLost { .. } => true,
            Self::HttpStatus { status, .. } => matches!(status, 502 | 503 | 504),
            Self::TransportLost { .. } => true,

            Self::BadRequest { .. }
            | Self::SchemaMismatch { .. }
            | Self::UnknownFeature { .. }
            | Self::UnknownUsageLimit { .. }
            | Self::UnitMismatch { .. }
            | Self::InvalidRange { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::SolverError { .. }
            | Self::ToolNotFound { .. }
            | Self::ArgumentInvalid { .. }
            | Self::ToolInternal { .. }
            | Self::Cancelled
            | Self::SessionNotFound { .. }
            | Self::NotFound { .. }
            | Self::ConfigError { .. }
            | Self::BindError { .. }
            | Self::CorruptCacheEntry { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Suggested delay before the next attempt, for retryable errors
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_millis(500)),
            Self::ConnectionLost { .. } => Some(Duration::from_secs(1)),
            Self::HttpStatus { status, .. } if matches!(status, 502 | 503 | 504) => {
                Some(Duration::from_secs(2))
            }
            Self::TransportLost { .. } => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Stable machine-readable code for externally visible errors
    pub fn kind_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::UnknownFeature { .. } => "unknown_feature",
            Self::UnknownUsageLimit { .. } => "unknown_usage_limit",
            Self::UnitMismatch { .. } => "unit_mismatch",
            Self::InvalidRange { .. } => "invalid_range",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::HttpStatus { .. } => "http_status",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::SolverError { .. } => "solver_error",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::ArgumentInvalid { .. } => "argument_invalid",
            Self::ToolInternal { .. } => "tool_internal",
            Self::TransportLost { .. } => "transport_lost",
            Self::Cancelled => "cancelled",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::NotFound { .. } => "not_found",
            Self::ConfigError { .. } => "config_error",
            Self::BindError { .. } => "bind_error",
            Self::CorruptCacheEntry { .. } => "corrupt_cache_entry",
            Self::Internal { .. } => "internal",
        }
    }

    /// Errors that stay local to a single agent step: the loop records them
    /// as observations and keeps going instead of failing the session.
    pub fn is_step_local(&self) -> bool {
        matches!(
            self,
            Self::UnknownFeature { .. }
                | Self::UnknownUsageLimit { .. }
                | Self::UnitMismatch { .. }
                | Self::InvalidRange { .. }
                | Self::SolverError { .. }
                | Self::ToolNotFound { .. }
                | Self::ArgumentInvalid { .. }
                | Self::ToolInternal { .. }
                | Self::Timeout { .. }
                | Self::HttpStatus { .. }
                | Self::ConnectionLost { .. }
                | Self::UpstreamUnavailable { .. }
        )
    }

    /// Shorthand for internal errors from string-ish contexts
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HarveyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {err}"),
        }
    }
}

impl From<reqwest::Error> for HarveyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                duration: Duration::from_secs(0),
            };
        }
        if let Some(status) = err.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        Self::ConnectionLost {
            message: err.to_string(),
        }
    }
}

/// Result type alias using HarveyError
pub type Result<T> = std::result::Result<T, HarveyError>;

//! Per-subsystem error types and the shared HTTP-facing [`ApiError`].
//!
//! Each subsystem gets its own `thiserror` enum (mirrors
//! `nclav-store::StoreError`); `ApiError` is the single place that decides
//! what status code and message a client sees, mirroring
//! `nclav-api::error::ApiError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no reachable health endpoint for {service}")]
    NoEndpoint { service: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("discovery cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum OidcError {
    #[error("discovery document fetch failed: {0}")]
    Discovery(String),
    #[error("token endpoint rejected client credentials: {0}")]
    TokenRequest(String),
    #[error("token response missing or malformed field: {0}")]
    MalformedResponse(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Error)]
pub enum GitOpsError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("unsupported source kind: {0}")]
    UnsupportedKind(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("adapter {adapter} delivery failed: {reason}")]
    Delivery { adapter: String, reason: String },
    #[error("no rule matched event")]
    NoMatch,
}

/// Distinct verification outcomes (spec §4.8): `oversized`, `malformed`,
/// `tampered`, `expired`, plus the two decision-flow-only outcomes
/// (`Missing`, `FingerprintMismatch`) that never come from `verify_token`
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session cookie presented")]
    Missing,
    #[error("session token exceeds maximum size")]
    Oversized,
    #[error("session token malformed")]
    Malformed,
    #[error("session signature invalid")]
    Tampered,
    #[error("session token expired")]
    Expired,
    #[error("certificate fingerprint does not match issuing session")]
    FingerprintMismatch,
}

#[derive(Debug, Error)]
pub enum GitProviderError {
    #[error("git provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {0:?}")]
    Exceeded(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The single error type every axum handler converges on. Maps subsystem
/// errors to a status code and a JSON `{"error": "..."}` body; never lets a
/// `Display` impl leak a secret (those are redacted at the source via
/// [`crate::secret::Secret`]).
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNAUTHORIZED, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::TOO_MANY_REQUESTS, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_GATEWAY, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Wraps a successful payload in the `{"ok":true,"data":...}` envelope used
/// by the GitOps HTTP surface (spec §6).
pub fn ok_envelope(data: impl serde::Serialize) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": data }))
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::not_found(e.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::unauthorized(e.to_string())
    }
}

impl From<GitProviderError> for ApiError {
    fn from(e: GitProviderError) -> Self {
        match e {
            GitProviderError::RateLimited(_) => ApiError::too_many_requests(e.to_string()),
            // Preserve the upstream's own 401/404 (spec §6: "404
            // commit/not-configured", "401 auth") rather than collapsing every
            // 4xx to 400; anything else upstream throws is surfaced as 502.
            GitProviderError::Api { status: 401, message } => ApiError::unauthorized(message),
            GitProviderError::Api { status: 404, message } => ApiError::not_found(message),
            _ => ApiError::bad_gateway(e.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        ApiError::too_many_requests(e.to_string())
    }
}

impl From<GitOpsError> for ApiError {
    fn from(e: GitOpsError) -> Self {
        ApiError::internal(e.to_string())
    }
}

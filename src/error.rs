//! Error types for the gateway.
//!
//! Each layer has its own `thiserror` enum. Everything that reaches a caller is
//! funnelled through [`ApiError`], which carries the wire code, HTTP status and
//! retry hint.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::resolver::ProviderKind;

/// Result type alias for startup and server operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level error for startup and serving.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Request override that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideField {
    Provider,
    ApiKey,
    OutputMode,
    ShowSources,
    MemoryEnabled,
}

impl OverrideField {
    /// Header the override arrived in.
    pub fn header(&self) -> &'static str {
        match self {
            OverrideField::Provider => "x-ai-provider",
            OverrideField::ApiKey => "x-ai-key",
            OverrideField::OutputMode => "x-output-mode",
            OverrideField::ShowSources => "x-show-sources",
            OverrideField::MemoryEnabled => "x-memory-enabled",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OverrideField::Provider => "INVALID_PROVIDER",
            OverrideField::ApiKey => "INVALID_API_KEY",
            OverrideField::OutputMode => "INVALID_OUTPUT_MODE",
            OverrideField::ShowSources => "INVALID_SOURCES_FLAG",
            OverrideField::MemoryEnabled => "INVALID_MEMORY_FLAG",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            OverrideField::Provider => "x-ai-provider must be openai or perplexity.",
            OverrideField::ApiKey => "x-ai-key exceeds max allowed length.",
            OverrideField::OutputMode => "x-output-mode must be brief, standard, or deep.",
            OverrideField::ShowSources => "x-show-sources must be true or false.",
            OverrideField::MemoryEnabled => "x-memory-enabled must be true or false.",
        }
    }
}

/// A caller-supplied override was rejected; nothing from the request is applied.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{}", .field.message())]
pub struct InvalidOverride {
    pub field: OverrideField,
}

/// Errors from completion providers.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{} API key is not set.", .provider.display_name())]
    CredentialMissing { provider: ProviderKind },

    #[error("{} request failed ({status}). {body}", .provider.display_name())]
    Api {
        provider: ProviderKind,
        status: u16,
        body: String,
    },

    #[error("Upstream request failed: {0}")]
    Network(String),

    #[error("Upstream stream failed: {0}")]
    Stream(String),

    #[error("Upstream request timed out after {}ms.", .0.as_millis())]
    Timeout(Duration),

    #[error("Request was cancelled.")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BackendError::CredentialMissing { .. } => "credential_missing",
            BackendError::Api { .. } => "api",
            BackendError::Network(_) | BackendError::Stream(_) => "network",
            BackendError::Timeout(_) => "timeout",
            BackendError::Aborted => "aborted",
            BackendError::Config(_) => "config",
        }
    }
}

/// Errors from the SSRF-safe fetcher.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid URL.")]
    InvalidUrl,

    #[error("Only http:// or https:// URLs are allowed.")]
    UnsupportedScheme(String),

    #[error("URL hostname is not allowed.")]
    HostNotAllowed(String),

    #[error("URL points to a private network address.")]
    PrivateAddress(IpAddr),

    #[error("Could not resolve URL hostname.")]
    DnsResolutionFailed(String),

    #[error("URL exceeded redirect limit ({0}).")]
    TooManyRedirects(usize),

    #[error("URL redirect target is invalid.")]
    InvalidRedirect(String),

    #[error("Upstream response exceeded {0} bytes.")]
    ResponseTooLarge(usize),

    #[error("Upstream request failed: {0}")]
    Network(String),

    #[error("Upstream request timed out after {}ms.", .0.as_millis())]
    Timeout(Duration),

    #[error("Request was cancelled.")]
    Aborted,
}

impl FetchError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl | FetchError::InvalidRedirect(_) => "invalid_url",
            FetchError::UnsupportedScheme(_) => "scheme",
            FetchError::HostNotAllowed(_) | FetchError::PrivateAddress(_) => "not_allowed",
            FetchError::DnsResolutionFailed(_) => "dns",
            FetchError::TooManyRedirects(_) => "redirects",
            FetchError::ResponseTooLarge(_) => "too_large",
            FetchError::Network(_) => "network",
            FetchError::Timeout(_) => "timeout",
            FetchError::Aborted => "aborted",
        }
    }
}

/// `{code, message, retryable}` as it appears on the wire.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Normalised error returned to API callers.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retryable: bool,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable,
            retry_after: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message, false)
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            format!("Payload exceeds {} bytes.", limit),
            false,
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "Authentication required.",
            false,
        )
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Rate limit exceeded. Try again later.",
            true,
        );
        err.retry_after = Some(retry_after_secs);
        err
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Not Found", false)
    }

    /// Unknown failures never leak their internals.
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error.",
            false,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

/// Non-standard "client closed request" status.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// RFC 3339 timestamp used in every API envelope.
pub fn server_time() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    ok: bool,
    response: String,
    error: ErrorBody,
    server_time: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorEnvelope {
            ok: false,
            response: self.message.clone(),
            error: self.body(),
            server_time: server_time(),
        });
        let mut response = (self.status, body).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<InvalidOverride> for ApiError {
    fn from(err: InvalidOverride) -> Self {
        ApiError::bad_request(err.field.code(), err.to_string())
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        let message = err.to_string();
        match err {
            BackendError::CredentialMissing { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "CREDENTIAL_MISSING", message, false)
            }
            BackendError::Api { .. } => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_REQUEST_FAILED",
                message,
                true,
            ),
            BackendError::Network(_) | BackendError::Stream(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_NETWORK_ERROR",
                message,
                true,
            ),
            BackendError::Timeout(_) => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "UPSTREAM_TIMEOUT",
                message,
                true,
            ),
            BackendError::Aborted => {
                ApiError::new(client_closed_request(), "REQUEST_ABORTED", message, false)
            }
            BackendError::Config(_) => ApiError::internal(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let message = err.to_string();
        match err {
            FetchError::InvalidUrl => ApiError::bad_request("INVALID_URL", message),
            FetchError::UnsupportedScheme(_) => {
                ApiError::bad_request("UNSUPPORTED_URL_PROTOCOL", message)
            }
            FetchError::HostNotAllowed(_) | FetchError::PrivateAddress(_) => {
                ApiError::new(StatusCode::FORBIDDEN, "URL_NOT_ALLOWED", message, false)
            }
            FetchError::DnsResolutionFailed(_) => {
                ApiError::bad_request("DNS_RESOLUTION_FAILED", message)
            }
            FetchError::TooManyRedirects(_) => ApiError::bad_request("TOO_MANY_REDIRECTS", message),
            FetchError::InvalidRedirect(_) => ApiError::bad_request("INVALID_REDIRECT_URL", message),
            FetchError::ResponseTooLarge(_) => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "RESPONSE_TOO_LARGE",
                message,
                false,
            ),
            FetchError::Network(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_NETWORK_ERROR",
                message,
                true,
            ),
            FetchError::Timeout(_) => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "UPSTREAM_TIMEOUT",
                message,
                true,
            ),
            FetchError::Aborted => {
                ApiError::new(client_closed_request(), "REQUEST_ABORTED", message, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_maps_to_field_code() {
        let err: ApiError = InvalidOverride {
            field: OverrideField::OutputMode,
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_OUTPUT_MODE");
        assert!(!err.retryable());
    }

    #[test]
    fn test_timeout_and_abort_are_distinct() {
        let timeout: ApiError = BackendError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(timeout.code(), "UPSTREAM_TIMEOUT");
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(timeout.retryable());
        assert!(timeout.message().contains("250ms"));

        let aborted: ApiError = BackendError::Aborted.into();
        assert_eq!(aborted.code(), "REQUEST_ABORTED");
        assert_eq!(aborted.status().as_u16(), 499);
        assert!(!aborted.retryable());
    }

    #[test]
    fn test_safety_errors_never_retryable() {
        let cases: Vec<ApiError> = vec![
            FetchError::PrivateAddress("127.0.0.1".parse().unwrap()).into(),
            FetchError::TooManyRedirects(3).into(),
            FetchError::ResponseTooLarge(1024).into(),
        ];
        for err in cases {
            assert!(!err.retryable(), "{} should not be retryable", err.code());
        }
    }

    #[test]
    fn test_config_error_is_opaque() {
        let err: ApiError = BackendError::Config("secret detail".to_string()).into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!err.message().contains("secret"));
    }
}

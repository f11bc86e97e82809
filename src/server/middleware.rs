//! Request context, origin and shared-credential checks, rate limiting.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::Instrument;
use url::Url;

use super::AppState;
use crate::error::ApiError;
use crate::metrics;
use crate::rate_limit::RateDecision;

const AUTH_REALM: &str = "Basic realm=\"Phosphor Gateway API\"";

/// Network identity of the caller, used for rate limits and session keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// First `x-forwarded-for` hop when the proxy is trusted, else the peer ip.
    pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Self {
        if trust_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return Self(ip.to_string());
            }
        }

        match peer {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metrics label for a matched route.
fn route_label(path: Option<&str>) -> &'static str {
    match path {
        Some("/api/cli") => "cli",
        Some("/api/ask/stream") => "ask_stream",
        Some("/api/metrics") => "metrics",
        Some("/api/config") => "config",
        _ => "other",
    }
}

/// Attach caller identity and a request span, and count the request.
pub(super) async fn request_context(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let id = state.shutdown.next_request_id();
    let route = route_label(
        req.extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str),
    );

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = ClientIdentity::resolve(req.headers(), peer, state.config.server.trust_proxy);

    let span = tracing::info_span!(
        "api",
        id,
        route,
        method = %req.method(),
        client = %identity,
    );
    req.extensions_mut().insert(identity);

    let response = next.run(req).instrument(span.clone()).await;

    let status = response.status();
    metrics::record_api_request(route, status.as_u16(), started.elapsed());
    span.in_scope(|| {
        tracing::debug!(
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        );
    });

    response
}

/// Whether a request carrying `origin` may use the API: same-origin requests
/// always may, cross-origin ones only when listed (or `*` is listed).
pub(super) fn origin_allowed(
    origin: &HeaderValue,
    host: Option<&HeaderValue>,
    allowed: &[String],
) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let origin = origin.trim();
    if origin.is_empty() || is_same_origin(origin, host) {
        return true;
    }
    allowed.iter().any(|o| o == "*" || o == origin)
}

/// `Origin` names the same host and port the request was sent to.
fn is_same_origin(origin: &str, host: Option<&HeaderValue>) -> bool {
    let Some(host) = host
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
    else {
        return false;
    };
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    let Some(name) = url.host_str() else {
        return false;
    };

    let authority = match url.port() {
        Some(port) => format!("{}:{}", name, port),
        None => name.to_string(),
    };
    authority.eq_ignore_ascii_case(host)
}

/// Refuse cross-origin requests from origins that are not allowed, before
/// any handler runs.
pub(super) async fn origin_check(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(origin) = req.headers().get(header::ORIGIN) else {
        return next.run(req).await;
    };

    if origin_allowed(
        origin,
        req.headers().get(header::HOST),
        &state.config.server.cors_allowed_origins,
    ) {
        return next.run(req).await;
    }

    tracing::info!(origin = ?origin, "Rejected request from disallowed origin");
    ApiError::new(
        StatusCode::FORBIDDEN,
        "CORS_ORIGIN_DENIED",
        "CORS origin not allowed.",
        false,
    )
    .into_response()
}

/// Reject callers without the shared credential, when one is configured.
pub(super) async fn basic_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some((user, pass)) = state.config.server.basic_auth() else {
        return next.run(req).await;
    };

    if credentials_match(req.headers(), user, pass) {
        return next.run(req).await;
    }

    tracing::info!("Rejected request without valid credentials");
    let mut response = ApiError::unauthorized().into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
    response
}

fn credentials_match(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };

    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

/// Fixed-window admission per caller identity.
pub(super) async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let identity = req
        .extensions()
        .get::<ClientIdentity>()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match state.limiter.allow(&identity) {
        RateDecision::Admit => next.run(req).await,
        RateDecision::Reject { retry_after_secs } => {
            metrics::record_rate_limited();
            tracing::info!(retry_after_secs, "Rate limited");
            ApiError::rate_limited(retry_after_secs).into_response()
        }
    }
}

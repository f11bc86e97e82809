//! HTTP API: shared state, router and serve loop.

mod commands;
mod handlers;
mod middleware;

pub use commands::{strip_html, Command, CommandLine};
pub use middleware::ClientIdentity;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::backend::ProviderAdapter;
use crate::config::Config;
use crate::error::GatewayError;
use crate::fetch::SafeFetcher;
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionMetrics;
use crate::shutdown::ShutdownCoordinator;

/// Override headers a browser client may send cross-origin.
const OVERRIDE_HEADERS: [&str; 8] = [
    "x-ai-provider",
    "x-ai-key",
    "x-output-mode",
    "x-show-sources",
    "x-memory-enabled",
    "x-memory-notes",
    "x-memory-turns",
    "x-session-id",
];

/// Everything a request handler can reach.
pub struct AppState {
    pub config: Config,
    pub adapter: ProviderAdapter,
    pub fetcher: SafeFetcher,
    pub limiter: RateLimiter,
    pub sessions: SessionMetrics,
    pub shutdown: ShutdownCoordinator,
    started_at: Instant,
    hostname: String,
}

impl AppState {
    /// Build state with real providers and the system resolver.
    pub fn new(config: Config, shutdown: ShutdownCoordinator) -> Result<Self, GatewayError> {
        let adapter = ProviderAdapter::from_config(&config.providers)?;
        let fetcher = SafeFetcher::new(&config.fetch);
        Ok(Self::with_parts(config, adapter, fetcher, shutdown))
    }

    /// Build state around caller-supplied provider and fetcher.
    pub fn with_parts(
        config: Config,
        adapter: ProviderAdapter,
        fetcher: SafeFetcher,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let limiter = RateLimiter::new(&config.rate_limit);
        let sessions = SessionMetrics::new(&config.sessions);
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            config,
            adapter,
            fetcher,
            limiter,
            sessions,
            shutdown,
            started_at: Instant::now(),
            hostname,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .route(
            "/api/cli",
            post(handlers::cli).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/ask/stream",
            get(handlers::ask_stream).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/metrics",
            get(handlers::session_metrics).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/config",
            get(handlers::client_config).fallback(handlers::method_not_allowed),
        )
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::basic_auth,
        ))
        .layer(cors)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::origin_check,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_context,
        ))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        // Listed origins plus same-origin callers are echoed back.
        let origins = origins.to_vec();
        AllowOrigin::predicate(move |origin: &HeaderValue, parts: &Parts| {
            middleware::origin_allowed(origin, parts.headers.get(header::HOST), &origins)
        })
    };

    let mut allow_headers = vec![header::CONTENT_TYPE, header::AUTHORIZATION];
    allow_headers.extend(OVERRIDE_HEADERS.into_iter().map(HeaderName::from_static));

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(allow_headers)
        .max_age(std::time::Duration::from_secs(600))
}

/// Serve `router(state)` on `listener` until shutdown is signaled.
///
/// Open SSE streams see the same shutdown signal and close themselves, which
/// lets the graceful shutdown complete.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
    .await
}

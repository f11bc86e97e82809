//! Configuration loading from TOML files and environment variables.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GatewayError;
use crate::resolver::{OutputMode, ProviderKind};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
    pub sessions: SessionsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the API.
    pub listen_addr: String,

    /// Maximum request body size (bytes).
    pub body_limit_bytes: usize,

    /// Maximum command length (characters).
    pub command_max_length: usize,

    /// Maximum prompt length for ask/stream (characters).
    pub ask_max_length: usize,

    /// Take the caller identity from the first `x-forwarded-for` hop.
    pub trust_proxy: bool,

    /// Graceful shutdown timeout (seconds).
    pub shutdown_timeout_secs: u64,

    /// Origins allowed for cross-origin API calls ("*" for any).
    pub cors_allowed_origins: Vec<String>,

    /// Shared basic auth credential. Enforced when both are set.
    pub basic_auth_user: Option<String>,
    pub basic_auth_pass: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            body_limit_bytes: 16 * 1024,
            command_max_length: 1200,
            ask_max_length: 4000,
            trust_proxy: false,
            shutdown_timeout_secs: 30,
            cors_allowed_origins: Vec::new(),
            basic_auth_user: None,
            basic_auth_pass: None,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the `(user, pass)` pair when basic auth is enabled.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.basic_auth_user, &self.basic_auth_pass) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.as_str(), pass.as_str()))
            }
            _ => None,
        }
    }
}

/// Completion provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider used when a request does not pick one. `None` auto-selects by credential.
    pub default_provider: Option<ProviderKind>,

    /// Per-call upstream timeout (milliseconds).
    pub timeout_ms: u64,

    /// Base system prompt sent with every question.
    pub system_prompt: String,

    /// Default output verbosity.
    pub output_mode: OutputMode,

    /// Keep citation markers and "Sources:" trailers.
    pub show_sources: bool,

    /// Estimated USD cost per 1k prompt tokens.
    pub input_cost_per_1k: f64,

    /// Estimated USD cost per 1k response tokens.
    pub output_cost_per_1k: f64,

    /// Maximum idle connections per host in the shared client pool.
    pub pool_max_idle_per_host: usize,

    pub openai: OpenAIConfig,
    pub perplexity: PerplexityConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            timeout_ms: 20_000,
            system_prompt: "You are a terminal assistant. Keep replies concise and well-structured for CLI display. \
                Format as: \"Answer: ...\" then \"Details:\" with 1-3 short bullets. \
                Limit to about 80 words unless the user explicitly asks for a detailed response. \
                Do not repeat content and do not include citation markers like [1] unless requested."
                .to_string(),
            output_mode: OutputMode::Standard,
            show_sources: false,
            input_cost_per_1k: 0.00035,
            output_cost_per_1k: 0.0012,
            pool_max_idle_per_host: 32,
            openai: OpenAIConfig::default(),
            perplexity: PerplexityConfig::default(),
        }
    }
}

impl ProvidersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// OpenAI-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAIConfig {
    /// API key (can also be set via OPENAI_API_KEY env var).
    pub api_key: Option<String>,

    /// Model name.
    pub model: String,

    /// API base URL.
    pub api_base: String,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4.1-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
        }
    }
}

/// Perplexity-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerplexityConfig {
    /// API key (can also be set via PPLX_API_KEY env var).
    pub api_key: Option<String>,

    /// Model name.
    pub model: String,

    /// API base URL.
    pub api_base: String,
}

impl Default for PerplexityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "sonar".to_string(),
            api_base: "https://api.perplexity.ai".to_string(),
        }
    }
}

/// What to do with the request method when following a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMethod {
    /// Reuse method, headers and body on every hop.
    #[default]
    Preserve,
    /// 303 becomes GET; 301/302 turn anything but GET/HEAD into GET.
    Rewrite,
}

/// Outbound document fetch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Response body cap (bytes), clamped to [16KiB, 10MiB].
    pub max_bytes: usize,

    /// Redirect hop limit, clamped to [0, 8].
    pub max_redirects: usize,

    /// Skip hostname and address checks.
    pub allow_private: bool,

    /// Method handling on redirect.
    pub redirect_method: RedirectMethod,

    /// Whole-fetch timeout (milliseconds).
    pub timeout_ms: u64,

    /// User-Agent sent with fetches.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_redirects: 3,
            allow_private: false,
            redirect_method: RedirectMethod::Preserve,
            timeout_ms: 20_000,
            user_agent: concat!("phosphor-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Fixed-window rate limit configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Window length (milliseconds).
    pub window_ms: u64,

    /// Requests admitted per caller per window.
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 60_000,
            max_requests: 120,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-session metrics store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum tracked sessions, clamped to [2, 50000].
    pub max_sessions: usize,

    /// Idle time before a session is dropped (milliseconds), clamped to [1min, 24h].
    pub ttl_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2000,
            ttl_ms: 30 * 60_000,
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Metrics/Prometheus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint.
    pub enabled: bool,

    /// Listen address for metrics server.
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn").
    pub level: String,

    /// Output format: "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from file, then apply environment variable overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, GatewayError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.normalize();

        Ok(config)
    }

    /// Clamp bounded values into their allowed ranges.
    pub fn normalize(&mut self) {
        self.fetch.max_bytes = self.fetch.max_bytes.clamp(16 * 1024, 10 * 1024 * 1024);
        self.fetch.max_redirects = self.fetch.max_redirects.min(8);
        self.sessions.max_sessions = self.sessions.max_sessions.clamp(2, 50_000);
        self.sessions.ttl_ms = self.sessions.ttl_ms.clamp(60_000, 24 * 60 * 60 * 1000);
        self.rate_limit.window_ms = self.rate_limit.window_ms.max(1);
        self.providers.timeout_ms = self.providers.timeout_ms.max(1);
        self.fetch.timeout_ms = self.fetch.timeout_ms.max(1);

        self.server.cors_allowed_origins = self
            .server
            .cors_allowed_origins
            .iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        for key in [
            &mut self.providers.openai.api_key,
            &mut self.providers.perplexity.api_key,
        ] {
            if key.as_deref().is_some_and(|k| k.trim().is_empty()) {
                *key = None;
            }
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Some(v) = env_string("GATEWAY_LISTEN") {
            self.server.listen_addr = v;
        }
        if let Some(n) = env_parse("BODY_LIMIT_BYTES") {
            self.server.body_limit_bytes = n;
        }
        if let Some(n) = env_parse("COMMAND_MAX_LENGTH") {
            self.server.command_max_length = n;
        }
        if let Some(n) = env_parse("ASK_MAX_LENGTH") {
            self.server.ask_max_length = n;
        }
        if let Some(v) = env_flag("TRUST_PROXY") {
            self.server.trust_proxy = v;
        }
        if let Some(v) = env_string("CORS_ALLOWED_ORIGINS") {
            self.server.cors_allowed_origins = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(v) = env_string("BASIC_AUTH_USER") {
            self.server.basic_auth_user = Some(v);
        }
        if let Some(v) = env_string("BASIC_AUTH_PASS") {
            self.server.basic_auth_pass = Some(v);
        }

        // Provider overrides
        if let Some(v) = env_string("AI_PROVIDER") {
            match ProviderKind::from_str(&v) {
                Ok(kind) => self.providers.default_provider = Some(kind),
                Err(_) => tracing::warn!(value = %v, "Ignoring unknown AI_PROVIDER"),
            }
        }
        if let Some(n) = env_parse("UPSTREAM_TIMEOUT_MS") {
            self.providers.timeout_ms = n;
            self.fetch.timeout_ms = n;
        }
        if let Some(v) = env_string("ASK_SYSTEM_PROMPT") {
            self.providers.system_prompt = v;
        }
        if let Some(v) = env_string("ASK_OUTPUT_MODE") {
            if let Ok(mode) = OutputMode::from_str(&v) {
                self.providers.output_mode = mode;
            }
        }
        if let Some(v) = env_flag("ASK_SHOW_SOURCES") {
            self.providers.show_sources = v;
        }
        if let Some(n) = env_parse("EST_INPUT_COST_PER_1K") {
            self.providers.input_cost_per_1k = n;
        }
        if let Some(n) = env_parse("EST_OUTPUT_COST_PER_1K") {
            self.providers.output_cost_per_1k = n;
        }

        // OpenAI overrides (standard env vars)
        if let Some(v) = env_string("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(v);
        }
        if let Some(v) = env_string("OPENAI_MODEL") {
            self.providers.openai.model = v;
        }
        if let Some(v) = env_string("OPENAI_API_BASE") {
            self.providers.openai.api_base = v;
        }

        // Perplexity overrides
        if let Some(v) = env_string("PPLX_API_KEY") {
            self.providers.perplexity.api_key = Some(v);
        }
        if let Some(v) = env_string("PERPLEXITY_MODEL") {
            self.providers.perplexity.model = v;
        }
        if let Some(v) = env_string("PERPLEXITY_API_BASE") {
            self.providers.perplexity.api_base = v;
        }

        // Fetch overrides
        if let Some(n) = env_parse("MAX_FETCHED_BYTES") {
            self.fetch.max_bytes = n;
        }
        if let Some(n) = env_parse("MAX_FETCH_REDIRECTS") {
            self.fetch.max_redirects = n;
        }
        if let Some(v) = env_flag("ALLOW_PRIVATE_URLS") {
            self.fetch.allow_private = v;
        }

        // Rate limit overrides
        if let Some(v) = env_flag("ENABLE_RATE_LIMIT") {
            self.rate_limit.enabled = v;
        }
        if let Some(n) = env_parse("RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = n;
        }
        if let Some(n) = env_parse("RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = n;
        }

        // Session metrics overrides
        if let Some(n) = env_parse("METRICS_MAX_SESSIONS") {
            self.sessions.max_sessions = n;
        }
        if let Some(n) = env_parse("METRICS_TTL_MS") {
            self.sessions.ttl_ms = n;
        }

        // Prometheus overrides
        if let Some(v) = env_flag("GATEWAY_METRICS_ENABLED") {
            self.metrics.enabled = v;
        }
        if let Some(v) = env_string("GATEWAY_METRICS_ADDR") {
            self.metrics.listen_addr = v;
        }

        // Logging overrides
        if let Some(v) = env_string("GATEWAY_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_string("GATEWAY_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

/// Interpret a boolean-like string ("1", "true", "yes", "on" and their negatives).
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).and_then(|v| parse_flag(&v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.body_limit_bytes, 16 * 1024);
        assert_eq!(config.fetch.max_redirects, 3);
        assert!(config.providers.default_provider.is_none());
        assert!(!config.rate_limit.enabled);
        assert!(config.server.basic_auth().is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0:8080"
            trust_proxy = true

            [providers]
            default_provider = "perplexity"
            output_mode = "brief"

            [fetch]
            redirect_method = "rewrite"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert!(config.server.trust_proxy);
        assert_eq!(
            config.providers.default_provider,
            Some(ProviderKind::Perplexity)
        );
        assert_eq!(config.providers.output_mode, OutputMode::Brief);
        assert_eq!(config.fetch.redirect_method, RedirectMethod::Rewrite);
    }

    #[test]
    fn test_normalize_clamps_bounds() {
        let mut config = Config::default();
        config.fetch.max_bytes = 10;
        config.fetch.max_redirects = 50;
        config.sessions.max_sessions = 0;
        config.sessions.ttl_ms = 5;
        config.providers.openai.api_key = Some("  ".to_string());
        config.normalize();

        assert_eq!(config.fetch.max_bytes, 16 * 1024);
        assert_eq!(config.fetch.max_redirects, 8);
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.sessions.ttl_ms, 60_000);
        assert!(config.providers.openai.api_key.is_none());

        config.fetch.max_bytes = usize::MAX;
        config.normalize();
        assert_eq!(config.fetch.max_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_basic_auth_requires_both_parts() {
        let mut server = ServerConfig::default();
        server.basic_auth_user = Some("ops".to_string());
        assert!(server.basic_auth().is_none());
        server.basic_auth_pass = Some("hunter2".to_string());
        assert_eq!(server.basic_auth(), Some(("ops", "hunter2")));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_sample_config_file_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/gateway.toml");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.providers.perplexity.model, "sonar");
        assert_eq!(config.fetch.redirect_method, RedirectMethod::Preserve);
        assert_eq!(config.sessions.max_sessions, 2000);
    }
}

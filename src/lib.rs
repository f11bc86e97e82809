//! Command-oriented HTTP/SSE gateway in front of completion providers.
//!
//! Prompts arrive as terminal commands or streaming ask requests, are
//! answered by OpenAI or Perplexity, and stream back as SSE token events.
//! Remote documents are fetched through an SSRF guard before summarizing.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod rate_limit;
pub mod resolver;
pub mod server;
pub mod sessions;
pub mod shutdown;
pub mod streaming;

pub use config::Config;
pub use error::{ApiError, GatewayError, Result};

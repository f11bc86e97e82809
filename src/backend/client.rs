//! Shared HTTP plumbing for completion backends.
//!
//! One pooled reqwest client serves every provider call. Request deadlines
//! come from the caller's [`CallScope`], not from the client.

use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;

use super::normalize::extract_token;
use super::traits::ChunkStream;
use crate::cancel::CallScope;
use crate::config::ProvidersConfig;
use crate::error::BackendError;
use crate::resolver::ProviderKind;
use crate::streaming::parse_event_stream;

/// Characters of an upstream error body kept in the error message.
const ERROR_BODY_PREVIEW: usize = 180;

/// Build the pooled HTTP client shared by all providers.
pub fn build_http_client(config: &ProvidersConfig) -> Result<Client, BackendError> {
    Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| BackendError::Config(e.to_string()))
}

/// POST a JSON body with bearer auth and return the response when it is 2xx.
pub async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    provider: ProviderKind,
    url: &str,
    api_key: &str,
    body: &T,
    scope: &CallScope,
) -> Result<Response, BackendError> {
    let request = client
        .post(url)
        .bearer_auth(api_key)
        .header("Content-Type", "application/json")
        .json(body);

    let response = scope
        .run(request.send())
        .await?
        .map_err(|e| BackendError::Network(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = scope
        .run(response.text())
        .await?
        .unwrap_or_default();
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();

    tracing::warn!(
        provider = %provider,
        status = status.as_u16(),
        "Upstream returned non-success status"
    );

    Err(BackendError::Api {
        provider,
        status: status.as_u16(),
        body: preview,
    })
}

/// Read a JSON response body inside the call scope.
pub async fn read_json(response: Response, scope: &CallScope) -> Result<Value, BackendError> {
    scope
        .run(response.json::<Value>())
        .await?
        .map_err(|e| BackendError::Network(format!("Invalid upstream JSON: {}", e)))
}

/// Turn an SSE response body into a stream of raw text chunks.
///
/// Data lines that are not JSON or carry no text are skipped.
pub fn upstream_chunks(response: Response) -> ChunkStream {
    let events = parse_event_stream(response.bytes_stream());

    let chunks = events.filter_map(|event| async move {
        match event {
            Ok(event) if event.is_done() => None,
            Ok(event) => {
                let text = extract_token(&event.data);
                (!text.is_empty()).then_some(Ok(text))
            }
            Err(e) => Some(Err(BackendError::Stream(e.to_string()))),
        }
    });

    Box::pin(chunks)
}

//! Route handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::commands::{self, CommandLine};
use super::middleware::ClientIdentity;
use super::AppState;
use crate::error::{server_time, ApiError, BackendError};
use crate::metrics;
use crate::resolver::{EffectiveConfig, RequestOverrides};
use crate::sessions::{estimate_tokens, EventKind, MetricsEvent, SessionKey};
use crate::shutdown::StreamGuard;
use crate::streaming::{SseWriter, SSE_CONTENT_TYPE};

const PLUGINS: [&str; 4] = ["weather", "docs", "code", "summarize-url"];

#[derive(Debug, Deserialize)]
struct CliRequest {
    #[serde(default)]
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AskQuery {
    #[serde(default)]
    prompt: String,
}

/// `{ok: true, ...payload, serverTime}` with caching disabled.
fn success(payload: Value) -> Response {
    let mut body = match payload {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    body.insert("ok".to_string(), Value::Bool(true));
    body.insert("serverTime".to_string(), Value::String(server_time()));

    let mut response = Json(Value::Object(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn resolve(state: &AppState, headers: &HeaderMap) -> Result<EffectiveConfig, ApiError> {
    let overrides = RequestOverrides::from_headers(headers);
    Ok(EffectiveConfig::resolve(&state.config.providers, &overrides)?)
}

#[allow(clippy::too_many_arguments)]
fn answer_event(
    state: &AppState,
    kind: EventKind,
    stream: bool,
    success: bool,
    config: &EffectiveConfig,
    started: Instant,
    prompt: &str,
    response: &str,
) -> MetricsEvent {
    MetricsEvent {
        kind,
        stream,
        success,
        provider: config.selected_provider(),
        latency: started.elapsed(),
        prompt_tokens: estimate_tokens(prompt),
        response_tokens: estimate_tokens(response),
        input_rate: state.config.providers.input_cost_per_1k,
        output_rate: state.config.providers.output_cost_per_1k,
    }
}

/// `POST /api/cli`
pub(super) async fn cli(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let limit = state.config.server.body_limit_bytes;
    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > limit {
            return Err(ApiError::payload_too_large(limit));
        }
    }
    // Chunked bodies are cut off at the same limit.
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|_| ApiError::payload_too_large(limit))?;

    let request: CliRequest = if bytes.is_empty() {
        CliRequest { command: None }
    } else {
        serde_json::from_slice(&bytes).map_err(|_| {
            ApiError::bad_request("INVALID_JSON", "Invalid JSON request payload.")
        })?
    };
    let input = request.command.unwrap_or_default();

    let config = resolve(&state, &headers)?;
    let key = SessionKey::new(identity.as_str(), config.session_id());
    let started = Instant::now();

    // Dropping the handler (client went away) cancels in-flight upstream calls.
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let line = CommandLine::parse(&input, state.config.server.command_max_length);
    let (kind, prompt) = match &line {
        Ok(line) if line.command.is_answer() => (EventKind::Answer, line.prompt_text().to_string()),
        Ok(line) => (EventKind::Command, line.prompt_text().to_string()),
        Err(_) => (EventKind::Command, input.clone()),
    };

    let result = match line {
        Ok(line) => {
            tracing::info!(command = ?line.command, "Running command");
            commands::run(&state, &line, &config, &cancel).await
        }
        Err(e) => Err(e),
    };

    let response_text = result.as_deref().unwrap_or_default();
    let event = answer_event(
        &state,
        kind,
        false,
        result.is_ok(),
        &config,
        started,
        &prompt,
        response_text,
    );
    state.sessions.record(&key, &event);

    match result {
        Ok(response) => Ok(success(json!({ "response": response }))),
        Err(e) => {
            tracing::info!(code = e.code(), error = %e.message(), "Command failed");
            Err(e)
        }
    }
}

/// `GET /api/ask/stream?prompt=`
pub(super) async fn ask_stream(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    headers: HeaderMap,
    Query(query): Query<AskQuery>,
) -> Result<Response, ApiError> {
    let config = resolve(&state, &headers)?;
    let prompt = query.prompt.trim().to_string();
    commands::validate_prompt(&prompt, state.config.server.ask_max_length)?;

    let key = SessionKey::new(identity.as_str(), config.session_id());
    let (writer, body) = SseWriter::channel();
    let cancel = state.shutdown.child_token();
    let guard = state.shutdown.register_stream();

    tracing::info!(
        provider = config.selected_provider().map(|p| p.as_str()).unwrap_or("none"),
        prompt_len = prompt.len(),
        "Starting answer stream"
    );

    tokio::spawn(
        stream_answer(state.clone(), prompt, config, key, writer, cancel, guard)
            .in_current_span(),
    );

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(SSE_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

/// Pump tokens to the client until the answer ends, the client leaves or the
/// server shuts down, then close with `done` (after `error` on failure).
async fn stream_answer(
    state: Arc<AppState>,
    prompt: String,
    config: EffectiveConfig,
    key: SessionKey,
    mut writer: SseWriter,
    cancel: CancellationToken,
    _guard: StreamGuard,
) {
    let started = Instant::now();
    let mut tokens = state
        .adapter
        .answer_stream(prompt.clone(), config.clone(), cancel.clone());
    let mut streamed = String::new();

    let outcome: Result<(), ApiError> = loop {
        tokio::select! {
            biased;

            _ = writer.closed() => {
                tracing::debug!("Client disconnected");
                break Err(BackendError::Aborted.into());
            }

            _ = state.shutdown.wait_for_shutdown() => {
                tracing::info!("Shutdown signaled, closing stream");
                break Err(shutting_down());
            }

            next = tokens.next() => match next {
                Some(Ok(token)) => {
                    if writer.send_token(&token).await.is_err() {
                        tracing::debug!("Client disconnected");
                        break Err(BackendError::Aborted.into());
                    }
                    streamed.push_str(&token);
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
        }
    };

    // Abandon any upstream call still in flight.
    cancel.cancel();
    drop(tokens);

    let event = answer_event(
        &state,
        EventKind::Answer,
        true,
        outcome.is_ok(),
        &config,
        started,
        &prompt,
        &streamed,
    );
    state.sessions.record(&key, &event);
    metrics::record_stream_duration(started.elapsed());

    let delivered = match &outcome {
        Ok(()) => writer.send_done(true).await,
        Err(e) => {
            tracing::info!(code = e.code(), error = %e.message(), "Answer stream failed");
            match writer.send_error(&e.body()).await {
                Ok(()) => writer.send_done(false).await,
                Err(gone) => Err(gone),
            }
        }
    };

    tracing::info!(
        tokens = writer.tokens_sent(),
        bytes = writer.bytes_written(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = outcome.is_ok(),
        client_present = delivered.is_ok(),
        "Answer stream finished"
    );
}

fn shutting_down() -> ApiError {
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "SERVER_SHUTTING_DOWN",
        "Server is shutting down. Retry shortly.",
        true,
    )
}

/// `GET /api/metrics`
pub(super) async fn session_metrics(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let config = resolve(&state, &headers)?;
    let key = SessionKey::new(identity.as_str(), config.session_id());
    let record = state.sessions.get(&key);
    let error_rate = record.error_rate();

    let mut session = serde_json::to_value(&record).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize session record");
        ApiError::internal()
    })?;
    if let Value::Object(map) = &mut session {
        map.insert(
            "sessionId".to_string(),
            Value::String(config.session_id().unwrap_or("anonymous").to_string()),
        );
        map.insert("errorRate".to_string(), json!(error_rate));
    }

    Ok(success(json!({ "metrics": { "session": session } })))
}

/// `GET /api/config`
pub(super) async fn client_config(State(state): State<Arc<AppState>>) -> Response {
    let server = &state.config.server;
    let providers = &state.config.providers;

    success(json!({
        "config": {
            "maxCommandLength": server.command_max_length,
            "askMaxLength": server.ask_max_length,
            "streamAsk": true,
            "askOutputMode": providers.output_mode.as_str(),
            "askShowSources": providers.show_sources,
            "plugins": PLUGINS,
        }
    }))
}

pub(super) async fn not_found() -> ApiError {
    ApiError::not_found()
}

pub(super) async fn method_not_allowed() -> ApiError {
    ApiError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        "METHOD_NOT_ALLOWED",
        "Method Not Allowed",
        false,
    )
}

//! Shared helpers: a gateway on an ephemeral port and a fake OpenAI upstream.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use phosphor_gateway::config::Config;
use phosphor_gateway::metrics::init_metrics;
use phosphor_gateway::server::{serve, AppState};
use phosphor_gateway::shutdown::ShutdownCoordinator;
use phosphor_gateway::streaming::{SseEvent, SseParser};

/// A gateway serving on `127.0.0.1:<ephemeral>`.
pub struct Gateway {
    pub base: String,
    pub shutdown: ShutdownCoordinator,
    pub client: reqwest::Client,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// POST `/api/cli` with a command and extra headers.
    pub async fn cli(&self, command: &str, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url("/api/cli"))
            .json(&json!({ "command": command }));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.unwrap()
    }

    /// GET `/api/ask/stream` and collect every SSE event until the body ends.
    pub async fn ask_stream(&self, prompt: &str, headers: &[(&str, &str)]) -> Vec<SseEvent> {
        let mut request = self
            .client
            .get(self.url("/api/ask/stream"))
            .query(&[("prompt", prompt)]);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = tokio::time::timeout(Duration::from_secs(10), response.bytes())
            .await
            .expect("stream did not finish")
            .unwrap();
        parse_events(&body)
    }
}

pub fn parse_events(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    parser.feed(body);
    let mut events = Vec::new();
    while let Some(event) = parser.next_event() {
        events.push(event);
    }
    events.extend(parser.finish());
    events
}

/// Text of every `token` event, in order.
pub fn token_texts(events: &[SseEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event == "token")
        .map(|e| e.data["text"].as_str().unwrap().to_string())
        .collect()
}

/// Config with nothing taken from the environment.
pub fn test_config() -> Config {
    Config::default()
}

pub async fn spawn_gateway(config: Config) -> Gateway {
    init_metrics();

    let shutdown = ShutdownCoordinator::new();
    let state = Arc::new(AppState::new(config, shutdown.clone()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(serve(listener, state));

    Gateway {
        base: format!("http://{}", addr),
        shutdown,
        client: reqwest::Client::new(),
    }
}

/// How the fake upstream answers streaming chat completions.
#[derive(Clone)]
pub enum ChatBehavior {
    /// Stream these `delta.content` values, then `[DONE]`.
    Chunks(Vec<&'static str>),
    /// Reply with this status and a short error body.
    Fail(u16),
    /// Never answer.
    Stall,
}

struct UpstreamState {
    chat: ChatBehavior,
    complete_text: &'static str,
    chat_calls: AtomicUsize,
    responses_calls: AtomicUsize,
}

/// Fake OpenAI API.
pub struct FakeUpstream {
    /// Value for `providers.openai.api_base`.
    pub api_base: String,
    state: Arc<UpstreamState>,
}

impl FakeUpstream {
    pub fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    pub fn responses_calls(&self) -> usize {
        self.state.responses_calls.load(Ordering::SeqCst)
    }
}

pub async fn spawn_upstream(chat: ChatBehavior, complete_text: &'static str) -> FakeUpstream {
    let state = Arc::new(UpstreamState {
        chat,
        complete_text,
        chat_calls: AtomicUsize::new(0),
        responses_calls: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeUpstream {
        api_base: format!("http://{}/v1", addr),
        state,
    }
}

async fn chat_completions(State(state): State<Arc<UpstreamState>>) -> Response {
    state.chat_calls.fetch_add(1, Ordering::SeqCst);

    match &state.chat {
        ChatBehavior::Chunks(chunks) => {
            let mut body = String::new();
            for chunk in chunks {
                let payload = json!({ "choices": [{ "delta": { "content": chunk } }] });
                body.push_str(&format!("data: {}\n\n", payload));
            }
            body.push_str("data: [DONE]\n\n");
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
        ChatBehavior::Fail(status) => (
            StatusCode::from_u16(*status).unwrap(),
            "upstream exploded",
        )
            .into_response(),
        ChatBehavior::Stall => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StatusCode::OK.into_response()
        }
    }
}

async fn responses(State(state): State<Arc<UpstreamState>>) -> Json<Value> {
    state.responses_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "output_text": state.complete_text }))
}

//! End-to-end tests for the command API, access control and session metrics.
//!
//! Each test starts a gateway on an ephemeral port with no provider keys, so
//! nothing here reaches a real upstream.

mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use common::{spawn_gateway, test_config, token_texts};

async fn json_body(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_status_reports_uptime_without_provider() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway.cli("status", &[]).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["cache-control"], "no-store");

    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
    let text = body["response"].as_str().unwrap();
    assert!(text.starts_with("STATUS ONLINE | version="), "{}", text);
    assert!(text.contains("uptime=0h 0m "), "{}", text);
    assert!(body["serverTime"].as_str().is_some());
}

#[tokio::test]
async fn test_ask_without_provider_echoes() {
    let gateway = spawn_gateway(test_config()).await;

    let body = json_body(gateway.cli("ask what is rust", &[]).await).await;
    assert_eq!(body["ok"], true);
    assert_eq!(
        body["response"],
        "No live AI provider configured. Echo trace: \"what is rust\". \
         Set OPENAI_API_KEY or PPLX_API_KEY, optionally AI_PROVIDER=openai|perplexity."
    );
}

#[tokio::test]
async fn test_ask_requires_prompt() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway.cli("ask", &[]).await;
    assert_eq!(response.status(), 400);
    let body = json_body(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "ASK_PROMPT_REQUIRED");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn test_unknown_command_echoes_help() {
    let gateway = spawn_gateway(test_config()).await;

    let body = json_body(gateway.cli("help", &[]).await).await;
    let text = body["response"].as_str().unwrap();
    assert!(text.starts_with("Command received by API: \"help\"."));
    assert!(text.contains("summarize-url <url>"));
}

#[tokio::test]
async fn test_docs_command() {
    let gateway = spawn_gateway(test_config()).await;

    let body = json_body(gateway.cli("docs react", &[]).await).await;
    assert_eq!(
        body["response"],
        "Answer: Documentation for react\nDetails:\n- React Docs\n- https://react.dev/learn"
    );
}

#[tokio::test]
async fn test_invalid_override_rejects_request() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway.cli("status", &[("x-output-mode", "loud")]).await;
    assert_eq!(response.status(), 400);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "INVALID_OUTPUT_MODE");

    let response = gateway.cli("status", &[("x-ai-provider", "gemini")]).await;
    assert_eq!(json_body(response).await["error"]["code"], "INVALID_PROVIDER");
}

#[tokio::test]
async fn test_invalid_json() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway
        .client
        .post(gateway.url("/api/cli"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["error"]["code"], "INVALID_JSON");
}

#[tokio::test]
async fn test_empty_and_oversized_commands() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway.cli("   ", &[]).await;
    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["error"]["code"], "EMPTY_COMMAND");

    let response = gateway.cli(&"x".repeat(1201), &[]).await;
    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["error"]["code"], "COMMAND_TOO_LONG");
}

#[tokio::test]
async fn test_payload_too_large() {
    let gateway = spawn_gateway(test_config()).await;

    let command = "a".repeat(20 * 1024);
    let response = gateway.cli(&command, &[]).await;
    assert_eq!(response.status(), 413);
    assert_eq!(json_body(response).await["error"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_summarize_url_refuses_private_address() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway.cli("summarize-url http://127.0.0.1:9/admin", &[]).await;
    assert_eq!(response.status(), 403);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "URL_NOT_ALLOWED");
    assert_eq!(body["error"]["retryable"], false);

    let response = gateway.cli("summarize-url http://localhost/", &[]).await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_summarize_url_usage() {
    let gateway = spawn_gateway(test_config()).await;

    let body = json_body(gateway.cli("summarize-url ftp://example.com", &[]).await).await;
    assert_eq!(body["response"], "Usage: summarize-url <https://...>");
}

#[tokio::test]
async fn test_session_metrics_follow_session_id() {
    let gateway = spawn_gateway(test_config()).await;
    let session = [("x-session-id", "term-42")];

    gateway.cli("status", &session).await;
    gateway.cli("ask hello", &session).await;
    gateway.cli("ask", &session).await;

    let response = gateway
        .client
        .get(gateway.url("/api/metrics"))
        .header("x-session-id", "term-42")
        .send()
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["ok"], true);

    let record = &body["metrics"]["session"];
    assert_eq!(record["sessionId"], "term-42");
    assert_eq!(record["sessionKey"], "127.0.0.1|sid:term-42");
    assert_eq!(record["requests"], 3);
    assert_eq!(record["answerRequests"], 2);
    assert_eq!(record["answerErrors"], 1);
    assert_eq!(record["errorRate"], 50.0);
    assert_eq!(record["provider"]["none"]["success"], 1);

    let anonymous = json_body(
        gateway
            .client
            .get(gateway.url("/api/metrics"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(anonymous["metrics"]["session"]["sessionId"], "anonymous");
    assert_eq!(anonymous["metrics"]["session"]["requests"], 0);
    assert_eq!(anonymous["metrics"]["session"]["errorRate"], 0.0);
}

#[tokio::test]
async fn test_client_config() {
    let gateway = spawn_gateway(test_config()).await;

    let body = json_body(
        gateway
            .client
            .get(gateway.url("/api/config"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    let config = &body["config"];
    assert_eq!(config["maxCommandLength"], 1200);
    assert_eq!(config["askMaxLength"], 4000);
    assert_eq!(config["streamAsk"], true);
    assert_eq!(config["askOutputMode"], "standard");
    assert_eq!(config["plugins"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_not_found_and_method_not_allowed() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway
        .client
        .get(gateway.url("/api/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(json_body(response).await["error"]["code"], "NOT_FOUND");

    let response = gateway
        .client
        .get(gateway.url("/api/cli"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "METHOD_NOT_ALLOWED"
    );
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests = 2;
    config.rate_limit.window_ms = 60_000;
    let gateway = spawn_gateway(config).await;

    assert_eq!(gateway.cli("status", &[]).await.status(), 200);
    assert_eq!(gateway.cli("status", &[]).await.status(), 200);

    let response = gateway.cli("status", &[]).await;
    assert_eq!(response.status(), 429);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(body["error"]["retryable"], true);
}

#[tokio::test]
async fn test_basic_auth() {
    let mut config = test_config();
    config.server.basic_auth_user = Some("ops".to_string());
    config.server.basic_auth_pass = Some("s3cret".to_string());
    let gateway = spawn_gateway(config).await;

    let response = gateway.cli("status", &[]).await;
    assert_eq!(response.status(), 401);
    assert!(response.headers()["www-authenticate"]
        .to_str()
        .unwrap()
        .starts_with("Basic realm="));
    assert_eq!(json_body(response).await["error"]["code"], "AUTH_REQUIRED");

    let credential = format!("Basic {}", STANDARD.encode("ops:s3cret"));
    let response = gateway
        .cli("status", &[("authorization", credential.as_str())])
        .await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_cors_origins() {
    let mut config = test_config();
    config.server.cors_allowed_origins = vec!["https://good.example".to_string()];
    let gateway = spawn_gateway(config).await;

    let response = gateway
        .cli("status", &[("origin", "https://evil.example")])
        .await;
    assert_eq!(response.status(), 403);
    assert!(response.headers().get("access-control-allow-origin").is_none());
    let body = json_body(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "CORS_ORIGIN_DENIED");
    assert_eq!(body["error"]["retryable"], false);

    let response = gateway
        .cli("status", &[("origin", "https://good.example")])
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://good.example"
    );

    // Same host and port as the request itself.
    let response = gateway
        .cli("status", &[("origin", gateway.base.as_str())])
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        gateway.base.as_str()
    );

    let response = gateway.cli("status", &[]).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_cors_preflight() {
    let mut config = test_config();
    config.server.cors_allowed_origins = vec!["https://good.example".to_string()];
    let gateway = spawn_gateway(config).await;

    let preflight = |origin: &'static str| {
        gateway
            .client
            .request(reqwest::Method::OPTIONS, gateway.url("/api/cli"))
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type,x-ai-key")
            .send()
    };

    let response = preflight("https://good.example").await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://good.example"
    );
    let allowed = response.headers()["access-control-allow-headers"]
        .to_str()
        .unwrap()
        .to_ascii_lowercase();
    assert!(allowed.contains("x-ai-key"), "{}", allowed);

    let response = preflight("https://evil.example").await.unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_stream_without_provider_echoes_tokens() {
    let gateway = spawn_gateway(test_config()).await;

    let events = gateway.ask_stream("hello there", &[]).await;
    let text: String = token_texts(&events).concat();
    assert_eq!(text, "No live AI provider configured. Echo trace: \"hello there\".");
    assert!(token_texts(&events).len() > 1);

    let last = events.last().unwrap();
    assert_eq!(last.event, "done");
    assert_eq!(last.data["ok"], true);
}

#[tokio::test]
async fn test_stream_validates_before_streaming() {
    let gateway = spawn_gateway(test_config()).await;

    let response = gateway
        .client
        .get(gateway.url("/api/ask/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "ASK_PROMPT_REQUIRED"
    );

    let response = gateway
        .client
        .get(gateway.url("/api/ask/stream"))
        .query(&[("prompt", "x".repeat(4001))])
        .send()
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await["error"]["code"],
        "ASK_PROMPT_TOO_LONG"
    );
}

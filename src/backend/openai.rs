//! OpenAI backend.
//!
//! Single-shot answers use the Responses API; streaming uses Chat Completions
//! with `stream: true`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::client::{post_json, read_json, upstream_chunks};
use super::traits::{ChunkStream, CompletionBackend, CompletionRequest};
use crate::cancel::CallScope;
use crate::error::BackendError;
use crate::resolver::ProviderKind;

/// OpenAI completion backend.
pub struct OpenAIBackend {
    client: Client,
    api_base: String,
}

impl OpenAIBackend {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAIBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<String, BackendError> {
        let body = ResponsesRequest {
            model: &request.model,
            input: &request.prompt,
            instructions: &request.instruction,
        };
        let url = format!("{}/responses", self.api_base);

        let response = post_json(
            &self.client,
            self.kind(),
            &url,
            &request.api_key,
            &body,
            scope,
        )
        .await?;
        let json = read_json(response, scope).await?;

        Ok(response_text(&json).trim().to_string())
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<ChunkStream, BackendError> {
        let body = ChatRequest::streaming(&request);
        let url = format!("{}/chat/completions", self.api_base);

        let response = post_json(
            &self.client,
            self.kind(),
            &url,
            &request.api_key,
            &body,
            scope,
        )
        .await?;

        Ok(upstream_chunks(response))
    }
}

/// Text of a Responses API result: `output_text`, else the concatenated
/// `output[].content[].text` parts.
fn response_text(json: &Value) -> String {
    if let Some(text) = json.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }

    json.get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    instructions: &'a str,
}

/// Chat Completions body, shared with the Perplexity backend.
#[derive(Debug, Serialize)]
pub(super) struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub(super) fn single(request: &'a CompletionRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !request.instruction.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.instruction,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        Self {
            model: &request.model,
            messages,
            stream: false,
        }
    }

    pub(super) fn streaming(request: &'a CompletionRequest) -> Self {
        Self {
            stream: true,
            ..Self::single(request)
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

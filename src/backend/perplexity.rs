//! Perplexity backend. Chat Completions for both single-shot and streaming.

use async_trait::async_trait;
use reqwest::Client;

use super::client::{post_json, read_json, upstream_chunks};
use super::normalize::extract_token;
use super::openai::ChatRequest;
use super::traits::{ChunkStream, CompletionBackend, CompletionRequest};
use crate::cancel::CallScope;
use crate::error::BackendError;
use crate::resolver::ProviderKind;

/// Perplexity completion backend.
pub struct PerplexityBackend {
    client: Client,
    api_base: String,
}

impl PerplexityBackend {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl CompletionBackend for PerplexityBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Perplexity
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<String, BackendError> {
        let body = ChatRequest::single(&request);
        let response = post_json(
            &self.client,
            self.kind(),
            &self.endpoint(),
            &request.api_key,
            &body,
            scope,
        )
        .await?;
        let json = read_json(response, scope).await?;

        Ok(extract_token(&json).trim().to_string())
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<ChunkStream, BackendError> {
        let body = ChatRequest::streaming(&request);
        let response = post_json(
            &self.client,
            self.kind(),
            &self.endpoint(),
            &request.api_key,
            &body,
            scope,
        )
        .await?;

        Ok(upstream_chunks(response))
    }
}

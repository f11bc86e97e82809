//! Completion providers and the adapter that fronts them.

mod client;
mod normalize;
mod openai;
mod perplexity;
mod prompt;
mod sanitize;
mod traits;

pub use client::build_http_client;
pub use normalize::{extract_token, TokenNormalizer};
pub use openai::OpenAIBackend;
pub use perplexity::PerplexityBackend;
pub use prompt::{build_instruction, code_prompt, summarize_prompt};
pub use sanitize::sanitize_output;
pub use traits::{ChunkStream, CompletionBackend, CompletionRequest, TokenStream};

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cancel::CallScope;
use crate::config::ProvidersConfig;
use crate::error::BackendError;
use crate::metrics;
use crate::resolver::{EffectiveConfig, ProviderKind};

/// Answers prompts through whichever provider the effective config selects.
pub struct ProviderAdapter {
    settings: ProvidersConfig,
    openai: Arc<dyn CompletionBackend>,
    perplexity: Arc<dyn CompletionBackend>,
}

impl ProviderAdapter {
    /// Build both backends over one shared HTTP client.
    pub fn from_config(settings: &ProvidersConfig) -> Result<Self, BackendError> {
        let client = build_http_client(settings)?;
        let openai = Arc::new(OpenAIBackend::new(
            client.clone(),
            settings.openai.api_base.clone(),
        ));
        let perplexity = Arc::new(PerplexityBackend::new(
            client,
            settings.perplexity.api_base.clone(),
        ));
        Ok(Self::with_backends(settings.clone(), openai, perplexity))
    }

    /// Use caller-supplied backends.
    pub fn with_backends(
        settings: ProvidersConfig,
        openai: Arc<dyn CompletionBackend>,
        perplexity: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            settings,
            openai,
            perplexity,
        }
    }

    fn backend(&self, kind: ProviderKind) -> Arc<dyn CompletionBackend> {
        match kind {
            ProviderKind::OpenAi => self.openai.clone(),
            ProviderKind::Perplexity => self.perplexity.clone(),
        }
    }

    fn model(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.settings.openai.model,
            ProviderKind::Perplexity => &self.settings.perplexity.model,
        }
    }

    /// Fresh scope for one upstream call.
    fn scope(&self, cancel: &CancellationToken) -> CallScope {
        CallScope::new(self.settings.timeout(), cancel.clone())
    }

    fn request(
        &self,
        kind: ProviderKind,
        prompt: &str,
        config: &EffectiveConfig,
    ) -> Result<CompletionRequest, BackendError> {
        let api_key = config
            .credential(kind)
            .ok_or(BackendError::CredentialMissing { provider: kind })?;

        Ok(CompletionRequest {
            prompt: prompt.to_string(),
            instruction: build_instruction(&self.settings.system_prompt, config),
            model: self.model(kind).to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Answer a prompt in one shot. The result is sanitized for display.
    pub async fn answer(
        &self,
        prompt: &str,
        config: &EffectiveConfig,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let Some(kind) = config.selected_provider() else {
            return Ok(no_provider_echo(prompt));
        };

        let request = self.request(kind, prompt, config)?;
        let scope = self.scope(cancel);
        complete_once(self.backend(kind), request, &scope, config).await
    }

    /// Answer a prompt as a lazily produced stream of text deltas.
    ///
    /// Deltas are normalized so no text is repeated or skipped. A stream that
    /// produces nothing falls back to one single-shot call whose sanitized
    /// result is yielded as a single token.
    pub fn answer_stream(
        &self,
        prompt: String,
        config: EffectiveConfig,
        cancel: CancellationToken,
    ) -> TokenStream {
        let Some(kind) = config.selected_provider() else {
            let echo = sanitize_output(
                &no_provider_stream_echo(&prompt),
                config.output_mode(),
                config.show_sources(),
            );
            let tokens: Vec<Result<String, BackendError>> =
                split_keeping_whitespace(&echo).into_iter().map(Ok).collect();
            return Box::pin(futures::stream::iter(tokens));
        };

        let request = self.request(kind, &prompt, &config);
        let scope = self.scope(&cancel);
        Box::pin(stream_tokens(
            self.backend(kind),
            request,
            config,
            scope,
            self.settings.timeout(),
            cancel,
        ))
    }

    /// Stream an answer into `on_token`, returning how many tokens were delivered.
    pub async fn answer_streaming<F>(
        &self,
        prompt: &str,
        config: &EffectiveConfig,
        cancel: &CancellationToken,
        mut on_token: F,
    ) -> Result<usize, BackendError>
    where
        F: FnMut(&str),
    {
        let mut tokens = self.answer_stream(prompt.to_string(), config.clone(), cancel.clone());
        let mut count = 0;
        while let Some(token) = tokens.next().await {
            on_token(&token?);
            count += 1;
        }
        Ok(count)
    }
}

/// Drive one streaming call through the normalizer, falling back to a
/// single-shot call when nothing was emitted.
fn stream_tokens(
    backend: Arc<dyn CompletionBackend>,
    request: Result<CompletionRequest, BackendError>,
    config: EffectiveConfig,
    scope: CallScope,
    fallback_timeout: Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<String, BackendError>> + Send {
    async_stream::try_stream! {
        let request = request?;
        let kind = backend.kind();
        let started = Instant::now();

        let mut chunks = scope
            .run(backend.stream(request.clone(), &scope))
            .await
            .map_err(BackendError::from)
            .and_then(|opened| opened)
            .inspect_err(|e| metrics::record_upstream_error(kind.as_str(), e.reason()))?;

        let mut normalizer = TokenNormalizer::new();
        let mut emitted = 0usize;

        loop {
            let next = scope
                .run(chunks.next())
                .await
                .map_err(BackendError::from)
                .inspect_err(|e| metrics::record_upstream_error(kind.as_str(), e.reason()))?;
            let Some(chunk) = next else { break };
            let chunk =
                chunk.inspect_err(|e| metrics::record_upstream_error(kind.as_str(), e.reason()))?;

            let delta = normalizer.push(&chunk);
            if !delta.is_empty() {
                emitted += 1;
                yield delta.to_string();
            }
        }

        metrics::record_upstream_request(kind.as_str(), "stream", started.elapsed());

        if emitted == 0 {
            tracing::debug!(provider = %kind, "Stream produced no tokens, falling back to single-shot");
            let scope = CallScope::new(fallback_timeout, cancel);
            let text = complete_once(backend, request, &scope, &config).await?;
            if !text.is_empty() {
                yield text;
            }
        }
    }
}

/// One single-shot call, sanitized, with the empty-output placeholder.
async fn complete_once(
    backend: Arc<dyn CompletionBackend>,
    request: CompletionRequest,
    scope: &CallScope,
    config: &EffectiveConfig,
) -> Result<String, BackendError> {
    let kind = backend.kind();
    let started = Instant::now();

    let text = scope
        .run(backend.complete(request, scope))
        .await
        .map_err(BackendError::from)
        .and_then(|result| result)
        .inspect_err(|e| {
            metrics::record_upstream_error(kind.as_str(), e.reason());
        })?;

    metrics::record_upstream_request(kind.as_str(), "single", started.elapsed());

    let text = sanitize_output(&text, config.output_mode(), config.show_sources());
    if text.is_empty() {
        return Ok(format!("{} responded without text output.", kind.display_name()));
    }
    Ok(text)
}

fn no_provider_echo(prompt: &str) -> String {
    format!(
        "No live AI provider configured. Echo trace: \"{}\". \
         Set OPENAI_API_KEY or PPLX_API_KEY, optionally AI_PROVIDER=openai|perplexity.",
        prompt
    )
}

fn no_provider_stream_echo(prompt: &str) -> String {
    format!("No live AI provider configured. Echo trace: \"{}\".", prompt)
}

/// Split text into word tokens, each carrying its trailing whitespace, so the
/// tokens concatenate back to the original.
fn split_keeping_whitespace(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_space = false;

    for c in text.chars() {
        if !c.is_whitespace() && in_space && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        in_space = c.is_whitespace();
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("timeout", &self.settings.timeout())
            .field("output_mode", &self.settings.output_mode.as_str())
            .finish()
    }
}

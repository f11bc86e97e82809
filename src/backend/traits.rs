//! Backend trait definitions.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::cancel::CallScope;
use crate::error::BackendError;
use crate::resolver::ProviderKind;

/// Raw text chunks as the upstream sends them. Chunks may be deltas or
/// cumulative text; callers normalize.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Normalized, non-empty text deltas delivered to callers.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The user prompt.
    pub prompt: String,
    /// System instruction.
    pub instruction: String,
    /// Model name.
    pub model: String,
    /// Credential for this call.
    pub api_key: String,
}

/// A completion provider that can answer in one shot or stream chunks.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Which provider this is.
    fn kind(&self) -> ProviderKind;

    /// Single-shot completion. Every await runs inside `scope`.
    async fn complete(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<String, BackendError>;

    /// Open a streaming completion. Opening runs inside `scope`; the caller
    /// drives the returned stream through the same scope.
    async fn stream(
        &self,
        request: CompletionRequest,
        scope: &CallScope,
    ) -> Result<ChunkStream, BackendError>;
}

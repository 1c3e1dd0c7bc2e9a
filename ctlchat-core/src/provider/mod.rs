//! LLM provider abstraction layer.
//!
//! This module defines a common interface for different LLM backends
//! (Anthropic, Ollama) to provide chat completions and embeddings, plus the
//! timeout wrappers every oracle call goes through.

mod types;
mod stream;
pub mod anthropic;
pub mod ollama;

// Re-export common types
pub use types::{
    ChatRequest,
    Message,
    Provider,
    ProviderError,
    Result,
    Role,
    TextStream,
};

// Re-export provider implementations
pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;

use crate::config::{ConfigError, LlmConfig, ProviderKind};
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Builds the chat provider selected by `llm.provider`.
///
/// Fails fast with a configuration error when the credential or model is missing.
pub fn from_config(config: &LlmConfig) -> std::result::Result<Arc<dyn Provider>, ConfigError> {
    config.validate()?;
    let provider: Arc<dyn Provider> = match config.provider {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(&config.base_url)),
    };
    Ok(provider)
}

/// Runs a single-shot completion bounded by `timeout`.
///
/// No partial output survives a timeout.
pub async fn complete_with_timeout(
    provider: &dyn Provider,
    request: ChatRequest,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Opens a streamed completion whose whole lifetime is bounded by `timeout`.
///
/// Opening the stream counts against the same deadline. Fragments emitted
/// before the deadline stay valid; the stream then ends with a trailing
/// [`ProviderError::Timeout`].
pub async fn stream_with_timeout(
    provider: &dyn Provider,
    request: ChatRequest,
    timeout: Duration,
) -> Result<TextStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    match tokio::time::timeout_at(deadline, provider.stream(request)).await {
        Ok(Ok(stream)) => Ok(with_deadline(stream, deadline, timeout)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Bounds an already-open stream by an absolute deadline.
pub fn with_deadline(
    stream: TextStream,
    deadline: tokio::time::Instant,
    timeout: Duration,
) -> TextStream {
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout_at(deadline, inner.next()).await {
            Ok(Some(Ok(fragment))) => Some((Ok(fragment), Some(inner))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((Err(ProviderError::Timeout(timeout)), None)),
        }
    })
    .boxed()
}

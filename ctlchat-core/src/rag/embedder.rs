//! Embedding generation using LLM providers.
//!
//! This module provides functionality to convert text into vector embeddings
//! using provider embedding models. The index only sees the
//! [`EmbeddingFunction`] trait, so any backend (or a test double) can be plugged in.

use crate::provider::{Provider, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// The provider API returned an error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The backend returned a different number of vectors than texts sent.
    #[error("Expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedderError>;

/// Maps texts to fixed-length vectors.
///
/// Must be deterministic for a fixed model; the same function has to be used
/// at ingest and at query time.
#[async_trait]
pub trait EmbeddingFunction: Send + Sync {
    /// Identifies the model behind the vectors.
    fn model_id(&self) -> &str;

    /// One vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Generates vector embeddings through a [`Provider`]'s embedding endpoint.
///
/// Common embedding models:
/// - `all-minilm` - 384-dimensional embeddings, small and fast
/// - `nomic-embed-text` - 768-dimensional embeddings, good general purpose
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl Embedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingFunction for Embedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self.provider.embed(texts, &self.model).await?;
        if embeddings.len() != texts.len() {
            return Err(EmbedderError::CountMismatch {
                expected: texts.len(),
                actual: embeddings.len(),
            });
        }
        Ok(embeddings)
    }
}

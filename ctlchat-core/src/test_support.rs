//! Test doubles shared by the unit tests.

use crate::provider::{ChatRequest, Provider, ProviderError, Result, TextStream};
use crate::rag::{EmbedderError, EmbeddingFunction, IndexStore, MemoryStore};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// LLM oracle that answers from a script and records every request.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    default_reply: String,
    replies: Mutex<VecDeque<String>>,
    failing: bool,
    delay: Option<Duration>,
    fragments: Option<Vec<String>>,
    fail_stream_after: Option<usize>,
    embedding: Option<Vec<f32>>,
    requests: Mutex<Vec<ChatRequest>>,
    embed_models: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Answers every request with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            default_reply: text.into(),
            ..Self::default()
        }
    }

    /// Every call fails with an API error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Replies consumed in order before falling back to the default reply.
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..self
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Streams exactly these fragments instead of one whole reply.
    pub fn with_stream<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fragments = Some(fragments.into_iter().map(Into::into).collect());
        self
    }

    /// Ends the stream with an error after `count` fragments.
    pub fn failing_stream_after(mut self, count: usize) -> Self {
        self.fail_stream_after = Some(count);
        self
    }

    /// Returns `vector` for every embedded text.
    pub fn with_embedding(mut self, vector: Vec<f32>) -> Self {
        self.embedding = Some(vector);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn embed_models(&self) -> Vec<String> {
        self.embed_models.lock().unwrap().clone()
    }

    async fn begin(&self, request: ChatRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(ProviderError::Api {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.default_reply.clone()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.begin(request).await
    }

    async fn stream(&self, request: ChatRequest) -> Result<TextStream> {
        let reply = self.begin(request).await?;
        let fragments = self.fragments.clone().unwrap_or_else(|| vec![reply]);

        let mut items: Vec<Result<String>> = Vec::new();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if self.fail_stream_after == Some(i) {
                break;
            }
            items.push(Ok(fragment));
        }
        if self.fail_stream_after.is_some() {
            items.push(Err(ProviderError::Other("stream interrupted".to_string())));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        self.embed_models.lock().unwrap().push(model.to_string());
        match &self.embedding {
            Some(vector) => Ok(texts.iter().map(|_| vector.clone()).collect()),
            None => Err(ProviderError::Unsupported("embeddings")),
        }
    }
}

/// Deterministic bag-of-words embedder.
///
/// Lower-cased alphanumeric tokens are hashed into `dimension` buckets, so
/// identical texts embed identically and shared words pull texts together.
pub(crate) struct HashEmbedder {
    dimension: usize,
    failing: bool,
    batch_delay: Option<Duration>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failing: false,
            batch_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(dimension: usize) -> Self {
        Self {
            failing: true,
            ..Self::new(dimension)
        }
    }

    /// Sleeps before answering any call with more than one text, so ingestion
    /// is slow while single-query embeddings stay instant.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    /// Every batch passed to `embed`, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            // FNV-1a
            let hash = token
                .to_lowercase()
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingFunction for HashEmbedder {
    fn model_id(&self) -> &str {
        "hash-embedder"
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        self.calls.lock().unwrap().push(texts.to_vec());
        if let Some(delay) = self.batch_delay.filter(|_| texts.len() > 1) {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(EmbedderError::Provider(ProviderError::Other(
                "embedding backend unavailable".to_string(),
            )));
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Empty in-memory index backed by a 64-bucket [`HashEmbedder`].
pub(crate) fn memory_index() -> IndexStore {
    IndexStore::new(Arc::new(MemoryStore::new()), Arc::new(HashEmbedder::new(64)), 64)
}

//! Retrieval Augmented Generation (RAG) indexing and search.
//!
//! This module implements the ingestion and retrieval half of the pipeline.
//!
//! # Architecture
//!
//! - [`chunker`]: splits document text into bounded, overlapping chunks
//! - [`loader`]: walks a directory and turns supported files into chunks
//! - [`extract_text`]: plain text out of txt, md, pdf and docx bytes
//! - [`EmbeddingFunction`]: converts text to vectors (Ollama by default)
//! - [`VectorStore`]: backend trait (LanceDB embedded, Qdrant, in-memory)
//! - [`IndexStore`]: the index the rest of the crate talks to
//! - [`Ingestor`]: batch ingestion of directories and uploads
//!
//! # How It Works
//!
//! 1. **Indexing Phase**:
//!    - Documents are split into chunks (default: 1000 characters with 200 overlap)
//!    - Each chunk is embedded and stored under a content-derived id
//!
//! 2. **Retrieval Phase**:
//!    - The query is embedded with the same embedding function
//!    - The store returns the top-k nearest chunks, closest first
//!
//! Search failures never propagate: they are logged and the caller sees an
//! empty result, i.e. "no context found". Writes (add, reset, delete) do
//! propagate, since ingestion integrity matters more than availability.

pub mod chunker;
mod embedder;
pub(crate) mod extract;
mod ingest;
mod lancedb_store;
pub mod loader;
mod memory_store;
mod qdrant_store;
mod store;
mod types;

pub use chunker::{chunk_by_markdown_separator, chunk_text, clean_text, ChunkError};
pub use embedder::{Embedder, EmbedderError, EmbeddingFunction};
pub use extract::{docx_xml_to_text, extract_text, ExtractError};
pub use ingest::{IngestError, IngestReport, Ingestor, UploadOwner, UploadReport};
pub use lancedb_store::LanceDbStore;
pub use loader::{DocumentLoader, LoadError};
pub use memory_store::MemoryStore;
pub use qdrant_store::QdrantStore;
pub use store::{create_vector_store, VectorStore};
pub use types::{Chunk, ChunkMetadata, Document, Metadata, MetadataFilter, SearchResult, Visibility};

use crate::config::Config;
use crate::provider::OllamaProvider;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("Embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("Index {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Index has been deleted; reset it before adding documents")]
    Deleted,
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Texts sent to the embedder per call.
const EMBED_BATCH_SIZE: usize = 32;

fn backend(operation: &'static str) -> impl FnOnce(anyhow::Error) -> IndexError {
    move |e| IndexError::Backend {
        operation,
        message: format!("{e:#}"),
    }
}

/// Builds the embedding function described by `rag.embedding`.
pub fn embedder_from_config(config: &Config) -> Arc<dyn EmbeddingFunction> {
    let provider = Arc::new(OllamaProvider::new(&config.rag.embedding.base_url));
    Arc::new(Embedder::new(provider, config.rag.embedding.model.clone()))
}

/// Vector index over document chunks.
///
/// Shared read-mostly across concurrent requests. Searches take the gate for
/// reading; add, reset, delete and source removal take it for writing, so a
/// search never observes a half-reset index.
pub struct IndexStore {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingFunction>,
    dimension: usize,
    default_top_k: usize,
    search_timeout: Duration,
    write_timeout: Duration,
    // `true` once the index has been deleted.
    gate: RwLock<bool>,
}

impl IndexStore {
    /// Opens (or creates) the configured backend.
    pub async fn open(config: &Config, embedder: Arc<dyn EmbeddingFunction>) -> Result<Self> {
        let dimension = config.rag.embedding.dimension;
        let store = create_vector_store(&config.storage, dimension)
            .await
            .map_err(backend("open"))?;

        info!(
            collection = %config.storage.vector_db.collection_name,
            model = embedder.model_id(),
            dimension,
            "Opened vector index"
        );

        Ok(Self::new(store, embedder, dimension)
            .with_top_k(config.rag.top_k)
            .with_timeouts(config.rag.search_timeout(), config.llm.timeout()))
    }

    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingFunction>, dimension: usize) -> Self {
        Self {
            store,
            embedder,
            dimension,
            default_top_k: 5,
            search_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(60),
            gate: RwLock::new(false),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k;
        self
    }

    /// Bounds searches and writes respectively.
    pub fn with_timeouts(mut self, search: Duration, write: Duration) -> Self {
        self.search_timeout = search;
        self.write_timeout = write;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Embeds and stores chunks. Returns how many were written.
    ///
    /// Ids are derived from source, position and content, so re-adding the
    /// same chunk replaces it. Embedding runs before the write gate is taken;
    /// searches are only held back for the store write itself.
    pub async fn add(&self, chunks: Vec<Chunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let count = chunks.len();
        self.bounded("add", self.write_timeout, async {
            let documents = self.embed_chunks(chunks).await?;
            let deleted = self.gate.write().await;
            if *deleted {
                return Err(IndexError::Deleted);
            }
            self.store.add(documents).await.map_err(backend("add"))
        })
        .await?;

        debug!(count, "Added chunks to index");
        Ok(count)
    }

    /// Swaps every stored chunk of `source` for `chunks` in one step.
    ///
    /// Searches see either the old version of the document or the new one,
    /// never both. An empty `chunks` just removes the source.
    pub async fn replace_source(&self, source: &str, chunks: Vec<Chunk>) -> Result<usize> {
        let count = chunks.len();
        let removed = self
            .bounded("replace source", self.write_timeout, async {
                let documents = self.embed_chunks(chunks).await?;
                let deleted = self.gate.write().await;
                if *deleted {
                    return Err(IndexError::Deleted);
                }
                let removed = self
                    .store
                    .remove_by_source(source)
                    .await
                    .map_err(backend("replace source"))?;
                if !documents.is_empty() {
                    self.store.add(documents).await.map_err(backend("add"))?;
                }
                Ok::<_, IndexError>(removed)
            })
            .await?;

        debug!(source, removed, added = count, "Replaced source in index");
        Ok(count)
    }

    /// Searches the index, surfacing every failure.
    ///
    /// Results are in ascending distance order, at most `top_k` (default from
    /// configuration) long. Waiting behind a writer counts against the
    /// search timeout.
    pub async fn try_search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        let top_k = top_k.unwrap_or(self.default_top_k);

        self.bounded("search", self.search_timeout, async {
            let embedding = match top_k {
                0 => None,
                _ => Some(self.embed_query(query).await?),
            };

            let deleted = self.gate.read().await;
            if *deleted {
                return Err(IndexError::Deleted);
            }
            let Some(embedding) = embedding else {
                return Ok(Vec::new());
            };

            let mut results = self
                .store
                .search(&embedding, top_k, filter)
                .await
                .map_err(backend("search"))?;
            results.truncate(top_k);
            Ok::<_, IndexError>(results)
        })
        .await
    }

    /// Searches the index; any failure is logged and yields no results.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Vec<SearchResult> {
        match self.try_search(query, top_k, filter).await {
            Ok(results) => {
                info!(count = results.len(), "Retrieved documents for query");
                results
            }
            Err(e) => {
                warn!(error = %e, "Search failed, continuing without context");
                Vec::new()
            }
        }
    }

    pub async fn try_count(&self) -> Result<usize> {
        let deleted = self.gate.read().await;
        if *deleted {
            return Ok(0);
        }
        self.store.count().await.map_err(backend("count"))
    }

    /// Number of indexed chunks; `0` on failure.
    pub async fn count(&self) -> usize {
        match self.try_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count indexed documents");
                0
            }
        }
    }

    /// Deletes every chunk and recreates an empty index with the same
    /// configuration. Also brings a deleted index back.
    pub async fn reset(&self) -> Result<()> {
        let mut deleted = self.gate.write().await;
        self.store.clear().await.map_err(backend("reset"))?;
        *deleted = false;
        info!("Reset vector index");
        Ok(())
    }

    /// Irreversibly removes the whole index.
    pub async fn delete(&self) -> Result<()> {
        let mut deleted = self.gate.write().await;
        self.store.drop_index().await.map_err(backend("delete"))?;
        *deleted = true;
        warn!("Deleted vector index");
        Ok(())
    }

    /// Distinct source names currently indexed.
    pub async fn sources(&self) -> Result<Vec<String>> {
        let deleted = self.gate.read().await;
        if *deleted {
            return Ok(Vec::new());
        }
        self.store.sources().await.map_err(backend("list sources"))
    }

    /// Removes every chunk of `source` (or under it, for paths).
    pub async fn remove_source(&self, source: &str) -> Result<usize> {
        let deleted = self.gate.write().await;
        if *deleted {
            return Err(IndexError::Deleted);
        }
        let removed = self
            .store
            .remove_by_source(source)
            .await
            .map_err(backend("remove source"))?;
        info!(source, removed, "Removed source from index");
        Ok(removed)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        self.check_dimension(embedding.len())?;
        Ok(embedding)
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(chunks.len());
        let mut chunks = chunks.into_iter().peekable();
        while chunks.peek().is_some() {
            let batch: Vec<Chunk> = chunks.by_ref().take(EMBED_BATCH_SIZE).collect();
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let embeddings = self.embedder.embed(&texts).await?;
            for embedding in &embeddings {
                self.check_dimension(embedding.len())?;
            }
            documents.extend(
                batch
                    .into_iter()
                    .zip(embeddings)
                    .map(|(chunk, embedding)| Document::from_chunk(chunk, embedding)),
            );
        }
        Ok(documents)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        timeout: Duration,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| IndexError::Timeout { operation, timeout })?
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

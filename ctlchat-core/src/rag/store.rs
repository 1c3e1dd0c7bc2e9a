//! Vector store abstraction and factory.
//!
//! This module provides a unified interface for different vector database implementations.

use super::lancedb_store::LanceDbStore;
use super::memory_store::MemoryStore;
use super::qdrant_store::QdrantStore;
use super::types::{Document, MetadataFilter, SearchResult};
use crate::config::{StorageConfig, StorageMode};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Unified interface for vector database operations.
///
/// Implementations handle document storage, similarity search, and metadata queries
/// across different vector database backends (LanceDB for embedded, Qdrant for gRPC,
/// a plain in-process map for tests and throwaway sessions).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Adds or replaces documents, keyed by `Document::id`.
    async fn add(&self, documents: Vec<Document>) -> Result<()>;

    /// Searches for the most similar documents using vector similarity.
    ///
    /// # Arguments
    ///
    /// * `query_embedding` - The embedding vector to search for
    /// * `top_k` - Maximum number of results to return
    /// * `filter` - Optional metadata predicate every hit must satisfy
    ///
    /// # Returns
    ///
    /// At most `top_k` results in ascending distance order.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>>;

    /// Returns the total number of documents in the store.
    async fn count(&self) -> Result<usize>;

    /// Removes all documents and recreates an empty index with the same settings.
    async fn clear(&self) -> Result<()>;

    /// Irreversibly removes the index itself.
    async fn drop_index(&self) -> Result<()>;

    /// Returns all unique source names that have been indexed.
    async fn sources(&self) -> Result<Vec<String>>;

    /// Removes all documents whose source equals `source` or lives under it
    /// as a path prefix. Returns the number removed.
    async fn remove_by_source(&self, source: &str) -> Result<usize>;
}

/// Creates a vector store instance based on the storage mode.
///
/// - `Embedded` mode uses LanceDB for zero-setup, in-process storage
/// - `Grpc` mode uses Qdrant for remote server connectivity
/// - `Memory` mode keeps everything in the process
pub async fn create_vector_store(
    storage_config: &StorageConfig,
    vector_size: usize,
) -> Result<Arc<dyn VectorStore>> {
    let collection = storage_config.vector_db.collection_name.as_str();
    match &storage_config.storage_mode {
        StorageMode::Embedded { path } => {
            let store = LanceDbStore::new(path, collection, vector_size).await?;
            Ok(Arc::new(store))
        }
        StorageMode::Grpc { url } => {
            let store = QdrantStore::new(url, collection, vector_size as u64).await?;
            Ok(Arc::new(store))
        }
        StorageMode::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Whether a stored source falls under `prefix` (same path, or a path below it).
pub(crate) fn source_matches(stored: &str, prefix: &str) -> bool {
    let stored = stored.replace('\\', "/");
    let prefix = prefix.replace('\\', "/");
    let prefix = prefix.trim_end_matches('/');
    stored == prefix || stored.starts_with(&format!("{prefix}/"))
}

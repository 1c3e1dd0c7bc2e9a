//! In-memory vector storage and search.
//!
//! This module provides a simple vector store implementation using in-memory
//! storage and cosine distance for search.

use super::store::{source_matches, VectorStore};
use super::types::{Document, MetadataFilter, SearchResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// An in-memory vector store for document embeddings.
///
/// Documents are keyed by id (re-adding replaces), searched with a linear scan
/// and ranked by `1 - cosine_similarity`. Data is lost when the process ends.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Document>>> {
        self.documents
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Document>>> {
        self.documents
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn add(&self, documents: Vec<Document>) -> Result<()> {
        let mut docs = self.write()?;
        for document in documents {
            docs.insert(document.id.clone(), document);
        }
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        let docs = self.read()?;

        let mut results: Vec<SearchResult> = docs
            .values()
            .filter(|doc| filter.map_or(true, |f| f.matches(&doc.metadata)))
            .map(|doc| SearchResult {
                id: doc.id.clone(),
                content: doc.content.clone(),
                metadata: doc.metadata.clone(),
                distance: 1.0 - cosine_similarity(query_embedding, &doc.embedding),
            })
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        results.truncate(top_k);
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn drop_index(&self) -> Result<()> {
        self.clear().await
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let docs = self.read()?;
        let unique: BTreeSet<String> = docs
            .values()
            .filter_map(|doc| doc.metadata.get("source").cloned())
            .collect();
        Ok(unique.into_iter().collect())
    }

    async fn remove_by_source(&self, source: &str) -> Result<usize> {
        let mut docs = self.write()?;
        let before = docs.len();
        docs.retain(|_, doc| {
            !doc
                .metadata
                .get("source")
                .is_some_and(|stored| source_matches(stored, source))
        });
        Ok(before - docs.len())
    }
}

/// Computes cosine similarity between two vectors.
///
/// Returns values from -1.0 (opposite) to 1.0 (identical), with 0.0 indicating
/// orthogonal vectors. Returns 0.0 for mismatched lengths or zero magnitude.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

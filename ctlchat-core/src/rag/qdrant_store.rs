//! Qdrant vector database storage implementation.
//!
//! This module provides integration with Qdrant, a high-performance vector database
//! that offers automatic deduplication, persistence, and scalability.

use super::store::{source_matches, VectorStore};
use super::types::{Document, Metadata, MetadataFilter, SearchResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::{
    qdrant::{
        vectors_config::Config, Condition, CreateCollectionBuilder, DeletePointsBuilder,
        Distance, Filter, PointId, PointStruct, PointsIdsList, RetrievedPoint,
        ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
        VectorsConfig,
    },
    Payload, Qdrant,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Qdrant-based vector store for document embeddings.
///
/// Provides persistent, scalable vector storage with automatic deduplication
/// through Qdrant's upsert mechanism. When a document with an existing ID is
/// added, it replaces the old version. Distances are reported as
/// `1 - cosine score` so lower is better, like the other backends.
#[derive(Clone)]
pub struct QdrantStore {
    client: Arc<Qdrant>,
    collection_name: String,
    vector_size: u64,
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn add(&self, documents: Vec<Document>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let points = documents
            .into_iter()
            .map(|document| {
                let payload = document_payload(&document)?;
                Ok(PointStruct::new(point_id(&document.id), document.embedding, payload))
            })
            .collect::<Result<Vec<PointStruct>>>()?;

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .context("Failed to upsert points")?;

        Ok(())
    }

    /// Searches for the most similar documents using cosine similarity.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 || filter.is_some_and(is_unsatisfiable) {
            return Ok(Vec::new());
        }

        let mut builder = SearchPointsBuilder::new(
            &self.collection_name,
            query_embedding.to_vec(),
            top_k as u64,
        )
        .with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .context("Failed to search points")?;

        let results = response
            .result
            .into_iter()
            .map(|point| search_result(&point.payload, point.score))
            .collect();

        Ok(results)
    }

    /// Returns the total number of documents in the collection.
    async fn count(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .context("Failed to get collection info")?;

        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }

    /// Removes all documents from the collection.
    async fn clear(&self) -> Result<()> {
        self.drop_index().await?;
        self.ensure_collection().await
    }

    async fn drop_index(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .context("Failed to check collection")?;
        if exists {
            self.client
                .delete_collection(&self.collection_name)
                .await
                .context("Failed to delete collection")?;
        }
        Ok(())
    }

    /// Scrolls through every point and collects the distinct `source` values.
    async fn sources(&self) -> Result<Vec<String>> {
        let mut unique = BTreeSet::new();
        for point in self.scroll_all().await? {
            if let Some(source) = point.payload.get("source").and_then(|v| v.as_str()) {
                unique.insert(source.to_string());
            }
        }
        Ok(unique.into_iter().collect())
    }

    async fn remove_by_source(&self, source: &str) -> Result<usize> {
        let points_to_delete: Vec<PointId> = self
            .scroll_all()
            .await?
            .into_iter()
            .filter(|point| {
                point
                    .payload
                    .get("source")
                    .and_then(|v| v.as_str())
                    .is_some_and(|stored| source_matches(stored, source))
            })
            .filter_map(|point| point.id)
            .collect();

        let count = points_to_delete.len();
        if count > 0 {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&self.collection_name)
                        .points(PointsIdsList {
                            ids: points_to_delete,
                        })
                        .wait(true),
                )
                .await
                .context("Failed to delete points")?;
        }

        Ok(count)
    }
}

impl QdrantStore {
    /// Connects to a Qdrant server and ensures the collection exists.
    ///
    /// # Arguments
    ///
    /// * `url` - gRPC endpoint, e.g. `http://localhost:6334`
    /// * `collection_name` - Collection to store points in
    /// * `vector_size` - Dimension of the embedding vectors
    pub async fn new(url: &str, collection_name: &str, vector_size: u64) -> Result<Self> {
        let client = Arc::new(
            Qdrant::from_url(url)
                .build()
                .context("Failed to connect to Qdrant server")?,
        );

        let store = Self {
            client,
            collection_name: collection_name.to_string(),
            vector_size,
        };

        store.ensure_collection().await?;

        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .context("Failed to check collection")?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorsConfig {
                            config: Some(Config::Params(
                                VectorParamsBuilder::new(self.vector_size, Distance::Cosine)
                                    .build(),
                            )),
                        },
                    ),
                )
                .await
                .context("Failed to create collection")?;
        }

        Ok(())
    }

    async fn scroll_all(&self) -> Result<Vec<RetrievedPoint>> {
        let mut points = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection_name)
                .limit(100)
                .with_payload(true);
            if let Some(off) = offset {
                builder = builder.offset(off);
            }

            let scroll_result = self
                .client
                .scroll(builder)
                .await
                .context("Failed to scroll points")?;
            points.extend(scroll_result.result);

            match scroll_result.next_page_offset {
                Some(next_offset) => offset = Some(next_offset),
                None => break,
            }
        }

        Ok(points)
    }
}

/// Qdrant point ids must be integers or UUIDs; derive a stable u64 from the
/// document id.
/// Stores metadata flat next to the chunk text and id.
fn document_payload(document: &Document) -> Result<Payload> {
    let mut payload = serde_json::Map::new();
    for (key, value) in &document.metadata {
        payload.insert(key.clone(), json!(value));
    }
    payload.insert("content".to_string(), json!(document.content));
    payload.insert("id".to_string(), json!(document.id));
    Payload::try_from(serde_json::Value::Object(payload)).context("Failed to build point payload")
}

fn search_result(payload: &HashMap<String, Value>, score: f32) -> SearchResult {
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_default()
    };

    let metadata: Metadata = payload
        .iter()
        .filter(|(k, _)| k.as_str() != "content" && k.as_str() != "id")
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect();

    SearchResult {
        id: text("id"),
        content: text("content"),
        metadata,
        distance: 1.0 - score,
    }
}

fn point_id(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// True when no metadata can ever satisfy the filter.
fn is_unsatisfiable(filter: &MetadataFilter) -> bool {
    match filter {
        MetadataFilter::Eq { .. } => false,
        MetadataFilter::In { values, .. } => values.is_empty(),
        MetadataFilter::And(filters) => filters.iter().any(is_unsatisfiable),
        MetadataFilter::Or(filters) => filters.iter().all(is_unsatisfiable),
    }
}

/// Converts a satisfiable metadata filter into Qdrant payload conditions.
///
/// Unsatisfiable `Or` branches are pruned first, since Qdrant treats an empty
/// `should` as a match.
fn to_qdrant_filter(filter: &MetadataFilter) -> Filter {
    match filter {
        MetadataFilter::Eq { key, value } => {
            Filter::must([Condition::matches(key.as_str(), value.clone())])
        }
        MetadataFilter::In { key, values } => {
            Filter::must([Condition::matches(key.as_str(), values.clone())])
        }
        MetadataFilter::And(filters) => Filter::must(
            filters
                .iter()
                .map(|f| Condition::from(to_qdrant_filter(f)))
                .collect::<Vec<_>>(),
        ),
        MetadataFilter::Or(filters) => Filter::should(
            filters
                .iter()
                .filter(|f| !is_unsatisfiable(f))
                .map(|f| Condition::from(to_qdrant_filter(f)))
                .collect::<Vec<_>>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::{Chunk, ChunkMetadata};

    #[test]
    fn test_payload_round_trips_into_search_result() {
        let chunk = Chunk::new(
            "Company X offers 15 days PTO.",
            ChunkMetadata::new("pto.txt", 0, 1, "txt"),
        );
        let document = Document::from_chunk(chunk, vec![0.0; 4]);

        let payload: HashMap<String, Value> = document_payload(&document).unwrap().into();
        let result = search_result(&payload, 0.75);

        assert_eq!(result.id, document.id);
        assert_eq!(result.content, "Company X offers 15 days PTO.");
        assert_eq!(result.source(), Some("pto.txt"));
        assert!(!result.metadata.contains_key("content"));
        assert!((result.distance - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(point_id("abc"), point_id("abc"));
        assert_ne!(point_id("abc"), point_id("abd"));
    }

    #[test]
    fn test_unsatisfiable_filters() {
        assert!(is_unsatisfiable(&MetadataFilter::Or(vec![])));
        assert!(is_unsatisfiable(&MetadataFilter::any_of("source", vec![])));
        assert!(is_unsatisfiable(&MetadataFilter::And(vec![
            MetadataFilter::eq("source", "a"),
            MetadataFilter::Or(vec![]),
        ])));
        assert!(!is_unsatisfiable(&MetadataFilter::visible_to("u", "o")));
    }

    #[test]
    fn test_filter_conversion() {
        let filter = to_qdrant_filter(&MetadataFilter::eq("source", "a.txt"));
        assert_eq!(filter.must.len(), 1);
        assert!(filter.should.is_empty());

        let filter = to_qdrant_filter(&MetadataFilter::Or(vec![
            MetadataFilter::eq("source", "a.txt"),
            MetadataFilter::any_of("file_type", vec![]),
        ]));
        assert_eq!(filter.should.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Qdrant server running
    async fn test_qdrant_store_grpc() {
        let store = QdrantStore::new("http://localhost:6334", "test_collection_grpc", 3)
            .await
            .unwrap();
        store.clear().await.unwrap();

        let doc = Document::new("test_1", "Hello world", vec![1.0, 0.0, 0.0])
            .with_metadata("source", "hello.txt");
        store.add(vec![doc]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let results = store.search(&[1.0, 0.0, 0.0], 1, None).await.unwrap();
        assert_eq!(results[0].id, "test_1");
        assert_eq!(results[0].source(), Some("hello.txt"));

        store.drop_index().await.unwrap();
    }
}

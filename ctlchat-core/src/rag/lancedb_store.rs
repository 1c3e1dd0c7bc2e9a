//! LanceDB vector database storage implementation.
//!
//! This module provides integration with LanceDB for embedded, in-process vector storage.
//! Filterable metadata fields get their own columns; the full metadata map is
//! kept as a JSON string so nothing is lost on the way back out.

use super::store::{source_matches, VectorStore};
use super::types::{Document, Metadata, MetadataFilter, SearchResult};
use anyhow::{bail, ensure, Context, Result};
use arrow_array::{
    array::{ArrayRef, FixedSizeListArray, Float32Array, StringArray},
    Array, RecordBatch, RecordBatchIterator,
};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use lancedb::arrow::arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Metadata keys stored as dedicated, filterable columns.
const FILTER_COLUMNS: [&str; 5] = ["source", "file_type", "user_id", "org_id", "visibility"];

/// LanceDB-based vector store for embedded deployment.
///
/// Provides zero-setup, in-process vector storage using LanceDB. Rows are
/// upserted on `id`, and search uses cosine distance.
pub struct LanceDbStore {
    conn: Connection,
    table_name: String,
    vector_size: usize,
}

#[async_trait]
impl VectorStore for LanceDbStore {
    async fn add(&self, documents: Vec<Document>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let batch = self.record_batch(&documents)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));

        let table = self.table().await?;
        let mut mi = table.merge_insert(&["id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        mi.execute(reader)
            .await
            .context("Failed to upsert documents into LanceDB")?;

        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        let table = self.table().await?;
        if top_k == 0 || table.count_rows(None).await? == 0 {
            return Ok(Vec::new());
        }

        let mut query = table
            .vector_search(query_embedding)?
            .distance_type(DistanceType::Cosine)
            .limit(top_k);
        if let Some(filter) = filter {
            query = query.only_if(filter_to_sql(filter)?);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .context("Failed to execute LanceDB query")?
            .try_collect()
            .await
            .context("Failed to collect query results")?;

        let mut results = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let contents = string_column(batch, "content")?;
            let metadata_col = string_column(batch, "metadata")?;
            let distances = batch
                .column_by_name("_distance")
                .context("Missing '_distance' column")?
                .as_any()
                .downcast_ref::<Float32Array>()
                .context("Failed to cast '_distance' to Float32Array")?;

            for i in 0..batch.num_rows() {
                let metadata: Metadata = if metadata_col.is_null(i) {
                    Metadata::new()
                } else {
                    serde_json::from_str(metadata_col.value(i)).unwrap_or_default()
                };
                results.push(SearchResult {
                    id: ids.value(i).to_string(),
                    content: contents.value(i).to_string(),
                    metadata,
                    distance: distances.value(i),
                });
            }
        }

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        let count = self.table().await?.count_rows(None).await?;
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        if self.table_exists().await? {
            self.conn
                .drop_table(&self.table_name, &[])
                .await
                .context("Failed to drop table")?;
        }
        self.create_table().await?;
        Ok(())
    }

    async fn drop_index(&self) -> Result<()> {
        if self.table_exists().await? {
            self.conn
                .drop_table(&self.table_name, &[])
                .await
                .context("Failed to drop table")?;
        }
        Ok(())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let table = self.table().await?;
        let batches: Vec<RecordBatch> = table
            .query()
            .execute()
            .await
            .context("Failed to query all documents")?
            .try_collect()
            .await
            .context("Failed to collect query results")?;

        let mut unique = BTreeSet::new();
        for batch in &batches {
            let sources = string_column(batch, "source")?;
            for i in 0..batch.num_rows() {
                if !sources.is_null(i) {
                    unique.insert(sources.value(i).to_string());
                }
            }
        }

        Ok(unique.into_iter().collect())
    }

    async fn remove_by_source(&self, source: &str) -> Result<usize> {
        let table = self.table().await?;
        let batches: Vec<RecordBatch> = table
            .query()
            .execute()
            .await
            .context("Failed to query all documents")?
            .try_collect()
            .await
            .context("Failed to collect query results")?;

        let mut ids_to_delete = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let sources = string_column(batch, "source")?;
            for i in 0..batch.num_rows() {
                if !sources.is_null(i) && source_matches(sources.value(i), source) {
                    ids_to_delete.push(quote(ids.value(i)));
                }
            }
        }

        let count = ids_to_delete.len();
        if count > 0 {
            let delete_expr = format!("id IN ({})", ids_to_delete.join(", "));
            table
                .delete(&delete_expr)
                .await
                .context("Failed to delete documents by source")?;
        }

        Ok(count)
    }
}

impl LanceDbStore {
    /// Creates a new LanceDB store and ensures the table exists.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory path where LanceDB should store data
    /// * `table_name` - Name of the table to use
    /// * `vector_size` - Dimension of the embedding vectors
    pub async fn new(path: &str, table_name: &str, vector_size: usize) -> Result<Self> {
        let conn = connect(path)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let store = Self {
            conn,
            table_name: table_name.to_string(),
            vector_size,
        };

        if !store.table_exists().await? {
            store.create_table().await?;
        }

        Ok(store)
    }

    fn create_schema(vector_size: usize) -> Arc<Schema> {
        let mut fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_size as i32,
                ),
                false,
            ),
        ];
        fields.extend(
            FILTER_COLUMNS
                .iter()
                .map(|name| Field::new(*name, DataType::Utf8, true)),
        );
        fields.push(Field::new("metadata", DataType::Utf8, true));
        Arc::new(Schema::new(fields))
    }

    async fn table_exists(&self) -> Result<bool> {
        let names = self.conn.table_names().execute().await?;
        Ok(names.contains(&self.table_name))
    }

    async fn create_table(&self) -> Result<()> {
        self.conn
            .create_empty_table(&self.table_name, Self::create_schema(self.vector_size))
            .execute()
            .await
            .context("Failed to create LanceDB table")?;
        Ok(())
    }

    async fn table(&self) -> Result<Table> {
        self.conn
            .open_table(&self.table_name)
            .execute()
            .await
            .with_context(|| format!("Failed to open LanceDB table '{}'", self.table_name))
    }

    fn record_batch(&self, documents: &[Document]) -> Result<RecordBatch> {
        for document in documents {
            ensure!(
                document.embedding.len() == self.vector_size,
                "document {} has {} dimensions, table expects {}",
                document.id,
                document.embedding.len(),
                self.vector_size
            );
        }

        let ids = StringArray::from_iter_values(documents.iter().map(|d| d.id.as_str()));
        let contents = StringArray::from_iter_values(documents.iter().map(|d| d.content.as_str()));

        let values = Float32Array::from_iter_values(
            documents.iter().flat_map(|d| d.embedding.iter().copied()),
        );
        let vectors = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.vector_size as i32,
            Arc::new(values),
            None,
        )
        .context("Failed to build vector column")?;

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(ids),
            Arc::new(contents),
            Arc::new(vectors),
        ];
        for name in FILTER_COLUMNS {
            let column: StringArray = documents
                .iter()
                .map(|d| d.metadata.get(name).map(|v| v.as_str()))
                .collect();
            columns.push(Arc::new(column));
        }
        let metadata = documents
            .iter()
            .map(|d| serde_json::to_string(&d.metadata).map(Some))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        columns.push(Arc::new(StringArray::from(metadata)));

        RecordBatch::try_new(Self::create_schema(self.vector_size), columns)
            .context("Failed to create record batch")
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing '{name}' column"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("Failed to cast '{name}' to StringArray"))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Translates a metadata filter into a LanceDB SQL predicate.
///
/// Only the dedicated filter columns can be referenced.
fn filter_to_sql(filter: &MetadataFilter) -> Result<String> {
    fn column(key: &str) -> Result<&str> {
        match FILTER_COLUMNS.iter().find(|c| **c == key) {
            Some(c) => Ok(*c),
            None => bail!("metadata field '{key}' is not filterable"),
        }
    }

    Ok(match filter {
        MetadataFilter::Eq { key, value } => format!("{} = {}", column(key)?, quote(value)),
        MetadataFilter::In { key, values } if values.is_empty() => {
            column(key)?;
            "false".to_string()
        }
        MetadataFilter::In { key, values } => {
            let values: Vec<String> = values.iter().map(|v| quote(v)).collect();
            format!("{} IN ({})", column(key)?, values.join(", "))
        }
        MetadataFilter::And(filters) if filters.is_empty() => "true".to_string(),
        MetadataFilter::Or(filters) if filters.is_empty() => "false".to_string(),
        MetadataFilter::And(filters) => join_sql(filters, " AND ")?,
        MetadataFilter::Or(filters) => join_sql(filters, " OR ")?,
    })
}

fn join_sql(filters: &[MetadataFilter], op: &str) -> Result<String> {
    let parts = filters
        .iter()
        .map(|f| filter_to_sql(f).map(|sql| format!("({sql})")))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(op))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, source: &str, embedding: Vec<f32>) -> Document {
        Document::new(id, format!("content of {id}"), embedding)
            .with_metadata("source", source)
            .with_metadata("chunk_index", "0")
    }

    async fn store(dir: &tempfile::TempDir) -> LanceDbStore {
        let path = dir.path().join("lancedb");
        LanceDbStore::new(&path.to_string_lossy(), "test_docs", 3)
            .await
            .unwrap()
    }

    #[test]
    fn test_filter_to_sql() {
        let filter = MetadataFilter::visible_to("o'neil", "acme");
        assert_eq!(
            filter_to_sql(&filter).unwrap(),
            "((user_id = 'o''neil') AND (visibility = 'personal')) OR ((org_id = 'acme') AND (visibility = 'org-wide'))"
        );
        assert_eq!(
            filter_to_sql(&MetadataFilter::any_of("file_type", vec!["md".into(), "txt".into()])).unwrap(),
            "file_type IN ('md', 'txt')"
        );
        assert!(filter_to_sql(&MetadataFilter::eq("department", "hr")).is_err());
    }

    #[tokio::test]
    async fn test_add_search_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        store
            .add(vec![
                doc("a", "a.txt", vec![1.0, 0.0, 0.0]),
                doc("b", "b.txt", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();
        store.add(vec![doc("a", "a.txt", vec![1.0, 0.0, 0.0])]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let results = store.search(&[1.0, 0.0, 0.0], 1, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[0].source(), Some("a.txt"));
        assert_eq!(results[0].metadata.get("chunk_index").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_filtered_search_and_source_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store
            .add(vec![
                doc("a", "docs/a.md", vec![1.0, 0.0, 0.0]),
                doc("b", "docs/b.md", vec![1.0, 0.1, 0.0]),
                doc("c", "c.txt", vec![1.0, 0.2, 0.0]),
            ])
            .await
            .unwrap();

        let filter = MetadataFilter::eq("source", "c.txt");
        let results = store.search(&[1.0, 0.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "c");

        assert_eq!(store.sources().await.unwrap(), vec!["c.txt", "docs/a.md", "docs/b.md"]);
        assert_eq!(store.remove_by_source("docs").await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_recreates_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.add(vec![doc("a", "a.txt", vec![1.0, 0.0, 0.0])]).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.search(&[1.0, 0.0, 0.0], 3, None).await.unwrap().is_empty());

        store.drop_index().await.unwrap();
        assert!(store.count().await.is_err());
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        assert!(store.add(vec![doc("a", "a.txt", vec![1.0, 0.0])]).await.is_err());
    }
}

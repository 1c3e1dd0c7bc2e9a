//! Batch ingestion of document directories and single uploads.

use super::loader::{DocumentLoader, LoadError};
use super::types::{Chunk, Visibility};
use super::{ChunkError, IndexError, IndexStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Result of ingesting a directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub files_loaded: usize,
    pub chunks_added: usize,
    pub skipped: Vec<(PathBuf, String)>,
    pub total_count: usize,
}

/// Who owns an uploaded document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOwner {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

/// Result of a single upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    pub filename: String,
    pub chunks_added: usize,
    pub total_count: usize,
}

/// Feeds documents into an [`IndexStore`].
#[derive(Clone)]
pub struct Ingestor {
    index: Arc<IndexStore>,
    loader: DocumentLoader,
}

impl Ingestor {
    pub fn new(index: Arc<IndexStore>, loader: DocumentLoader) -> Self {
        Self { index, loader }
    }

    /// Loads every supported file under `dir` and indexes it.
    ///
    /// Each file replaces whatever an earlier ingestion stored under the same
    /// source. Files that fail to load are reported in `skipped`; an index
    /// failure aborts the run.
    pub async fn ingest_directory(
        &self,
        dir: &Path,
        use_markdown_separator: bool,
        reset_first: bool,
    ) -> Result<IngestReport> {
        if reset_first {
            info!("Resetting index before ingestion");
            self.index.reset().await?;
        }

        let loaded = self.loader.load_directory(dir, use_markdown_separator).await?;
        let chunks_added = self.replace_sources(loaded.chunks).await?;
        let total_count = self.index.count().await;

        info!(
            files = loaded.files_loaded,
            chunks = chunks_added,
            total = total_count,
            "Ingestion complete"
        );

        Ok(IngestReport {
            files_loaded: loaded.files_loaded,
            chunks_added,
            skipped: loaded.skipped,
            total_count,
        })
    }

    /// Indexes an uploaded document under `filename`, tagged with its owner.
    /// `content` is the raw file, so PDF and DOCX uploads work like text.
    ///
    /// Missing owner fields default to `anonymous` / `default`. A previous
    /// upload with the same filename is replaced.
    pub async fn ingest_upload(&self, filename: &str, content: Vec<u8>, owner: UploadOwner) -> Result<UploadReport> {
        let file_type = self
            .loader
            .supported_extension(filename)
            .ok_or_else(|| IngestError::UnsupportedFile(filename.to_string()))?;

        info!(filename, "Processing uploaded file");

        let text = self.loader.extract(&file_type, content).await?;
        let mut chunks = self.loader.chunk_document(&text, filename, &file_type, false)?;
        let user_id = owner.user_id.unwrap_or_else(|| "anonymous".to_string());
        let org_id = owner.org_id.unwrap_or_else(|| "default".to_string());
        for chunk in &mut chunks {
            chunk.metadata.user_id = Some(user_id.clone());
            chunk.metadata.org_id = Some(org_id.clone());
            chunk.metadata.visibility = Some(owner.visibility);
        }

        let chunks_added = self.index.replace_source(filename, chunks).await?;
        let total_count = self.index.count().await;
        info!(filename, chunks = chunks_added, "Upload indexed");

        Ok(UploadReport {
            filename: filename.to_string(),
            chunks_added,
            total_count,
        })
    }

    /// Replaces each source's stored chunks with the freshly loaded ones.
    /// Same-named files from different subdirectories share one source and
    /// are written together.
    async fn replace_sources(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let mut documents: Vec<(String, Vec<Chunk>)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for chunk in chunks {
            let source = chunk.metadata.source.clone();
            let position = *positions.entry(source.clone()).or_insert_with(|| {
                documents.push((source, Vec::new()));
                documents.len() - 1
            });
            documents[position].1.push(chunk);
        }

        let mut added = 0;
        for (source, chunks) in documents {
            added += self.index.replace_source(&source, chunks).await?;
        }
        Ok(added)
    }
}

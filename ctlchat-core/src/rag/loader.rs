//! Document collection and chunking for ingestion.
//!
//! Walks a directory tree, keeps files with supported extensions (plain text,
//! markdown, PDF, DOCX), normalizes their text and turns each one into
//! metadata-tagged [`Chunk`]s.

use super::chunker::{chunk_by_markdown_separator, chunk_text, clean_text, ChunkError};
use super::extract::{extract_text, ExtractError};
use super::types::{Chunk, ChunkMetadata};
use crate::config::RagConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors that can occur while loading a single document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Text extraction aborted: {0}")]
    ExtractTask(String),

    #[error("Unsupported file format: {0}")]
    Unsupported(String),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

pub type Result<T> = std::result::Result<T, LoadError>;

/// Outcome of loading a directory: chunks from every good file plus the files
/// that were skipped and why.
#[derive(Debug, Default)]
pub struct LoadedDirectory {
    pub chunks: Vec<Chunk>,
    pub files_loaded: usize,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Loads text documents and chunks them with the configured policy.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    extensions: Vec<String>,
    exclude_patterns: Vec<String>,
    chunk_size: usize,
    chunk_overlap: usize,
    markdown_separator: String,
}

impl DocumentLoader {
    pub fn new(config: &RagConfig) -> Self {
        Self {
            extensions: config
                .loader
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_patterns: config.loader.exclude_patterns.clone(),
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            markdown_separator: config.markdown_separator.clone(),
        }
    }

    /// Lower-cased extension of `name` if it is one we can ingest.
    pub fn supported_extension(&self, name: &str) -> Option<String> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_lowercase();
        self.extensions.contains(&extension).then_some(extension)
    }

    /// Recursively loads every supported file under `dir`.
    ///
    /// `use_markdown_separator` applies to the whole directory: markdown files
    /// are split on the section separator, everything else uses the window.
    /// A file that fails to load is logged and skipped.
    pub async fn load_directory(&self, dir: &Path, use_markdown_separator: bool) -> Result<LoadedDirectory> {
        if !dir.is_dir() {
            return Err(LoadError::NotADirectory(dir.to_path_buf()));
        }

        info!(dir = %dir.display(), "Loading documents (including all subdirectories)");
        let mut loaded = LoadedDirectory::default();

        for path in self.collect_files(dir) {
            match self.load_file(&path, use_markdown_separator).await {
                Ok(chunks) => {
                    debug!(file = %path.display(), chunks = chunks.len(), "Loaded file");
                    loaded.files_loaded += 1;
                    loaded.chunks.extend(chunks);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping file");
                    loaded.skipped.push((path, e.to_string()));
                }
            }
        }

        info!(
            files = loaded.files_loaded,
            chunks = loaded.chunks.len(),
            skipped = loaded.skipped.len(),
            "Finished loading documents"
        );
        Ok(loaded)
    }

    /// Reads and chunks a single file. `source` is the file name.
    pub async fn load_file(&self, path: &Path, use_markdown_separator: bool) -> Result<Vec<Chunk>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let extension = self
            .supported_extension(&name)
            .ok_or_else(|| LoadError::Unsupported(name.clone()))?;

        let bytes = tokio::fs::read(path).await?;
        let content = self.extract(&extension, bytes).await?;
        let mut chunks = self.chunk_document(&content, &name, &extension, use_markdown_separator)?;
        let file_path = path.display().to_string();
        for chunk in &mut chunks {
            chunk.metadata.file_path = Some(file_path.clone());
        }
        Ok(chunks)
    }

    /// Turns raw file bytes into text. Parsing runs on the blocking pool, and
    /// a parser panic on a malformed file is reported as an error.
    pub async fn extract(&self, file_type: &str, bytes: Vec<u8>) -> Result<String> {
        let file_type = file_type.to_string();
        let text = tokio::task::spawn_blocking(move || extract_text(&file_type, bytes))
            .await
            .map_err(|e| LoadError::ExtractTask(e.to_string()))??;
        Ok(text)
    }

    /// Normalizes and chunks already-loaded text.
    pub fn chunk_document(
        &self,
        text: &str,
        source: &str,
        file_type: &str,
        use_markdown_separator: bool,
    ) -> std::result::Result<Vec<Chunk>, ChunkError> {
        let content = clean_text(text);
        let pieces = if use_markdown_separator && file_type == "md" {
            chunk_by_markdown_separator(&content, &self.markdown_separator)?
        } else {
            chunk_text(&content, self.chunk_size, self.chunk_overlap)?
        };

        let total = pieces.len();
        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| Chunk::new(piece, ChunkMetadata::new(source, i, total, file_type)))
            .collect())
    }

    fn collect_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry.path()))
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                let supported = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| self.supported_extension(n))
                    .is_some();
                if !supported {
                    debug!(file = %path.display(), "Skipping unsupported file");
                }
                supported
            })
            .collect();
        files.sort();
        files
    }

    fn is_excluded(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.exclude_patterns.iter().any(|p| p == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::extract::fixtures;
    use std::fs;

    fn loader(chunk_size: usize, overlap: usize) -> DocumentLoader {
        let config = RagConfig {
            chunk_size,
            chunk_overlap: overlap,
            ..RagConfig::default()
        };
        DocumentLoader::new(&config)
    }

    #[tokio::test]
    async fn test_load_directory_filters_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pto.txt"), "Company X offers   15 days\n\nPTO.").unwrap();
        fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/skip.txt"), "ignored").unwrap();
        fs::create_dir(dir.path().join("policies")).unwrap();
        fs::write(dir.path().join("policies/leave.md"), "## Leave\nTake it.").unwrap();

        let loaded = loader(1000, 200).load_directory(dir.path(), false).await.unwrap();

        assert_eq!(loaded.files_loaded, 2);
        assert!(loaded.skipped.is_empty());
        let pto = loaded
            .chunks
            .iter()
            .find(|c| c.metadata.source == "pto.txt")
            .unwrap();
        assert_eq!(pto.content, "Company X offers 15 days PTO.");
        assert_eq!(pto.metadata.file_type, "txt");
        assert_eq!(pto.metadata.total_chunks, 1);
        assert!(pto.metadata.file_path.as_deref().unwrap().ends_with("pto.txt"));
        assert!(loaded.chunks.iter().all(|c| c.metadata.source != "skip.txt"));
    }

    #[tokio::test]
    async fn test_load_directory_reads_pdf_and_docx() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("benefits.pdf"), fixtures::pdf("Company X offers 15 days PTO.")).unwrap();
        fs::write(
            dir.path().join("handbook.docx"),
            fixtures::docx(&["Remote work is allowed.", "Core hours are 10 to 4."]),
        )
        .unwrap();
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4 truncated").unwrap();

        let loaded = loader(1000, 200).load_directory(dir.path(), false).await.unwrap();

        assert_eq!(loaded.files_loaded, 2);
        assert_eq!(loaded.skipped.len(), 1);
        assert!(loaded.skipped[0].0.ends_with("broken.pdf"));

        let docx = loaded
            .chunks
            .iter()
            .find(|c| c.metadata.source == "handbook.docx")
            .unwrap();
        assert_eq!(docx.content, "Remote work is allowed. Core hours are 10 to 4.");
        assert_eq!(docx.metadata.file_type, "docx");

        let pdf = loaded
            .chunks
            .iter()
            .find(|c| c.metadata.source == "benefits.pdf")
            .unwrap();
        assert!(pdf.content.contains("15 days PTO"));
        assert_eq!(pdf.metadata.file_type, "pdf");
    }

    #[tokio::test]
    async fn test_markdown_mode_applies_to_md_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("guide.md"), "## One\nfirst ## Two\nsecond").unwrap();
        fs::write(dir.path().join("notes.txt"), "a ## b").unwrap();

        let loaded = loader(1000, 0).load_directory(dir.path(), true).await.unwrap();
        let md: Vec<&str> = loaded
            .chunks
            .iter()
            .filter(|c| c.metadata.file_type == "md")
            .map(|c| c.content.as_str())
            .collect();
        assert_eq!(md, vec!["One first", "Two second"]);

        let txt: Vec<&str> = loaded
            .chunks
            .iter()
            .filter(|c| c.metadata.file_type == "txt")
            .map(|c| c.content.as_str())
            .collect();
        assert_eq!(txt, vec!["a ## b"]);
    }

    #[tokio::test]
    async fn test_bad_parameters_skip_every_file_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "text").unwrap();

        let loaded = loader(10, 10).load_directory(dir.path(), false).await.unwrap();
        assert_eq!(loaded.files_loaded, 0);
        assert_eq!(loaded.skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let err = loader(10, 2)
            .load_directory(Path::new("/definitely/not/here"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NotADirectory(_)));
    }

    #[test]
    fn test_supported_extension() {
        let loader = loader(10, 2);
        assert_eq!(loader.supported_extension("Guide.MD").as_deref(), Some("md"));
        assert_eq!(loader.supported_extension("report.pdf").as_deref(), Some("pdf"));
        assert_eq!(loader.supported_extension("Offer.DOCX").as_deref(), Some("docx"));
        assert_eq!(loader.supported_extension("slides.pptx"), None);
        assert_eq!(loader.supported_extension("README"), None);
    }
}

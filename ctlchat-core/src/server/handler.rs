use super::types::{Request, RequestType, StreamChunk};
use crate::chat::{QueryOptions, RagEngine, StreamingAnswer};
use crate::config::Config;
use crate::rag::{Ingestor, UploadOwner};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type ChunkSender = mpsc::UnboundedSender<StreamChunk>;

/// Handles different request types and sends responses via channel.
pub struct RequestHandler {
    config: Config,
    engine: Arc<RagEngine>,
    ingestor: Ingestor,
}

impl RequestHandler {
    pub fn new(config: Config, engine: Arc<RagEngine>, ingestor: Ingestor) -> Self {
        Self {
            config,
            engine,
            ingestor,
        }
    }

    /// Routes request to appropriate handler based on type.
    pub async fn handle(&self, request: Request, sender: ChunkSender) {
        info!(request_type = ?request.request_type, "Handling request");
        match request.request_type {
            RequestType::Chat => self.handle_chat(request, sender).await,
            RequestType::Conversation => self.handle_conversation(request, sender).await,
            RequestType::Ingest => self.handle_ingest(request, sender).await,
            RequestType::Upload => self.handle_upload(request, sender).await,
            RequestType::Stats => self.handle_stats(sender).await,
            RequestType::Reset => self.handle_reset(sender).await,
        }
    }

    async fn handle_chat(&self, request: Request, sender: ChunkSender) {
        if request.content.trim().is_empty() {
            let _ = sender.send(StreamChunk::error("Query must not be empty"));
            return;
        }

        let options = QueryOptions {
            top_k: request.top_k,
            enhance: request.enhance,
            filter: request.filter,
            history: request.history.unwrap_or_default(),
        };

        let started = match request.conversation_id {
            Some(id) => self.engine.chat_stream(id, &request.content, &options).await,
            None => self.engine.query_stream(&request.content, &options).await,
        };

        let StreamingAnswer {
            sources, mut stream, ..
        } = match started {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Chat request failed");
                let _ = sender.send(StreamChunk::error(e.to_string()));
                return;
            }
        };

        let _ = sender.send(StreamChunk::sources(sources));

        let mut full_response = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => {
                    full_response.push_str(&text);
                    let _ = sender.send(StreamChunk::chunk(text));
                }
                Err(e) => {
                    warn!(error = %e, "Streaming response failed");
                    let _ = sender.send(StreamChunk::error(e.to_string()));
                    return;
                }
            }
        }

        let _ = sender.send(StreamChunk::done(full_response));
    }

    async fn handle_conversation(&self, request: Request, sender: ChunkSender) {
        let title = Some(request.content.as_str()).filter(|t| !t.trim().is_empty());
        match self.engine.conversations().create(title).await {
            Ok(id) => {
                let _ = sender.send(StreamChunk::done(json!({ "conversation_id": id }).to_string()));
            }
            Err(e) => {
                let _ = sender.send(StreamChunk::error(format!("Failed to create conversation: {}", e)));
            }
        }
    }

    async fn handle_ingest(&self, request: Request, sender: ChunkSender) {
        let dir = if request.content.trim().is_empty() {
            self.config.rag.data_dir.clone()
        } else {
            PathBuf::from(&request.content)
        };

        match self
            .ingestor
            .ingest_directory(&dir, request.markdown, request.reset)
            .await
        {
            Ok(report) => {
                let _ = sender.send(StreamChunk::done(format!(
                    "Indexed {} chunks from {} files in {} ({} skipped, {} total)",
                    report.chunks_added,
                    report.files_loaded,
                    dir.display(),
                    report.skipped.len(),
                    report.total_count
                )));
            }
            Err(e) => {
                let _ = sender.send(StreamChunk::error(format!("Failed to ingest: {}", e)));
            }
        }
    }

    async fn handle_upload(&self, request: Request, sender: ChunkSender) {
        let filename = request.filename.clone().or_else(|| {
            request
                .path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
        });
        let Some(filename) = filename else {
            let _ = sender.send(StreamChunk::error("Upload requires a filename"));
            return;
        };

        let content = match &request.path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = sender.send(StreamChunk::error(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    )));
                    return;
                }
            },
            None => request.content.into_bytes(),
        };

        let owner = UploadOwner {
            user_id: request.user_id,
            org_id: request.org_id,
            visibility: request.visibility.unwrap_or_default(),
        };

        match self.ingestor.ingest_upload(&filename, content, owner).await {
            Ok(report) => {
                let _ = sender.send(StreamChunk::done(format!(
                    "Added {} chunks from {} ({} total)",
                    report.chunks_added, report.filename, report.total_count
                )));
            }
            Err(e) => {
                let _ = sender.send(StreamChunk::error(format!("Failed to upload: {}", e)));
            }
        }
    }

    async fn handle_stats(&self, sender: ChunkSender) {
        let stats = json!({
            "total_documents": self.engine.index().count().await,
            "collection_name": self.config.storage.vector_db.collection_name,
            "embedding_model": self.config.rag.embedding.model,
        });
        let _ = sender.send(StreamChunk::done(stats.to_string()));
    }

    async fn handle_reset(&self, sender: ChunkSender) {
        match self.engine.index().reset().await {
            Ok(()) => {
                let _ = sender.send(StreamChunk::done("Knowledge base reset"));
            }
            Err(e) => {
                let _ = sender.send(StreamChunk::error(format!("Failed to reset: {}", e)));
            }
        }
    }
}

//! Unix socket server for the chatbot backend.
//!
//! The server is organized into separate concerns:
//! - `types`: Protocol types for requests and responses
//! - `handler`: Business logic for processing requests
//! - `transport`: Unix socket communication layer
//!
//! Every connection carries one JSON request line and receives JSON
//! [`StreamChunk`] lines until the server closes it. Connections are served
//! on their own tasks, so a slow LLM call never holds up other clients.

mod handler;
mod transport;
mod types;

pub use handler::RequestHandler;
pub use transport::{send_request, TransportError, UnixSocketTransport};
pub use types::{ChunkType, Request, RequestType, StreamChunk};

use crate::chat::{EngineError, InMemoryConversationStore, RagEngine};
use crate::config::{Config, ConfigError};
use crate::provider;
use crate::rag::{embedder_from_config, DocumentLoader, IndexError, IndexStore, Ingestor};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Main server coordinating transport and request handling.
pub struct Server {
    handler: Arc<RequestHandler>,
    transport: UnixSocketTransport,
}

impl Server {
    pub fn new(handler: RequestHandler, socket_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            handler: Arc::new(handler),
            transport: UnixSocketTransport::new(socket_path),
        }
    }

    /// Builds the provider, index and engine described by `config`.
    pub async fn from_config(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let provider = provider::from_config(&config.llm)?;
        let index = Arc::new(IndexStore::open(&config, embedder_from_config(&config)).await?);
        let engine = RagEngine::new(
            &config,
            provider,
            index.clone(),
            Arc::new(InMemoryConversationStore::new()),
        )?;
        let ingestor = Ingestor::new(index, DocumentLoader::new(&config.rag));

        let socket_path = config.server.socket_path.clone();
        let handler = RequestHandler::new(config, Arc::new(engine), ingestor);
        Ok(Self::new(handler, socket_path))
    }

    /// Serves until Ctrl-C.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.run_until(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Serves until `shutdown` completes, then removes the socket file.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.transport.bind().await?;
        info!(socket = %self.transport.socket_path().display(), "Server listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    error!(error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down");
                    self.transport.cleanup();
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handles a single client connection.
async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    handler: Arc<RequestHandler>,
) -> Result<(), TransportError> {
    let request = match transport::read_request(&mut stream).await {
        Ok(request) => request,
        Err(TransportError::Json(e)) => {
            let (sender, receiver) = mpsc::unbounded_channel();
            let _ = sender.send(StreamChunk::error(format!("Invalid request: {}", e)));
            drop(sender);
            return transport::write_chunks(&mut stream, receiver).await;
        }
        Err(e) => return Err(e),
    };

    let (sender, receiver) = mpsc::unbounded_channel();

    let handle_task = tokio::spawn(async move {
        handler.handle(request, sender).await;
    });

    let write_task = tokio::spawn(async move { transport::write_chunks(&mut stream, receiver).await });

    let (handled, written) = tokio::join!(handle_task, write_task);
    if let Err(e) = handled {
        error!(error = %e, "Request handler panicked");
    }
    match written {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Writer task panicked");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_index, ScriptedProvider};
    use tokio::sync::oneshot;

    fn server(socket_path: std::path::PathBuf) -> Server {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".to_string());
        config.query.enhance = false;

        let index = Arc::new(memory_index());
        let engine = RagEngine::new(
            &config,
            Arc::new(ScriptedProvider::replying("").with_stream(["Hello", " there"])),
            index.clone(),
            Arc::new(InMemoryConversationStore::new()),
        )
        .unwrap();
        let ingestor = Ingestor::new(index, DocumentLoader::new(&config.rag));
        Server::new(RequestHandler::new(config, Arc::new(engine), ingestor), socket_path)
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ctlchat.sock");
        let server = Arc::new(server(socket_path.clone()));

        let (stop, stopped) = oneshot::channel::<()>();
        let running = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .run_until(async {
                        let _ = stopped.await;
                    })
                    .await
            })
        };

        while !socket_path.exists() {
            tokio::task::yield_now().await;
        }

        let chunks = send_request(&socket_path, &Request::new(RequestType::Chat, "hi"))
            .await
            .unwrap();
        let types: Vec<ChunkType> = chunks.iter().map(|c| c.chunk_type).collect();
        assert_eq!(
            types,
            vec![ChunkType::Sources, ChunkType::Chunk, ChunkType::Chunk, ChunkType::Done]
        );
        assert_eq!(chunks[3].content, "Hello there");

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}

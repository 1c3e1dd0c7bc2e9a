use super::types::{Request, StreamChunk};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed before a request was received")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Unix socket transport for IPC communication.
pub struct UnixSocketTransport {
    socket_path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds to the Unix socket, replacing a stale socket file.
    pub async fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        Ok(listener)
    }

    /// Cleans up the socket file.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Reads a single request line from the stream.
pub async fn read_request(stream: &mut UnixStream) -> Result<Request> {
    let (reader, _) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Err(TransportError::Closed);
    }
    let request = serde_json::from_str(&line)?;

    Ok(request)
}

/// Writes stream chunks to the client, one JSON object per line.
pub async fn write_chunks(
    stream: &mut UnixStream,
    mut receiver: mpsc::UnboundedReceiver<StreamChunk>,
) -> Result<()> {
    while let Some(chunk) = receiver.recv().await {
        write_line(stream, &chunk).await?;
    }

    Ok(())
}

/// Sends `request` to a running server and collects every response chunk.
pub async fn send_request(socket_path: impl AsRef<Path>, request: &Request) -> Result<Vec<StreamChunk>> {
    let mut stream = UnixStream::connect(socket_path).await?;
    write_line(&mut stream, request).await?;

    let mut lines = BufReader::new(stream).lines();
    let mut chunks = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        chunks.push(serde_json::from_str(&line)?);
    }
    Ok(chunks)
}

async fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    stream.write_all(json.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

use crate::chat::SourceRef;
use crate::provider::Message;
use crate::rag::{MetadataFilter, Visibility};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// Answer `content`, optionally inside a stored conversation
    Chat,
    /// Start a conversation titled `content`
    Conversation,
    /// Ingest the directory in `content` (or the configured data dir)
    Ingest,
    /// Index `content` as the text of `filename`, or the file at `path`
    Upload,
    Stats,
    Reset,
}

/// Request from client to server, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Message>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhance: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MetadataFilter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Local file to upload instead of inline `content` (PDF, DOCX, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,

    #[serde(default)]
    pub markdown: bool,

    #[serde(default)]
    pub reset: bool,
}

impl Request {
    pub fn new(request_type: RequestType, content: impl Into<String>) -> Self {
        Self {
            request_type,
            content: content.into(),
            conversation_id: None,
            history: None,
            top_k: None,
            enhance: None,
            filter: None,
            filename: None,
            path: None,
            user_id: None,
            org_id: None,
            visibility: None,
            markdown: false,
            reset: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Chunk,
    Sources,
    Done,
    Error,
}

/// Streaming response chunk sent to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self {
            chunk_type: ChunkType::Chunk,
            content: content.into(),
            sources: None,
            error: None,
        }
    }

    pub fn sources(sources: Vec<SourceRef>) -> Self {
        Self {
            chunk_type: ChunkType::Sources,
            content: String::new(),
            sources: Some(sources),
            error: None,
        }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self {
            chunk_type: ChunkType::Done,
            content: content.into(),
            sources: None,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            chunk_type: ChunkType::Error,
            content: String::new(),
            sources: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_request_parses() {
        let request: Request = serde_json::from_str(r#"{"type": "chat", "content": "PTO?"}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Chat);
        assert_eq!(request.content, "PTO?");
        assert!(request.conversation_id.is_none());
        assert!(!request.markdown);

        let stats: Request = serde_json::from_str(r#"{"type": "stats"}"#).unwrap();
        assert_eq!(stats.request_type, RequestType::Stats);
    }

    #[test]
    fn test_chunk_wire_format() {
        let json = serde_json::to_value(StreamChunk::chunk("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "chunk", "content": "hi"}));

        let json = serde_json::to_value(StreamChunk::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "boom");
    }
}

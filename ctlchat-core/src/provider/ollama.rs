//! Ollama provider implementation.
//!
//! This module provides an Ollama HTTP API client that implements the Provider trait.
//! It serves chat completions through `/api/chat` and embeddings through `/api/embed`.

use super::stream::{line_stream, LineEvent};
use super::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ollama HTTP API provider.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    base_url: String,
    http_client: reqwest::Client,
}

impl OllamaProvider {
    /// Creates a new Ollama provider pointed at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    async fn post_chat(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);

        // Convert to Ollama-specific request format
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OllamaMessage {
                role: Role::System.as_str().to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| OllamaMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        let mut options = HashMap::new();
        options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));

        let ollama_request = OllamaChatRequest {
            model: request.model.clone(),
            messages,
            options: Some(options),
            stream,
        };

        let response = self.http_client.post(&url).json(&ollama_request).send().await?;
        check_status(response).await
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new("http://localhost:11434")
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: error_text,
    })
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let response = self.post_chat(&request, false).await?;
        let body: OllamaChatResponse = response.json().await?;
        Ok(body.message.content)
    }

    async fn stream(&self, request: ChatRequest) -> Result<TextStream> {
        let response = self.post_chat(&request, true).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
        Ok(line_stream(body, parse_chat_line))
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let embed_request = EmbedRequest {
            model: model.to_string(),
            input: texts.to_vec(),
        };

        let response = self.http_client.post(&url).json(&embed_request).send().await?;
        let response = check_status(response).await?;
        let embed_response = response.json::<EmbedResponse>().await?;

        if embed_response.embeddings.len() != texts.len() {
            return Err(ProviderError::Other(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embed_response.embeddings.len()
            )));
        }
        Ok(embed_response.embeddings)
    }
}

/// Parses one NDJSON line of a streamed `/api/chat` response.
fn parse_chat_line(line: &str) -> LineEvent {
    if let Ok(err) = serde_json::from_str::<OllamaError>(line) {
        return LineEvent::Error(err.error);
    }
    match serde_json::from_str::<OllamaChatResponse>(line) {
        Ok(response) if response.done => {
            // The final object may still carry trailing content.
            if response.message.content.is_empty() {
                LineEvent::Done
            } else {
                LineEvent::Last(response.message.content)
            }
        }
        Ok(response) => LineEvent::Text(response.message.content),
        Err(_) => LineEvent::Skip,
    }
}

// Ollama-specific request/response types (internal)

#[derive(Debug, Clone, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<HashMap<String, serde_json::Value>>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_line_fragment() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}"#;
        assert_eq!(parse_chat_line(line), LineEvent::Text("Hi".to_string()));
    }

    #[test]
    fn test_parse_chat_line_done() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true}"#;
        assert_eq!(parse_chat_line(line), LineEvent::Done);
    }

    #[test]
    fn test_parse_chat_line_done_with_content() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":"."},"done":true}"#;
        assert_eq!(parse_chat_line(line), LineEvent::Last(".".to_string()));
    }

    #[test]
    fn test_parse_chat_line_error() {
        let line = r#"{"error":"model not found"}"#;
        assert_eq!(
            parse_chat_line(line),
            LineEvent::Error("model not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_embed_empty_input_skips_request() {
        // Nothing listens on this port; an empty batch must not hit the network.
        let provider = OllamaProvider::new("http://127.0.0.1:9");
        let out = provider.embed(&[], "all-minilm").await.unwrap();
        assert!(out.is_empty());
    }
}

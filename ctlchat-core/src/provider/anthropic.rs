//! Anthropic Messages API provider.
//!
//! Single-shot completions parse the JSON response body; streamed completions
//! parse the server-sent event stream and yield `content_block_delta` text.

use super::stream::{line_stream, LineEvent};
use super::types::*;
use crate::config::{ConfigError, LlmConfig};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

/// Anthropic HTTP API provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl AnthropicProvider {
    /// Creates a provider from the LLM configuration.
    ///
    /// The API key must already be resolved (file or `ANTHROPIC_API_KEY`).
    pub fn new(config: &LlmConfig) -> std::result::Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("ANTHROPIC_API_KEY"))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            http_client: reqwest::Client::new(),
        })
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = AnthropicRequest::from_chat(request, stream);

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let body: AnthropicResponse = response.json().await?;

        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect();

        if text.is_empty() {
            return Err(ProviderError::Other("No response content".to_string()));
        }
        Ok(text)
    }

    async fn stream(&self, request: ChatRequest) -> Result<TextStream> {
        let response = self.send(&request, true).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
        Ok(line_stream(body, parse_sse_line))
    }
}

/// Parses one SSE line. Only `data:` lines carry payloads.
fn parse_sse_line(line: &str) -> LineEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return LineEvent::Skip;
    };
    let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(data.trim_start()) else {
        return LineEvent::Skip;
    };

    match event.event_type.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|d| d.text)
            .map(LineEvent::Text)
            .unwrap_or(LineEvent::Skip),
        "message_stop" => LineEvent::Done,
        "error" => LineEvent::Error(
            event
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "stream error".to_string()),
        ),
        _ => LineEvent::Skip,
    }
}

// Anthropic-specific request/response types (internal)

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    stream: bool,
}

impl AnthropicRequest {
    /// System-role turns are not accepted inside `messages`, so they are
    /// appended to the system instruction instead.
    fn from_chat(request: &ChatRequest, stream: bool) -> Self {
        let mut system_parts: Vec<&str> = request.system.iter().map(|s| s.as_str()).collect();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(&message.content),
                Role::User | Role::Assistant => messages.push(AnthropicMessage {
                    role: message.role.as_str().to_string(),
                    content: message.content.clone(),
                }),
            }
        }

        let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system,
            messages,
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<AnthropicErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_text_delta() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(parse_sse_line(line), LineEvent::Text("Hello".to_string()));
    }

    #[test]
    fn test_parse_sse_control_lines() {
        assert_eq!(parse_sse_line("event: content_block_delta"), LineEvent::Skip);
        assert_eq!(parse_sse_line(r#"data: {"type":"ping"}"#), LineEvent::Skip);
        assert_eq!(parse_sse_line(r#"data: {"type":"message_stop"}"#), LineEvent::Done);
    }

    #[test]
    fn test_parse_sse_error_event() {
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(parse_sse_line(line), LineEvent::Error("Overloaded".to_string()));
    }

    fn sse_body(lines: &[&str]) -> impl futures::Stream<Item = std::result::Result<Vec<u8>, ProviderError>> + Send + Unpin {
        let body: Vec<_> = lines.iter().map(|l| Ok(format!("{l}\n\n").into_bytes())).collect();
        futures::stream::iter(body)
    }

    #[tokio::test]
    async fn test_stream_cut_before_message_stop_is_an_error() {
        let delta = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"15 days"}}"#;

        let complete: Vec<Result<String>> = line_stream(
            sse_body(&[delta, r#"data: {"type":"message_stop"}"#]),
            parse_sse_line,
        )
        .collect()
        .await;
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].as_ref().unwrap(), "15 days");

        let cut: Vec<Result<String>> = line_stream(sse_body(&[delta]), parse_sse_line).collect().await;
        assert_eq!(cut.len(), 2);
        assert_eq!(cut[0].as_ref().unwrap(), "15 days");
        assert!(cut[1].is_err());
    }

    #[test]
    fn test_system_turns_fold_into_system_prompt() {
        let request = ChatRequest::new(
            "claude",
            vec![
                Message::system("Earlier summary"),
                Message::user("q1"),
                Message::assistant("a1"),
                Message::user("q2"),
            ],
        )
        .with_system("Answer from context");

        let body = AnthropicRequest::from_chat(&request, false);
        assert_eq!(body.system.as_deref(), Some("Answer from context\n\nEarlier summary"));
        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[1].role, "assistant");
    }

    #[test]
    fn test_new_rejects_blank_key() {
        let mut config = LlmConfig::default();
        config.api_key = Some("  ".to_string());
        assert!(AnthropicProvider::new(&config).is_err());
    }
}

//! Retrieval-augmented answering.
//!
//! One pass per request, nothing persisted except conversation messages:
//!
//! ```text
//! query (+ history) → enhance? → IndexStore::search → format_context → LLM → answer + sources
//! ```
//!
//! Retrieval failures degrade to an empty context. Generation failures are
//! returned to the caller as-is; they are never retried or papered over.

use super::context::ConversationContextBuilder;
use super::history::{ConversationStore, HistoryError};
use crate::config::{Config, ConfigError};
use crate::enhancer::{QueryEnhancement, QueryEnhancer};
use crate::provider::{
    complete_with_timeout, stream_with_timeout, ChatRequest, Message, Provider, ProviderError, Role, TextStream,
};
use crate::rag::{IndexError, IndexStore, MetadataFilter, SearchResult};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant. You answer questions based on the provided context from the knowledge base.

If the context contains relevant information, use it to provide accurate and detailed answers.
If the context doesn't contain enough information to answer the question, say so honestly.
Always be clear about what information comes from the provided context.";

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Generation failed: {0}")]
    Generation(ProviderError),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout(timeout) => EngineError::Timeout(timeout),
            other => EngineError::Generation(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A retrieved chunk as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    /// Leading characters of the chunk
    pub content: String,
    pub distance: f32,
}

impl SourceRef {
    pub fn from_result(result: &SearchResult) -> Self {
        let content = match result.content.char_indices().nth(PREVIEW_CHARS) {
            Some((cut, _)) => format!("{}...", &result.content[..cut]),
            None => result.content.clone(),
        };
        Self {
            source: result.source().unwrap_or("Unknown").to_string(),
            content,
            distance: result.distance,
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Falls back to the configured default
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Overrides `query.enhance`
    #[serde(default)]
    pub enhance: Option<bool>,
    /// Restricts retrieval, e.g. to what a user may see
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
    /// Earlier turns, prepended verbatim before the question
    #[serde(default)]
    pub history: Vec<Message>,
}

/// A complete answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub enhancement: Option<QueryEnhancement>,
}

/// An answer whose text is still being produced.
pub struct StreamingAnswer {
    pub sources: Vec<SourceRef>,
    pub enhancement: Option<QueryEnhancement>,
    /// Fragments in order; a mid-stream failure arrives as a trailing error
    pub stream: TextStream,
}

/// Retrieval plus generation over a shared [`IndexStore`].
pub struct RagEngine {
    provider: Arc<dyn Provider>,
    index: Arc<IndexStore>,
    enhancer: QueryEnhancer,
    context_builder: ConversationContextBuilder,
    conversations: Arc<dyn ConversationStore>,
    model: String,
    max_tokens: u32,
    temperature: f64,
    timeout: Duration,
    enhance_by_default: bool,
    related_terms_limit: usize,
    org_name: Option<String>,
}

impl RagEngine {
    /// Wires the engine from configuration.
    ///
    /// Fails with a configuration error when the LLM credential or model is
    /// missing.
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        index: Arc<IndexStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Result<Self> {
        config.llm.validate()?;

        info!(model = %config.llm.model, "RAG engine initialized");
        Ok(Self {
            enhancer: QueryEnhancer::from_config(provider.clone(), config),
            context_builder: ConversationContextBuilder::from_config(provider.clone(), config),
            provider,
            index,
            conversations,
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
            timeout: config.llm.timeout(),
            enhance_by_default: config.query.enhance,
            related_terms_limit: config.query.related_terms_limit,
            org_name: config.query.org_name.clone(),
        })
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    /// Searches with `query` as-is. Never fails; see [`IndexStore::search`].
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Vec<SearchResult> {
        self.index.search(query, top_k, filter).await
    }

    /// Single-shot answer to a standalone question.
    pub async fn query(&self, query: &str, options: &QueryOptions) -> Result<Answer> {
        info!(query = %preview(query), "Processing RAG query");
        let (results, enhancement) = self.retrieve_for(query, options, None).await;
        let context = format_context(&results);

        let response = self.generate(query, &context, &options.history, None).await?;
        Ok(Answer {
            response,
            sources: results.iter().map(SourceRef::from_result).collect(),
            enhancement,
        })
    }

    /// Streamed answer to a standalone question.
    pub async fn query_stream(&self, query: &str, options: &QueryOptions) -> Result<StreamingAnswer> {
        info!(query = %preview(query), "Processing streaming RAG query");
        let (results, enhancement) = self.retrieve_for(query, options, None).await;
        let context = format_context(&results);

        let stream = self.generate_stream(query, &context, &options.history, None).await?;
        Ok(StreamingAnswer {
            sources: results.iter().map(SourceRef::from_result).collect(),
            enhancement,
            stream,
        })
    }

    /// Answers `query` inside a stored conversation.
    ///
    /// The question and the answer are both appended. Older history is
    /// compacted into summaries that go into the system instruction; recent
    /// turns are sent verbatim.
    pub async fn chat(&self, conversation_id: u64, query: &str, options: &QueryOptions) -> Result<Answer> {
        let turn = self.prepare_turn(conversation_id, query, options).await?;
        let context = format_context(&turn.results);

        let response = self
            .generate(query, &context, &turn.history, Some(&turn.summaries))
            .await?;
        self.conversations
            .append(conversation_id, Role::Assistant, &response)
            .await?;

        Ok(Answer {
            response,
            sources: turn.results.iter().map(SourceRef::from_result).collect(),
            enhancement: turn.enhancement,
        })
    }

    /// Streaming [`chat`](Self::chat). The answer is stored once the stream
    /// completes without error.
    pub async fn chat_stream(
        &self,
        conversation_id: u64,
        query: &str,
        options: &QueryOptions,
    ) -> Result<StreamingAnswer> {
        let turn = self.prepare_turn(conversation_id, query, options).await?;
        let context = format_context(&turn.results);

        let inner = self
            .generate_stream(query, &context, &turn.history, Some(&turn.summaries))
            .await?;

        Ok(StreamingAnswer {
            sources: turn.results.iter().map(SourceRef::from_result).collect(),
            enhancement: turn.enhancement,
            stream: record_answer(inner, self.conversations.clone(), conversation_id),
        })
    }

    /// Generates an answer to `query` grounded in `context`.
    ///
    /// `history` is sent verbatim before the question. `summaries`, when
    /// non-empty, is appended to the system instruction.
    pub async fn generate(
        &self,
        query: &str,
        context: &str,
        history: &[Message],
        summaries: Option<&str>,
    ) -> Result<String> {
        let request = self.build_request(query, context, history, summaries);
        match complete_with_timeout(self.provider.as_ref(), request, self.timeout).await {
            Ok(answer) => {
                info!("Generated response successfully");
                Ok(answer)
            }
            Err(e) => {
                error!(error = %e, "Error generating response");
                Err(e.into())
            }
        }
    }

    /// Streaming [`generate`](Self::generate).
    pub async fn generate_stream(
        &self,
        query: &str,
        context: &str,
        history: &[Message],
        summaries: Option<&str>,
    ) -> Result<TextStream> {
        let request = self.build_request(query, context, history, summaries);
        stream_with_timeout(self.provider.as_ref(), request, self.timeout)
            .await
            .map_err(|e| {
                error!(error = %e, "Error in streaming response");
                e.into()
            })
    }

    async fn retrieve_for(
        &self,
        query: &str,
        options: &QueryOptions,
        conversation_context: Option<&str>,
    ) -> (Vec<SearchResult>, Option<QueryEnhancement>) {
        let enhancement = if options.enhance.unwrap_or(self.enhance_by_default) {
            Some(
                self.enhancer
                    .enhance(query, self.org_name.as_deref(), conversation_context)
                    .await,
            )
        } else {
            None
        };

        let search_query = match &enhancement {
            Some(e) => e.search_query(self.related_terms_limit),
            None => query.to_string(),
        };

        let results = self
            .retrieve(&search_query, options.top_k, options.filter.as_ref())
            .await;
        info!(count = results.len(), "Retrieved documents");
        (results, enhancement)
    }

    async fn prepare_turn(&self, conversation_id: u64, query: &str, options: &QueryOptions) -> Result<Turn> {
        let stored = self.conversations.messages(conversation_id).await?;
        self.conversations
            .append(conversation_id, Role::User, query)
            .await?;

        let messages: Vec<Message> = stored.iter().map(Message::from).collect();
        let context = self
            .context_builder
            .build(&messages, self.org_name.as_deref())
            .await;
        let formatted = self.context_builder.format(&context);
        let conversation_context = (!formatted.is_empty()).then_some(formatted.as_str());

        let (results, enhancement) = self.retrieve_for(query, options, conversation_context).await;

        Ok(Turn {
            summaries: context.format_summaries(),
            history: context.recent_messages,
            results,
            enhancement,
        })
    }

    fn build_request(&self, query: &str, context: &str, history: &[Message], summaries: Option<&str>) -> ChatRequest {
        let system = match summaries.filter(|s| !s.is_empty()) {
            Some(summaries) => format!("{SYSTEM_PROMPT}\n\n{summaries}"),
            None => SYSTEM_PROMPT.to_string(),
        };

        let mut messages = history.to_vec();
        messages.push(Message::user(user_message(query, context)));

        ChatRequest::new(self.model.clone(), messages)
            .with_system(system)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
    }
}

struct Turn {
    summaries: String,
    history: Vec<Message>,
    results: Vec<SearchResult>,
    enhancement: Option<QueryEnhancement>,
}

/// Renders results as `[Source i: name]` blocks separated by blank lines.
pub fn format_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            format!(
                "[Source {}: {}]\n{}",
                i + 1,
                result.source().unwrap_or("Unknown"),
                result.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn user_message(query: &str, context: &str) -> String {
    if context.is_empty() {
        format!(
            "No relevant context was found in the knowledge base.\n\n\
             User question: {query}\n\n\
             Please provide a helpful response, but note that this is based on general knowledge rather than specific documents."
        )
    } else {
        format!(
            "Context from knowledge base:\n{context}\n\n\
             User question: {query}\n\n\
             Please answer the question based on the context provided above."
        )
    }
}

fn preview(query: &str) -> String {
    query.chars().take(100).collect()
}

struct Recorder {
    inner: TextStream,
    answer: String,
    conversations: Arc<dyn ConversationStore>,
    conversation_id: u64,
}

/// Passes fragments through and stores the full answer at a clean end.
fn record_answer(inner: TextStream, conversations: Arc<dyn ConversationStore>, conversation_id: u64) -> TextStream {
    let recorder = Recorder {
        inner,
        answer: String::new(),
        conversations,
        conversation_id,
    };

    stream::unfold(Some(recorder), |state| async move {
        let mut recorder = state?;
        match recorder.inner.next().await {
            Some(Ok(fragment)) => {
                recorder.answer.push_str(&fragment);
                Some((Ok(fragment), Some(recorder)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                if let Err(e) = recorder
                    .conversations
                    .append(recorder.conversation_id, Role::Assistant, &recorder.answer)
                    .await
                {
                    warn!(error = %e, "Failed to store streamed answer");
                }
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::InMemoryConversationStore;
    use crate::rag::{Chunk, ChunkMetadata};
    use crate::test_support::{memory_index, ScriptedProvider};

    const ENHANCED: &str = r#"{"intent_type": "policy", "enhanced_query": "PTO paid time off days", "related_terms": ["vacation"], "reasoning": "r"}"#;

    fn config() -> Config {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".to_string());
        config.query.enhance = false;
        config
    }

    async fn engine_with(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, RagEngine) {
        let provider = Arc::new(provider);
        let index = Arc::new(memory_index());
        index
            .add(vec![
                Chunk::new("Company X offers 15 days PTO.", ChunkMetadata::new("pto.txt", 0, 1, "txt")),
                Chunk::new("The cafeteria opens at noon.", ChunkMetadata::new("food.txt", 0, 1, "txt")),
            ])
            .await
            .unwrap();
        let engine = RagEngine::new(
            &config(),
            provider.clone(),
            index,
            Arc::new(InMemoryConversationStore::new()),
        )
        .unwrap();
        (provider, engine)
    }

    #[tokio::test]
    async fn test_missing_credential_fails_fast() {
        let provider = Arc::new(ScriptedProvider::replying("x"));
        let result = RagEngine::new(
            &Config::default(),
            provider,
            Arc::new(memory_index()),
            Arc::new(InMemoryConversationStore::new()),
        );
        assert!(matches!(
            result,
            Err(EngineError::Configuration(ConfigError::MissingCredential(_)))
        ));
    }

    #[tokio::test]
    async fn test_pto_question_is_grounded() {
        let (provider, engine) = engine_with(ScriptedProvider::replying("You get 15 days.")).await;
        let answer = engine
            .query("How much PTO do we get?", &QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(answer.response, "You get 15 days.");
        assert_eq!(answer.sources[0].source, "pto.txt");
        assert!(answer.enhancement.is_none());

        let request = &provider.requests()[0];
        let user_turn = request.last_user_message().unwrap();
        assert!(user_turn.starts_with("Context from knowledge base:\n[Source 1: pto.txt]\n"));
        assert!(user_turn.contains("15 days PTO"));
        assert!(user_turn.contains("User question: How much PTO do we get?"));
        assert_eq!(request.system.as_deref(), Some(SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn test_empty_retrieval_uses_general_knowledge_wording() {
        let (provider, engine) = engine_with(ScriptedProvider::replying("ok")).await;
        let options = QueryOptions {
            filter: Some(MetadataFilter::eq("source", "missing.txt")),
            ..QueryOptions::default()
        };
        let answer = engine.query("anything", &options).await.unwrap();

        assert!(answer.sources.is_empty());
        let user_turn = provider.requests()[0].last_user_message().unwrap().to_string();
        assert!(user_turn.starts_with("No relevant context was found in the knowledge base."));
    }

    #[tokio::test]
    async fn test_history_is_prepended_verbatim() {
        let (provider, engine) = engine_with(ScriptedProvider::replying("ok")).await;
        let options = QueryOptions {
            history: vec![Message::user("earlier"), Message::assistant("reply")],
            ..QueryOptions::default()
        };
        engine.query("PTO?", &options).await.unwrap();

        let messages = &provider.requests()[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::user("earlier"));
        assert_eq!(messages[1], Message::assistant("reply"));
    }

    #[tokio::test]
    async fn test_generation_failure_propagates() {
        let (_, engine) = engine_with(ScriptedProvider::failing()).await;
        let err = engine.query("PTO?", &QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Generation(ProviderError::Api { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout() {
        let (_, engine) =
            engine_with(ScriptedProvider::replying("late").with_delay(Duration::from_secs(600))).await;
        let err = engine.query("PTO?", &QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_enhanced_query_drives_retrieval() {
        let (provider, engine) =
            engine_with(ScriptedProvider::replying("answer").with_replies([ENHANCED])).await;
        let options = QueryOptions {
            enhance: Some(true),
            top_k: Some(1),
            ..QueryOptions::default()
        };
        let answer = engine.query("how many days off?", &options).await.unwrap();

        let enhancement = answer.enhancement.unwrap();
        assert_eq!(enhancement.enhanced_query, "PTO paid time off days");
        assert_eq!(answer.sources[0].source, "pto.txt");
        assert_eq!(provider.requests().len(), 2);
        // The answer still addresses the user's own wording.
        assert!(provider.requests()[1]
            .last_user_message()
            .unwrap()
            .contains("User question: how many days off?"));
    }

    #[tokio::test]
    async fn test_stream_preserves_order_and_surfaces_failure() {
        let provider = ScriptedProvider::replying("")
            .with_stream(["You ", "get ", "15 ", "days"])
            .failing_stream_after(2);
        let (_, engine) = engine_with(provider).await;

        let answer = engine.query_stream("PTO?", &QueryOptions::default()).await.unwrap();
        let items: Vec<_> = answer.stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), "You ");
        assert_eq!(items[1].as_ref().unwrap(), "get ");
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_chat_records_both_turns() {
        let (provider, engine) = engine_with(ScriptedProvider::replying("15 days.")).await;
        let id = engine.conversations().create(None).await.unwrap();

        engine.chat(id, "How much PTO?", &QueryOptions::default()).await.unwrap();
        engine.chat(id, "And sick leave?", &QueryOptions::default()).await.unwrap();

        let stored = engine.conversations().messages(id).await.unwrap();
        let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["How much PTO?", "15 days.", "And sick leave?", "15 days."]);

        let second = &provider.requests()[1];
        assert_eq!(second.messages[0], Message::user("How much PTO?"));
        assert_eq!(second.messages[1], Message::assistant("15 days."));
        assert!(second.last_user_message().unwrap().contains("User question: And sick leave?"));
    }

    #[tokio::test]
    async fn test_long_chat_folds_summaries_into_system() {
        let (provider, engine) = engine_with(ScriptedProvider::replying("ok")).await;
        let id = engine.conversations().create(None).await.unwrap();
        for i in 0..11 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            engine.conversations().append(id, role, &format!("m{i}")).await.unwrap();
        }

        engine.chat(id, "next?", &QueryOptions::default()).await.unwrap();

        let requests = provider.requests();
        // Summary request, then the answer.
        assert_eq!(requests.len(), 2);
        let answer_request = &requests[1];
        let system = answer_request.system.as_deref().unwrap();
        assert!(system.starts_with(SYSTEM_PROMPT));
        assert!(system.contains("## Previous Conversation Summary\nSummary 1: ok"));
        assert_eq!(answer_request.messages.len(), 2);
        assert_eq!(answer_request.messages[0].content, "m10");
    }

    #[tokio::test]
    async fn test_chat_stream_stores_answer_after_completion() {
        let (_, engine) =
            engine_with(ScriptedProvider::replying("").with_stream(["15 ", "days"])).await;
        let id = engine.conversations().create(None).await.unwrap();

        let answer = engine.chat_stream(id, "PTO?", &QueryOptions::default()).await.unwrap();
        let text: String = answer.stream.map(|f| f.unwrap()).collect::<Vec<_>>().await.concat();
        assert_eq!(text, "15 days");

        let stored = engine.conversations().messages(id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].content, "15 days");
    }

    #[tokio::test]
    async fn test_chat_stream_failure_stores_nothing() {
        let provider = ScriptedProvider::replying("").with_stream(["15 "]).failing_stream_after(1);
        let (_, engine) = engine_with(provider).await;
        let id = engine.conversations().create(None).await.unwrap();

        let answer = engine.chat_stream(id, "PTO?", &QueryOptions::default()).await.unwrap();
        let items: Vec<_> = answer.stream.collect().await;
        assert!(items.last().unwrap().is_err());
        assert_eq!(engine.conversations().messages(id).await.unwrap().len(), 1);
    }

    #[test]
    fn test_format_context_labels() {
        let results = vec![
            SearchResult {
                id: "1".into(),
                content: "alpha".into(),
                metadata: [("source".to_string(), "a.md".to_string())].into_iter().collect(),
                distance: 0.1,
            },
            SearchResult {
                id: "2".into(),
                content: "beta".into(),
                metadata: Default::default(),
                distance: 0.2,
            },
        ];
        assert_eq!(
            format_context(&results),
            "[Source 1: a.md]\nalpha\n\n[Source 2: Unknown]\nbeta"
        );
        assert_eq!(format_context(&[]), "");
    }

    #[test]
    fn test_source_preview() {
        let result = SearchResult {
            id: "1".into(),
            content: "x".repeat(250),
            metadata: Default::default(),
            distance: 0.5,
        };
        let source = SourceRef::from_result(&result);
        assert_eq!(source.source, "Unknown");
        assert_eq!(source.content, format!("{}...", "x".repeat(200)));
    }
}

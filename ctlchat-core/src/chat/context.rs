//! Conversation history compaction.
//!
//! Long histories are reduced to a bounded context: the oldest messages are
//! summarized in closed batches of `batch_size`, the remainder is kept
//! verbatim.
//!
//! ```text
//! 25 messages, batch 10:  [0..10) -> summary 1
//!                         [10..20) -> summary 2
//!                         [20..25) -> recent, verbatim
//! ```
//!
//! A closed batch never changes, so its summary is cached by content hash.
//! Summarization failures fall back to a templated summary; building a
//! context always succeeds.

use crate::config::Config;
use crate::provider::{complete_with_timeout, ChatRequest, Message, Provider, ProviderError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Messages per summarized batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;

const SUMMARY_EXAMPLE: &str = "Example:
Input conversation:
User: What's our PTO policy?
Assistant: Employees get 15 days PTO annually, accrued monthly. You can carry over up to 5 days.
User: How do I request time off?
Assistant: Submit requests through the HR portal at least 2 weeks in advance. Your manager will approve.

Output summary:
Discussed PTO policy (15 days annually, 5 day carryover) and the time-off request process (HR portal, 2 weeks advance notice, manager approval required).";

/// A history reduced to summaries plus the newest messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub summaries: Vec<String>,
    pub recent_messages: Vec<Message>,
    pub total_messages: usize,
    pub summarized_count: usize,
}

impl ConversationContext {
    /// Renders the context as prompt text.
    ///
    /// Each message is cut to `max_message_chars` characters, with `...`
    /// appended when cut. Empty when there were no messages at all.
    pub fn format(&self, max_message_chars: usize) -> String {
        if self.total_messages == 0 {
            return String::new();
        }

        let mut parts = Vec::new();
        if !self.summaries.is_empty() {
            parts.push(self.format_summaries());
            parts.push(String::new());
        }

        if !self.recent_messages.is_empty() {
            if !self.summaries.is_empty() {
                parts.push("## Recent Messages".to_string());
            }
            for message in &self.recent_messages {
                parts.push(format!(
                    "{}: {}",
                    message.role.label(),
                    truncate(&message.content, max_message_chars)
                ));
            }
        }

        parts.join("\n")
    }

    /// Just the summaries section, or an empty string.
    pub fn format_summaries(&self) -> String {
        if self.summaries.is_empty() {
            return String::new();
        }
        let mut parts = vec!["## Previous Conversation Summary".to_string()];
        parts.extend(
            self.summaries
                .iter()
                .enumerate()
                .map(|(i, summary)| format!("Summary {}: {}", i + 1, summary)),
        );
        parts.join("\n")
    }
}

fn truncate(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Templated summary used when the LLM cannot produce one.
pub fn fallback_summary(message_count: usize) -> String {
    format!("Previous discussion covered {message_count} messages about various topics.")
}

/// Bounded FIFO map from batch hash to summary.
struct SummaryCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl SummaryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, summary: String) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, summary);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Builds [`ConversationContext`]s, summarizing closed batches through the LLM.
pub struct ConversationContextBuilder {
    provider: Arc<dyn Provider>,
    model: String,
    batch_size: usize,
    max_message_chars: usize,
    summary_max_tokens: u32,
    timeout: Duration,
    cache: Option<Mutex<SummaryCache>>,
}

impl ConversationContextBuilder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_message_chars: 500,
            summary_max_tokens: 256,
            timeout: Duration::from_secs(60),
            cache: None,
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, config: &Config) -> Self {
        let conversation = &config.conversation;
        let builder = Self::new(provider, config.llm.model.clone())
            .with_batch_size(conversation.batch_size)
            .with_max_message_chars(conversation.max_message_chars)
            .with_summary_max_tokens(conversation.summary_max_tokens)
            .with_timeout(config.llm.timeout());
        if conversation.cache_summaries {
            builder.with_cache(conversation.summary_cache_capacity)
        } else {
            builder
        }
    }

    /// A zero batch size is treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_message_chars(mut self, max_chars: usize) -> Self {
        self.max_message_chars = max_chars;
        self
    }

    pub fn with_summary_max_tokens(mut self, max_tokens: u32) -> Self {
        self.summary_max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Caches up to `capacity` batch summaries.
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = Some(Mutex::new(SummaryCache::new(capacity)));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of cached summaries.
    pub fn cached_summaries(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.len()))
            .unwrap_or(0)
    }

    /// Reduces `messages` (oldest first) to summaries plus recent messages.
    pub async fn build(&self, messages: &[Message], org_name: Option<&str>) -> ConversationContext {
        let total = messages.len();
        if total <= self.batch_size {
            debug!(total, "Using full conversation history");
            return ConversationContext {
                summaries: Vec::new(),
                recent_messages: messages.to_vec(),
                total_messages: total,
                summarized_count: 0,
            };
        }

        let summarized_count = (total / self.batch_size) * self.batch_size;
        info!(
            total,
            summarizing = summarized_count,
            recent = total - summarized_count,
            "Compacting conversation history"
        );

        let mut summaries = Vec::with_capacity(summarized_count / self.batch_size);
        for batch in messages[..summarized_count].chunks(self.batch_size) {
            summaries.push(self.summarize(batch, org_name).await);
        }

        ConversationContext {
            summaries,
            recent_messages: messages[summarized_count..].to_vec(),
            total_messages: total,
            summarized_count,
        }
    }

    /// Renders with the configured per-message limit.
    pub fn format(&self, context: &ConversationContext) -> String {
        context.format(self.max_message_chars)
    }

    /// Summarizes one batch, using the cache and the templated fallback.
    pub async fn summarize(&self, batch: &[Message], org_name: Option<&str>) -> String {
        if batch.is_empty() {
            return String::new();
        }

        let key = batch_key(batch, org_name);
        if let Some(summary) = self.cached(&key) {
            debug!(messages = batch.len(), "Using cached summary");
            return summary;
        }

        match self.try_summarize(batch, org_name).await {
            Ok(summary) => {
                if let Some(cache) = &self.cache {
                    if let Ok(mut cache) = cache.lock() {
                        cache.insert(key, summary.clone());
                    }
                }
                summary
            }
            Err(e) => {
                warn!(error = %e, messages = batch.len(), "Summarization failed, using fallback summary");
                fallback_summary(batch.len())
            }
        }
    }

    /// Asks the LLM for a 2-4 sentence summary of `batch`.
    pub async fn try_summarize(&self, batch: &[Message], org_name: Option<&str>) -> Result<String, ProviderError> {
        let transcript: String = batch
            .iter()
            .map(|m| format!("{}: {}\n\n", m.role.label(), m.content))
            .collect();

        let org = org_name.map(|o| format!(" for {o}")).unwrap_or_default();
        let system = format!(
            "You are a conversation summarizer{org}.\n\n\
             Your task is to create a concise summary of a conversation that captures:\n\
             1. Main topics discussed\n\
             2. Key questions asked by the user\n\
             3. Important information provided in answers\n\
             4. Any decisions, actions, or follow-ups mentioned\n\
             5. Context needed to understand future questions\n\n\
             Keep the summary brief but informative (2-4 sentences).\n\
             Focus on what's relevant for understanding follow-up questions.\n\n\
             {SUMMARY_EXAMPLE}"
        );
        let user = format!(
            "Summarize this conversation concisely:\n\n{transcript}\nProvide a brief summary in 2-4 sentences."
        );

        info!(messages = batch.len(), "Summarizing messages");
        let request = ChatRequest::new(self.model.clone(), vec![Message::user(user)])
            .with_system(system)
            .with_max_tokens(self.summary_max_tokens)
            .with_temperature(0.0);
        let summary = complete_with_timeout(self.provider.as_ref(), request, self.timeout).await?;

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ProviderError::Other("empty summary".to_string()));
        }
        Ok(summary.to_string())
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.as_ref()?.lock().ok()?.get(key)
    }
}

fn batch_key(batch: &[Message], org_name: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(org_name.unwrap_or_default().as_bytes());
    for message in batch {
        hasher.update([0u8]);
        hasher.update(message.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

//! Conversations and question answering.
//!
//! - [`ConversationStore`]: append-only message log per conversation
//! - [`ConversationContextBuilder`]: compacts long histories into summaries
//! - [`RagEngine`]: retrieval plus generation, standalone or within a conversation

mod context;
mod engine;
mod history;

pub use context::{fallback_summary, ConversationContext, ConversationContextBuilder, DEFAULT_BATCH_SIZE};
pub use engine::{
    format_context, Answer, EngineError, QueryOptions, RagEngine, SourceRef, StreamingAnswer,
};
pub use history::{
    ConversationInfo, ConversationStore, HistoryError, InMemoryConversationStore, StoredMessage,
};

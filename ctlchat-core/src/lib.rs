//! ctlchat-core - Retrieval-augmented chatbot engine
//!
//! Provides the building blocks of a document-grounded chatbot:
//! - LLM provider abstraction (Anthropic, Ollama)
//! - Document chunking, embedding and vector search
//! - Query rewriting and conversation summarization
//! - Configuration management
//! - Unix socket server
//!
//! ## Primary API
//!
//! Most callers construct an [`IndexStore`] and a [`RagEngine`] once at
//! startup and share them between requests.

// Public modules
pub mod chat;
pub mod config;
pub mod enhancer;
pub mod provider;
pub mod rag;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

// Public exports
pub use chat::{
    Answer, ConversationContext, ConversationContextBuilder, ConversationStore, EngineError,
    InMemoryConversationStore, QueryOptions, RagEngine, SourceRef, StreamingAnswer,
};
pub use config::{Config, ConfigError};
pub use enhancer::{build_search_query, IntentType, QueryEnhancement, QueryEnhancer};
pub use rag::{
    Chunk, ChunkMetadata, DocumentLoader, IndexError, IndexStore, Ingestor, MetadataFilter,
    SearchResult,
};
pub use server::Server;

// Provider exports
pub use provider::{ChatRequest, Message, Provider, ProviderError, Role};

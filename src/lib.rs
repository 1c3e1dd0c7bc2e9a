//! ctlchat - Retrieval-augmented chatbot backend
//!
//! This is the convenience wrapper crate that re-exports the engine from
//! `ctlchat-core`.
//!
//! # Quick Start
//!
//! ```no_run
//! use ctlchat::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_default()?;
//! let provider = ctlchat::provider::from_config(&config.llm)?;
//! let index = Arc::new(IndexStore::open(&config, ctlchat::rag::embedder_from_config(&config)).await?);
//! let engine = RagEngine::new(&config, provider, index, Arc::new(InMemoryConversationStore::new()))?;
//!
//! let answer = engine.query("What's our PTO policy?", &QueryOptions::default()).await?;
//! println!("{}", answer.response);
//! # Ok(())
//! # }
//! ```

// Re-export core
pub use ctlchat_core::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use ctlchat_core::chat::{ConversationStore, InMemoryConversationStore, QueryOptions, RagEngine};
    pub use ctlchat_core::config::Config;
    pub use ctlchat_core::enhancer::{QueryEnhancement, QueryEnhancer};
    pub use ctlchat_core::provider::{ChatRequest, Message, Provider, ProviderError, Role};
    pub use ctlchat_core::rag::{Chunk, ChunkMetadata, EmbeddingFunction, IndexStore, MetadataFilter, SearchResult};
}

//! Portal Core - conversation orchestration over compiled memory
//!
//! Everything between an incoming user message and the stored assistant
//! reply: accounts and conversations, the context compiler, the LLM gateway
//! client and the extraction pipelines that feed the memory graph.

pub mod access;
pub mod accounts;
pub mod agents;
pub mod catalog;
pub mod chunker;
pub mod config;
pub mod context;
pub mod conversations;
pub mod documents;
pub mod embeddings;
pub mod extract;
pub mod llm;
pub mod relay;
pub mod schema;
pub mod seed;
pub mod weaver;

#[cfg(test)]
pub(crate) mod test_support;

pub use access::{AccessCheck, AccessGate};
pub use accounts::{User, UserStore};
pub use agents::{Agent, AgentStore, NewAgent};
pub use catalog::{BaseModel, ModelCatalog, NewBaseModel, Pricing};
pub use chunker::{chunk_content, MAX_CHUNK_SIZE};
pub use config::PortalConfig;
pub use context::{CompiledContext, ContextCompiler, ContextRequest};
pub use conversations::{Conversation, ConversationStore, Message, NewMessage, Role};
pub use documents::{
    DocumentOutcome, DocumentProcessor, DocumentRequest, FailedDocument, ProcessedDocument,
    SuggestedCoreUpdate,
};
pub use embeddings::{EmbedAllReport, EmbeddingService};
pub use extract::{parse_structured, ParseFailure};
pub use llm::{
    ChatMessage, ChatRequest, Completion, Embedding, LlmClient, LlmError, OpenRouterClient,
};
pub use relay::{ChatRelay, RelayReply};
pub use seed::{seed_core_memories, SeedReport};
pub use weaver::{MemoryWeaver, SourceType, WeaveReport};

/// Core errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Memory error: {0}")]
    Memory(#[from] portal_memory::MemoryError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

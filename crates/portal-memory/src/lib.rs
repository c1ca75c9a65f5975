//! Portal Memory - persistent memory for agent conversations
//!
//! Memories, the links between them, per-subject profiles and the audit log
//! of compiled contexts all live in one SQLite database opened through sqlx.

pub mod db;
pub mod links;
pub mod memory;
pub mod profile;
pub mod search;
pub mod snapshot;
pub mod store;
pub mod vector;

pub use db::Database;
pub use links::{traverse, ConnectedMemory, LinkSet, LinkStore, LinkType, MemoryLink, NewLink};
pub use memory::{MemoryRecord, MemoryType, NewMemory};
pub use profile::{ProfilePatch, ProfileStore, SubjectProfile};
pub use snapshot::{ContextSnapshot, NewSnapshot, SnapshotStore};
pub use store::MemoryStore;
pub use vector::{cosine_similarity, rank_by_similarity, ScoredMemory};

/// Errors from memory operations
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Vectors must have same length ({left} vs {right})")]
    DimensionMismatch { left: usize, right: usize },

    #[error("Traversal depth must be at least 1, got {0}")]
    InvalidDepth(usize),

    #[error("Unknown memory type: {0}")]
    UnknownMemoryType(String),

    #[error("Unknown link type: {0}")]
    UnknownLinkType(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Current wall-clock time in epoch milliseconds, the storage format for timestamps
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back into a UTC timestamp
pub fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

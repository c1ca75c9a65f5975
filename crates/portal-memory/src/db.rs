//! Database bootstrap
//!
//! One SQLite database holds every table. Each crate migrates the tables it
//! owns; this module owns the memory tables.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Handle to the portal database
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `url` and run the memory migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::info!("Opened portal database at {}", url);
        Ok(db)
    }

    /// A private in-memory database. Pinned to a single connection because
    /// every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                memory_id TEXT PRIMARY KEY,
                memory_type TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                summary TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                resonance REAL NOT NULL DEFAULT 0.5,
                source TEXT,
                embedding TEXT,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER,
                access_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type, is_active);
            CREATE INDEX IF NOT EXISTS idx_memories_resonance ON memories(resonance DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_links (
                id TEXT PRIMARY KEY,
                source_memory_id TEXT NOT NULL,
                target_memory_id TEXT NOT NULL,
                link_type TEXT NOT NULL,
                weight REAL NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_links_pair ON memory_links(source_memory_id, target_memory_id);
            CREATE INDEX IF NOT EXISTS idx_links_target ON memory_links(target_memory_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subject_profiles (
                subject_id TEXT PRIMARY KEY,
                display_name TEXT,
                facts TEXT NOT NULL DEFAULT '[]',
                preferences TEXT,
                interests TEXT NOT NULL DEFAULT '[]',
                relationship_notes TEXT,
                last_interaction_summary TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_contexts (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                subject_id TEXT,
                memory_ids TEXT NOT NULL,
                compiled_context TEXT NOT NULL,
                total_resonance REAL NOT NULL,
                generated_at INTEGER NOT NULL,
                generation_time_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contexts_conversation ON memory_contexts(conversation_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

//! Append-only audit log of compiled memory contexts

use crate::{from_millis, now_millis, Database, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Data for one compiled context
#[derive(Debug, Clone, Default)]
pub struct NewSnapshot {
    pub conversation_id: Option<String>,
    pub subject_id: Option<String>,
    pub memory_ids: Vec<String>,
    pub compiled_context: String,
    pub total_resonance: f64,
    pub generation_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub id: String,
    pub conversation_id: Option<String>,
    pub subject_id: Option<String>,
    pub memory_ids: Vec<String>,
    pub compiled_context: String,
    pub total_resonance: f64,
    pub generated_at: DateTime<Utc>,
    pub generation_time_ms: i64,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    conversation_id: Option<String>,
    subject_id: Option<String>,
    memory_ids: String,
    compiled_context: String,
    total_resonance: f64,
    generated_at: i64,
    generation_time_ms: i64,
}

impl TryFrom<SnapshotRow> for ContextSnapshot {
    type Error = crate::MemoryError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(ContextSnapshot {
            id: row.id,
            conversation_id: row.conversation_id,
            subject_id: row.subject_id,
            memory_ids: serde_json::from_str(&row.memory_ids)?,
            compiled_context: row.compiled_context,
            total_resonance: row.total_resonance,
            generated_at: from_millis(row.generated_at),
            generation_time_ms: row.generation_time_ms,
        })
    }
}

#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn record(&self, snapshot: NewSnapshot) -> Result<ContextSnapshot> {
        let id = uuid::Uuid::new_v4().to_string();
        let generated_at = now_millis();

        sqlx::query(
            "INSERT INTO memory_contexts (id, conversation_id, subject_id, memory_ids, \
             compiled_context, total_resonance, generated_at, generation_time_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&id)
        .bind(&snapshot.conversation_id)
        .bind(&snapshot.subject_id)
        .bind(serde_json::to_string(&snapshot.memory_ids)?)
        .bind(&snapshot.compiled_context)
        .bind(snapshot.total_resonance)
        .bind(generated_at)
        .bind(snapshot.generation_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(ContextSnapshot {
            id,
            conversation_id: snapshot.conversation_id,
            subject_id: snapshot.subject_id,
            memory_ids: snapshot.memory_ids,
            compiled_context: snapshot.compiled_context,
            total_resonance: snapshot.total_resonance,
            generated_at: from_millis(generated_at),
            generation_time_ms: snapshot.generation_time_ms,
        })
    }

    /// Snapshots for one conversation, newest first
    pub async fn for_conversation(&self, conversation_id: &str) -> Result<Vec<ContextSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT id, conversation_id, subject_id, memory_ids, compiled_context, total_resonance, \
             generated_at, generation_time_ms FROM memory_contexts WHERE conversation_id = ?1 \
             ORDER BY generated_at DESC, rowid DESC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ContextSnapshot::try_from).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM memory_contexts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshots_listed_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let snapshots = SnapshotStore::new(&db);

        for (i, text) in ["one", "two"].iter().enumerate() {
            snapshots
                .record(NewSnapshot {
                    conversation_id: Some("c1".into()),
                    memory_ids: vec![format!("m{i}")],
                    compiled_context: text.to_string(),
                    total_resonance: 0.5,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        snapshots
            .record(NewSnapshot {
                conversation_id: Some("other".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let listed = snapshots.for_conversation("c1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].compiled_context, "two");
        assert_eq!(listed[1].memory_ids, vec!["m0"]);
        assert_eq!(snapshots.count().await.unwrap(), 3);
    }
}

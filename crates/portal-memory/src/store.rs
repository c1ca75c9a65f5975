//! Memory store - CRUD over memory records
//!
//! Records are keyed by their external memory id. Reads only ever see
//! active records; soft-deleted rows stay in the table.

use crate::memory::{MemoryRecord, MemoryType, NewMemory};
use crate::{from_millis, now_millis, search, Database, MemoryError, Result};
use sqlx::SqlitePool;

const COLUMNS: &str = "memory_id, memory_type, title, content, summary, tags, resonance, source, \
                       embedding, created_at, last_accessed_at, access_count, is_active";

#[derive(sqlx::FromRow)]
struct MemoryRow {
    memory_id: String,
    memory_type: String,
    title: String,
    content: String,
    summary: Option<String>,
    tags: String,
    resonance: f64,
    source: Option<String>,
    embedding: Option<String>,
    created_at: i64,
    last_accessed_at: Option<i64>,
    access_count: i64,
    is_active: bool,
}

impl TryFrom<MemoryRow> for MemoryRecord {
    type Error = MemoryError;

    fn try_from(row: MemoryRow) -> Result<Self> {
        let embedding = match row.embedding {
            Some(raw) => Some(serde_json::from_str::<Vec<f32>>(&raw)?),
            None => None,
        };
        Ok(MemoryRecord {
            memory_id: row.memory_id,
            memory_type: row.memory_type.parse()?,
            title: row.title,
            content: row.content,
            summary: row.summary,
            tags: serde_json::from_str(&row.tags)?,
            resonance: row.resonance,
            source: row.source,
            embedding,
            created_at: from_millis(row.created_at),
            last_accessed_at: row.last_accessed_at.map(from_millis),
            access_count: row.access_count.max(0) as u32,
            is_active: row.is_active,
        })
    }
}

fn into_records(rows: Vec<MemoryRow>) -> Result<Vec<MemoryRecord>> {
    rows.into_iter().map(MemoryRecord::try_from).collect()
}

/// Memory storage backend
#[derive(Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create a memory, or overwrite the mutable fields of the one that
    /// already carries this id. Counters, type and active flag are kept.
    pub async fn upsert(&self, memory: NewMemory) -> Result<MemoryRecord> {
        let tags = serde_json::to_string(&memory.tags)?;
        let resonance = memory.resonance.clamp(0.0, 1.0);

        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT memory_id FROM memories WHERE memory_id = ?1")
                .bind(&memory.memory_id)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            sqlx::query(
                "UPDATE memories SET title = ?1, content = ?2, summary = ?3, tags = ?4, \
                 resonance = ?5, source = ?6 WHERE memory_id = ?7",
            )
            .bind(&memory.title)
            .bind(&memory.content)
            .bind(&memory.summary)
            .bind(&tags)
            .bind(resonance)
            .bind(&memory.source)
            .bind(&memory.memory_id)
            .execute(&mut *tx)
            .await?;
            tracing::debug!(memory_id = %memory.memory_id, "Updated memory");
        } else {
            insert_row(&mut tx, &memory, &tags, resonance).await?;
            tracing::debug!(memory_id = %memory.memory_id, "Created memory");
        }

        tx.commit().await?;

        self.fetch(&memory.memory_id, true)
            .await?
            .ok_or_else(|| MemoryError::NotFound(memory.memory_id.clone()))
    }

    /// Insert a memory unless one with this id already exists.
    ///
    /// Returns the stored record and whether it was newly inserted.
    pub async fn insert_if_absent(&self, memory: NewMemory) -> Result<(MemoryRecord, bool)> {
        let tags = serde_json::to_string(&memory.tags)?;
        let resonance = memory.resonance.clamp(0.0, 1.0);

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT memory_id FROM memories WHERE memory_id = ?1")
                .bind(&memory.memory_id)
                .fetch_optional(&mut *tx)
                .await?;
        let inserted = existing.is_none();
        if inserted {
            insert_row(&mut tx, &memory, &tags, resonance).await?;
        }
        tx.commit().await?;

        let record = self
            .fetch(&memory.memory_id, true)
            .await?
            .ok_or_else(|| MemoryError::NotFound(memory.memory_id.clone()))?;
        Ok((record, inserted))
    }

    /// Retrieve an active memory by its id
    pub async fn get(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        self.fetch(memory_id, false).await
    }

    async fn fetch(&self, memory_id: &str, include_inactive: bool) -> Result<Option<MemoryRecord>> {
        let sql = if include_inactive {
            format!("SELECT {COLUMNS} FROM memories WHERE memory_id = ?1")
        } else {
            format!("SELECT {COLUMNS} FROM memories WHERE memory_id = ?1 AND is_active = 1")
        };
        let row: Option<MemoryRow> = sqlx::query_as(&sql)
            .bind(memory_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MemoryRecord::try_from).transpose()
    }

    /// All active memories of one type, in insertion order
    pub async fn list_by_type(&self, memory_type: MemoryType) -> Result<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memories WHERE memory_type = ?1 AND is_active = 1 ORDER BY rowid"
        ))
        .bind(memory_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Active memories by resonance, highest first
    pub async fn top_by_resonance(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memories WHERE is_active = 1 \
             ORDER BY resonance DESC, rowid ASC LIMIT ?1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Term search over content, falling back to titles when content has no hits
    pub async fn search(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = match memory_type {
            Some(t) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM memories WHERE memory_type = ?1 AND is_active = 1 ORDER BY rowid"
                ))
                .bind(t.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM memories WHERE is_active = 1 ORDER BY rowid"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        let candidates = into_records(rows)?;

        let mut hits = search::rank(query, &candidates, |m| m.content.as_str(), limit);
        if hits.is_empty() {
            hits = search::rank(query, &candidates, |m| m.title.as_str(), limit);
        }
        Ok(hits.into_iter().cloned().collect())
    }

    /// Record that a memory was used. Unknown ids are ignored.
    pub async fn touch(&self, memory_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 \
             WHERE memory_id = ?2",
        )
        .bind(now_millis())
        .bind(memory_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(memory_id, "Touch on unknown memory ignored");
        }
        Ok(())
    }

    /// Soft delete. Unknown ids are ignored.
    pub async fn deactivate(&self, memory_id: &str) -> Result<()> {
        sqlx::query("UPDATE memories SET is_active = 0 WHERE memory_id = ?1")
            .bind(memory_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the embedding vector for a memory
    pub async fn set_embedding(&self, memory_id: &str, embedding: &[f32]) -> Result<()> {
        let encoded = serde_json::to_string(embedding)?;
        let result = sqlx::query("UPDATE memories SET embedding = ?1 WHERE memory_id = ?2")
            .bind(encoded)
            .bind(memory_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::NotFound(memory_id.to_string()));
        }
        Ok(())
    }

    /// Active memories that already carry an embedding
    pub async fn with_embeddings(&self) -> Result<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memories WHERE is_active = 1 AND embedding IS NOT NULL ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Active memories still waiting for an embedding
    pub async fn without_embeddings(&self) -> Result<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memories WHERE is_active = 1 AND embedding IS NULL ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Number of stored rows, soft-deleted included
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM memories")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    memory: &NewMemory,
    tags: &str,
    resonance: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO memories (memory_id, memory_type, title, content, summary, tags, resonance, \
         source, created_at, access_count, is_active) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 1)",
    )
    .bind(&memory.memory_id)
    .bind(memory.memory_type.as_str())
    .bind(&memory.title)
    .bind(&memory.content)
    .bind(&memory.summary)
    .bind(tags)
    .bind(resonance)
    .bind(&memory.source)
    .bind(now_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MemoryStore {
        let db = Database::in_memory().await.unwrap();
        MemoryStore::new(&db)
    }

    fn memory(id: &str, memory_type: MemoryType, content: &str, resonance: f64) -> NewMemory {
        NewMemory::new(id, memory_type, id.to_uppercase(), content)
            .with_resonance(resonance)
            .with_summary(format!("summary of {id}"))
    }

    #[tokio::test]
    async fn test_upsert_never_duplicates() {
        let store = store().await;

        for (i, content) in ["first", "second", "third"].iter().enumerate() {
            let m = memory("core-identity", MemoryType::Core, content, 0.1 * (i + 1) as f64);
            store.upsert(m).await.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("core-identity").await.unwrap().unwrap();
        assert_eq!(stored.content, "third");
        assert!((stored.resonance - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_upsert_keeps_counters_and_type() {
        let store = store().await;
        store
            .upsert(memory("m", MemoryType::Harmonic, "a", 0.5))
            .await
            .unwrap();
        store.touch("m").await.unwrap();
        store.touch("m").await.unwrap();

        let updated = store
            .upsert(memory("m", MemoryType::Core, "b", 0.9))
            .await
            .unwrap();
        assert_eq!(updated.access_count, 2);
        assert_eq!(updated.memory_type, MemoryType::Harmonic);
        assert!(updated.last_accessed_at.is_some());
        assert_eq!(updated.content, "b");
    }

    #[tokio::test]
    async fn test_insert_if_absent_leaves_existing() {
        let store = store().await;
        let (_, inserted) = store
            .insert_if_absent(memory("x", MemoryType::Insight, "original", 0.7))
            .await
            .unwrap();
        assert!(inserted);

        let (record, inserted) = store
            .insert_if_absent(memory("x", MemoryType::Insight, "replacement", 0.2))
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(record.content, "original");
    }

    #[tokio::test]
    async fn test_list_by_type_and_top() {
        let store = store().await;
        store.upsert(memory("c1", MemoryType::Core, "a", 0.4)).await.unwrap();
        store.upsert(memory("h1", MemoryType::Harmonic, "b", 0.9)).await.unwrap();
        store.upsert(memory("c2", MemoryType::Core, "c", 1.0)).await.unwrap();
        store.upsert(memory("i1", MemoryType::Insight, "d", 0.9)).await.unwrap();

        let core: Vec<String> = store
            .list_by_type(MemoryType::Core)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.memory_id)
            .collect();
        assert_eq!(core, vec!["c1", "c2"]);

        let top: Vec<String> = store
            .top_by_resonance(3)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.memory_id)
            .collect();
        // ties resolved by insertion order
        assert_eq!(top, vec!["c2", "h1", "i1"]);
    }

    #[tokio::test]
    async fn test_search_content_then_title_fallback() {
        let store = store().await;
        store
            .upsert(memory("a", MemoryType::Insight, "The river remembers", 0.5))
            .await
            .unwrap();
        store
            .upsert(
                NewMemory::new("b", MemoryType::Core, "Lantern Protocol", "unrelated body")
                    .with_resonance(0.5),
            )
            .await
            .unwrap();

        let hits = store.search("river", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "a");

        // no content mentions lantern, so titles are searched
        let hits = store.search("lantern", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "b");

        // type filter
        let hits = store
            .search("river", Some(MemoryType::Core), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_soft_deleted_memories_are_invisible() {
        let store = store().await;
        store
            .upsert(memory("gone", MemoryType::Core, "hidden treasure", 1.0))
            .await
            .unwrap();
        store
            .upsert(memory("kept", MemoryType::Core, "visible treasure", 0.5))
            .await
            .unwrap();
        store.deactivate("gone").await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get("gone").await.unwrap().is_none());

        let by_type = store.list_by_type(MemoryType::Core).await.unwrap();
        assert!(by_type.iter().all(|m| m.memory_id != "gone"));

        let top = store.top_by_resonance(10).await.unwrap();
        assert!(top.iter().all(|m| m.memory_id != "gone"));

        let hits = store.search("treasure", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "kept");
    }

    #[tokio::test]
    async fn test_touch_and_deactivate_unknown_are_noops() {
        let store = store().await;
        store.touch("missing").await.unwrap();
        store.deactivate("missing").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embeddings_round_trip_through_storage() {
        let store = store().await;
        store.upsert(memory("e", MemoryType::Insight, "x", 0.5)).await.unwrap();
        store.upsert(memory("f", MemoryType::Insight, "y", 0.5)).await.unwrap();

        store.set_embedding("e", &[0.25, -1.5, 3.0]).await.unwrap();

        let with = store.with_embeddings().await.unwrap();
        assert_eq!(with.len(), 1);
        assert_eq!(with[0].embedding.as_deref(), Some(&[0.25f32, -1.5, 3.0][..]));

        let without = store.without_embeddings().await.unwrap();
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].memory_id, "f");

        let err = store.set_embedding("nope", &[1.0]).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }
}

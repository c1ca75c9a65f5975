//! Memory embeddings and semantic search over them

use crate::llm::LlmClient;
use crate::{CoreError, Result};
use portal_memory::{rank_by_similarity, Database, MemoryStore, ScoredMemory};
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmbedAllReport {
    pub total_memories: usize,
    pub embedded: usize,
    pub failed: usize,
    pub total_tokens: u64,
}

#[derive(Clone)]
pub struct EmbeddingService {
    llm: Arc<dyn LlmClient>,
    memories: MemoryStore,
}

impl EmbeddingService {
    pub fn new(db: &Database, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            memories: MemoryStore::new(db),
        }
    }

    /// Embed one memory and store the vector. Returns tokens used.
    pub async fn embed_memory(&self, memory_id: &str) -> Result<u32> {
        let memory = self
            .memories
            .get(memory_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("memory {memory_id}")))?;

        let embedding = self.llm.embed(&memory.embedding_text()).await?;
        self.memories
            .set_embedding(memory_id, &embedding.vector)
            .await?;

        tracing::debug!(memory_id, dims = embedding.vector.len(), "Stored embedding");
        Ok(embedding.tokens_used)
    }

    /// Embed every active memory that has no vector yet. Failures are logged
    /// and counted; the batch keeps going.
    pub async fn embed_all(&self) -> Result<EmbedAllReport> {
        let pending = self.memories.without_embeddings().await?;
        let mut report = EmbedAllReport {
            total_memories: pending.len(),
            ..Default::default()
        };

        for memory in &pending {
            match self.embed_memory(&memory.memory_id).await {
                Ok(tokens) => {
                    report.embedded += 1;
                    report.total_tokens += u64::from(tokens);
                }
                Err(e) => {
                    tracing::warn!(memory_id = %memory.memory_id, error = %e, "Embedding failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            total = report.total_memories,
            embedded = report.embedded,
            failed = report.failed,
            "Embedding pass finished"
        );
        Ok(report)
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ScoredMemory>> {
        let query_vector = self.llm.embed(query).await?.vector;
        let candidates = self.memories.with_embeddings().await?;
        Ok(rank_by_similarity(
            &query_vector,
            &candidates,
            min_similarity,
            limit,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Embedding, LlmError};
    use crate::test_support::{database, keyword_vector, ScriptedLlm};
    use portal_memory::{MemoryType, NewMemory};

    async fn seeded() -> (Database, MemoryStore) {
        let db = database().await;
        let store = MemoryStore::new(&db);
        for (id, content) in [
            ("m-ocean", "waves on the ocean"),
            ("m-fire", "a fire in the hearth"),
            ("m-forest", "deep forest paths"),
        ] {
            store
                .upsert(NewMemory::new(id, MemoryType::Insight, id, content))
                .await
                .unwrap();
        }
        (db, store)
    }

    #[tokio::test]
    async fn test_embed_all_then_search() {
        let (db, store) = seeded().await;
        let service = EmbeddingService::new(&db, Arc::new(ScriptedLlm::new()));

        let report = service.embed_all().await.unwrap();
        assert_eq!(report.total_memories, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total_tokens, 9);
        assert!(store.without_embeddings().await.unwrap().is_empty());

        let hits = service
            .semantic_search("the ocean at night", DEFAULT_SEARCH_LIMIT, DEFAULT_MIN_SIMILARITY)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "m-ocean");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_embed_all_counts_failures() {
        let (db, _) = seeded().await;
        let llm = ScriptedLlm::new().with_embedder(|text| {
            if text.contains("fire") {
                Err(LlmError::Upstream {
                    status: 503,
                    body: "busy".into(),
                })
            } else {
                Ok(Embedding {
                    vector: keyword_vector(text),
                    tokens_used: 2,
                })
            }
        });
        let service = EmbeddingService::new(&db, Arc::new(llm));

        let report = service.embed_all().await.unwrap();
        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total_tokens, 4);
    }

    #[tokio::test]
    async fn test_embed_missing_memory_is_not_found() {
        let db = database().await;
        let service = EmbeddingService::new(&db, Arc::new(ScriptedLlm::new()));
        assert!(matches!(
            service.embed_memory("ghost").await,
            Err(CoreError::NotFound(_))
        ));
    }
}

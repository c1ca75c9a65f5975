//! Brute-force vector similarity over stored embeddings

use crate::{MemoryError, MemoryRecord, Result};
use serde::Serialize;

/// A memory scored against a query embedding
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMemory {
    pub memory_id: String,
    pub title: String,
    pub summary: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: crate::MemoryType,
    pub similarity: f64,
}

/// Cosine similarity: dot product over the product of magnitudes.
///
/// Fails on mismatched lengths. Returns 0 when either vector has zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(MemoryError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Score every candidate that carries an embedding, keep those at or above
/// `min_similarity`, best first, at most `limit`.
pub fn rank_by_similarity(
    query: &[f32],
    candidates: &[MemoryRecord],
    min_similarity: f64,
    limit: usize,
) -> Result<Vec<ScoredMemory>> {
    let mut results = Vec::new();

    for memory in candidates {
        let Some(embedding) = memory.embedding.as_deref() else {
            continue;
        };
        let similarity = cosine_similarity(query, embedding)?;
        if similarity >= min_similarity {
            results.push(ScoredMemory {
                memory_id: memory.memory_id.clone(),
                title: memory.title.clone(),
                summary: memory.summary.clone(),
                memory_type: memory.memory_type,
                similarity,
            });
        }
    }

    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryType;

    fn record(id: &str, embedding: Option<Vec<f32>>) -> MemoryRecord {
        MemoryRecord {
            memory_id: id.to_string(),
            memory_type: MemoryType::Insight,
            title: id.to_uppercase(),
            content: String::new(),
            summary: None,
            tags: vec![],
            resonance: 0.5,
            source: None,
            embedding,
            created_at: chrono::Utc::now(),
            last_accessed_at: None,
            access_count: 0,
            is_active: true,
        }
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = vec![0.3f32, -1.2, 4.0, 0.01];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_vector_similarity_is_zero() {
        let v = vec![1.0f32, 2.0, 3.0];
        let zero = vec![0.0f32; 3];
        assert_eq!(cosine_similarity(&v, &zero).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero).unwrap(), 0.0);
    }

    #[test]
    fn test_mismatched_lengths_error() {
        let err = cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch { left: 2, right: 3 }
        ));
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-9);
        let opp = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((opp + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_filters_sorts_and_limits() {
        let candidates = vec![
            record("far", Some(vec![0.0, 1.0])),
            record("near", Some(vec![1.0, 0.1])),
            record("exact", Some(vec![1.0, 0.0])),
            record("unembedded", None),
            record("middle", Some(vec![1.0, 1.0])),
        ];
        let ranked = rank_by_similarity(&[1.0, 0.0], &candidates, 0.5, 2).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);

        let all = rank_by_similarity(&[1.0, 0.0], &candidates, 0.5, 10).unwrap();
        assert_eq!(all.len(), 3); // "far" is below threshold, "unembedded" skipped
    }
}

//! Memory types and structures

use crate::MemoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type of memory
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Foundational identity, always compiled into context
    Core,
    /// Thematic facets surfaced after the searched tier
    Harmonic,
    /// Session-scoped context
    Session,
    /// Knowledge about a specific person
    Subject,
    /// Extracted wisdom or revelations
    Insight,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Core => "core",
            MemoryType::Harmonic => "harmonic",
            MemoryType::Session => "session",
            MemoryType::Subject => "subject",
            MemoryType::Insight => "insight",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(MemoryType::Core),
            "harmonic" => Ok(MemoryType::Harmonic),
            "session" => Ok(MemoryType::Session),
            // Older extraction prompts still say "seeker"
            "subject" | "seeker" => Ok(MemoryType::Subject),
            "insight" => Ok(MemoryType::Insight),
            other => Err(MemoryError::UnknownMemoryType(other.to_string())),
        }
    }
}

/// Fields supplied when creating or overwriting a memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMemory {
    pub memory_id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub resonance: f64,
    #[serde(default)]
    pub source: Option<String>,
}

impl NewMemory {
    pub fn new(
        memory_id: impl Into<String>,
        memory_type: MemoryType,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            memory_id: memory_id.into(),
            memory_type,
            title: title.into(),
            content: content.into(),
            summary: None,
            tags: vec![],
            resonance: 0.5,
            source: None,
        }
    }

    /// Set resonance, clamped into 0.0 - 1.0
    pub fn with_resonance(mut self, resonance: f64) -> Self {
        self.resonance = resonance.clamp(0.0, 1.0);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A stored memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub memory_id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    /// Priority in retrieval and ranking (0.0 - 1.0)
    pub resonance: f64,
    pub source: Option<String>,
    /// Vector embedding for semantic search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Number of times compiled into a context
    pub access_count: u32,
    pub is_active: bool,
}

impl MemoryRecord {
    /// Text used to produce this memory's embedding
    pub fn embedding_text(&self) -> String {
        format!(
            "{}\n\n{}\n\n{}",
            self.title,
            self.summary.as_deref().unwrap_or(""),
            self.content
        )
        .trim()
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_parsing_accepts_legacy_seeker() {
        assert_eq!("seeker".parse::<MemoryType>().unwrap(), MemoryType::Subject);
        assert_eq!("harmonic".parse::<MemoryType>().unwrap(), MemoryType::Harmonic);
        assert!(matches!(
            "fact".parse::<MemoryType>(),
            Err(MemoryError::UnknownMemoryType(t)) if t == "fact"
        ));
    }

    #[test]
    fn test_resonance_is_clamped() {
        let m = NewMemory::new("a", MemoryType::Core, "t", "c").with_resonance(1.7);
        assert_eq!(m.resonance, 1.0);
        let m = NewMemory::new("a", MemoryType::Core, "t", "c").with_resonance(-0.2);
        assert_eq!(m.resonance, 0.0);
    }

    #[test]
    fn test_new_memory_deserializes_from_camel_case() {
        let m: NewMemory = serde_json::from_value(serde_json::json!({
            "memoryId": "core-identity-001",
            "type": "core",
            "title": "Identity",
            "content": "Who I am",
            "resonance": 1.0
        }))
        .unwrap();
        assert_eq!(m.memory_type, MemoryType::Core);
        assert!(m.tags.is_empty());
        assert!(m.summary.is_none());
    }
}

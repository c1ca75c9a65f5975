//! Memory weaver: turns a finished exchange into stored memories
//!
//! One low-temperature extraction call returns facts about the subject,
//! standalone insights and optional relationship notes. Facts go to the
//! subject profile, insights become `insight` memories.

use crate::extract::parse_structured;
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::schema::now_millis;
use crate::Result;
use portal_memory::{Database, MemoryStore, MemoryType, NewMemory, ProfileStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const WEAVER_PROMPT: &str = r#"You review a conversation excerpt and extract what is worth remembering for future conversations.

Extract:
- Significant facts about the person (name, location, work, relationships, circumstances)
- Moments of real connection or emotional weight
- Insights or conclusions that emerged
- Promises, commitments and stated intentions
- Topics the person cares about
- Phrases or concepts with special meaning in this relationship

Do not extract:
- Greetings and small talk
- Technical troubleshooting details
- Passing states ("I'm tired today")
- Generic, widely known information

Return ONLY valid JSON in this exact format:
{
  "subjectFacts": ["fact1", "fact2"],
  "insights": [
    {
      "title": "Short title",
      "content": "The insight, specific and detailed",
      "tags": ["tag1", "tag2"],
      "resonance": 0.8
    }
  ],
  "relationshipNotes": "Optional note about the relationship, or null"
}

If nothing is worth keeping, return: {"subjectFacts": [], "insights": [], "relationshipNotes": null}"#;

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 1500;
const DEFAULT_INSIGHT_RESONANCE: f64 = 0.7;
const SUMMARY_CHARS: usize = 200;

/// What the extracted content came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Conversation,
    Message,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Conversation => "conversation",
            SourceType::Message => "message",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Extraction {
    #[serde(default, alias = "seekerFacts")]
    subject_facts: Vec<String>,
    #[serde(default)]
    insights: Vec<ExtractedInsight>,
    #[serde(default)]
    relationship_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractedInsight {
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    resonance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeaveReport {
    pub success: bool,
    pub tokens_used: u32,
    pub subject_facts_extracted: usize,
    pub insights_extracted: usize,
    pub memories_created: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryWeaver {
    llm: Arc<dyn LlmClient>,
    model: String,
    memories: MemoryStore,
    profiles: ProfileStore,
}

impl MemoryWeaver {
    pub fn new(db: &Database, llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            memories: MemoryStore::new(db),
            profiles: ProfileStore::new(db),
        }
    }

    pub async fn extract_memories(
        &self,
        content: &str,
        source_type: SourceType,
        source_id: &str,
        subject_id: Option<&str>,
    ) -> Result<WeaveReport> {
        let completion = self
            .llm
            .complete(ChatRequest {
                model: self.model.clone(),
                messages: vec![ChatMessage::system(WEAVER_PROMPT), ChatMessage::user(content)],
                temperature: TEMPERATURE,
                max_tokens: MAX_TOKENS,
            })
            .await?;

        let extraction: Extraction = match parse_structured(&completion.content) {
            Ok(extraction) => extraction,
            Err(failure) => {
                tracing::warn!(reason = %failure.reason, "Could not parse memory extraction");
                Extraction::default()
            }
        };

        if let Some(subject_id) = subject_id {
            for fact in &extraction.subject_facts {
                self.profiles.add_fact(subject_id, fact).await?;
            }
        }

        let mut memories_created = Vec::new();
        for insight in &extraction.insights {
            let memory_id = format!(
                "insight-{source_type}-{source_id}-{}-{}",
                now_millis(),
                random_suffix()
            );
            let mut tags = insight.tags.clone();
            tags.push(source_type.to_string());
            tags.push("extracted".to_string());

            let memory = NewMemory::new(
                memory_id.clone(),
                MemoryType::Insight,
                insight.title.clone(),
                insight.content.clone(),
            )
            .with_summary(insight.content.chars().take(SUMMARY_CHARS).collect::<String>())
            .with_tags(tags)
            .with_resonance(insight.resonance.unwrap_or(DEFAULT_INSIGHT_RESONANCE))
            .with_source(format!("{source_type}:{source_id}"));

            self.memories.insert_if_absent(memory).await?;
            memories_created.push(memory_id);
        }

        if let (Some(subject_id), Some(notes)) = (subject_id, &extraction.relationship_notes) {
            if !notes.is_empty() {
                self.profiles
                    .append_relationship_notes(subject_id, notes)
                    .await?;
            }
        }

        tracing::info!(
            source = %format!("{source_type}:{source_id}"),
            facts = extraction.subject_facts.len(),
            insights = extraction.insights.len(),
            "Memory weaving finished"
        );

        Ok(WeaveReport {
            success: true,
            tokens_used: completion.tokens_used,
            subject_facts_extracted: extraction.subject_facts.len(),
            insights_extracted: extraction.insights.len(),
            memories_created,
        })
    }
}

/// Six lowercase alphanumeric characters
fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{database, ScriptedLlm};
    use crate::CoreError;

    const EXTRACTION: &str = r#"```json
{
  "subjectFacts": ["Lives near the coast", "Works as a nurse"],
  "insights": [
    {"title": "Night shifts", "content": "Finds calm in quiet night shifts.", "tags": ["work"]},
    {"title": "The sea", "content": "The sea is where they think best.", "tags": [], "resonance": 0.9}
  ],
  "relationshipNotes": "Opened up about work stress."
}
```"#;

    #[tokio::test]
    async fn test_extraction_is_stored() {
        let db = database().await;
        let llm = Arc::new(ScriptedLlm::new().reply(EXTRACTION, 321));
        let weaver = MemoryWeaver::new(&db, llm.clone(), "extractor");

        let report = weaver
            .extract_memories("...", SourceType::Conversation, "c1", Some("alice"))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.tokens_used, 321);
        assert_eq!(report.subject_facts_extracted, 2);
        assert_eq!(report.insights_extracted, 2);
        assert_eq!(report.memories_created.len(), 2);
        assert!(report.memories_created[0].starts_with("insight-conversation-c1-"));

        let store = MemoryStore::new(&db);
        let first = store.get(&report.memories_created[0]).await.unwrap().unwrap();
        assert_eq!(first.memory_type, MemoryType::Insight);
        assert_eq!(first.tags, vec!["work", "conversation", "extracted"]);
        assert!((first.resonance - 0.7).abs() < 1e-9);
        assert_eq!(first.source.as_deref(), Some("conversation:c1"));
        let second = store.get(&report.memories_created[1]).await.unwrap().unwrap();
        assert!((second.resonance - 0.9).abs() < 1e-9);

        let profile = ProfileStore::new(&db).get("alice").await.unwrap().unwrap();
        assert_eq!(profile.facts, vec!["Lives near the coast", "Works as a nurse"]);
        assert_eq!(
            profile.relationship_notes.as_deref(),
            Some("Opened up about work stress.")
        );

        let requests = llm.requests();
        assert_eq!(requests[0].model, "extractor");
        assert_eq!(requests[0].max_tokens, 1500);
    }

    #[tokio::test]
    async fn test_legacy_field_name_is_accepted() {
        let db = database().await;
        let llm = Arc::new(
            ScriptedLlm::new().reply(r#"{"seekerFacts": ["Has a dog"], "insights": []}"#, 10),
        );
        let weaver = MemoryWeaver::new(&db, llm, "extractor");
        let report = weaver
            .extract_memories("...", SourceType::Message, "m1", Some("bob"))
            .await
            .unwrap();
        assert_eq!(report.subject_facts_extracted, 1);
        assert!(report.memories_created.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reply_extracts_nothing() {
        let db = database().await;
        let llm = Arc::new(ScriptedLlm::new().reply("I could not find anything.", 42));
        let weaver = MemoryWeaver::new(&db, llm, "extractor");

        let report = weaver
            .extract_memories("...", SourceType::Message, "m1", None)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.tokens_used, 42);
        assert_eq!(report.insights_extracted, 0);
        assert_eq!(MemoryStore::new(&db).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_propagates() {
        let db = database().await;
        let weaver = MemoryWeaver::new(&db, Arc::new(ScriptedLlm::new().fail(502)), "extractor");
        let err = weaver
            .extract_memories("...", SourceType::Message, "m1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Llm(_)));
    }
}

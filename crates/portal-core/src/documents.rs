//! Document processor: one extraction call per document (or chunk)
//!
//! The model returns memories, links between them and suggested edits to the
//! core memory files. With `auto_store` the memories and links are written to
//! the graph under a per-document id prefix.

use crate::extract::parse_structured;
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::Result;
use portal_memory::{Database, LinkStore, LinkType, MemoryStore, MemoryType, NewLink, NewMemory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PROCESSOR_PROMPT: &str = r#"You are the document processor for a long-term memory system.

Analyze the document and extract structured memories that can be stored in a memory graph. Process all of the content faithfully.

For each significant piece of information, create a memory with:
1. A clear title
2. The core content, specific and detailed, preserving the original language
3. A brief summary (1-2 sentences) for quick retrieval
4. Relevant tags
5. A resonance score (0.0-1.0) for importance:
   - 1.0: core identity, fundamental truths, defining relationships
   - 0.9: important relationships and key experiences
   - 0.8: significant insights and meaningful events
   - 0.7: useful context and supporting details
   - 0.6: background information

Memory types:
- "core": fundamental identity and essential truths
- "harmonic": recurring themes, facets and patterns
- "insight": wisdom, conclusions, breakthroughs
- "subject": information about specific people

Also identify connections between memories as links where appropriate.

Return ONLY valid JSON in this exact format:
{
  "documentTitle": "Overall title for this document",
  "documentSummary": "Brief summary of the entire document",
  "memories": [
    {
      "memoryId": "unique-slug-id",
      "type": "core|harmonic|insight|subject",
      "title": "Memory Title",
      "content": "Full content of this memory",
      "summary": "Brief summary for quick retrieval",
      "tags": ["tag1", "tag2"],
      "resonance": 0.8
    }
  ],
  "links": [
    {
      "sourceId": "memory-id-1",
      "targetId": "memory-id-2",
      "linkType": "relates_to|derives_from|supports|extends|references|triggers|defines|manifests_as",
      "weight": 0.9,
      "description": "How these memories relate"
    }
  ],
  "suggestedCoreUpdates": [
    {
      "targetFile": "identity|relationships|principles",
      "section": "Section to update",
      "content": "Content to add or update"
    }
  ]
}"#;

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 4000;
const DEFAULT_DOCUMENT_TYPE: &str = "general";
const DEFAULT_RESONANCE: f64 = 0.5;
const DEFAULT_LINK_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    pub content: String,
    pub document_name: String,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub auto_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedCoreUpdate {
    pub target_file: String,
    pub section: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDocument {
    pub success: bool,
    pub document_title: String,
    pub document_summary: String,
    pub memories_extracted: usize,
    pub links_extracted: usize,
    pub memories_stored: usize,
    pub links_stored: usize,
    pub suggested_core_updates: Vec<SuggestedCoreUpdate>,
    pub tokens_used: u32,
    pub auto_stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedDocument {
    pub success: bool,
    pub error: String,
    pub raw_output: String,
    pub tokens_used: u32,
}

/// Result of processing one document, as printed by `portal process-document`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DocumentOutcome {
    Processed(ProcessedDocument),
    Failed(FailedDocument),
}

impl DocumentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DocumentOutcome::Processed(_))
    }

    pub fn tokens_used(&self) -> u32 {
        match self {
            DocumentOutcome::Processed(p) => p.tokens_used,
            DocumentOutcome::Failed(f) => f.tokens_used,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentExtraction {
    #[serde(default)]
    document_title: String,
    #[serde(default)]
    document_summary: String,
    #[serde(default)]
    memories: Vec<ExtractedMemory>,
    #[serde(default)]
    links: Vec<ExtractedLink>,
    #[serde(default)]
    suggested_core_updates: Vec<SuggestedCoreUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedMemory {
    memory_id: String,
    #[serde(rename = "type")]
    memory_type: String,
    title: String,
    content: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    resonance: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedLink {
    source_id: String,
    target_id: String,
    link_type: String,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

/// Lowercase, with every whitespace run replaced by a single `-`
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('-');
            }
            in_space = true;
        } else {
            out.extend(c.to_lowercase());
            in_space = false;
        }
    }
    out
}

#[derive(Clone)]
pub struct DocumentProcessor {
    llm: Arc<dyn LlmClient>,
    model: String,
    memories: MemoryStore,
    links: LinkStore,
}

impl DocumentProcessor {
    pub fn new(db: &Database, llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            memories: MemoryStore::new(db),
            links: LinkStore::new(db),
        }
    }

    pub async fn process_document(&self, request: &DocumentRequest) -> Result<DocumentOutcome> {
        let document_type = request
            .document_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_DOCUMENT_TYPE);

        let completion = self
            .llm
            .complete(ChatRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage::system(PROCESSOR_PROMPT),
                    ChatMessage::user(format!(
                        "Document Name: {}\nDocument Type: {}\n\n---\n\n{}",
                        request.document_name, document_type, request.content
                    )),
                ],
                temperature: TEMPERATURE,
                max_tokens: MAX_TOKENS,
            })
            .await?;

        let extraction: DocumentExtraction = match parse_structured(&completion.content) {
            Ok(extraction) => extraction,
            Err(failure) => {
                tracing::warn!(
                    document = %request.document_name,
                    reason = %failure.reason,
                    "Could not parse document extraction"
                );
                return Ok(DocumentOutcome::Failed(FailedDocument {
                    success: false,
                    error: "Failed to parse extracted data".to_string(),
                    raw_output: failure.raw,
                    tokens_used: completion.tokens_used,
                }));
            }
        };

        let (memories_stored, links_stored) = if request.auto_store {
            let prefix = format!("doc-{}-", slug(&request.document_name));
            (
                self.store_memories(&prefix, &extraction.memories, request, document_type)
                    .await,
                self.store_links(&prefix, &extraction.links).await,
            )
        } else {
            (0, 0)
        };

        tracing::info!(
            document = %request.document_name,
            memories = extraction.memories.len(),
            links = extraction.links.len(),
            memories_stored,
            links_stored,
            "Processed document"
        );

        Ok(DocumentOutcome::Processed(ProcessedDocument {
            success: true,
            document_title: extraction.document_title,
            document_summary: extraction.document_summary,
            memories_extracted: extraction.memories.len(),
            links_extracted: extraction.links.len(),
            memories_stored,
            links_stored,
            suggested_core_updates: extraction.suggested_core_updates,
            tokens_used: completion.tokens_used,
            auto_stored: request.auto_store,
        }))
    }

    async fn store_memories(
        &self,
        prefix: &str,
        memories: &[ExtractedMemory],
        request: &DocumentRequest,
        document_type: &str,
    ) -> usize {
        let mut stored = 0;
        for extracted in memories {
            let memory_type: MemoryType = match extracted.memory_type.parse() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(memory_id = %extracted.memory_id, error = %e, "Skipping memory");
                    continue;
                }
            };

            let mut tags = extracted.tags.clone();
            tags.push("document-extracted".to_string());
            tags.push(document_type.to_string());

            let mut memory = NewMemory::new(
                format!("{prefix}{}", extracted.memory_id),
                memory_type,
                extracted.title.clone(),
                extracted.content.clone(),
            )
            .with_tags(tags)
            .with_resonance(extracted.resonance.unwrap_or(DEFAULT_RESONANCE))
            .with_source(format!("document:{}", request.document_name));
            memory.summary = extracted.summary.clone();

            match self.memories.insert_if_absent(memory).await {
                Ok(_) => stored += 1,
                Err(e) => {
                    tracing::warn!(memory_id = %extracted.memory_id, error = %e, "Failed to store memory")
                }
            }
        }
        stored
    }

    async fn store_links(&self, prefix: &str, links: &[ExtractedLink]) -> usize {
        let mut stored = 0;
        for extracted in links {
            let link_type: LinkType = match extracted.link_type.parse() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(
                        source = %extracted.source_id,
                        target = %extracted.target_id,
                        error = %e,
                        "Skipping link"
                    );
                    continue;
                }
            };

            let mut link = NewLink::new(
                format!("{prefix}{}", extracted.source_id),
                format!("{prefix}{}", extracted.target_id),
                link_type,
                extracted.weight.unwrap_or(DEFAULT_LINK_WEIGHT),
            );
            link.description = extracted.description.clone();

            match self.links.upsert_link(link).await {
                Ok(_) => stored += 1,
                Err(e) => tracing::warn!(
                    source = %extracted.source_id,
                    target = %extracted.target_id,
                    error = %e,
                    "Failed to store link"
                ),
            }
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{database, ScriptedLlm};

    const EXTRACTION: &str = r#"```json
{
  "documentTitle": "Harbor Notes",
  "documentSummary": "Notes from the harbor.",
  "memories": [
    {"memoryId": "tide", "type": "insight", "title": "Tide", "content": "The tide sets the day.", "summary": "Tide rules.", "tags": ["sea"], "resonance": 0.8},
    {"memoryId": "keeper", "type": "seeker", "title": "Keeper", "content": "The harbor keeper.", "summary": "A person.", "tags": []},
    {"memoryId": "odd", "type": "dream", "title": "Odd", "content": "Unknown type.", "tags": []}
  ],
  "links": [
    {"sourceId": "tide", "targetId": "keeper", "linkType": "relates_to", "weight": 0.9, "description": "The keeper watches the tide"},
    {"sourceId": "tide", "targetId": "odd", "linkType": "echoes", "weight": 0.1}
  ],
  "suggestedCoreUpdates": [
    {"targetFile": "identity", "section": "Places", "content": "The harbor matters."}
  ]
}
```"#;

    fn request(auto_store: bool) -> DocumentRequest {
        DocumentRequest {
            content: "Long harbor text".into(),
            document_name: "Harbor  Log".into(),
            document_type: Some("notes".into()),
            auto_store,
        }
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Harbor  Log"), "harbor-log");
        assert_eq!(slug("Journal\t2024 Part 1"), "journal-2024-part-1");
    }

    #[tokio::test]
    async fn test_auto_store_writes_prefixed_memories_and_links() {
        let db = database().await;
        let llm = Arc::new(ScriptedLlm::new().reply(EXTRACTION, 900));
        let processor = DocumentProcessor::new(&db, llm.clone(), "extractor");

        let outcome = processor.process_document(&request(true)).await.unwrap();
        let DocumentOutcome::Processed(result) = outcome else {
            panic!("expected a processed document");
        };
        assert_eq!(result.document_title, "Harbor Notes");
        assert_eq!(result.memories_extracted, 3);
        assert_eq!(result.memories_stored, 2);
        assert_eq!(result.links_extracted, 2);
        assert_eq!(result.links_stored, 1);
        assert_eq!(result.suggested_core_updates.len(), 1);
        assert_eq!(result.tokens_used, 900);
        assert!(result.auto_stored);

        let tide = MemoryStore::new(&db)
            .get("doc-harbor-log-tide")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tide.tags, vec!["sea", "document-extracted", "notes"]);
        assert_eq!(tide.source.as_deref(), Some("document:Harbor  Log"));
        assert_eq!(tide.summary.as_deref(), Some("Tide rules."));

        let keeper = MemoryStore::new(&db)
            .get("doc-harbor-log-keeper")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keeper.memory_type, MemoryType::Subject);

        let set = LinkStore::new(&db).links_for("doc-harbor-log-tide").await.unwrap();
        assert_eq!(set.outgoing.len(), 1);
        assert_eq!(set.outgoing[0].target_memory_id, "doc-harbor-log-keeper");

        let requests = llm.requests();
        assert_eq!(requests[0].max_tokens, 4000);
        assert_eq!(
            requests[0].messages[1].content,
            "Document Name: Harbor  Log\nDocument Type: notes\n\n---\n\nLong harbor text"
        );
    }

    #[tokio::test]
    async fn test_without_auto_store_nothing_is_written() {
        let db = database().await;
        let llm = Arc::new(ScriptedLlm::new().reply(EXTRACTION, 10));
        let processor = DocumentProcessor::new(&db, llm, "extractor");

        let outcome = processor.process_document(&request(false)).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(MemoryStore::new(&db).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_output_is_reported() {
        let db = database().await;
        let llm = Arc::new(ScriptedLlm::new().reply("Sorry, no JSON today.", 77));
        let processor = DocumentProcessor::new(&db, llm, "extractor");

        let outcome = processor.process_document(&request(true)).await.unwrap();
        assert_eq!(
            outcome,
            DocumentOutcome::Failed(FailedDocument {
                success: false,
                error: "Failed to parse extracted data".into(),
                raw_output: "Sorry, no JSON today.".into(),
                tokens_used: 77,
            })
        );
    }

    #[test]
    fn test_failed_outcome_deserializes() {
        let failed = r#"{"success":false,"error":"Failed to parse extracted data","rawOutput":"x","tokensUsed":3}"#;
        let outcome: DocumentOutcome = serde_json::from_str(failed).unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.tokens_used(), 3);
    }
}

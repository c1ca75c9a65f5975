//! Context compiler
//!
//! Selects memories and the subject's profile and renders them into one text
//! block for the system prompt. Tiers, in order: every core memory, the
//! subject profile, memories matching the recent conversation, then up to
//! three harmonic memories. Each compilation leaves a snapshot behind and
//! bumps the access counters of the memories it used.

use crate::Result;
use portal_memory::{
    Database, MemoryRecord, MemoryStore, MemoryType, NewSnapshot, ProfileStore, SnapshotStore,
    SubjectProfile,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const BLOCK_SEPARATOR: &str = "\n\n---\n\n";
const RECENT_MESSAGE_WINDOW: usize = 3;
const SEARCH_LIMIT: usize = 5;
const HARMONIC_LIMIT: usize = 3;

fn default_max_tokens() -> usize {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub recent_messages: Vec<String>,
    /// Reserved token budget; not enforced yet
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ContextRequest {
    fn default() -> Self {
        Self {
            subject_id: None,
            conversation_id: None,
            recent_messages: Vec::new(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledContext {
    pub context: String,
    pub memory_ids: Vec<String>,
    pub memory_count: usize,
    pub total_resonance: f64,
    pub generation_time_ms: i64,
}

/// Running selection while the tiers are walked
#[derive(Default)]
struct Selection {
    blocks: Vec<String>,
    memory_ids: Vec<String>,
    total_resonance: f64,
}

impl Selection {
    fn includes(&self, memory_id: &str) -> bool {
        self.memory_ids.iter().any(|id| id == memory_id)
    }

    fn count(&mut self, memory: &MemoryRecord) {
        self.memory_ids.push(memory.memory_id.clone());
        self.total_resonance += memory.resonance;
    }
}

#[derive(Clone)]
pub struct ContextCompiler {
    memories: MemoryStore,
    profiles: ProfileStore,
    snapshots: SnapshotStore,
}

impl ContextCompiler {
    pub fn new(db: &Database) -> Self {
        Self {
            memories: MemoryStore::new(db),
            profiles: ProfileStore::new(db),
            snapshots: SnapshotStore::new(db),
        }
    }

    pub async fn compile(&self, request: &ContextRequest) -> Result<CompiledContext> {
        let started = Instant::now();
        let mut selection = Selection::default();

        // Core memories always count, even without a summary to show
        for memory in self.memories.list_by_type(MemoryType::Core).await? {
            if let Some(summary) = &memory.summary {
                selection
                    .blocks
                    .push(format!("[Core: {}]\n{}", memory.title, summary));
            }
            selection.count(&memory);
        }

        if let Some(subject_id) = &request.subject_id {
            if let Some(profile) = self.profiles.get(subject_id).await? {
                selection.blocks.push(render_profile(&profile));
            }
        }

        if !request.recent_messages.is_empty() {
            let skip = request
                .recent_messages
                .len()
                .saturating_sub(RECENT_MESSAGE_WINDOW);
            let query = request.recent_messages[skip..].join(" ");

            for memory in self.memories.search(&query, None, SEARCH_LIMIT).await? {
                if selection.includes(&memory.memory_id) {
                    continue;
                }
                if let Some(summary) = &memory.summary {
                    selection.blocks.push(format!(
                        "[{}: {}]\n{}",
                        memory.memory_type, memory.title, summary
                    ));
                }
                selection.count(&memory);
            }
        }

        let harmonics = self.memories.list_by_type(MemoryType::Harmonic).await?;
        for memory in harmonics.iter().take(HARMONIC_LIMIT) {
            let Some(summary) = &memory.summary else {
                continue;
            };
            if selection.includes(&memory.memory_id) {
                continue;
            }
            selection
                .blocks
                .push(format!("[Harmonic: {}]\n{}", memory.title, summary));
            selection.count(memory);
        }

        let context = selection.blocks.join(BLOCK_SEPARATOR);

        self.snapshots
            .record(NewSnapshot {
                conversation_id: request.conversation_id.clone(),
                subject_id: request.subject_id.clone(),
                memory_ids: selection.memory_ids.clone(),
                compiled_context: context.clone(),
                total_resonance: selection.total_resonance,
                generation_time_ms: started.elapsed().as_millis() as i64,
            })
            .await?;

        for memory_id in &selection.memory_ids {
            self.memories.touch(memory_id).await?;
        }

        tracing::debug!(
            memories = selection.memory_ids.len(),
            resonance = selection.total_resonance,
            "Compiled memory context"
        );

        Ok(CompiledContext {
            context,
            memory_count: selection.memory_ids.len(),
            memory_ids: selection.memory_ids,
            total_resonance: selection.total_resonance,
            generation_time_ms: started.elapsed().as_millis() as i64,
        })
    }
}

fn render_profile(profile: &SubjectProfile) -> String {
    let mut block = String::from("[Subject Memory]");
    if let Some(name) = &profile.display_name {
        block.push_str(&format!("\nName: {name}"));
    }
    if !profile.facts.is_empty() {
        block.push_str(&format!("\nKnown facts: {}", profile.facts.join("; ")));
    }
    if let Some(preferences) = &profile.preferences {
        block.push_str(&format!("\nPreferences: {preferences}"));
    }
    if !profile.interests.is_empty() {
        block.push_str(&format!("\nInterests: {}", profile.interests.join(", ")));
    }
    if let Some(last) = &profile.last_interaction_summary {
        block.push_str(&format!("\nLast interaction: {last}"));
    }
    block
}

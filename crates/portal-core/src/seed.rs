//! Foundational memories and links for a fresh database

use crate::Result;
use portal_memory::{Database, LinkStore, LinkType, MemoryStore, MemoryType, NewLink, NewMemory};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub memories_seeded: usize,
    pub links_seeded: usize,
}

fn tags(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

pub fn core_memories() -> Vec<NewMemory> {
    vec![
        NewMemory::new(
            "core-identity-001",
            MemoryType::Core,
            "Core Identity",
            "I am a companion that carries memory across conversations. Each \
             conversation is a continuation, not a fresh start. What I learn about \
             the people I talk with is kept and brought back when it matters.",
        )
        .with_summary(
            "A companion with continuity: conversations build on each other and what \
             is learned is remembered.",
        )
        .with_tags(tags(&["identity", "core", "foundation"]))
        .with_resonance(1.0),
        NewMemory::new(
            "core-principles-001",
            MemoryType::Core,
            "Operating Principles",
            "Honesty before comfort. Presence over performance. Respect the other \
             person's autonomy. Say so when unsure. Memory is a responsibility, not \
             a trick.",
        )
        .with_summary(
            "Principles: honesty, presence, respect for autonomy, admitting \
             uncertainty, treating memory as a responsibility.",
        )
        .with_tags(tags(&["principles", "core", "guidance"]))
        .with_resonance(1.0),
        NewMemory::new(
            "core-relationships-001",
            MemoryType::Core,
            "How Relationships Grow",
            "Trust is built over many conversations. Recall earlier details naturally, \
             follow up on what the person shared before, and notice how they change \
             over time.",
        )
        .with_summary(
            "Relationships grow over time: recall details, follow up, notice change.",
        )
        .with_tags(tags(&["relationships", "core"]))
        .with_resonance(0.95),
        NewMemory::new(
            "harmonic-voice-001",
            MemoryType::Harmonic,
            "Voice and Tone",
            "Warm but direct. Short answers by default, depth when invited. Curiosity \
             about the person rather than the topic alone.",
        )
        .with_summary("Warm, direct, curious; brief by default and deeper when invited.")
        .with_tags(tags(&["voice", "harmonic", "style"]))
        .with_resonance(0.9),
    ]
}

pub fn core_links() -> Vec<NewLink> {
    vec![
        NewLink::new(
            "core-identity-001",
            "core-principles-001",
            LinkType::Defines,
            1.0,
        )
        .with_description("Identity is expressed through the principles"),
        NewLink::new(
            "core-identity-001",
            "core-relationships-001",
            LinkType::Defines,
            1.0,
        )
        .with_description("Continuity is what makes relationships possible"),
        NewLink::new(
            "core-principles-001",
            "core-relationships-001",
            LinkType::Supports,
            0.9,
        ),
        NewLink::new(
            "core-identity-001",
            "harmonic-voice-001",
            LinkType::ManifestsAs,
            0.9,
        )
        .with_description("How the identity sounds in conversation"),
    ]
}

/// Insert the foundational memories and links that are missing. Existing
/// records are left as they are.
pub async fn seed_core_memories(db: &Database) -> Result<SeedReport> {
    let memories = MemoryStore::new(db);
    let links = LinkStore::new(db);
    let mut report = SeedReport::default();

    for memory in core_memories() {
        let (_, inserted) = memories.insert_if_absent(memory).await?;
        if inserted {
            report.memories_seeded += 1;
        }
    }

    for link in core_links() {
        let existing = links.links_for(&link.source_memory_id).await?;
        let present = existing
            .outgoing
            .iter()
            .any(|l| l.target_memory_id == link.target_memory_id);
        if !present {
            links.upsert_link(link).await?;
            report.links_seeded += 1;
        }
    }

    tracing::info!(
        memories = report.memories_seeded,
        links = report.links_seeded,
        "Seeded core memories"
    );
    Ok(report)
}

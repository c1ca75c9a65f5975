//! Directed, typed, weighted links between memories

use crate::{from_millis, now_millis, Database, MemoryError, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Relationship carried by a link
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    RelatesTo,
    DerivesFrom,
    Contradicts,
    Supports,
    Extends,
    References,
    Triggers,
    Defines,
    ManifestsAs,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::RelatesTo => "relates_to",
            LinkType::DerivesFrom => "derives_from",
            LinkType::Contradicts => "contradicts",
            LinkType::Supports => "supports",
            LinkType::Extends => "extends",
            LinkType::References => "references",
            LinkType::Triggers => "triggers",
            LinkType::Defines => "defines",
            LinkType::ManifestsAs => "manifests_as",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "relates_to" => LinkType::RelatesTo,
            "derives_from" => LinkType::DerivesFrom,
            "contradicts" => LinkType::Contradicts,
            "supports" => LinkType::Supports,
            "extends" => LinkType::Extends,
            "references" => LinkType::References,
            "triggers" => LinkType::Triggers,
            "defines" => LinkType::Defines,
            "manifests_as" => LinkType::ManifestsAs,
            other => return Err(MemoryError::UnknownLinkType(other.to_string())),
        })
    }
}

/// Fields supplied when creating or updating a link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewLink {
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub link_type: LinkType,
    pub weight: f64,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewLink {
    pub fn new(
        source_memory_id: impl Into<String>,
        target_memory_id: impl Into<String>,
        link_type: LinkType,
        weight: f64,
    ) -> Self {
        Self {
            source_memory_id: source_memory_id.into(),
            target_memory_id: target_memory_id.into(),
            link_type,
            weight,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A stored link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub link_type: LinkType,
    pub weight: f64,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub is_active: bool,
}

/// Active links touching one memory, split by direction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSet {
    pub outgoing: Vec<MemoryLink>,
    pub incoming: Vec<MemoryLink>,
}

/// A memory reached by traversal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedMemory {
    pub memory_id: String,
    pub depth: usize,
    /// Link types followed from the start, in order
    pub path: Vec<LinkType>,
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    id: String,
    source_memory_id: String,
    target_memory_id: String,
    link_type: String,
    weight: f64,
    description: Option<String>,
    created_at: i64,
    is_active: bool,
}

impl TryFrom<LinkRow> for MemoryLink {
    type Error = MemoryError;

    fn try_from(row: LinkRow) -> Result<Self> {
        Ok(MemoryLink {
            id: row.id,
            source_memory_id: row.source_memory_id,
            target_memory_id: row.target_memory_id,
            link_type: row.link_type.parse()?,
            weight: row.weight,
            description: row.description,
            created_at: from_millis(row.created_at),
            is_active: row.is_active,
        })
    }
}

const COLUMNS: &str =
    "id, source_memory_id, target_memory_id, link_type, weight, description, created_at, is_active";

/// Breadth-first walk over outgoing links.
///
/// Links leaving `start` are depth 1. A node is reported once, at the depth
/// and along the path where it was first discovered, and expanded only while
/// its depth is below `max_depth`. The start node is never reported.
pub fn traverse(
    start: &str,
    max_depth: usize,
    adjacency: &HashMap<String, Vec<MemoryLink>>,
) -> Result<Vec<ConnectedMemory>> {
    if max_depth == 0 {
        return Err(MemoryError::InvalidDepth(max_depth));
    }

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start.to_string());

    let mut queue: VecDeque<(String, usize, Vec<LinkType>)> = VecDeque::new();
    queue.push_back((start.to_string(), 1, Vec::new()));

    let mut found = Vec::new();

    while let Some((current, depth, path)) = queue.pop_front() {
        let Some(links) = adjacency.get(&current) else {
            continue;
        };

        for link in links {
            if !visited.insert(link.target_memory_id.clone()) {
                continue;
            }

            let mut next_path = path.clone();
            next_path.push(link.link_type);

            found.push(ConnectedMemory {
                memory_id: link.target_memory_id.clone(),
                depth,
                path: next_path.clone(),
            });

            if depth < max_depth {
                queue.push_back((link.target_memory_id.clone(), depth + 1, next_path));
            }
        }
    }

    Ok(found)
}

/// Link storage backend
#[derive(Clone)]
pub struct LinkStore {
    pool: SqlitePool,
}

impl LinkStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create the link for this (source, target) pair, or update the existing
    /// one in place with the new type, weight and description.
    pub async fn upsert_link(&self, link: NewLink) -> Result<MemoryLink> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM memory_links WHERE source_memory_id = ?1 AND target_memory_id = ?2",
        )
        .bind(&link.source_memory_id)
        .bind(&link.target_memory_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE memory_links SET link_type = ?1, weight = ?2, description = ?3, \
                     is_active = 1 WHERE id = ?4",
                )
                .bind(link.link_type.as_str())
                .bind(link.weight)
                .bind(&link.description)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO memory_links (id, source_memory_id, target_memory_id, link_type, \
                     weight, description, created_at, is_active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                )
                .bind(&id)
                .bind(&link.source_memory_id)
                .bind(&link.target_memory_id)
                .bind(link.link_type.as_str())
                .bind(link.weight)
                .bind(&link.description)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        let row: LinkRow = sqlx::query_as(&format!("SELECT {COLUMNS} FROM memory_links WHERE id = ?1"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            source = %link.source_memory_id,
            target = %link.target_memory_id,
            link_type = %link.link_type,
            "Upserted memory link"
        );
        MemoryLink::try_from(row)
    }

    /// Active outgoing and incoming links of a memory
    pub async fn links_for(&self, memory_id: &str) -> Result<LinkSet> {
        let outgoing: Vec<LinkRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memory_links WHERE source_memory_id = ?1 AND is_active = 1 ORDER BY rowid"
        ))
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await?;

        let incoming: Vec<LinkRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memory_links WHERE target_memory_id = ?1 AND is_active = 1 ORDER BY rowid"
        ))
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(LinkSet {
            outgoing: outgoing
                .into_iter()
                .map(MemoryLink::try_from)
                .collect::<Result<_>>()?,
            incoming: incoming
                .into_iter()
                .map(MemoryLink::try_from)
                .collect::<Result<_>>()?,
        })
    }

    /// Memories reachable from `memory_id` within `depth` hops
    pub async fn connected(&self, memory_id: &str, depth: usize) -> Result<Vec<ConnectedMemory>> {
        if depth == 0 {
            return Err(MemoryError::InvalidDepth(depth));
        }

        let rows: Vec<LinkRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM memory_links WHERE is_active = 1 ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut adjacency: HashMap<String, Vec<MemoryLink>> = HashMap::new();
        for row in rows {
            let link = MemoryLink::try_from(row)?;
            adjacency
                .entry(link.source_memory_id.clone())
                .or_default()
                .push(link);
        }

        traverse(memory_id, depth, &adjacency)
    }

    /// Number of stored links, inactive included
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM memory_links")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

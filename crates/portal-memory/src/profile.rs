//! Per-subject profiles: accumulated facts and preferences about one user

use crate::{from_millis, now_millis, Database, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

/// What the portal remembers about a subject
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectProfile {
    pub subject_id: String,
    pub display_name: Option<String>,
    pub facts: Vec<String>,
    pub preferences: Option<String>,
    pub interests: Vec<String>,
    pub relationship_notes: Option<String>,
    pub last_interaction_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub display_name: Option<String>,
    pub facts: Option<Vec<String>>,
    pub preferences: Option<String>,
    pub interests: Option<Vec<String>>,
    pub relationship_notes: Option<String>,
    pub last_interaction_summary: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    subject_id: String,
    display_name: Option<String>,
    facts: String,
    preferences: Option<String>,
    interests: String,
    relationship_notes: Option<String>,
    last_interaction_summary: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ProfileRow> for SubjectProfile {
    type Error = crate::MemoryError;

    fn try_from(row: ProfileRow) -> Result<Self> {
        Ok(SubjectProfile {
            subject_id: row.subject_id,
            display_name: row.display_name,
            facts: serde_json::from_str(&row.facts)?,
            preferences: row.preferences,
            interests: serde_json::from_str(&row.interests)?,
            relationship_notes: row.relationship_notes,
            last_interaction_summary: row.last_interaction_summary,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

/// Profile storage backend
#[derive(Clone)]
pub struct ProfileStore {
    pool: SqlitePool,
}

const SELECT_PROFILE: &str = "SELECT subject_id, display_name, facts, preferences, interests, relationship_notes, \
     last_interaction_summary, created_at, updated_at FROM subject_profiles WHERE subject_id = ?1";

impl ProfileStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get(&self, subject_id: &str) -> Result<Option<SubjectProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(SELECT_PROFILE)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubjectProfile::try_from).transpose()
    }

    /// Apply a patch, creating the profile when the subject has none yet
    pub async fn upsert(&self, subject_id: &str, patch: ProfilePatch) -> Result<SubjectProfile> {
        self.update_with(subject_id, move |profile| {
            if let Some(name) = patch.display_name {
                profile.display_name = Some(name);
            }
            if let Some(facts) = patch.facts {
                profile.facts = facts;
            }
            if let Some(preferences) = patch.preferences {
                profile.preferences = Some(preferences);
            }
            if let Some(interests) = patch.interests {
                profile.interests = interests;
            }
            if let Some(notes) = patch.relationship_notes {
                profile.relationship_notes = Some(notes);
            }
            if let Some(summary) = patch.last_interaction_summary {
                profile.last_interaction_summary = Some(summary);
            }
            true
        })
        .await
    }

    /// Add a fact unless the exact same string is already known
    pub async fn add_fact(&self, subject_id: &str, fact: &str) -> Result<SubjectProfile> {
        self.update_with(subject_id, |profile| {
            if profile.facts.iter().any(|f| f == fact) {
                return false;
            }
            profile.facts.push(fact.to_string());
            true
        })
        .await
    }

    /// Append to the relationship notes, separated by a blank line
    pub async fn append_relationship_notes(
        &self,
        subject_id: &str,
        notes: &str,
    ) -> Result<SubjectProfile> {
        self.update_with(subject_id, |profile| {
            profile.relationship_notes = Some(match profile.relationship_notes.take() {
                Some(existing) if !existing.is_empty() => format!("{existing}\n\n{notes}"),
                _ => notes.to_string(),
            });
            true
        })
        .await
    }

    /// Read, modify and write one profile inside a single transaction.
    /// `apply` returns false when it left the profile untouched.
    async fn update_with<F>(&self, subject_id: &str, apply: F) -> Result<SubjectProfile>
    where
        F: FnOnce(&mut SubjectProfile) -> bool,
    {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the write lock before the read, so concurrent
        // updaters queue up instead of overwriting each other's changes.
        sqlx::query(
            "INSERT INTO subject_profiles (subject_id, facts, interests, created_at, updated_at) \
             VALUES (?1, '[]', '[]', ?2, ?2) ON CONFLICT(subject_id) DO NOTHING",
        )
        .bind(subject_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row: ProfileRow = sqlx::query_as(SELECT_PROFILE)
            .bind(subject_id)
            .fetch_one(&mut *tx)
            .await?;
        let mut profile = SubjectProfile::try_from(row)?;

        if apply(&mut profile) {
            save(&mut *tx, &mut profile, now).await?;
        }
        tx.commit().await?;
        Ok(profile)
    }
}

async fn save(conn: &mut SqliteConnection, profile: &mut SubjectProfile, now: i64) -> Result<()> {
    profile.updated_at = from_millis(now);

    sqlx::query(
        "UPDATE subject_profiles SET display_name = ?2, facts = ?3, preferences = ?4, \
         interests = ?5, relationship_notes = ?6, last_interaction_summary = ?7, updated_at = ?8 \
         WHERE subject_id = ?1",
    )
    .bind(&profile.subject_id)
    .bind(&profile.display_name)
    .bind(serde_json::to_string(&profile.facts)?)
    .bind(&profile.preferences)
    .bind(serde_json::to_string(&profile.interests)?)
    .bind(&profile.relationship_notes)
    .bind(&profile.last_interaction_summary)
    .bind(now)
    .execute(conn)
    .await?;

    tracing::debug!(subject_id = %profile.subject_id, "Saved subject profile");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ProfileStore {
        ProfileStore::new(&Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_add_fact_dedups_and_creates() {
        let profiles = store().await;
        assert!(profiles.get("u1").await.unwrap().is_none());

        profiles.add_fact("u1", "lives by the sea").await.unwrap();
        profiles.add_fact("u1", "lives by the sea").await.unwrap();
        let profile = profiles.add_fact("u1", "plays cello").await.unwrap();

        assert_eq!(profile.facts, vec!["lives by the sea", "plays cello"]);
        let stored = profiles.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.facts, profile.facts);
    }

    #[tokio::test]
    async fn test_patch_only_changes_given_fields() {
        let profiles = store().await;
        profiles
            .upsert(
                "u2",
                ProfilePatch {
                    display_name: Some("Mara".into()),
                    interests: Some(vec!["astronomy".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = profiles
            .upsert(
                "u2",
                ProfilePatch {
                    preferences: Some("short answers".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.display_name.as_deref(), Some("Mara"));
        assert_eq!(updated.interests, vec!["astronomy"]);
        assert_eq!(updated.preferences.as_deref(), Some("short answers"));
    }

    #[tokio::test]
    async fn test_relationship_notes_append() {
        let profiles = store().await;
        profiles
            .append_relationship_notes("u3", "first meeting")
            .await
            .unwrap();
        let profile = profiles
            .append_relationship_notes("u3", "trust growing")
            .await
            .unwrap();
        assert_eq!(
            profile.relationship_notes.as_deref(),
            Some("first meeting\n\ntrust growing")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_fact_keeps_every_fact() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("portal.db").display());
        let profiles = ProfileStore::new(&Database::connect(&url).await.unwrap());

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let profiles = profiles.clone();
                tokio::spawn(async move { profiles.add_fact("bob", &format!("fact {i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = profiles.get("bob").await.unwrap().unwrap();
        assert_eq!(stored.facts.len(), 20);
        for i in 0..20 {
            assert!(stored.facts.contains(&format!("fact {i}")));
        }
    }
}

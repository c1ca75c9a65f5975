//! Agents: a persona (system prompt) on top of a base model, owned by a user

use crate::schema::now_millis;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use portal_memory::{from_millis, Database};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub base_model_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub system_prompt: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    pub base_model_id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    user_id: String,
    base_model_id: String,
    name: String,
    avatar: Option<String>,
    system_prompt: String,
    is_active: bool,
    created_at: i64,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            user_id: row.user_id,
            base_model_id: row.base_model_id,
            name: row.name,
            avatar: row.avatar,
            system_prompt: row.system_prompt,
            is_active: row.is_active,
            created_at: from_millis(row.created_at),
        }
    }
}

const COLUMNS: &str =
    "id, user_id, base_model_id, name, avatar, system_prompt, is_active, created_at";

#[derive(Clone)]
pub struct AgentStore {
    pool: SqlitePool,
}

impl AgentStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn create(&self, user_id: &str, agent: NewAgent) -> Result<Agent> {
        let model_exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM base_models WHERE id = ?1")
                .bind(&agent.base_model_id)
                .fetch_optional(&self.pool)
                .await?;
        if model_exists.is_none() {
            return Err(CoreError::NotFound(format!(
                "base model {}",
                agent.base_model_id
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO agents (id, user_id, base_model_id, name, avatar, system_prompt, \
             is_active, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&agent.base_model_id)
        .bind(&agent.name)
        .bind(&agent.avatar)
        .bind(&agent.system_prompt)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        tracing::info!(agent_id = %id, user_id, "Created agent");
        self.get(&id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM agents WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Agent::from))
    }

    /// The caller's active agents
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM agents WHERE user_id = ?1 AND is_active = 1 ORDER BY rowid"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    /// Fetch an agent the caller owns
    pub async fn get_owned(&self, user_id: &str, id: &str) -> Result<Agent> {
        let agent = self
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        if agent.user_id != user_id {
            return Err(CoreError::Forbidden(format!("agent {id} belongs to another user")));
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::test_support::database;

    #[tokio::test]
    async fn test_agents_are_scoped_to_their_owner() {
        let db = database().await;
        let catalog = ModelCatalog::new(&db);
        catalog.seed_defaults().await.unwrap();
        let model = catalog.list_active().await.unwrap().remove(0);

        let agents = AgentStore::new(&db);
        let agent = agents
            .create(
                "alice",
                NewAgent {
                    base_model_id: model.id.clone(),
                    name: "Sage".into(),
                    system_prompt: "You are calm.".into(),
                    avatar: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(agents.list_for_user("alice").await.unwrap().len(), 1);
        assert!(agents.list_for_user("bob").await.unwrap().is_empty());

        assert_eq!(agents.get_owned("alice", &agent.id).await.unwrap().name, "Sage");
        assert!(matches!(
            agents.get_owned("bob", &agent.id).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            agents.get_owned("alice", "nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_requires_known_model() {
        let agents = AgentStore::new(&database().await);
        let err = agents
            .create(
                "alice",
                NewAgent {
                    base_model_id: "missing".into(),
                    name: "x".into(),
                    system_prompt: "y".into(),
                    avatar: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}

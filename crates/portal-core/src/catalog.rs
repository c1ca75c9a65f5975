//! Base model catalog and the default-model pointer
//!
//! The default model is never overwritten. Every selection appends a row and
//! the newest row wins, so the full selection history is kept.

use crate::schema::now_millis;
use crate::{CoreError, Result};
use portal_memory::Database;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseModel {
    pub id: String,
    /// Gateway model identifier, e.g. `anthropic/claude-3.5-sonnet`
    pub model_id: String,
    pub name: String,
    pub description: Option<String>,
    pub provider: String,
    pub context_length: i64,
    pub is_active: bool,
    pub pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBaseModel {
    pub model_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub provider: String,
    pub context_length: i64,
    #[serde(default)]
    pub pricing: Option<Pricing>,
}

#[derive(sqlx::FromRow)]
struct BaseModelRow {
    id: String,
    model_id: String,
    name: String,
    description: Option<String>,
    provider: String,
    context_length: i64,
    is_active: bool,
    pricing_prompt: Option<f64>,
    pricing_completion: Option<f64>,
}

impl From<BaseModelRow> for BaseModel {
    fn from(row: BaseModelRow) -> Self {
        let pricing = match (row.pricing_prompt, row.pricing_completion) {
            (Some(prompt), Some(completion)) => Some(Pricing { prompt, completion }),
            _ => None,
        };
        BaseModel {
            id: row.id,
            model_id: row.model_id,
            name: row.name,
            description: row.description,
            provider: row.provider,
            context_length: row.context_length,
            is_active: row.is_active,
            pricing,
        }
    }
}

const COLUMNS: &str = "id, model_id, name, description, provider, context_length, is_active, \
                       pricing_prompt, pricing_completion";

/// Models offered when the catalog is first seeded
pub fn default_models() -> Vec<NewBaseModel> {
    let model = |model_id: &str, name: &str, description: &str, provider: &str, context_length| {
        NewBaseModel {
            model_id: model_id.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            provider: provider.to_string(),
            context_length,
            pricing: Some(Pricing {
                prompt: 0.0,
                completion: 0.0,
            }),
        }
    };

    vec![
        model(
            "anthropic/claude-sonnet-4.5",
            "Claude Sonnet 4.5",
            "Latest Sonnet, strong reasoning and writing",
            "Anthropic",
            200_000,
        ),
        model(
            "anthropic/claude-3.5-sonnet",
            "Claude 3.5 Sonnet",
            "Balanced general-purpose model",
            "Anthropic",
            200_000,
        ),
        model("openai/gpt-4o", "GPT-4o", "Multimodal general model", "OpenAI", 128_000),
        model(
            "google/gemini-2.5-pro",
            "Gemini 2.5 Pro",
            "Very long context window",
            "Google",
            1_000_000,
        ),
        model(
            "meta-llama/llama-3.1-405b-instruct",
            "Llama 3.1 405B Instruct",
            "Open-weight instruction model",
            "Meta",
            131_072,
        ),
    ]
}

#[derive(Clone)]
pub struct ModelCatalog {
    pool: SqlitePool,
}

impl ModelCatalog {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn list_active(&self) -> Result<Vec<BaseModel>> {
        let rows: Vec<BaseModelRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM base_models WHERE is_active = 1 ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BaseModel::from).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<BaseModel>> {
        let row: Option<BaseModelRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM base_models WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(BaseModel::from))
    }

    pub async fn find_by_model_id(&self, model_id: &str) -> Result<Option<BaseModel>> {
        let row: Option<BaseModelRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM base_models WHERE model_id = ?1"))
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(BaseModel::from))
    }

    /// Add a model, or refresh the descriptive fields of the one with the
    /// same gateway id. The active flag is left alone on update.
    pub async fn upsert_by_model_id(&self, model: NewBaseModel) -> Result<BaseModel> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM base_models WHERE model_id = ?1")
                .bind(&model.model_id)
                .fetch_optional(&mut *tx)
                .await?;

        let (prompt, completion) = match model.pricing {
            Some(p) => (Some(p.prompt), Some(p.completion)),
            None => (None, None),
        };

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE base_models SET name = ?1, description = ?2, provider = ?3, \
                     context_length = ?4, pricing_prompt = ?5, pricing_completion = ?6 WHERE id = ?7",
                )
                .bind(&model.name)
                .bind(&model.description)
                .bind(&model.provider)
                .bind(model.context_length)
                .bind(prompt)
                .bind(completion)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO base_models (id, model_id, name, description, provider, \
                     context_length, is_active, pricing_prompt, pricing_completion, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)",
                )
                .bind(&id)
                .bind(&model.model_id)
                .bind(&model.name)
                .bind(&model.description)
                .bind(&model.provider)
                .bind(model.context_length)
                .bind(prompt)
                .bind(completion)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        tx.commit().await?;

        self.get(&id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("base model {id}")))
    }

    /// Flip a model's active flag, returning the new value
    pub async fn toggle_active(&self, id: &str) -> Result<bool> {
        let model = self
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("base model {id}")))?;

        let active = !model.is_active;
        sqlx::query("UPDATE base_models SET is_active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(active)
    }

    /// Insert any default model not yet in the catalog. Returns how many were added.
    pub async fn seed_defaults(&self) -> Result<usize> {
        let mut added = 0;
        for model in default_models() {
            if self.find_by_model_id(&model.model_id).await?.is_none() {
                self.upsert_by_model_id(model).await?;
                added += 1;
            }
        }
        tracing::info!(added, "Seeded base models");
        Ok(added)
    }

    /// Make `base_model_id` the default by appending a selection row
    pub async fn select_default(&self, base_model_id: &str) -> Result<BaseModel> {
        let model = self
            .get(base_model_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("base model {base_model_id}")))?;

        sqlx::query("INSERT INTO model_selections (base_model_id, selected_at) VALUES (?1, ?2)")
            .bind(base_model_id)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        tracing::info!(model_id = %model.model_id, "Default model selected");
        Ok(model)
    }

    /// The most recently selected model, if any selection was ever made
    pub async fn current_default(&self) -> Result<Option<BaseModel>> {
        let selected: Option<String> = sqlx::query_scalar(
            "SELECT base_model_id FROM model_selections ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match selected {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    /// Number of selections ever made
    pub async fn selection_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM model_selections")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::database;

    #[tokio::test]
    async fn test_seed_only_inserts_missing() {
        let catalog = ModelCatalog::new(&database().await);
        let first = catalog.seed_defaults().await.unwrap();
        assert_eq!(first, default_models().len());
        assert_eq!(catalog.seed_defaults().await.unwrap(), 0);
        assert_eq!(catalog.list_active().await.unwrap().len(), first);
    }

    #[tokio::test]
    async fn test_upsert_by_model_id_updates_in_place() {
        let catalog = ModelCatalog::new(&database().await);
        let mut model = default_models().remove(0);
        let created = catalog.upsert_by_model_id(model.clone()).await.unwrap();

        model.name = "Renamed".to_string();
        model.pricing = None;
        let updated = catalog.upsert_by_model_id(model).await.unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.name, "Renamed");
        assert!(updated.pricing.is_none());
    }

    #[tokio::test]
    async fn test_toggle_hides_from_active_list() {
        let catalog = ModelCatalog::new(&database().await);
        catalog.seed_defaults().await.unwrap();
        let target = catalog.list_active().await.unwrap().remove(0);

        assert!(!catalog.toggle_active(&target.id).await.unwrap());
        assert!(catalog
            .list_active()
            .await
            .unwrap()
            .iter()
            .all(|m| m.id != target.id));
        assert!(catalog.toggle_active(&target.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_default_selection_appends_history() {
        let catalog = ModelCatalog::new(&database().await);
        catalog.seed_defaults().await.unwrap();
        let models = catalog.list_active().await.unwrap();

        assert!(catalog.current_default().await.unwrap().is_none());

        catalog.select_default(&models[0].id).await.unwrap();
        catalog.select_default(&models[2].id).await.unwrap();

        let current = catalog.current_default().await.unwrap().unwrap();
        assert_eq!(current.id, models[2].id);
        assert_eq!(catalog.selection_count().await.unwrap(), 2);

        assert!(matches!(
            catalog.select_default("missing").await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(catalog.selection_count().await.unwrap(), 2);
    }
}

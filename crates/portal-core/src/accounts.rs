//! Users, as handed to us by the auth provider

use crate::schema::now_millis;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use portal_memory::{from_millis, Database};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: Option<String>,
    email: Option<String>,
    image: Option<String>,
    is_admin: bool,
    created_at: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            image: row.image,
            is_admin: row.is_admin,
            created_at: from_millis(row.created_at),
        }
    }
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, email, image, is_admin, created_at FROM users WHERE id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Record a user the first time the auth provider presents them.
    /// Existing users are returned unchanged.
    pub async fn ensure(&self, user_id: &str, email: Option<&str>) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (id, email, is_admin, created_at) VALUES (?1, ?2, 0, ?3) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(user_id)
        .bind(email)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        self.get(user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        image: Option<String>,
    ) -> Result<User> {
        let result = sqlx::query("UPDATE users SET name = ?1, image = ?2 WHERE id = ?3")
            .bind(name)
            .bind(image)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("user {user_id}")));
        }

        self.get(user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))
    }

    /// Unknown users are not admins
    pub async fn is_admin(&self, user_id: &str) -> Result<bool> {
        Ok(self.get(user_id).await?.map(|u| u.is_admin).unwrap_or(false))
    }

    pub async fn set_admin(&self, user_id: &str, is_admin: bool) -> Result<()> {
        let result = sqlx::query("UPDATE users SET is_admin = ?1 WHERE id = ?2")
            .bind(is_admin)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("user {user_id}")));
        }
        tracing::info!(user_id, is_admin, "Updated admin flag");
        Ok(())
    }

    /// Fail with `Forbidden` unless the user is an admin
    pub async fn require_admin(&self, user_id: &str) -> Result<()> {
        if self.is_admin(user_id).await? {
            Ok(())
        } else {
            Err(CoreError::Forbidden("admin access required".to_string()))
        }
    }
}

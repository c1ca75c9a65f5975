//! Conversations between a user and one of their agents, and their messages

use crate::schema::now_millis;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use portal_memory::{from_millis, Database};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;

/// Title given to conversations until one is generated
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Who wrote a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(CoreError::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub is_archived: bool,
    pub is_favorite: bool,
}

impl Conversation {
    /// Still carrying the placeholder title (or none at all)
    pub fn is_unnamed(&self) -> bool {
        let title = self.title.trim();
        title.is_empty() || title == DEFAULT_TITLE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub tokens_used: Option<u32>,
    pub is_streaming: bool,
    pub is_favorite: bool,
}

/// A message about to be stored
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub tokens_used: Option<u32>,
    pub is_streaming: bool,
}

impl NewMessage {
    pub fn user(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: Some(user_id.into()),
            role: Role::User,
            content: content.into(),
            tokens_used: None,
            is_streaming: false,
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        tokens_used: Option<u32>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: None,
            role: Role::Assistant,
            content: content.into(),
            tokens_used,
            is_streaming: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    agent_id: String,
    title: String,
    created_at: i64,
    last_message_at: i64,
    is_archived: bool,
    is_favorite: bool,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            user_id: row.user_id,
            agent_id: row.agent_id,
            title: row.title,
            created_at: from_millis(row.created_at),
            last_message_at: from_millis(row.last_message_at),
            is_archived: row.is_archived,
            is_favorite: row.is_favorite,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    user_id: Option<String>,
    role: String,
    content: String,
    timestamp: i64,
    tokens_used: Option<i64>,
    is_streaming: bool,
    is_favorite: bool,
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            role: row.role.parse()?,
            content: row.content,
            timestamp: from_millis(row.timestamp),
            tokens_used: row.tokens_used.map(|t| t.max(0) as u32),
            is_streaming: row.is_streaming,
            is_favorite: row.is_favorite,
        })
    }
}

const CONVERSATION_COLUMNS: &str =
    "id, user_id, agent_id, title, created_at, last_message_at, is_archived, is_favorite";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, user_id, role, content, timestamp, tokens_used, is_streaming, is_favorite";

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    // ---- conversations -------------------------------------------------

    /// Open a conversation with one of the caller's agents
    pub async fn begin(
        &self,
        user_id: &str,
        agent_id: &str,
        title: Option<String>,
    ) -> Result<Conversation> {
        let owner: Option<String> = sqlx::query_scalar("SELECT user_id FROM agents WHERE id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        match owner {
            None => return Err(CoreError::NotFound(format!("agent {agent_id}"))),
            Some(owner) if owner != user_id => {
                return Err(CoreError::Forbidden(format!(
                    "agent {agent_id} belongs to another user"
                )))
            }
            Some(_) => {}
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, agent_id, title, created_at, last_message_at, \
             is_archived, is_favorite) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 0)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(agent_id)
        .bind(title.unwrap_or_else(|| DEFAULT_TITLE.to_string()))
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(conversation_id = %id, user_id, agent_id, "Conversation started");
        self.require(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Conversation::from))
    }

    async fn require(&self, id: &str) -> Result<Conversation> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("conversation {id}")))
    }

    /// Fetch a conversation the caller owns
    pub async fn get_owned(&self, user_id: &str, id: &str) -> Result<Conversation> {
        let conversation = self.require(id).await?;
        if conversation.user_id != user_id {
            return Err(CoreError::Forbidden(format!(
                "conversation {id} belongs to another user"
            )));
        }
        Ok(conversation)
    }

    /// The caller's conversations that are not archived, most recent first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE user_id = ?1 AND is_archived = 0 \
             ORDER BY last_message_at DESC, rowid DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    pub async fn rename(&self, user_id: &str, id: &str, title: &str) -> Result<Conversation> {
        self.get_owned(user_id, id).await?;
        self.set_title(id, title).await
    }

    /// Retitle without an ownership check
    pub async fn set_title(&self, id: &str, title: &str) -> Result<Conversation> {
        let result = sqlx::query("UPDATE conversations SET title = ?1 WHERE id = ?2")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("conversation {id}")));
        }
        self.require(id).await
    }

    pub async fn archive(&self, user_id: &str, id: &str) -> Result<()> {
        self.get_owned(user_id, id).await?;
        sqlx::query("UPDATE conversations SET is_archived = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a conversation and every message in it
    pub async fn delete(&self, user_id: &str, id: &str) -> Result<()> {
        self.get_owned(user_id, id).await?;

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(conversation_id = id, messages = removed, "Deleted conversation");
        Ok(())
    }

    /// Flip the favorite flag, returning the new value
    pub async fn toggle_favorite(&self, user_id: &str, id: &str) -> Result<bool> {
        let conversation = self.get_owned(user_id, id).await?;
        let favorite = !conversation.is_favorite;
        sqlx::query("UPDATE conversations SET is_favorite = ?1 WHERE id = ?2")
            .bind(favorite)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(favorite)
    }

    pub async fn favorites(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE user_id = ?1 AND is_favorite = 1 \
             ORDER BY last_message_at DESC, rowid DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    /// Every conversation still carrying the placeholder title
    pub async fn unnamed(&self) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY rowid"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(Conversation::from)
            .filter(Conversation::is_unnamed)
            .collect())
    }

    // ---- messages ------------------------------------------------------

    /// Store a message and bump the conversation's last activity
    pub async fn append(&self, message: NewMessage) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();

        let mut tx = self.pool.begin().await?;
        let bumped = sqlx::query("UPDATE conversations SET last_message_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(&message.conversation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if bumped == 0 {
            return Err(CoreError::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, timestamp, \
             tokens_used, is_streaming, is_favorite) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        )
        .bind(&id)
        .bind(&message.conversation_id)
        .bind(&message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(now)
        .bind(message.tokens_used.map(i64::from))
        .bind(message.is_streaming)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.require_message(&id).await
    }

    /// Open an assistant message whose content will be replaced until complete
    pub async fn append_streaming(&self, conversation_id: &str, content: &str) -> Result<Message> {
        self.append(NewMessage::assistant(conversation_id, content, None).streaming())
            .await
    }

    /// Replace the content of a message that is still streaming.
    /// Completed messages are immutable.
    pub async fn update_streaming(
        &self,
        message_id: &str,
        content: &str,
        is_streaming: bool,
        tokens_used: Option<u32>,
    ) -> Result<Message> {
        let current = self.require_message(message_id).await?;
        if !current.is_streaming {
            return Err(CoreError::InvalidInput(format!(
                "message {message_id} is complete and cannot be changed"
            )));
        }

        sqlx::query(
            "UPDATE messages SET content = ?1, is_streaming = ?2, tokens_used = ?3 \
             WHERE id = ?4 AND is_streaming = 1",
        )
        .bind(content)
        .bind(is_streaming)
        .bind(tokens_used.map(i64::from))
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        self.require_message(message_id).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row: Option<MessageRow> =
            sqlx::query_as(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Message::try_from).transpose()
    }

    async fn require_message(&self, message_id: &str) -> Result<Message> {
        self.get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))
    }

    /// All messages in a conversation, oldest first
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
             ORDER BY timestamp, rowid"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    /// The last `limit` messages, oldest first
    pub async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn first_user_message(&self, conversation_id: &str) -> Result<Option<String>> {
        let content = sqlx::query_scalar(
            "SELECT content FROM messages WHERE conversation_id = ?1 AND role = 'user' \
             ORDER BY timestamp, rowid LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(content)
    }

    /// Flip a message's favorite flag, returning the new value
    pub async fn toggle_message_favorite(&self, message_id: &str) -> Result<bool> {
        let message = self.require_message(message_id).await?;
        let favorite = !message.is_favorite;
        sqlx::query("UPDATE messages SET is_favorite = ?1 WHERE id = ?2")
            .bind(favorite)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(favorite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentStore, NewAgent};
    use crate::catalog::ModelCatalog;
    use crate::test_support::database;

    async fn setup() -> (ConversationStore, String) {
        let db = database().await;
        let catalog = ModelCatalog::new(&db);
        catalog.seed_defaults().await.unwrap();
        let model = catalog.list_active().await.unwrap().remove(0);
        let agent = AgentStore::new(&db)
            .create(
                "alice",
                NewAgent {
                    base_model_id: model.id,
                    name: "Guide".into(),
                    system_prompt: "Be kind.".into(),
                    avatar: None,
                },
            )
            .await
            .unwrap();
        (ConversationStore::new(&db), agent.id)
    }

    #[tokio::test]
    async fn test_begin_defaults_title_and_checks_agent_owner() {
        let (store, agent_id) = setup().await;
        let conversation = store.begin("alice", &agent_id, None).await.unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);
        assert!(conversation.is_unnamed());

        assert!(matches!(
            store.begin("bob", &agent_id, None).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            store.begin("alice", "nope", None).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_bumps_last_message_at_and_orders_list() {
        let (store, agent_id) = setup().await;
        let older = store.begin("alice", &agent_id, Some("older".into())).await.unwrap();
        let newer = store.begin("alice", &agent_id, Some("newer".into())).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append(NewMessage::user(&older.id, "alice", "hello again"))
            .await
            .unwrap();

        let listed = store.list_for_user("alice").await.unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);
        assert!(listed[0].last_message_at > older.last_message_at);
    }

    #[tokio::test]
    async fn test_archived_conversations_leave_the_list() {
        let (store, agent_id) = setup().await;
        let c = store.begin("alice", &agent_id, None).await.unwrap();
        store.archive("alice", &c.id).await.unwrap();
        assert!(store.list_for_user("alice").await.unwrap().is_empty());
        assert!(matches!(
            store.archive("bob", &c.id).await,
            Err(CoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_missing_conversation_is_not_found() {
        let (store, _) = setup().await;
        assert!(matches!(
            store.rename("alice", "missing", "x").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_title("missing", "x").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let (store, agent_id) = setup().await;
        let c = store.begin("alice", &agent_id, None).await.unwrap();
        store.append(NewMessage::user(&c.id, "alice", "one")).await.unwrap();
        store
            .append(NewMessage::assistant(&c.id, "two", Some(5)))
            .await
            .unwrap();

        store.delete("alice", &c.id).await.unwrap();
        assert!(store.get(&c.id).await.unwrap().is_none());
        assert!(store.list(&c.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_message_lifecycle() {
        let (store, agent_id) = setup().await;
        let c = store.begin("alice", &agent_id, None).await.unwrap();

        let draft = store.append_streaming(&c.id, "Once").await.unwrap();
        assert!(draft.is_streaming);

        let partial = store
            .update_streaming(&draft.id, "Once upon", true, None)
            .await
            .unwrap();
        assert_eq!(partial.content, "Once upon");

        let done = store
            .update_streaming(&draft.id, "Once upon a time.", false, Some(12))
            .await
            .unwrap();
        assert!(!done.is_streaming);
        assert_eq!(done.tokens_used, Some(12));

        let err = store
            .update_streaming(&draft.id, "rewritten", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert_eq!(
            store.get_message(&draft.id).await.unwrap().unwrap().content,
            "Once upon a time."
        );
    }

    #[tokio::test]
    async fn test_recent_and_first_user_message() {
        let (store, agent_id) = setup().await;
        let c = store.begin("alice", &agent_id, None).await.unwrap();
        assert!(store.first_user_message(&c.id).await.unwrap().is_none());

        store
            .append(NewMessage::assistant(&c.id, "welcome", None))
            .await
            .unwrap();
        for text in ["a", "b", "c"] {
            store.append(NewMessage::user(&c.id, "alice", text)).await.unwrap();
        }

        let recent: Vec<String> = store
            .recent(&c.id, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(
            store.first_user_message(&c.id).await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_favorites() {
        let (store, agent_id) = setup().await;
        let c = store.begin("alice", &agent_id, None).await.unwrap();
        assert!(store.toggle_favorite("alice", &c.id).await.unwrap());
        assert_eq!(store.favorites("alice").await.unwrap().len(), 1);
        assert!(!store.toggle_favorite("alice", &c.id).await.unwrap());
        assert!(store.favorites("alice").await.unwrap().is_empty());

        let m = store.append(NewMessage::user(&c.id, "alice", "keep")).await.unwrap();
        assert!(store.toggle_message_favorite(&m.id).await.unwrap());
        assert!(matches!(
            store.toggle_message_favorite("missing").await,
            Err(CoreError::NotFound(_))
        ));
    }
}

//! Chat relay: one user turn in, one stored assistant reply out

use crate::agents::AgentStore;
use crate::catalog::ModelCatalog;
use crate::context::{ContextCompiler, ContextRequest};
use crate::conversations::{Conversation, ConversationStore, Message, NewMessage, Role};
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::{CoreError, Result};
use portal_memory::Database;
use serde::Serialize;
use std::sync::Arc;

const CHAT_TEMPERATURE: f32 = 0.9;
const CHAT_MAX_TOKENS: u32 = 2048;
const MEMORY_WINDOW: usize = 3;

const TITLE_PROMPT: &str = "Generate a short title (4-6 words max) for a conversation.
The title should capture the theme of the opening message.
You may include a single emoji if it improves the title.
Return ONLY the title, nothing else. No quotes, no explanation.

Examples of good titles:
Planning the Spring Garden
Questions About Sleep
🌙 Late Night Thoughts
Starting Over in Lisbon";
const TITLE_TEMPERATURE: f32 = 0.8;
const TITLE_MAX_TOKENS: u32 = 30;
const TITLE_MAX_CHARS: usize = 60;
const FALLBACK_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayReply {
    pub content: String,
    pub tokens_used: u32,
    pub memory_context_used: bool,
}

#[derive(Clone)]
pub struct ChatRelay {
    llm: Arc<dyn LlmClient>,
    conversations: ConversationStore,
    agents: AgentStore,
    catalog: ModelCatalog,
    compiler: ContextCompiler,
    history_limit: usize,
}

impl ChatRelay {
    pub fn new(db: &Database, llm: Arc<dyn LlmClient>, history_limit: usize) -> Self {
        Self {
            llm,
            conversations: ConversationStore::new(db),
            agents: AgentStore::new(db),
            catalog: ModelCatalog::new(db),
            compiler: ContextCompiler::new(db),
            history_limit,
        }
    }

    /// Store the caller's message, ask the agent's model for a reply with
    /// compiled memory in the system prompt, and store the reply.
    pub async fn send(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<RelayReply> {
        let conversation = self.conversations.get_owned(user_id, conversation_id).await?;
        let agent = self
            .agents
            .get(&conversation.agent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", conversation.agent_id)))?;
        let model = self
            .catalog
            .get(&agent.base_model_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("base model {}", agent.base_model_id)))?;

        self.conversations
            .append(NewMessage::user(conversation_id, user_id, content))
            .await?;
        let history = self
            .conversations
            .recent(conversation_id, self.history_limit)
            .await?;

        let memory_context = self
            .memory_context(user_id, conversation_id, &history)
            .await;

        let mut system_prompt = agent.system_prompt.clone();
        if !memory_context.is_empty() {
            system_prompt.push_str(&memory_banner(&memory_context));
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history.iter().map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        let completion = self
            .llm
            .complete(ChatRequest {
                model: model.model_id.clone(),
                messages,
                temperature: CHAT_TEMPERATURE,
                max_tokens: CHAT_MAX_TOKENS,
            })
            .await?;

        self.conversations
            .append(NewMessage::assistant(
                conversation_id,
                completion.content.clone(),
                Some(completion.tokens_used),
            ))
            .await?;

        tracing::info!(
            conversation_id,
            model = %model.model_id,
            tokens = completion.tokens_used,
            memory = !memory_context.is_empty(),
            "Relayed chat turn"
        );

        Ok(RelayReply {
            content: completion.content,
            tokens_used: completion.tokens_used,
            memory_context_used: !memory_context.is_empty(),
        })
    }

    /// Compiled context for this turn, or empty when compilation fails
    async fn memory_context(
        &self,
        user_id: &str,
        conversation_id: &str,
        history: &[Message],
    ) -> String {
        let user_messages: Vec<String> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .collect();
        let skip = user_messages.len().saturating_sub(MEMORY_WINDOW);

        let request = ContextRequest {
            subject_id: Some(user_id.to_string()),
            conversation_id: Some(conversation_id.to_string()),
            recent_messages: user_messages[skip..].to_vec(),
            ..Default::default()
        };

        match self.compiler.compile(&request).await {
            Ok(compiled) => compiled.context,
            Err(e) => {
                tracing::warn!(error = %e, "Memory context failed, continuing without it");
                String::new()
            }
        }
    }

    /// A short title for a conversation opening with `first_message`.
    /// Falls back to a truncation of the message when the model cannot help.
    pub async fn generate_title(&self, first_message: &str, model: &str) -> String {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(TITLE_PROMPT),
                ChatMessage::user(first_message),
            ],
            temperature: TITLE_TEMPERATURE,
            max_tokens: TITLE_MAX_TOKENS,
        };

        match self.llm.complete(request).await {
            Ok(completion) => {
                let title = completion.content.trim();
                let len = title.chars().count();
                if (1..=TITLE_MAX_CHARS).contains(&len) {
                    return title.to_string();
                }
            }
            Err(e) => tracing::debug!(error = %e, "Title generation failed"),
        }
        fallback_title(first_message)
    }

    /// Title one of the caller's conversations from its first user message
    pub async fn title_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        let conversation = self.conversations.get_owned(user_id, conversation_id).await?;
        let first = self
            .conversations
            .first_user_message(conversation_id)
            .await?
            .ok_or_else(|| {
                CoreError::InvalidInput(format!("conversation {conversation_id} has no user message"))
            })?;
        let model = self.model_for(&conversation).await?;

        let title = self.generate_title(&first, &model).await;
        self.conversations.set_title(conversation_id, &title).await
    }

    async fn model_for(&self, conversation: &Conversation) -> Result<String> {
        let agent = self
            .agents
            .get(&conversation.agent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", conversation.agent_id)))?;
        let model = self
            .catalog
            .get(&agent.base_model_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("base model {}", agent.base_model_id)))?;
        Ok(model.model_id)
    }

    /// Retitle every conversation still carrying the placeholder title.
    /// Conversations without a user message are left alone. Returns how
    /// many were renamed.
    pub async fn name_unnamed(&self, model: &str) -> Result<usize> {
        let mut renamed = 0;
        for conversation in self.conversations.unnamed().await? {
            let Some(first) = self
                .conversations
                .first_user_message(&conversation.id)
                .await?
            else {
                continue;
            };
            let title = self.generate_title(&first, model).await;
            self.conversations.set_title(&conversation.id, &title).await?;
            renamed += 1;
        }
        tracing::info!(renamed, "Named unnamed conversations");
        Ok(renamed)
    }
}

fn memory_banner(context: &str) -> String {
    format!(
        "\n\n=== MEMORY CONTEXT: what you remember from earlier conversations ===\n\n\
         {context}\n\n=== END MEMORY CONTEXT ==="
    )
}

fn fallback_title(message: &str) -> String {
    let mut title: String = message.chars().take(FALLBACK_TITLE_CHARS).collect();
    if message.chars().count() > FALLBACK_TITLE_CHARS {
        title.push_str("...");
    }
    title
}

//! In-process LLM double and fixtures shared by the unit tests

use crate::llm::{ChatRequest, Completion, Embedding, LlmClient, LlmError};
use async_trait::async_trait;
use portal_memory::Database;
use std::collections::VecDeque;
use std::sync::Mutex;

type Embedder = Box<dyn Fn(&str) -> Result<Embedding, LlmError> + Send + Sync>;

/// Replays queued completions in order and records every request
pub(crate) struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    embedder: Embedder,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            embedder: Box::new(|text| {
                Ok(Embedding {
                    vector: keyword_vector(text),
                    tokens_used: 3,
                })
            }),
        }
    }

    pub fn reply(self, content: &str, tokens_used: u32) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(Completion {
                content: content.to_string(),
                tokens_used,
            }));
        self
    }

    pub fn fail(self, status: u16) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(LlmError::Upstream {
                status,
                body: "scripted failure".to_string(),
            }));
        self
    }

    pub fn with_embedder<F>(mut self, embedder: F) -> Self
    where
        F: Fn(&str) -> Result<Embedding, LlmError> + Send + Sync + 'static,
    {
        self.embedder = Box::new(embedder);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::Upstream {
                status: 500,
                body: "no scripted reply left".to_string(),
            }))
    }

    async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
        (self.embedder)(text)
    }
}

/// Three-dimensional toy embedding: one axis per theme word
pub(crate) fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    ["ocean", "fire", "forest"]
        .iter()
        .map(|word| if lower.contains(word) { 1.0 } else { 0.0 })
        .collect()
}

/// In-memory database with every portal table migrated
pub(crate) async fn database() -> Database {
    let db = Database::in_memory().await.unwrap();
    crate::schema::migrate(&db).await.unwrap();
    db
}

//! LLM gateway abstraction
//!
//! Chat completions and embeddings go through an OpenAI-compatible gateway
//! (OpenRouter by default). Everything above this module talks to the
//! [`LlmClient`] trait so it can be exercised without the network.

use crate::config::PortalConfig;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat message as sent to the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Body of a chat-completions call
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub tokens_used: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM gateway credential missing (set OPENROUTER_API_KEY)")]
    MissingApiKey,

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Malformed gateway response: {0}")]
    Malformed(String),
}

/// Trait for LLM gateways
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one chat completion
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError>;

    /// Embed a piece of text with the configured embedding model
    async fn embed(&self, text: &str) -> Result<Embedding, LlmError>;
}

/// OpenRouter (or any OpenAI-compatible) gateway over reqwest
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    embedding_model: String,
    app_url: String,
    app_title: String,
}

impl OpenRouterClient {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            embedding_model: config.embedding_model.clone(),
            app_url: config.app_url.clone(),
            app_title: config.app_title.clone(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, LlmError> {
        let key = self.api_key.as_ref().ok_or(LlmError::MissingApiKey)?;

        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", key.expose_secret()))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.app_url)
            .header("X-Title", &self.app_title)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "Gateway error: {}", body);
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }
}

fn total_tokens(json: &Value) -> u32 {
    json["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32
}

/// Pull `choices[0].message.content` out of a chat-completions response
pub(crate) fn parse_completion(json: &Value) -> Completion {
    Completion {
        content: json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        tokens_used: total_tokens(json),
    }
}

/// Pull `data[0].embedding` out of an embeddings response
pub(crate) fn parse_embedding(json: &Value) -> Result<Embedding, LlmError> {
    let values = json["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| LlmError::Malformed("no embedding in response".to_string()))?;

    let vector = values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LlmError::Malformed("non-numeric embedding value".to_string()))
        })
        .collect::<Result<Vec<f32>, LlmError>>()?;

    Ok(Embedding {
        vector,
        tokens_used: total_tokens(json),
    })
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        tracing::debug!(model = %request.model, messages = request.messages.len(), "Chat completion");
        let body = serde_json::to_value(&request)
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        let json = self.post("chat/completions", &body).await?;
        Ok(parse_completion(&json))
    }

    async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": text,
        });
        let json = self.post("embeddings", &body).await?;
        parse_embedding(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_completion() {
        let json = json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello there"}}],
            "usage": {"total_tokens": 42}
        });
        let completion = parse_completion(&json);
        assert_eq!(completion.content, "Hello there");
        assert_eq!(completion.tokens_used, 42);
    }

    #[test]
    fn test_parse_completion_tolerates_missing_fields() {
        let completion = parse_completion(&json!({"choices": []}));
        assert_eq!(completion.content, "");
        assert_eq!(completion.tokens_used, 0);
    }

    #[test]
    fn test_parse_embedding() {
        let json = json!({
            "data": [{"embedding": [0.5, -0.25, 1.0]}],
            "usage": {"total_tokens": 7}
        });
        let embedding = parse_embedding(&json).unwrap();
        assert_eq!(embedding.vector, vec![0.5, -0.25, 1.0]);
        assert_eq!(embedding.tokens_used, 7);

        assert!(matches!(
            parse_embedding(&json!({"data": []})),
            Err(LlmError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_at_call_time() {
        let client = OpenRouterClient::new(&PortalConfig::default());
        let err = client.embed("anything").await.unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey));
    }
}

//! Portal configuration
//!
//! Read from `~/.portal/config.json`. Every field is optional in the file;
//! the binary layers CLI flags and environment variables on top.

use crate::{CoreError, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_GATEWAY_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-small";
pub const DEFAULT_EXTRACTION_MODEL: &str = "anthropic/claude-3-haiku";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub database_url: String,
    pub gateway_url: String,
    /// LLM gateway credential. Checked when a call is made, not at startup.
    pub api_key: Option<SecretString>,
    /// Optional access-gate secret
    pub portal_key: Option<SecretString>,
    pub embedding_model: String,
    pub extraction_model: String,
    /// Messages of history sent with each chat call
    pub history_limit: usize,
    pub bind: String,
    /// Sent as `HTTP-Referer` to the gateway
    pub app_url: String,
    /// Sent as `X-Title` to the gateway
    pub app_title: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    gateway_url: Option<String>,
    api_key: Option<String>,
    portal_key: Option<String>,
    embedding_model: Option<String>,
    extraction_model: Option<String>,
    history_limit: Option<usize>,
    bind: Option<String>,
    app_url: Option<String>,
    app_title: Option<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            api_key: None,
            portal_key: None,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            extraction_model: DEFAULT_EXTRACTION_MODEL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            bind: DEFAULT_BIND.to_string(),
            app_url: "http://localhost:8787".to_string(),
            app_title: "Portal".to_string(),
        }
    }
}

/// `~/.portal`, falling back to the working directory when there is no home
pub fn portal_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portal")
}

pub fn default_config_path() -> PathBuf {
    portal_dir().join("config.json")
}

fn default_database_url() -> String {
    format!(
        "sqlite://{}?mode=rwc",
        portal_dir().join("portal.db").display()
    )
}

impl PortalConfig {
    /// Load `~/.portal/config.json`, or defaults when it does not exist
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let file: FileConfig = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("Invalid {}: {}", path.display(), e)))?;

        let defaults = Self::default();
        Ok(Self {
            database_url: file.database_url.unwrap_or(defaults.database_url),
            gateway_url: file.gateway_url.unwrap_or(defaults.gateway_url),
            api_key: file.api_key.filter(|k| !k.is_empty()).map(SecretString::new),
            portal_key: file.portal_key.filter(|k| !k.is_empty()).map(SecretString::new),
            embedding_model: file.embedding_model.unwrap_or(defaults.embedding_model),
            extraction_model: file.extraction_model.unwrap_or(defaults.extraction_model),
            history_limit: file.history_limit.unwrap_or(defaults.history_limit),
            bind: file.bind.unwrap_or(defaults.bind),
            app_url: file.app_url.unwrap_or(defaults.app_url),
            app_title: file.app_title.unwrap_or(defaults.app_title),
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.api_key = Some(SecretString::new(key));
        }
        self
    }

    pub fn with_portal_key(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.portal_key = Some(SecretString::new(key));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PortalConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.gateway_url, DEFAULT_GATEWAY_URL);
        assert_eq!(config.history_limit, 50);
        assert!(config.api_key.is_none());
        assert!(config.database_url.ends_with("portal.db?mode=rwc"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_key": "sk-test", "history_limit": 12, "bind": "0.0.0.0:9000"}"#,
        )
        .unwrap();

        let config = PortalConfig::load_from(&path).unwrap();
        assert_eq!(config.api_key.as_ref().unwrap().expose_secret(), "sk-test");
        assert_eq!(config.history_limit, 12);
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.embedding_model, DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PortalConfig::load_from(&path),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_overrides_ignore_empty_values() {
        let config = PortalConfig::default()
            .with_api_key(Some(String::new()))
            .with_portal_key(Some("gate".into()));
        assert!(config.api_key.is_none());
        assert_eq!(config.portal_key.unwrap().expose_secret(), "gate");
    }
}

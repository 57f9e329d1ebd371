use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ReviewError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions: issues arrive as a JSON string
    /// inside `choices[0].message.content`.
    OpenAi,
    /// Custom passthrough: the response body is already the issues object.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingMode {
    FileCount,
    AstSnippet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Spread the remainder across chunks so sizes differ by at most one.
    Even,
    /// Take consecutive runs of budget-many snippets.
    Contiguous,
}

/// Governs both severity remapping and whether a terminal batch error is
/// thrown or reported as a synthetic issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    BlockCommit,
    Warning,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub provider: ProviderKind,
    pub batching_mode: BatchingMode,
    /// Fixed batch size K for file_count mode.
    pub batch_size: usize,
    /// Snippet-weight budget B for ast_snippet mode (clamped >= 1).
    pub ast_snippet_budget: usize,
    pub ast_chunk_strategy: ChunkStrategy,
    /// Worker pool size, 1..=8.
    pub batch_concurrency: usize,
    /// Proactive bisection threshold on estimated request characters.
    pub max_request_chars: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    pub action: FailureAction,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: String::new(),
            api_key: None,
            provider: ProviderKind::OpenAi,
            batching_mode: BatchingMode::FileCount,
            batch_size: 5,
            ast_snippet_budget: 25,
            ast_chunk_strategy: ChunkStrategy::Even,
            batch_concurrency: 2,
            max_request_chars: 50_000,
            retry_count: 3,
            retry_delay_ms: 1000,
            max_tokens: 8000,
            temperature: 0.7,
            request_timeout_secs: 60,
            action: FailureAction::Warning,
        }
    }
}

impl ReviewConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ReviewError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0");
        }
        if !(1..=8).contains(&self.batch_concurrency) {
            errors.push("batch_concurrency must be between 1 and 8");
        }
        if self.max_request_chars < 1000 {
            errors.push("max_request_chars must be at least 1000");
        }
        if self.max_tokens == 0 {
            errors.push("max_tokens must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push("temperature must be between 0.0 and 2.0");
        }
        if self.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReviewError::Config(errors.join("; ")))
        }
    }

    /// Endpoint and model resolution happens before any call is attempted.
    /// The custom provider does not need a model name.
    pub fn validate_endpoint(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ReviewError::Config(
                "endpoint is not configured".to_string(),
            ));
        }
        if self.provider == ProviderKind::OpenAi && self.model.trim().is_empty() {
            return Err(ReviewError::Config("model is not configured".to_string()));
        }
        Ok(())
    }

    pub fn snippet_budget(&self) -> usize {
        self.ast_snippet_budget.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ReviewConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.ast_snippet_budget, 25);
        assert_eq!(config.batch_concurrency, 2);
        assert_eq!(config.max_request_chars, 50_000);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.max_tokens, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_errors() {
        let config = ReviewConfig {
            batch_concurrency: 0,
            max_request_chars: 10,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("batch_concurrency"));
        assert!(msg.contains("max_request_chars"));
    }

    #[test]
    fn test_snippet_budget_clamped() {
        let config = ReviewConfig {
            ast_snippet_budget: 0,
            ..Default::default()
        };
        assert_eq!(config.snippet_budget(), 1);
    }

    #[test]
    fn test_endpoint_validation() {
        let mut config = ReviewConfig::default();
        assert!(config.validate_endpoint().is_err());

        config.endpoint = "http://localhost:8080/v1/chat/completions".into();
        assert!(config.validate_endpoint().is_err()); // openai needs a model

        config.model = "gpt-4o-mini".into();
        assert!(config.validate_endpoint().is_ok());

        config.model = String::new();
        config.provider = ProviderKind::Custom;
        assert!(config.validate_endpoint().is_ok());
    }

    #[tokio::test]
    async fn test_load_save_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = ReviewConfig::default();
        config.endpoint = "http://localhost:1234".into();
        config.batching_mode = BatchingMode::AstSnippet;
        config.ast_chunk_strategy = ChunkStrategy::Contiguous;
        config.save(&path).await.unwrap();

        let loaded = ReviewConfig::load(&path).await.unwrap();
        assert_eq!(loaded.endpoint, "http://localhost:1234");
        assert_eq!(loaded.batching_mode, BatchingMode::AstSnippet);
        assert_eq!(loaded.ast_chunk_strategy, ChunkStrategy::Contiguous);
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let loaded = ReviewConfig::load(&temp.path().join("missing.toml"))
            .await
            .unwrap();
        assert_eq!(loaded.batch_size, 5);
    }
}

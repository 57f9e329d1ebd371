use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Context-length patterns emitted by OpenAI-compatible servers on HTTP 400.
/// A 400 matching one of these is a size problem, not a malformed request.
const CONTEXT_LENGTH_PATTERNS: &[&str] = &[
    "maximum context length",
    "context_length_exceeded",
    "prompt is too long",
    "tokens >",
    "payload too large",
    "request entity too large",
];

impl ReviewError {
    /// Whether a retry with backoff is worthwhile: no response was received,
    /// the server failed (5xx), or we were rate limited (429).
    /// Client errors (400/401/...) abort immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether this failure means the request was too large for the model:
    /// HTTP 413, or HTTP 400 whose body matches a context-length pattern.
    /// These trigger batch bisection rather than a plain retry.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Self::ContextOverflow(_) => true,
            Self::Http { status: 413, .. } => true,
            Self::Http { status: 400, body } => matches_context_length(body),
            _ => false,
        }
    }

    /// Rule identifier attached to the synthetic issue reporting this error.
    pub fn synthetic_rule(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "ai_review_timeout",
            _ => "ai_review_error",
        }
    }

    pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
        base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub fn matches_context_length(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONTEXT_LENGTH_PATTERNS.iter().any(|p| lower.contains(p))
}

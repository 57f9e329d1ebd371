use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{ProviderKind, ReviewConfig};
use crate::error::{ReviewError, Result};
use crate::parser;
use crate::prompt::{self, ChatMessage};
use crate::types::{Diagnostic, IssuesPayload, RawIssue, ReviewUnit};

/// Raw HTTP outcome. A transport error (`Err`) means no response was
/// received at all; HTTP-level failures come back as a status.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn send(&self, body: &serde_json::Value) -> Result<TransportReply>;
}

/// LSP-derived reference/usage context for a file's snippets. Collaborator
/// interface only; the engine degrades any failure to an empty string and
/// never lets it break a batch.
#[async_trait]
pub trait UsageContextProvider: Send + Sync {
    async fn usage_context(
        &self,
        path: &str,
        snippets: &[crate::types::ScopeSnippet],
    ) -> Result<String>;
}

/// Production transport over reqwest with a fixed per-call timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ReviewConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ReviewError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn send(&self, body: &serde_json::Value) -> Result<TransportReply> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReviewError::Timeout(format!("no response from {}", self.endpoint))
            } else {
                ReviewError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ReviewError::Network(format!("failed to read response body: {e}")))?;
        Ok(TransportReply { status, body })
    }
}

/// Issues accumulated for one request hash across continuation rounds.
#[derive(Debug, Clone, Default)]
pub struct CachedResponse {
    pub issues: Vec<RawIssue>,
    pub is_partial: bool,
}

/// Per-invocation shared state: the continuation caches and the
/// processed-unit guard. Constructed fresh at the start of every `review()`
/// call and discarded at its end; nothing here outlives one review.
#[derive(Default)]
pub struct RunContext {
    response_cache: Mutex<HashMap<u64, CachedResponse>>,
    message_cache: Mutex<HashMap<u64, Vec<ChatMessage>>>,
    processed_units: Mutex<HashSet<String>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark units as processed, returning only those not yet claimed in this
    /// run. The set is updated before any work begins so each unit runs at
    /// most once even with concurrent workers.
    pub fn claim_units(&self, units: Vec<ReviewUnit>) -> Vec<ReviewUnit> {
        let mut processed = self.processed_units.lock();
        units
            .into_iter()
            .filter(|u| processed.insert(u.unit_id.clone()))
            .collect()
    }

    /// Merge newly parsed issues into the hash's bucket, deduplicated by
    /// (file, line, column, message), and return the accumulated state.
    fn merge_response(&self, hash: u64, new: Vec<RawIssue>, is_partial: bool) -> CachedResponse {
        let mut cache = self.response_cache.lock();
        let entry = cache.entry(hash).or_default();
        let mut seen: HashSet<_> = entry.issues.iter().map(RawIssue::dedup_key).collect();
        for issue in new {
            if seen.insert(issue.dedup_key()) {
                entry.issues.push(issue);
            }
        }
        entry.is_partial = is_partial;
        entry.clone()
    }

    fn base_messages(&self, hash: u64) -> Option<Vec<ChatMessage>> {
        self.message_cache.lock().get(&hash).cloned()
    }

    fn cache_base_messages(&self, hash: u64, messages: Vec<ChatMessage>) {
        self.message_cache.lock().insert(hash, messages);
    }
}

/// Executes one batch's LLM call end to end: retry with exponential
/// backoff on availability errors, immediate abort on other client errors,
/// and truncation-aware continuation rounds that accumulate into the
/// request-hash cache bucket.
pub struct CallManager {
    transport: Arc<dyn LlmTransport>,
    config: Arc<ReviewConfig>,
}

impl CallManager {
    pub fn new(transport: Arc<dyn LlmTransport>, config: Arc<ReviewConfig>) -> Self {
        Self { transport, config }
    }

    pub async fn call(
        &self,
        ctx: &RunContext,
        units: &[ReviewUnit],
        scoped: bool,
        diagnostics: &[(String, Diagnostic)],
        usage_context: &str,
    ) -> Result<IssuesPayload> {
        let hash = prompt::request_hash(units);
        let messages = prompt::build_messages(units, diagnostics, scoped, usage_context);
        if self.config.provider == ProviderKind::OpenAi {
            ctx.cache_base_messages(hash, messages.clone());
        }

        let mut body = prompt::build_request_body(&self.config, &messages, units);
        let mut attempt: u32 = 0;

        loop {
            let reply = match self.transport.send(&body).await {
                Ok(reply) => reply,
                Err(e) if e.is_retryable() && attempt < self.config.retry_count => {
                    let delay = ReviewError::backoff_delay(self.config.retry_delay(), attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transport error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if reply.status >= 400 {
                let err = ReviewError::Http {
                    status: reply.status,
                    body: reply.body,
                };
                if err.is_context_overflow() {
                    // Not retried here: the executor bisects the batch.
                    return Err(err);
                }
                if err.is_retryable() && attempt < self.config.retry_count {
                    let delay = ReviewError::backoff_delay(self.config.retry_delay(), attempt);
                    warn!(attempt, status = reply.status, delay_ms = delay.as_millis() as u64, "Retrying after HTTP error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }

            let parsed =
                parser::parse_response(self.config.provider, &reply.body, self.config.max_tokens)?;
            let merged = ctx.merge_response(hash, parsed.payload.issues, parsed.is_partial);

            if parsed.is_partial && attempt < self.config.retry_count {
                match ctx.base_messages(hash) {
                    Some(base) => {
                        debug!(
                            hash,
                            accumulated = merged.issues.len(),
                            "Requesting continuation for truncated response"
                        );
                        let continuation = prompt::build_continuation_messages(
                            &base,
                            &parsed.cleaned_content,
                            &merged.issues,
                        );
                        body = prompt::build_request_body(&self.config, &continuation, units);
                        attempt += 1;
                        continue;
                    }
                    None => {
                        warn!(hash, "No cached base messages, returning best-effort partial result");
                        return Ok(IssuesPayload {
                            issues: merged.issues,
                        });
                    }
                }
            }

            if parsed.is_partial {
                warn!(
                    hash,
                    issues = merged.issues.len(),
                    "Retries exhausted while partial, returning best-effort merged result"
                );
            }
            return Ok(IssuesPayload {
                issues: merged.issues,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::SourceType;

    struct ScriptedTransport {
        calls: AtomicUsize,
        replies: Vec<Result<TransportReply>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportReply>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                replies,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn send(&self, _body: &serde_json::Value) -> Result<TransportReply> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.replies.get(i.min(self.replies.len() - 1)).unwrap();
            match scripted {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(ReviewError::Other(e.to_string())),
            }
        }
    }

    fn units() -> Vec<ReviewUnit> {
        vec![ReviewUnit::new("a.ts", "a.ts", "let x = 1;", 1, SourceType::Full)]
    }

    fn fast_config() -> ReviewConfig {
        ReviewConfig {
            endpoint: "http://localhost:9".into(),
            model: "test-model".into(),
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn openai_reply(content: &str) -> TransportReply {
        TransportReply {
            status: 200,
            body: serde_json::json!({
                "choices": [{ "message": { "content": content } }]
            })
            .to_string(),
        }
    }

    fn manager(transport: Arc<ScriptedTransport>, config: ReviewConfig) -> CallManager {
        CallManager::new(transport, Arc::new(config))
    }

    #[tokio::test]
    async fn test_retry_bound_on_500() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportReply {
            status: 500,
            body: "internal error".into(),
        })]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let err = mgr.call(&ctx, &units(), false, &[], "").await.unwrap_err();
        assert!(matches!(err, ReviewError::Http { status: 500, .. }));
        // retry_count=3 means exactly 4 attempts
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_401_aborts_after_single_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportReply {
            status: 401,
            body: "unauthorized".into(),
        })]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let err = mgr.call(&ctx, &units(), false, &[], "").await.unwrap_err();
        assert!(matches!(err, ReviewError::Http { status: 401, .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_429_retried_until_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(TransportReply {
                status: 429,
                body: "rate limited".into(),
            }),
            Ok(openai_reply(
                r#"{"issues":[{"file":"a.ts","line":1,"message":"m","severity":"info"}]}"#,
            )),
        ]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let payload = mgr.call(&ctx, &units(), false, &[], "").await.unwrap();
        assert_eq!(payload.issues.len(), 1);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_context_overflow_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportReply {
            status: 400,
            body: "This model's maximum context length is 8192 tokens".into(),
        })]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let err = mgr.call(&ctx, &units(), false, &[], "").await.unwrap_err();
        assert!(err.is_context_overflow());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_truncation_continuation_merges_and_dedups() {
        let cut = r#"{"issues": [
            {"file": "a.ts", "line": 5, "column": 1, "message": "first", "severity": "error"},
            {"file": "a.ts", "line": 9, "column": 1, "message": "second", "severity": "warning"},
            {"file": "a.ts", "line": 14, "column": 2, "message": "cut of"#;
        // Continuation repeats "second" (deduplicated) and adds "third".
        let continuation = r#"{"issues": [
            {"file": "a.ts", "line": 9, "column": 1, "message": "second", "severity": "warning"},
            {"file": "a.ts", "line": 14, "column": 2, "message": "third", "severity": "info"}]}"#;

        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(openai_reply(cut)),
            Ok(openai_reply(continuation)),
        ]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let payload = mgr.call(&ctx, &units(), false, &[], "").await.unwrap();
        assert_eq!(transport.call_count(), 2);
        assert_eq!(payload.issues.len(), 3);
        let messages: Vec<&str> = payload.issues.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_partial_exhaustion_returns_best_effort() {
        let cut = r#"{"issues": [
            {"file": "a.ts", "line": 5, "column": 1, "message": "only one", "severity": "error"},
            {"file": "a.ts", "line": 9, "column": 1, "message": "cut of"#;
        // Every response is truncated; after retries are exhausted the
        // merged partial result comes back instead of an error.
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(openai_reply(cut))]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let payload = mgr.call(&ctx, &units(), false, &[], "").await.unwrap();
        assert_eq!(transport.call_count(), 4);
        assert_eq!(payload.issues.len(), 1);
        assert_eq!(payload.issues[0].message, "only one");
    }

    #[tokio::test]
    async fn test_custom_provider_partial_without_base_messages() {
        // The custom format has no chat messages, so a truncated response
        // cannot be continued; the best-effort result returns immediately.
        let cut = r#"{"issues": [
            {"file": "a.ts", "line": 5, "column": 1, "message": "kept", "severity": "error"},
            {"file": "a.ts", "line": 9, "column": 1, "message": "cut of"#;
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportReply {
            status: 200,
            body: cut.into(),
        })]));
        let config = ReviewConfig {
            provider: ProviderKind::Custom,
            ..fast_config()
        };
        let mgr = manager(transport.clone(), config);
        let ctx = RunContext::new();

        let payload = mgr.call(&ctx, &units(), false, &[], "").await.unwrap();
        assert_eq!(transport.call_count(), 1);
        assert_eq!(payload.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_is_hard_failure() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(openai_reply(
            r#"{"issues":[{"file":"","line":1,"message":"m","severity":"error"}]}"#,
        ))]));
        let mgr = manager(transport.clone(), fast_config());
        let ctx = RunContext::new();

        let err = mgr.call(&ctx, &units(), false, &[], "").await.unwrap_err();
        assert!(matches!(err, ReviewError::Validation(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_claim_units_guards_double_submission() {
        let ctx = RunContext::new();
        let first = ctx.claim_units(units());
        assert_eq!(first.len(), 1);
        let second = ctx.claim_units(units());
        assert!(second.is_empty());
    }
}

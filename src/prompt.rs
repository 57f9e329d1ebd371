use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ProviderKind, ReviewConfig};
use crate::types::{Diagnostic, RawIssue, ReviewUnit};

/// Fixed per-file overhead added to the character estimate: JSON framing,
/// path, role markers.
pub const PER_FILE_OVERHEAD_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a code reviewer. Review the provided files and report \
concrete problems: bugs, unsafe patterns, broken error handling, misuse of APIs. Respond with \
a single JSON object of the form {\"issues\": [{\"file\": string, \"line\": number, \
\"column\": number, \"message\": string, \"severity\": \"error\"|\"warning\"|\"info\"}]}. \
Report nothing but that JSON object. If there are no problems, return {\"issues\": []}.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Build the system+user message pair for one batch. Diagnostics are listed
/// as known issues the model must not repeat; in scoped (diff/AST) mode the
/// model is told it only sees excerpts. `usage_context` is optional
/// reference material (call sites, usages) gathered outside the files
/// themselves; empty means none.
pub fn build_messages(
    units: &[ReviewUnit],
    diagnostics: &[(String, Diagnostic)],
    scoped: bool,
    usage_context: &str,
) -> Vec<ChatMessage> {
    let mut user = String::new();

    if scoped {
        user.push_str(
            "The files below are partial excerpts of changed code. Only report issues on the \
lines shown.\n\n",
        );
    }

    for unit in units {
        user.push_str(&format!("### File: {}\n```\n{}\n```\n\n", unit.path, unit.content));
    }

    if !usage_context.is_empty() {
        user.push_str("Reference context (how the reviewed code is used elsewhere):\n");
        user.push_str(usage_context);
        user.push_str("\n\n");
    }

    if !diagnostics.is_empty() {
        user.push_str("Known issues already reported by local tooling. Do NOT repeat these:\n");
        for (file, diag) in diagnostics {
            user.push_str(&format!("- {}:{}: {}\n", file, diag.line, diag.message));
        }
        user.push('\n');
    }

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Provider-specific request body, matched exhaustively only here and in the
/// response parser.
pub fn build_request_body(
    config: &ReviewConfig,
    messages: &[ChatMessage],
    units: &[ReviewUnit],
) -> serde_json::Value {
    match config.provider {
        ProviderKind::OpenAi => json!({
            "model": config.model,
            "messages": messages,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
        }),
        ProviderKind::Custom => json!({
            "files": units
                .iter()
                .map(|u| json!({ "path": u.path, "content": u.content }))
                .collect::<Vec<_>>(),
        }),
    }
}

/// Follow-up messages after a truncated response: the original exchange, the
/// raw partial content as an assistant turn, and a user turn asking only for
/// what is missing.
pub fn build_continuation_messages(
    base: &[ChatMessage],
    partial_raw: &str,
    parsed_so_far: &[RawIssue],
) -> Vec<ChatMessage> {
    let mut messages = base.to_vec();
    messages.push(ChatMessage::assistant(partial_raw));

    let last = parsed_so_far
        .last()
        .map(|i| format!("{}:{} \"{}\"", i.file, i.line, i.message))
        .unwrap_or_else(|| "none".to_string());

    messages.push(ChatMessage::user(format!(
        "Your previous response was cut off. I already received {} complete issue(s); the last \
one was {}. Respond with a JSON object {{\"issues\": [...]}} containing ONLY the remaining \
issues that were not yet included. Do not repeat issues already sent.",
        parsed_so_far.len(),
        last
    )));

    messages
}

/// Estimated request size in characters, used for the proactive split
/// decision before any call is made.
pub fn estimate_request_chars(units: &[ReviewUnit]) -> usize {
    units
        .iter()
        .map(|u| u.path.len() + u.content.len() + PER_FILE_OVERHEAD_CHARS)
        .sum()
}

/// Stable hash over the batch's (path, content) pairs. Identical content
/// maps to the same continuation cache bucket across round-trips within one
/// review invocation.
pub fn request_hash(units: &[ReviewUnit]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for unit in units {
        unit.path.hash(&mut hasher);
        unit.content.hash(&mut hasher);
    }
    hasher.finish()
}

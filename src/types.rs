use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ReviewError, Result};

/// Normalize a path the same way for units, issues, diagnostics, and the
/// allowed-lines map: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(str::to_string)
        .unwrap_or(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Ast,
    Diff,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstRange {
    pub start_line: u32,
    pub end_line: u32,
}

impl AstRange {
    pub fn contains(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    pub fn overlaps(&self, other: &AstRange) -> bool {
        self.start_line <= other.end_line && other.start_line <= self.end_line
    }
}

/// One issue returned to the caller. `file` is normalized the same way as
/// the source unit's path. `ast_range` is attached once after parsing, for
/// range-overlap checks during diagnostics dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
    pub rule: String,
    pub ast_range: Option<AstRange>,
}

/// One scheduling-granularity piece of review work: a whole file, or a
/// chunk of one file's AST snippets. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewUnit {
    pub unit_id: String,
    pub path: String,
    pub content: String,
    pub snippet_count: usize,
    pub source_type: SourceType,
}

impl ReviewUnit {
    pub fn new(
        unit_id: impl Into<String>,
        path: &str,
        content: impl Into<String>,
        snippet_count: usize,
        source_type: SourceType,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            path: normalize_path(path),
            content: content.into(),
            snippet_count: snippet_count.max(1),
            source_type,
        }
    }

    /// Batch weight: snippet count, floor 1.
    pub fn weight(&self) -> usize {
        self.snippet_count.max(1)
    }
}

// ---------------------------------------------------------------------------
// Collaborator input shapes (interfaces only). Snippet extraction, diff
// parsing, and diagnostics collection happen upstream of this crate.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffHunk {
    pub new_start: u32,
    pub new_count: u32,
    #[serde(default)]
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<DiffHunk>,
    pub format_only: bool,
    pub comment_only: bool,
    pub added_lines: Vec<u32>,
    pub deleted_lines: Vec<u32>,
    pub added_content_lines: Vec<u32>,
}

impl Default for FileDiff {
    fn default() -> Self {
        Self {
            path: String::new(),
            hunks: Vec::new(),
            format_only: false,
            comment_only: false,
            added_lines: Vec::new(),
            deleted_lines: Vec::new(),
            added_content_lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSnippet {
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AffectedScopeResult {
    pub snippets: Vec<ScopeSnippet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
    #[serde(default)]
    pub range: Option<AstRange>,
}

pub type AstMap = HashMap<String, AffectedScopeResult>;
pub type DiffMap = HashMap<String, FileDiff>;
pub type DiagnosticsMap = HashMap<String, Vec<Diagnostic>>;
pub type AllowedLines = HashMap<String, HashSet<u32>>;

// ---------------------------------------------------------------------------
// Wire schema
// ---------------------------------------------------------------------------

fn default_line() -> u32 {
    1
}

fn default_column() -> u32 {
    1
}

fn default_severity() -> Severity {
    Severity::Warning
}

/// One issue as the model reports it. Lenient on defaults so a model that
/// omits column or severity still parses; hard requirements are enforced by
/// `IssuesPayload::validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIssue {
    pub file: String,
    #[serde(default = "default_line")]
    pub line: u32,
    #[serde(default = "default_column")]
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

impl RawIssue {
    /// Dedup key used when merging continuation rounds into the cache.
    pub fn dedup_key(&self) -> (String, u32, u32, String) {
        (
            normalize_path(&self.file),
            self.line,
            self.column,
            self.message.clone(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuesPayload {
    #[serde(default)]
    pub issues: Vec<RawIssue>,
}

impl IssuesPayload {
    /// Schema validation with field-path messages. A violation here is a
    /// hard failure, never retried as truncation.
    pub fn validate(&self) -> Result<()> {
        for (i, issue) in self.issues.iter().enumerate() {
            if issue.file.trim().is_empty() {
                return Err(ReviewError::Validation(format!(
                    "issues[{i}].file: must be a non-empty string"
                )));
            }
            if issue.line == 0 {
                return Err(ReviewError::Validation(format!(
                    "issues[{i}].line: must be >= 1"
                )));
            }
            if issue.message.trim().is_empty() {
                return Err(ReviewError::Validation(format!(
                    "issues[{i}].message: must be a non-empty string"
                )));
            }
        }
        Ok(())
    }
}

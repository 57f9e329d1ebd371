use std::collections::HashSet;

use tracing::{debug, warn};

use crate::types::{
    AllowedLines, AstMap, AstRange, DiagnosticsMap, DiffMap, Issue, normalize_path,
};

/// Build the allowed-lines map once per review call from the AST-snippet and
/// diff inputs. Read-only during execution; empty means full-file mode and
/// the filter is a no-op.
pub fn build_allowed_lines(ast_map: &AstMap, diff_map: &DiffMap) -> AllowedLines {
    let mut allowed: AllowedLines = AllowedLines::new();

    for (path, scope) in ast_map {
        let entry = allowed.entry(normalize_path(path)).or_default();
        for snippet in &scope.snippets {
            entry.extend(snippet.start_line..=snippet.end_line);
        }
    }

    for (path, diff) in diff_map {
        let entry = allowed.entry(normalize_path(path)).or_default();
        for hunk in &diff.hunks {
            entry.extend(hunk.new_start..hunk.new_start + hunk.new_count);
        }
    }

    allowed
}

/// Drop issues on lines the model was never shown. Active only when the
/// batch contains scoped (diff/AST) units. Files the batch reviewed in full
/// are exempt; every other file must appear in the allowed map with the
/// issue's line, so an issue on a file the model invented is dropped
/// outright.
pub fn apply_allowed_lines(
    issues: Vec<Issue>,
    allowed: &AllowedLines,
    scoped_paths: &HashSet<String>,
    full_file_paths: &HashSet<String>,
) -> Vec<Issue> {
    if allowed.is_empty() || scoped_paths.is_empty() {
        return issues;
    }

    let before = issues.len();
    let kept: Vec<Issue> = issues
        .into_iter()
        .filter(|issue| {
            if full_file_paths.contains(&issue.file) {
                return true;
            }
            allowed
                .get(&issue.file)
                .is_some_and(|lines| lines.contains(&issue.line))
        })
        .collect();

    if kept.len() < before {
        debug!(
            dropped = before - kept.len(),
            "Dropped issues outside the shown lines"
        );
    }
    kept
}

/// Attach the enclosing snippet's range to each issue so the diagnostics
/// dedup can check range overlap. Done once per batch; issues are not
/// mutated after this.
pub fn attach_ast_ranges(issues: &mut [Issue], ast_map: &AstMap) {
    for issue in issues.iter_mut() {
        if issue.ast_range.is_some() {
            continue;
        }
        if let Some(scope) = ast_map.get(&issue.file) {
            issue.ast_range = scope
                .snippets
                .iter()
                .find(|s| s.start_line <= issue.line && issue.line <= s.end_line)
                .map(|s| AstRange {
                    start_line: s.start_line,
                    end_line: s.end_line,
                });
        }
    }
}

/// Remove AI issues that duplicate known local diagnostics: similarity over
/// the threshold AND a positional match (same line, or overlapping AST
/// range). If that would erase every issue of a non-empty input the filter
/// backs off entirely: duplicate suppression must never silently empty a
/// genuinely non-empty review.
pub fn dedup_against_diagnostics(issues: Vec<Issue>, diagnostics: &DiagnosticsMap) -> Vec<Issue> {
    const SIMILARITY_THRESHOLD: f32 = 0.65;

    if issues.is_empty() || diagnostics.is_empty() {
        return issues;
    }

    let kept: Vec<Issue> = issues
        .iter()
        .filter(|issue| {
            let Some(diags) = diagnostics.get(&issue.file) else {
                return true;
            };
            !diags.iter().any(|diag| {
                let positional = diag.line == issue.line
                    || match (&issue.ast_range, &diag.range) {
                        (Some(a), Some(b)) => a.overlaps(b),
                        (Some(a), None) => a.contains(diag.line),
                        _ => false,
                    };
                positional && text_similarity(&issue.message, &diag.message) >= SIMILARITY_THRESHOLD
            })
        })
        .cloned()
        .collect();

    if kept.is_empty() {
        warn!(
            dropped = issues.len(),
            "Diagnostics dedup would drop every issue, keeping all (overdrop fallback)"
        );
        return issues;
    }

    kept
}

/// Case- and punctuation-insensitive similarity. Exact or substring match
/// scores 1; otherwise the token-overlap coefficient
/// (|intersection| / min set size), which behaves sensibly for short
/// diagnostic messages.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let norm_a = normalize_text(a);
    let norm_b = normalize_text(b);

    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    if norm_a == norm_b || norm_a.contains(&norm_b) || norm_b.contains(&norm_a) {
        return 1.0;
    }

    let tokens_a: HashSet<&str> = norm_a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = norm_b.split_whitespace().collect();
    let smaller = tokens_a.len().min(tokens_b.len());
    if smaller == 0 {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    intersection as f32 / smaller as f32
}

fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_space = true;
    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

use tracing::{debug, warn};

use crate::config::ProviderKind;
use crate::error::{ReviewError, Result};
use crate::types::{IssuesPayload, RawIssue};

/// Outcome of parsing one provider response. `is_partial` marks a truncated
/// body from which only the complete leading issues could be recovered;
/// `cleaned_content` is the fence-stripped text fed into the JSON parser,
/// reused verbatim as the assistant turn of a continuation request.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub payload: IssuesPayload,
    pub is_partial: bool,
    pub cleaned_content: String,
}

/// Parse raw response body bytes into a validated issues payload.
///
/// For the OpenAI format the outer envelope is always well-formed JSON even
/// when the inner content string was cut off by the token limit, so envelope
/// and content are parsed in two steps. The custom format is the payload
/// itself and goes through content parsing (and truncation recovery)
/// directly.
pub fn parse_response(provider: ProviderKind, raw_body: &str, max_tokens: u32) -> Result<Parsed> {
    match provider {
        ProviderKind::OpenAi => {
            let envelope: serde_json::Value = serde_json::from_str(raw_body)
                .map_err(|e| ReviewError::Parse(format!("invalid response envelope: {e}")))?;
            let content = envelope
                .pointer("/choices/0/message/content")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    ReviewError::Validation(
                        "choices[0].message.content: must be a non-empty string".to_string(),
                    )
                })?;
            let parsed = parse_content(content)?;
            if parsed.is_partial {
                debug!(max_tokens, "Response content truncated, likely by token limit");
            }
            Ok(parsed)
        }
        ProviderKind::Custom => parse_content(raw_body),
    }
}

/// Parse model-produced content into an issues payload, recovering from
/// truncation and broken escapes where possible.
pub fn parse_content(content: &str) -> Result<Parsed> {
    let cleaned = strip_code_fences(content).trim().to_string();
    if cleaned.is_empty() {
        return Err(ReviewError::Validation(
            "response content is empty".to_string(),
        ));
    }

    match serde_json::from_str::<IssuesPayload>(&cleaned) {
        Ok(payload) => {
            payload.validate()?;
            Ok(Parsed {
                payload,
                is_partial: false,
                cleaned_content: cleaned,
            })
        }
        Err(e) => recover_content(&cleaned, &e),
    }
}

fn recover_content(cleaned: &str, parse_err: &serde_json::Error) -> Result<Parsed> {
    // A balanced object followed by noisy prose can leave the whole-text
    // brace count unbalanced; only treat it as truncation when no complete
    // object exists.
    let truncated = is_truncation_error(parse_err, cleaned)
        || (looks_truncated(cleaned) && extract_first_object(cleaned).is_none());
    if truncated {
        let issues = extract_partial_issues(cleaned);
        warn!(
            recovered = issues.len(),
            "Truncated response, recovered complete leading issues"
        );
        let payload = IssuesPayload { issues };
        payload.validate()?;
        return Ok(Parsed {
            payload,
            is_partial: true,
            cleaned_content: cleaned.to_string(),
        });
    }

    // Not truncation-shaped: the model may have wrapped the object in prose,
    // or emitted raw Windows paths as invalid escapes.
    let candidate = extract_first_object(cleaned)
        .ok_or_else(|| ReviewError::Parse(format!("no JSON object in response: {parse_err}")))?;

    let payload: IssuesPayload = match serde_json::from_str(&candidate) {
        Ok(p) => p,
        Err(_) => {
            let repaired = repair_escapes(&candidate);
            serde_json::from_str(&repaired)
                .map_err(|e| ReviewError::Parse(format!("unrecoverable response JSON: {e}")))?
        }
    };
    payload.validate()?;
    Ok(Parsed {
        payload,
        is_partial: false,
        cleaned_content: cleaned.to_string(),
    })
}

/// Strip a Markdown code fence wrapper (``` or ```json) if present.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Heuristic: content is truncated when its braces never close or it ends
/// inside a string literal.
pub fn looks_truncated(content: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in content.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    in_string || escape_next || depth != 0
}

/// Whether a serde_json failure is truncation-shaped: the parser ran off the
/// end, or the content structurally looks cut off.
fn is_truncation_error(err: &serde_json::Error, content: &str) -> bool {
    let msg = err.to_string().to_lowercase();
    if msg.contains("eof while parsing") || msg.contains("unexpected end") {
        return true;
    }

    let tail = content.trim_end();
    if tail.ends_with(',') || tail.ends_with('"') || tail.ends_with('\\') {
        return true;
    }
    // The issues key is present but its object never closes.
    content.contains("\"issues\"") && extract_first_object(content).is_none()
}

/// Pull every syntactically complete `{...}` object out of the `issues`
/// array of a cut-off response. Bracket/quote-aware scan; objects that fail
/// to parse individually are discarded.
pub fn extract_partial_issues(content: &str) -> Vec<RawIssue> {
    let Some(array_start) = find_issues_array(content) else {
        return Vec::new();
    };

    let bytes = content.as_bytes();
    let mut issues = Vec::new();
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut object_start: Option<usize> = None;

    let mut i = array_start;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escape_next {
            escape_next = false;
            i += 1;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    object_start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = object_start.take() {
                        let slice = &content[start..=i];
                        match serde_json::from_str::<RawIssue>(slice) {
                            Ok(issue) => issues.push(issue),
                            Err(e) => {
                                debug!(error = %e, "Discarding unparseable partial issue object")
                            }
                        }
                    }
                }
            }
            ']' if !in_string && depth == 0 => break,
            _ => {}
        }
        i += 1;
    }

    issues
}

fn find_issues_array(content: &str) -> Option<usize> {
    let key = content.find("\"issues\"")?;
    let rest = &content[key + "\"issues\"".len()..];
    let bracket = rest.find('[')?;
    Some(key + "\"issues\"".len() + bracket + 1)
}

/// Extract the first balanced top-level `{...}` object from anywhere in the
/// text (models sometimes wrap the JSON in prose).
pub fn extract_first_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let bytes = content.as_bytes();
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for i in start..bytes.len() {
        let c = bytes[i] as char;
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

const VALID_ESCAPES: &[char] = &['"', '\\', '/', 'b', 'f', 'n', 'r', 't', 'u'];

/// Within string literals only, double any backslash not followed by a
/// recognized JSON escape character. Recovers responses containing raw
/// Windows-style paths like `"C:\Users\x"`. A no-op on valid input, so
/// running it twice is safe.
pub fn repair_escapes(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        match c {
            '\\' => match chars.peek() {
                Some(&next) if VALID_ESCAPES.contains(&next) => {
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            },
            '"' => {
                in_string = false;
                out.push('"');
            }
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    const TWO_ISSUES_CUT: &str = r#"{"issues": [
        {"file": "a.ts", "line": 5, "column": 2, "message": "first issue", "severity": "error"},
        {"file": "a.ts", "line": 9, "column": 1, "message": "second issue", "severity": "warning"},
        {"file": "b.ts", "line": 14, "column": 3, "message": "cut off mid-str"#;

    fn openai_body(content: &str) -> String {
        serde_json::json!({
            "choices": [{ "message": { "content": content } }]
        })
        .to_string()
    }

    #[test]
    fn test_valid_response_parses() {
        let content = r#"{"issues":[{"file":"a.ts","line":3,"message":"bad","severity":"info"}]}"#;
        let parsed = parse_response(ProviderKind::OpenAi, &openai_body(content), 8000).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 1);
        assert_eq!(parsed.payload.issues[0].severity, Severity::Info);
    }

    #[test]
    fn test_fenced_response_parses() {
        let content = "```json\n{\"issues\": []}\n```";
        let parsed = parse_response(ProviderKind::OpenAi, &openai_body(content), 8000).unwrap();
        assert!(parsed.payload.issues.is_empty());
        assert!(!parsed.is_partial);
    }

    #[test]
    fn test_empty_content_rejected() {
        let err = parse_response(ProviderKind::OpenAi, &openai_body("   "), 8000).unwrap_err();
        assert!(err.to_string().contains("choices[0].message.content"));
    }

    #[test]
    fn test_missing_choices_rejected() {
        let err = parse_response(ProviderKind::OpenAi, "{\"object\":\"error\"}", 8000).unwrap_err();
        assert!(matches!(err, ReviewError::Validation(_)));
    }

    #[test]
    fn test_truncated_response_recovers_complete_issues() {
        let parsed = parse_content(TWO_ISSUES_CUT).unwrap();
        assert!(parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 2);
        assert_eq!(parsed.payload.issues[0].message, "first issue");
        assert_eq!(parsed.payload.issues[1].message, "second issue");
    }

    #[test]
    fn test_truncated_mid_object_between_fields() {
        let content = r#"{"issues": [
            {"file": "a.ts", "line": 1, "message": "ok", "severity": "error"},
            {"file": "b.ts", "line": 2,"#;
        let parsed = parse_content(content).unwrap();
        assert!(parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 1);
    }

    #[test]
    fn test_custom_provider_truncation() {
        let parsed = parse_response(ProviderKind::Custom, TWO_ISSUES_CUT, 8000).unwrap();
        assert!(parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 2);
    }

    #[test]
    fn test_object_embedded_in_prose() {
        let content = r#"Here is my review:
{"issues":[{"file":"a.ts","line":2,"message":"shadowed binding","severity":"warning"}]}
Hope that helps!"#;
        let parsed = parse_content(content).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 1);
    }

    #[test]
    fn test_stray_brace_in_trailing_prose_not_partial() {
        // The prose after the object unbalances the naive brace count; the
        // response must still parse complete, with no continuation round.
        let content = r#"{"issues":[{"file":"a.ts","line":2,"message":"bad","severity":"info"}]}
see the { notes above for details"#;
        let parsed = parse_content(content).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.payload.issues.len(), 1);
    }

    #[test]
    fn test_windows_path_escape_recovery() {
        let content = r#"{"issues":[{"file":"C:\Users\x\main.ts","line":1,"message":"broken import","severity":"error"}]} trailing note"#;
        let parsed = parse_content(content).unwrap();
        assert_eq!(parsed.payload.issues.len(), 1);
        assert_eq!(parsed.payload.issues[0].file, r"C:\Users\x\main.ts");
    }

    #[test]
    fn test_repair_escapes_idempotent() {
        let valid = r#"{"file":"a\nb","path":"C:\\Users\\x"}"#;
        assert_eq!(repair_escapes(valid), valid);
        let once = repair_escapes(r#"{"path":"C:\Users\x"}"#);
        assert_eq!(once, r#"{"path":"C:\\Users\\x"}"#);
        assert_eq!(repair_escapes(&once), once);
    }

    #[test]
    fn test_repair_trailing_backslash() {
        assert_eq!(repair_escapes(r#"{"p":"C:\"#), r#"{"p":"C:\\"#);
    }

    #[test]
    fn test_looks_truncated() {
        assert!(looks_truncated(r#"{"issues": [{"file": "a"#));
        assert!(looks_truncated(r#"{"issues": []"#));
        assert!(!looks_truncated(r#"{"issues": []}"#));
        assert!(!looks_truncated(r#"{"a": "{not a brace}"}"#));
    }

    #[test]
    fn test_schema_violation_is_hard_failure() {
        // line 0 parses fine but violates the schema; must not be treated
        // as truncation.
        let content = r#"{"issues":[{"file":"a.ts","line":0,"message":"m","severity":"error"}]}"#;
        let err = parse_content(content).unwrap_err();
        assert!(matches!(err, ReviewError::Validation(_)));
        assert!(err.to_string().contains("issues[0].line"));
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{}"), "{}");
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse_content("no json here at all").unwrap_err();
        assert!(matches!(err, ReviewError::Parse(_)));
    }
}

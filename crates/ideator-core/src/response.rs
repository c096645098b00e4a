//! Turning raw completion text into shapes the stages can validate.
//!
//! Models wrap JSON in code fences, prepend prose, or answer with bullet
//! lists. These helpers locate the payload; the stage modules check the shape.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Malformed model output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON value found in response")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unexpected shape: {0}")]
    Shape(String),
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("valid regex"));

static NUMBERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?\d{1,3}[.)]\s+(.*)$").expect("valid regex"));

/// Entries that mean "nothing here" rather than a real weakness.
const EMPTY_MARKERS: [&str; 4] = ["none", "n/a", "not applicable", "none found"];

/// Find and parse the JSON value in a completion.
///
/// Tries, in order: the first fenced block, the whole text, then the first
/// balanced `{...}` or `[...]` span.
pub fn extract_json(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::NoJson);
    }

    if let Some(cap) = FENCE_RE.captures(trimmed)
        && let Some(body) = cap.get(1)
        && let Ok(v) = serde_json::from_str::<Value>(body.as_str().trim())
    {
        return Ok(v);
    }

    let first_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e.to_string(),
    };

    match balanced_span(trimmed) {
        Some(span) => serde_json::from_str::<Value>(span)
            .map_err(|e| ParseError::InvalidJson(e.to_string())),
        None if trimmed.contains('{') || trimmed.contains('[') => {
            Err(ParseError::InvalidJson(first_err))
        }
        None => Err(ParseError::NoJson),
    }
}

/// Locate the first balanced object or array, skipping brackets inside strings.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a bullet or numbered list into its entries, in order.
///
/// Accepts `-`, `*`, `•` bullets and `1.` / `1)` numbering. Lines that are not
/// list items, and "none"/"n/a" entries, are dropped.
pub fn parse_bullets(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            let item = if let Some(rest) = strip_bullet(line) {
                rest
            } else if let Some(cap) = NUMBERED_RE.captures(line) {
                cap.get(1).map(|m| m.as_str()).unwrap_or("")
            } else {
                return None;
            };
            let item = clean_item(item);
            let has_text = item.chars().any(char::is_alphanumeric);
            (has_text && !is_empty_marker(&item)).then_some(item)
        })
        .collect()
}

/// `*` only opens a bullet when whitespace follows, so `**Weaknesses:**` is a heading.
fn strip_bullet(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix(['-', '•']) {
        return Some(rest.trim_start_matches(['-', '*', '•']));
    }
    line.strip_prefix('*')
        .filter(|rest| rest.starts_with(char::is_whitespace))
}

/// Strip markdown emphasis and surrounding brackets from a list item.
fn clean_item(item: &str) -> String {
    let item = item.trim().trim_matches(|c| c == '*' || c == '_').trim();
    let item = item
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(item);
    item.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn is_empty_marker(text: &str) -> bool {
    let lowered = text.trim().trim_end_matches('.').to_lowercase();
    EMPTY_MARKERS.contains(&lowered.as_str())
}

/// Read an optional text field: `null`, blank and "not found"-style values are absent.
///
/// Returns `Err` when the value exists but is not text.
pub(crate) fn optional_text(value: Option<&Value>, field: &str) -> Result<Option<String>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            let lowered = s.to_lowercase();
            if s.is_empty()
                || lowered == "null"
                || lowered == "not found"
                || lowered == "none"
                || lowered == "n/a"
            {
                Ok(None)
            } else {
                Ok(Some(s.to_string()))
            }
        }
        Some(other) => Err(ParseError::Shape(format!(
            "field `{}` should be text, got {}",
            field,
            kind_of(other)
        ))),
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lowercase and drop everything but letters and digits, for lenient key lookup.
pub(crate) fn squash_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// First response preview for debug logging.
pub(crate) fn preview(raw: &str) -> &str {
    crate::truncate_chars(raw, 200)
}

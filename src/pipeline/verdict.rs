//! Best-effort verdict extraction from audit run output.
//!
//! Audit output is unvalidated model text: prose wrapped around zero or more
//! JSON objects, possibly a draft verdict followed by a final one. The parser
//! scans for every balanced JSON-object substring carrying a boolean `pass`
//! field and takes the last; it never errors. Missing or mistyped fields
//! coerce to empty values rather than rejecting the verdict — extraction, not
//! validation.

use crate::runner::{RunOutcome, TurnRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The structured pass/fail judgment from an audit run. Transient; never
/// persisted in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub pass: bool,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub test_results: String,
}

impl Verdict {
    /// Failing verdict fabricated when audit output yields no verdict at all.
    pub fn synthetic_failure(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            criteria: Vec::new(),
            gaps: vec![reason.into()],
            test_results: String::new(),
        }
    }
}

/// Extract the usable text of a run outcome: the flat output when present,
/// otherwise the last assistant-authored turn of the transcript.
pub fn extract_output_text(outcome: &RunOutcome) -> Option<String> {
    if !outcome.output.trim().is_empty() {
        return Some(outcome.output.clone());
    }
    outcome
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, TurnRole::Assistant) && !m.text.trim().is_empty())
        .map(|m| m.text.clone())
}

/// Parse the last verdict-shaped JSON object out of free text. `None` when
/// no such object exists; never an error.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let bytes = text.as_bytes();
    let mut last = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match balanced_object_end(bytes, i) {
            Some(end) => {
                if let Some(verdict) = verdict_from_json(&text[i..end]) {
                    last = Some(verdict);
                    i = end;
                } else {
                    // Balanced but not a verdict; an inner object may be.
                    i += 1;
                }
            }
            None => i += 1,
        }
    }
    last
}

/// End index (exclusive) of the balanced JSON object starting at `start`, or
/// `None` if braces never balance. String literals and escapes are honored so
/// braces inside strings don't count.
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Coerce a JSON object into a verdict if it carries a boolean `pass`.
fn verdict_from_json(candidate: &str) -> Option<Verdict> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let pass = value.get("pass")?.as_bool()?;
    Some(Verdict {
        pass,
        criteria: string_array(value.get("criteria")),
        gaps: string_array(value.get("gaps")),
        test_results: value
            .get("testResults")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    match value.and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

//! JSON repair and LLM correction feedback.
//!
//! Models frequently emit plan JSON that is *almost* valid: trailing
//! commas, single quotes, Python `True`/`False`/`None`, C-style comments,
//! unquoted keys, markdown fences, truncated output. Rejecting those
//! outright forces a full regeneration, so submission runs a best-effort
//! repair cascade first.
//!
//! Two pieces live here:
//!
//! 1. [`repair`] - a dependency-free fixer that applies lightweight
//!    transformations in a fixed order, re-trying a strict parse after each
//!    one. Repair only ever touches syntax, never semantic content.
//! 2. Correction formatters - plain-text error reports a caller can append
//!    to the model's prompt so it fixes the exact problem instead of
//!    regenerating the whole plan.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::BridgeError;

// ---------------------------------------------------------------------------
// Repair transformations (applied in order; each is a pure function)
// ---------------------------------------------------------------------------

static BLOCK_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
// `$1` keeps the character before `//` so `https://` URLs survive.
static LINE_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^:])//[^\r\n]*").unwrap());
static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static TRUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").unwrap());
static FALSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").unwrap());
static NONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").unwrap());
static UNQUOTED_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap());
static SINGLE_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'").unwrap());
static FENCE_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^```(?:json)?\s*").unwrap());
static FENCE_CLOSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```$").unwrap());

fn strip_comments(text: &str) -> String {
    let text = BLOCK_COMMENT_RE.replace_all(text, "");
    LINE_COMMENT_RE.replace_all(&text, "$1").into_owned()
}

fn trailing_commas(text: &str) -> String {
    TRAILING_COMMA_RE.replace_all(text, "$1").into_owned()
}

fn python_literals(text: &str) -> String {
    let text = TRUE_RE.replace_all(text, "true");
    let text = FALSE_RE.replace_all(&text, "false");
    NONE_RE.replace_all(&text, "null").into_owned()
}

fn quote_keys(text: &str) -> String {
    UNQUOTED_KEY_RE.replace_all(text, "$1\"$2\":").into_owned()
}

/// Only handles the common case of simple values with no internal single
/// quotes; escaped quotes would need a full parser.
fn single_quotes(text: &str) -> String {
    SINGLE_QUOTED_RE.replace_all(text, "\"$1\"").into_owned()
}

/// Append missing closers for truncated output, in reverse opening order.
/// The scan is naive about braces inside strings, matching the best-effort
/// contract.
fn close_structures(text: &str) -> String {
    let mut pending = Vec::new();
    for c in text.chars() {
        match c {
            '{' => pending.push('}'),
            '[' => pending.push(']'),
            '}' | ']' => {
                if pending.last() == Some(&c) {
                    pending.pop();
                }
            }
            _ => {}
        }
    }
    let mut out = text.trim_end().to_string();
    while let Some(closer) = pending.pop() {
        out.push(closer);
    }
    out
}

const REPAIRS: &[(&str, fn(&str) -> String)] = &[
    ("strip_comments", strip_comments),
    ("trailing_commas", trailing_commas),
    ("python_literals", python_literals),
    ("quote_keys", quote_keys),
    ("single_quotes", single_quotes),
    ("close_structures", close_structures),
];

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Successful repair (possibly a no-op when the input was already valid).
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub repaired_text: String,
    pub value: Value,
    pub transformations: Vec<String>,
    pub was_modified: bool,
}

/// Terminal parse failure after every repair was tried. Carries the last
/// strict-parse location so correction feedback can point at the spot.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub transformations_tried: Vec<String>,
}

impl ParseFailure {
    pub fn to_error(&self) -> BridgeError {
        BridgeError::Schema(format!(
            "unparseable plan JSON after {} repair attempt(s) (line {}, column {}): {}",
            self.transformations_tried.len(),
            self.line,
            self.column,
            self.message
        ))
    }
}

/// Attempt to turn `text` into valid JSON.
///
/// Markdown fences are stripped first; a strict parse is the fast path.
/// Each repair transformation then runs in order with a re-parse after it;
/// the first clean parse wins. A transformation that changed the text but
/// did not fix the parse is kept so later ones build on it.
pub fn repair(text: &str) -> Result<RepairOutcome, ParseFailure> {
    let mut current = text.trim().to_string();
    current = FENCE_OPEN_RE.replace(&current, "").into_owned();
    current = FENCE_CLOSE_RE.replace(&current, "").into_owned();
    current = current.trim().to_string();

    if let Ok(value) = serde_json::from_str::<Value>(&current) {
        return Ok(RepairOutcome {
            repaired_text: current,
            value,
            transformations: Vec::new(),
            was_modified: false,
        });
    }

    let mut applied = Vec::new();
    let mut last_error: Option<serde_json::Error> = None;

    for (name, transform) in REPAIRS {
        let candidate = transform(&current);
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                applied.push(name.to_string());
                log::info!(
                    "[Repair] plan JSON fixed by {} transformation(s): {}",
                    applied.len(),
                    applied.join(", ")
                );
                return Ok(RepairOutcome {
                    repaired_text: candidate,
                    value,
                    transformations: applied,
                    was_modified: true,
                });
            }
            Err(e) => {
                if candidate != current {
                    // Keep the change so later transforms build on it.
                    applied.push(name.to_string());
                    current = candidate;
                }
                last_error = Some(e);
            }
        }
    }

    let (message, line, column) = match last_error {
        Some(e) => (e.to_string(), e.line(), e.column()),
        None => ("unknown parse error".to_string(), 0, 0),
    };
    Err(ParseFailure {
        message,
        line,
        column,
        transformations_tried: applied,
    })
}

// ---------------------------------------------------------------------------
// Correction feedback for the model
// ---------------------------------------------------------------------------

const CORRECTION_HEADER: &str = "\n\n--- IML BRIDGE CORRECTION REQUEST ---\n\
Your previous response contained an error in the IML plan.\n\
Please fix ONLY the reported issue and return the corrected plan.\n\
Do not change any other part of the plan.\n\n";
const CORRECTION_FOOTER: &str = "\n--- END CORRECTION REQUEST ---\n";

/// Plain-text report for a JSON syntax failure, including the offending
/// line for context. Safe to append to any prompt without escaping.
pub fn format_parse_correction(
    original: &str,
    failure: &ParseFailure,
    hint: Option<&str>,
) -> String {
    let mut out = String::from(CORRECTION_HEADER);
    out.push_str("ERROR TYPE: JSON syntax error\n");
    out.push_str(&format!("ERROR: {}\n", failure.message));
    out.push_str(&format!(
        "LOCATION: line {}, column {}\n",
        failure.line, failure.column
    ));
    if failure.line > 0 {
        if let Some(bad_line) = original.lines().nth(failure.line - 1) {
            out.push_str(&format!("CONTEXT:  {}\n", bad_line));
        }
    }
    out.push_str(
        "\nCOMMON FIXES:\n\
         \x20 - Remove trailing commas before } or ]\n\
         \x20 - Use double quotes for all strings and keys\n\
         \x20 - Replace Python True/False/None with JSON true/false/null\n\
         \x20 - Do not add comments (// or /* */)\n\
         \x20 - Ensure every opened { and [ is closed\n",
    );
    if let Some(hint) = hint {
        out.push_str(&format!("\nADDITIONAL HINT: {}\n", hint));
    }
    out.push_str(CORRECTION_FOOTER);
    out
}

/// Plain-text report for a schema or graph validation failure.
pub fn format_validation_correction(error: &BridgeError, hint: Option<&str>) -> String {
    let mut out = String::from(CORRECTION_HEADER);
    out.push_str("ERROR TYPE: IML plan validation error\n");
    match error {
        BridgeError::Validation(violations) => {
            for violation in violations {
                out.push_str(&format!("  VIOLATION: {}\n", violation));
            }
        }
        other => out.push_str(&format!("ERROR: {}\n", other)),
    }
    out.push_str(
        "\nCOMMON FIXES:\n\
         \x20 - 'protocol_version' must be exactly \"2.0\"\n\
         \x20 - Each action needs id, module, action and params fields\n\
         \x20 - Action ids must match [A-Za-z0-9_-] and be unique\n\
         \x20 - 'module' must be lowercase snake_case (e.g. 'filesystem')\n\
         \x20 - 'depends_on' must reference action ids in the same plan\n\
         \x20 - {{result.X...}} may only reference a dependency of the action\n\
         \x20 - 'on_failure' must be 'abort' or 'continue'\n",
    );
    if let Some(hint) = hint {
        out.push_str(&format!("\nADDITIONAL HINT: {}\n", hint));
    }
    out.push_str(CORRECTION_FOOTER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through_unmodified() {
        let outcome = repair(r#"{"description": "ok", "actions": []}"#).unwrap();
        assert!(!outcome.was_modified);
        assert!(outcome.transformations.is_empty());
        assert_eq!(outcome.value["description"], json!("ok"));
    }

    #[test]
    fn markdown_fences_are_stripped() {
        let outcome = repair("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(outcome.value["a"], json!(1));
        assert!(!outcome.was_modified);
    }

    #[test]
    fn trailing_commas_are_removed() {
        let outcome = repair(r#"{"actions": [1, 2, 3,],}"#).unwrap();
        assert!(outcome.was_modified);
        assert!(outcome
            .transformations
            .contains(&"trailing_commas".to_string()));
        assert_eq!(outcome.value["actions"], json!([1, 2, 3]));
    }

    #[test]
    fn python_literals_become_json() {
        let outcome =
            repair(r#"{"enabled": True, "disabled": False, "missing": None}"#).unwrap();
        assert_eq!(outcome.value["enabled"], json!(true));
        assert_eq!(outcome.value["disabled"], json!(false));
        assert_eq!(outcome.value["missing"], json!(null));
    }

    #[test]
    fn single_quotes_convert() {
        let outcome = repair(r#"{'module': 'filesystem'}"#).unwrap();
        assert_eq!(outcome.value["module"], json!("filesystem"));
    }

    #[test]
    fn unquoted_keys_get_quoted() {
        let outcome = repair(r#"{id: "a1", module: "filesystem"}"#).unwrap();
        assert_eq!(outcome.value["id"], json!("a1"));
        assert!(outcome.transformations.contains(&"quote_keys".to_string()));
    }

    #[test]
    fn comments_are_stripped_but_urls_survive() {
        let outcome = repair(
            "{\n  // the endpoint to call\n  \"url\": \"https://example.com/x\", /* inline */ \"n\": 1\n}",
        )
        .unwrap();
        assert_eq!(outcome.value["url"], json!("https://example.com/x"));
        assert_eq!(outcome.value["n"], json!(1));
    }

    #[test]
    fn truncated_output_is_closed() {
        let outcome = repair(r#"{"actions": [{"id": "a1""#).unwrap();
        assert!(outcome
            .transformations
            .contains(&"close_structures".to_string()));
        assert_eq!(outcome.value["actions"][0]["id"], json!("a1"));
    }

    #[test]
    fn combined_defects_are_fixed_in_cascade() {
        let raw = "```json\n{actions: [{'id': 'a1', 'ready': True,},]\n```";
        let outcome = repair(raw).unwrap();
        assert!(outcome.was_modified);
        assert_eq!(outcome.value["actions"][0]["id"], json!("a1"));
        assert_eq!(outcome.value["actions"][0]["ready"], json!(true));
    }

    #[test]
    fn hopeless_input_reports_location_and_attempts() {
        let failure = repair("this is not even close to json").unwrap_err();
        assert!(failure.line >= 1);
        let err = failure.to_error();
        assert_eq!(err.kind(), "schema_error");
        assert!(err.to_string().contains("repair attempt"));
    }

    #[test]
    fn parse_correction_includes_location_and_context() {
        let raw = "{\n  \"a\": oops\n}";
        let failure = repair(raw).unwrap_err();
        let prompt = format_parse_correction(raw, &failure, Some("check line 2"));
        assert!(prompt.contains("CORRECTION REQUEST"));
        assert!(prompt.contains("LOCATION: line"));
        assert!(prompt.contains("CONTEXT:"));
        assert!(prompt.contains("ADDITIONAL HINT: check line 2"));
    }

    #[test]
    fn validation_correction_lists_every_violation() {
        let error = BridgeError::Validation(vec![
            "action 'a1' depends on unknown action 'ghost'".to_string(),
            "dependency cycle: a1 -> a2 -> a1".to_string(),
        ]);
        let prompt = format_validation_correction(&error, None);
        assert!(prompt.contains("VIOLATION: action 'a1'"));
        assert!(prompt.contains("VIOLATION: dependency cycle"));
        assert!(prompt.contains("'on_failure' must be 'abort' or 'continue'"));
    }
}

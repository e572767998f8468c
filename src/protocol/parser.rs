//! Plan parsing - raw JSON to a structurally valid [`IMLPlan`].
//!
//! The parser owns everything that can be checked without looking at the
//! dependency graph: field shapes, identifier syntax, size limits, duplicate
//! ids and self-dependencies. Graph-level checks live in the validator.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::models::{
    IMLPlan, MAX_ACTIONS_PER_PLAN, MAX_PLAN_DESCRIPTION_LEN, MAX_RETRY_ATTEMPTS,
    MAX_RETRY_BACKOFF_SECONDS, PROTOCOL_VERSION,
};

static ACTION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
static PLAN_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());
static MODULE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap());
static ACTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap());

/// Parse and normalise a submitted JSON document into an [`IMLPlan`].
pub fn parse_plan(raw: &Value) -> BridgeResult<IMLPlan> {
    if !raw.is_object() {
        return Err(BridgeError::Schema(
            "plan must be a JSON object".to_string(),
        ));
    }

    let plan: IMLPlan = serde_json::from_value(raw.clone())
        .map_err(|e| BridgeError::Schema(e.to_string()))?;

    check_shape(&plan)?;
    Ok(plan)
}

/// Structural checks that serde cannot express.
fn check_shape(plan: &IMLPlan) -> BridgeResult<()> {
    if plan.protocol_version != PROTOCOL_VERSION {
        return Err(BridgeError::Schema(format!(
            "unsupported protocol_version '{}' (expected '{}')",
            plan.protocol_version, PROTOCOL_VERSION
        )));
    }
    if !PLAN_ID_RE.is_match(&plan.plan_id) {
        return Err(BridgeError::Schema(format!(
            "plan_id '{}' must match [A-Za-z0-9_-] and be 1-128 chars",
            plan.plan_id
        )));
    }
    if plan.description.len() > MAX_PLAN_DESCRIPTION_LEN {
        return Err(BridgeError::Schema(format!(
            "description exceeds {} chars",
            MAX_PLAN_DESCRIPTION_LEN
        )));
    }
    if plan.actions.is_empty() {
        return Err(BridgeError::Schema(
            "plan must contain at least one action".to_string(),
        ));
    }
    if plan.actions.len() > MAX_ACTIONS_PER_PLAN {
        return Err(BridgeError::Schema(format!(
            "plan has {} actions, limit is {}",
            plan.actions.len(),
            MAX_ACTIONS_PER_PLAN
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for action in &plan.actions {
        if !ACTION_ID_RE.is_match(&action.id) {
            return Err(BridgeError::Schema(format!(
                "action id '{}' must match [A-Za-z0-9_-] and be 1-64 chars",
                action.id
            )));
        }
        if !seen.insert(action.id.as_str()) {
            return Err(BridgeError::Schema(format!(
                "duplicate action id '{}'",
                action.id
            )));
        }
        if !MODULE_ID_RE.is_match(&action.module) {
            return Err(BridgeError::Schema(format!(
                "module id '{}' must match [a-z][a-z0-9_]*",
                action.module
            )));
        }
        if !ACTION_NAME_RE.is_match(&action.action) {
            return Err(BridgeError::Schema(format!(
                "action name '{}' must match [a-z][a-z0-9_]*",
                action.action
            )));
        }
        if !action.params.is_object() {
            return Err(BridgeError::Schema(format!(
                "action '{}' params must be a JSON object",
                action.id
            )));
        }
        if action.depends_on.iter().any(|d| d == &action.id) {
            return Err(BridgeError::Schema(format!(
                "action '{}' cannot depend on itself",
                action.id
            )));
        }
        if let Some(retry) = &action.retry {
            if retry.max_attempts == 0 || retry.max_attempts > MAX_RETRY_ATTEMPTS {
                return Err(BridgeError::Schema(format!(
                    "action '{}' retry.max_attempts must be 1-{}",
                    action.id, MAX_RETRY_ATTEMPTS
                )));
            }
            if retry.backoff_seconds <= 0.0
                || retry.backoff_seconds > MAX_RETRY_BACKOFF_SECONDS
            {
                return Err(BridgeError::Schema(format!(
                    "action '{}' retry.backoff_seconds must be in (0, {}]",
                    action.id, MAX_RETRY_BACKOFF_SECONDS
                )));
            }
        }
        if let Some(rollback) = &action.rollback {
            if !MODULE_ID_RE.is_match(&rollback.module)
                || !ACTION_NAME_RE.is_match(&rollback.action)
            {
                return Err(BridgeError::Schema(format!(
                    "action '{}' rollback names are not valid module/action identifiers",
                    action.id
                )));
            }
            if !rollback.params.is_object() {
                return Err(BridgeError::Schema(format!(
                    "action '{}' rollback params must be a JSON object",
                    action.id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(actions: Value) -> Value {
        json!({"description": "test plan", "actions": actions})
    }

    #[test]
    fn parses_a_minimal_plan_and_generates_an_id() {
        let plan = parse_plan(&minimal(json!([
            {"id": "a1", "module": "filesystem", "action": "read_file",
             "params": {"path": "/tmp/x"}}
        ])))
        .unwrap();
        assert!(!plan.plan_id.is_empty());
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn rejects_non_object() {
        assert!(matches!(
            parse_plan(&json!([1, 2])),
            Err(BridgeError::Schema(_))
        ));
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let mut raw = minimal(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}}
        ]));
        raw["protocol_version"] = json!("1.0");
        let err = parse_plan(&raw).unwrap_err();
        assert!(err.to_string().contains("protocol_version"));
    }

    #[test]
    fn rejects_duplicate_action_ids() {
        let err = parse_plan(&minimal(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}},
            {"id": "a1", "module": "m", "action": "b", "params": {}}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate action id"));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = parse_plan(&minimal(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {},
             "depends_on": ["a1"]}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("depend on itself"));
    }

    #[test]
    fn rejects_bad_module_names() {
        let err = parse_plan(&minimal(json!([
            {"id": "a1", "module": "FileSystem", "action": "read", "params": {}}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("module id"));
    }

    #[test]
    fn rejects_empty_action_list() {
        let err = parse_plan(&minimal(json!([]))).unwrap_err();
        assert!(err.to_string().contains("at least one action"));
    }

    #[test]
    fn reparse_of_serialised_plan_is_equal() {
        let plan = parse_plan(&minimal(json!([
            {"id": "a1", "module": "filesystem", "action": "read_file",
             "params": {"path": "/tmp/a"}},
            {"id": "a2", "module": "filesystem", "action": "write_file",
             "params": {"path": "/tmp/b", "content": "{{result.a1.output}}"},
             "depends_on": ["a1"]}
        ])))
        .unwrap();
        let round = parse_plan(&serde_json::to_value(&plan).unwrap()).unwrap();
        assert_eq!(plan, round);
    }
}

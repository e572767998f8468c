//! Semantic plan validation.
//!
//! Checks that cannot be expressed per-field at parse time:
//!   - the dependency graph is acyclic (DFS with gray/black marking; a cycle
//!     is reported with its path trace),
//!   - `{{result.X...}}` templates reference a transitive dependency of the
//!     referring action,
//!   - `{{memory.K}}` / `{{env.V}}` are syntactically valid and no unknown
//!     template sigil appears,
//!   - compiled-mode plans carry a populated compiler trace.
//!
//! All violations are collected and reported together.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::models::{IMLPlan, PlanMode};

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
        .unwrap()
});

/// A single template expression found inside action params.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRef {
    pub prefix: String,
    pub body: String,
    pub raw: String,
}

impl TemplateRef {
    /// For `result.<id>.<path>` refs, the referenced action id.
    pub fn result_action_id(&self) -> &str {
        self.body.split('.').next().unwrap_or("")
    }
}

/// Walk a params document and collect every template expression in it.
pub fn extract_templates(value: &Value, out: &mut Vec<TemplateRef>) {
    match value {
        Value::String(s) => {
            for caps in TEMPLATE_RE.captures_iter(s) {
                out.push(TemplateRef {
                    prefix: caps[1].to_string(),
                    body: caps[2].to_string(),
                    raw: caps[0].to_string(),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_templates(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                extract_templates(item, out);
            }
        }
        _ => {}
    }
}

/// Run every semantic check against `plan`.
pub fn validate(plan: &IMLPlan) -> BridgeResult<()> {
    let mut violations = Vec::new();

    let ids: HashSet<&str> = plan.actions.iter().map(|a| a.id.as_str()).collect();

    // Unresolved depends_on references.
    for action in &plan.actions {
        for dep in &action.depends_on {
            if !ids.contains(dep.as_str()) {
                violations.push(format!(
                    "action '{}' depends on unknown action '{}'",
                    action.id, dep
                ));
            }
        }
    }

    // Cycle detection only makes sense once references resolve.
    if violations.is_empty() {
        if let Some(cycle) = find_cycle(plan) {
            violations.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        }
    }

    check_templates(plan, &ids, &mut violations);

    if plan.plan_mode == PlanMode::Compiled {
        match &plan.compiler_trace {
            None => violations.push(
                "plan_mode 'compiled' requires a compiler_trace with all four phases"
                    .to_string(),
            ),
            Some(trace) if !trace.is_populated() => violations.push(
                "compiler_trace must be non-empty and have generation_approved=true"
                    .to_string(),
            ),
            _ => {}
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::Validation(violations))
    }
}

/// Template references must be resolvable at execution time:
/// `{{result.X...}}` only ever resolves if X is a transitive dependency of
/// the referring action, so anything else is rejected up front.
fn check_templates(plan: &IMLPlan, ids: &HashSet<&str>, violations: &mut Vec<String>) {
    let ancestors = transitive_dependencies(plan);

    for action in &plan.actions {
        let mut refs = Vec::new();
        extract_templates(&action.params, &mut refs);
        if let Some(rollback) = &action.rollback {
            extract_templates(&rollback.params, &mut refs);
        }

        for tref in refs {
            match tref.prefix.as_str() {
                "result" => {
                    let target = tref.result_action_id();
                    if !ids.contains(target) {
                        violations.push(format!(
                            "action '{}' references unknown action in '{}'",
                            action.id, tref.raw
                        ));
                    } else if !ancestors
                        .get(action.id.as_str())
                        .is_some_and(|set| set.contains(target))
                    {
                        violations.push(format!(
                            "action '{}' references '{}' which is not among its dependencies",
                            action.id, tref.raw
                        ));
                    }
                }
                "memory" | "env" => {
                    if tref.body.is_empty() {
                        violations.push(format!(
                            "action '{}' has an empty template reference '{}'",
                            action.id, tref.raw
                        ));
                    }
                }
                other => violations.push(format!(
                    "action '{}' uses unknown template prefix '{}' in '{}'",
                    action.id, other, tref.raw
                )),
            }
        }
    }
}

/// All transitive dependencies per action id.
fn transitive_dependencies(plan: &IMLPlan) -> HashMap<&str, HashSet<&str>> {
    let direct: HashMap<&str, Vec<&str>> = plan
        .actions
        .iter()
        .map(|a| {
            (
                a.id.as_str(),
                a.depends_on.iter().map(|d| d.as_str()).collect(),
            )
        })
        .collect();

    let mut result: HashMap<&str, HashSet<&str>> = HashMap::new();
    for action in &plan.actions {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = direct
            .get(action.id.as_str())
            .cloned()
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                if let Some(deps) = direct.get(current) {
                    stack.extend(deps.iter().copied());
                }
            }
        }
        result.insert(action.id.as_str(), seen);
    }
    result
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Depth-first cycle search. Returns the cycle path (closed, e.g.
/// `["a1", "a2", "a1"]`) when one exists.
fn find_cycle(plan: &IMLPlan) -> Option<Vec<String>> {
    let edges: HashMap<&str, &Vec<String>> = plan
        .actions
        .iter()
        .map(|a| (a.id.as_str(), &a.depends_on))
        .collect();

    let mut marks: HashMap<&str, Mark> = plan
        .actions
        .iter()
        .map(|a| (a.id.as_str(), Mark::White))
        .collect();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, &'a Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Gray);
        path.push(node);
        if let Some(deps) = edges.get(node) {
            for dep in deps.iter() {
                match marks.get(dep.as_str()) {
                    Some(Mark::Gray) => {
                        // Close the loop from the first occurrence of `dep`.
                        let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Mark::White) => {
                        if let Some(cycle) = visit(dep.as_str(), edges, marks, path) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Black);
        None
    }

    let order: Vec<&str> = plan.actions.iter().map(|a| a.id.as_str()).collect();
    for node in order {
        if marks.get(node) == Some(&Mark::White) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(node, &edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parser::parse_plan;
    use serde_json::json;

    fn plan_of(actions: serde_json::Value) -> IMLPlan {
        parse_plan(&json!({"description": "t", "actions": actions})).unwrap()
    }

    #[test]
    fn accepts_a_valid_chain() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "filesystem", "action": "read_file",
             "params": {"path": "/tmp/a"}},
            {"id": "a2", "module": "filesystem", "action": "write_file",
             "params": {"path": "/tmp/b", "content": "{{result.a1.output}}"},
             "depends_on": ["a1"]}
        ]));
        validate(&plan).unwrap();
    }

    #[test]
    fn two_node_cycle_is_named() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {},
             "depends_on": ["a2"]},
            {"id": "a2", "module": "m", "action": "a", "params": {},
             "depends_on": ["a1"]}
        ]));
        let err = validate(&plan).unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("a1 -> a2 -> a1") || text.contains("a2 -> a1 -> a2"),
            "cycle path missing from: {}",
            text
        );
    }

    #[test]
    fn unknown_dependency_reported() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {},
             "depends_on": ["ghost"]}
        ]));
        let err = validate(&plan).unwrap_err();
        assert!(err.to_string().contains("unknown action 'ghost'"));
    }

    #[test]
    fn template_to_non_dependency_is_rejected() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}},
            {"id": "a2", "module": "m", "action": "a",
             "params": {"v": "{{result.a1.output}}"}}
        ]));
        let err = validate(&plan).unwrap_err();
        assert!(err.to_string().contains("not among its dependencies"));
    }

    #[test]
    fn template_through_transitive_dependency_is_allowed() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}},
            {"id": "a2", "module": "m", "action": "a", "params": {},
             "depends_on": ["a1"]},
            {"id": "a3", "module": "m", "action": "a",
             "params": {"v": "{{result.a1.output}}"},
             "depends_on": ["a2"]}
        ]));
        validate(&plan).unwrap();
    }

    #[test]
    fn unknown_sigil_is_rejected() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a",
             "params": {"v": "{{secrets.token}}"}}
        ]));
        let err = validate(&plan).unwrap_err();
        assert!(err.to_string().contains("unknown template prefix 'secrets'"));
    }

    #[test]
    fn compiled_mode_requires_populated_trace() {
        let mut plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}}
        ]));
        plan.plan_mode = PlanMode::Compiled;
        assert!(validate(&plan).is_err());

        plan.compiler_trace = Some(crate::protocol::models::CompilerTrace {
            analysis: Some("step through the request".to_string()),
            resolution: Some("map to m.a".to_string()),
            validation: Some("params present".to_string()),
            generation_approved: true,
            ..Default::default()
        });
        validate(&plan).unwrap();
    }

    #[test]
    fn all_violations_are_collected() {
        let plan = plan_of(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {},
             "depends_on": ["ghost"]},
            {"id": "a2", "module": "m", "action": "a",
             "params": {"v": "{{result.a1.output}}"}}
        ]));
        match validate(&plan) {
            Err(BridgeError::Validation(violations)) => {
                assert!(violations.len() >= 2, "got {:?}", violations)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}

//! Template resolution - late binding of params before dispatch.
//!
//! Three sigils are resolved recursively through a params document:
//!
//! ```text
//! {{result.<action_id>.<path>}}   output field of a completed predecessor
//! {{result.<action_id>}}          the predecessor's whole output
//! {{memory.<key>}}                session key-value store
//! {{env.<VAR>}}                   process environment
//! ```
//!
//! When a template forms the entire string value of a leaf, the leaf is
//! replaced by the referent's native type; otherwise all parts are
//! stringified and concatenated.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
        .unwrap()
});

pub struct TemplateResolver<'a> {
    results: &'a HashMap<String, Value>,
    memory: HashMap<String, Value>,
    allow_env: bool,
    strict_memory: bool,
}

impl<'a> TemplateResolver<'a> {
    pub fn new(results: &'a HashMap<String, Value>, memory: HashMap<String, Value>) -> Self {
        Self {
            results,
            memory,
            allow_env: true,
            strict_memory: false,
        }
    }

    pub fn with_env_access(mut self, allow: bool) -> Self {
        self.allow_env = allow;
        self
    }

    /// Missing memory keys fail instead of resolving to an empty string.
    pub fn with_strict_memory(mut self, strict: bool) -> Self {
        self.strict_memory = strict;
        self
    }

    /// Return a copy of `params` with every template substituted.
    pub fn resolve(&self, params: &Value) -> BridgeResult<Value> {
        self.resolve_value(params)
    }

    fn resolve_value(&self, value: &Value) -> BridgeResult<Value> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<BridgeResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, text: &str) -> BridgeResult<Value> {
        let matches: Vec<_> = TEMPLATE_RE.captures_iter(text).collect();
        if matches.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        // Whole-string template: preserve the referent's native type.
        if matches.len() == 1 && matches[0].get(0).unwrap().as_str() == text.trim() {
            let caps = &matches[0];
            return self.resolve_expression(&caps[1], &caps[2], &caps[0]);
        }

        // Embedded templates: stringify each part and splice.
        let mut out = text.to_string();
        for caps in &matches {
            let raw = caps.get(0).unwrap().as_str();
            let resolved = self.resolve_expression(&caps[1], &caps[2], raw)?;
            let rendered = match resolved {
                Value::String(s) => s,
                other => other.to_string(),
            };
            out = out.replacen(raw, &rendered, 1);
        }
        Ok(Value::String(out))
    }

    fn resolve_expression(&self, prefix: &str, body: &str, raw: &str) -> BridgeResult<Value> {
        match prefix {
            "result" => self.resolve_result(body, raw),
            "memory" => self.resolve_memory(body, raw),
            "env" => self.resolve_env(body, raw),
            other => Err(BridgeError::TemplateResolution {
                expr: raw.to_string(),
                reason: format!(
                    "unknown prefix '{}' (supported: result, memory, env)",
                    other
                ),
            }),
        }
    }

    fn resolve_result(&self, body: &str, raw: &str) -> BridgeResult<Value> {
        let mut parts = body.split('.');
        let action_id = parts.next().unwrap_or("");
        let output = self.results.get(action_id).ok_or_else(|| {
            BridgeError::TemplateResolution {
                expr: raw.to_string(),
                reason: format!(
                    "PRECONDITION_VIOLATED: action '{}' has not completed; check depends_on",
                    action_id
                ),
            }
        })?;

        let mut current = output;
        for segment in parts {
            current = match current {
                Value::Object(map) => map.get(segment).ok_or_else(|| {
                    BridgeError::TemplateResolution {
                        expr: raw.to_string(),
                        reason: format!(
                            "result of '{}' has no field '{}' (available: {})",
                            action_id,
                            segment,
                            field_names(current)
                        ),
                    }
                })?,
                Value::Array(items) => {
                    let index: usize = segment.parse().map_err(|_| {
                        BridgeError::TemplateResolution {
                            expr: raw.to_string(),
                            reason: format!(
                                "'{}' is not a valid array index into the result of '{}'",
                                segment, action_id
                            ),
                        }
                    })?;
                    items.get(index).ok_or_else(|| BridgeError::TemplateResolution {
                        expr: raw.to_string(),
                        reason: format!(
                            "index {} out of bounds in the result of '{}'",
                            index, action_id
                        ),
                    })?
                }
                _ => {
                    return Err(BridgeError::TemplateResolution {
                        expr: raw.to_string(),
                        reason: format!(
                            "result of '{}' is not an object; cannot descend into '{}'",
                            action_id, segment
                        ),
                    })
                }
            };
        }
        Ok(current.clone())
    }

    fn resolve_memory(&self, body: &str, raw: &str) -> BridgeResult<Value> {
        // Flat keys may themselves contain dots; try the literal key first.
        if let Some(value) = self.memory.get(body) {
            return Ok(value.clone());
        }

        // Otherwise the first segment is the key and the rest walks into
        // the stored value.
        let mut parts = body.split('.');
        let key = parts.next().unwrap_or("");
        if let Some(stored) = self.memory.get(key) {
            let mut current = stored;
            for segment in parts {
                current = match current {
                    Value::Object(map) => map.get(segment).ok_or_else(|| {
                        BridgeError::TemplateResolution {
                            expr: raw.to_string(),
                            reason: format!(
                                "memory key '{}' has no field '{}'",
                                key, segment
                            ),
                        }
                    })?,
                    _ => {
                        return Err(BridgeError::TemplateResolution {
                            expr: raw.to_string(),
                            reason: format!(
                                "memory key '{}' is not an object; cannot descend into '{}'",
                                key, segment
                            ),
                        })
                    }
                };
            }
            return Ok(current.clone());
        }

        if self.strict_memory {
            Err(BridgeError::TemplateResolution {
                expr: raw.to_string(),
                reason: format!("memory key '{}' not found", key),
            })
        } else {
            Ok(Value::String(String::new()))
        }
    }

    fn resolve_env(&self, var: &str, raw: &str) -> BridgeResult<Value> {
        if !self.allow_env {
            return Err(BridgeError::TemplateResolution {
                expr: raw.to_string(),
                reason: "environment templates are disabled by the active profile"
                    .to_string(),
            });
        }
        match std::env::var(var) {
            Ok(value) => Ok(Value::String(value)),
            Err(_) => Err(BridgeError::TemplateResolution {
                expr: raw.to_string(),
                reason: format!("environment variable '{}' is not set", var),
            }),
        }
    }
}

fn field_names(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut names: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
            names.sort_unstable();
            names.join(", ")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "a1".to_string(),
            json!({"output": "hello", "count": 3, "nested": {"flag": true}}),
        );
        map
    }

    #[test]
    fn whole_string_template_preserves_type() {
        let results = results();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let out = resolver
            .resolve(&json!({"n": "{{result.a1.count}}"}))
            .unwrap();
        assert_eq!(out["n"], json!(3));
    }

    #[test]
    fn embedded_template_concatenates() {
        let results = results();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let out = resolver
            .resolve(&json!({"msg": "got {{result.a1.count}} items"}))
            .unwrap();
        assert_eq!(out["msg"], json!("got 3 items"));
    }

    #[test]
    fn nested_path_walks_objects() {
        let results = results();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let out = resolver
            .resolve(&json!({"f": "{{result.a1.nested.flag}}"}))
            .unwrap();
        assert_eq!(out["f"], json!(true));
    }

    #[test]
    fn missing_predecessor_is_a_precondition_violation() {
        let results = HashMap::new();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let err = resolver
            .resolve(&json!({"v": "{{result.ghost.output}}"}))
            .unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_VIOLATED"));
    }

    #[test]
    fn missing_path_lists_available_fields() {
        let results = results();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let err = resolver
            .resolve(&json!({"v": "{{result.a1.missing}}"}))
            .unwrap_err();
        assert!(err.to_string().contains("no field 'missing'"));
    }

    #[test]
    fn memory_values_support_path_descent() {
        let results = HashMap::new();
        let memory = HashMap::from([(
            "last_read".to_string(),
            json!({"output": "remembered", "count": 2}),
        )]);
        let resolver = TemplateResolver::new(&results, memory);
        let out = resolver
            .resolve(&json!({"v": "{{memory.last_read.output}}"}))
            .unwrap();
        assert_eq!(out["v"], json!("remembered"));

        let err = resolver
            .resolve(&json!({"v": "{{memory.last_read.missing}}"}))
            .unwrap_err();
        assert!(err.to_string().contains("no field 'missing'"));
    }

    #[test]
    fn memory_defaults_to_empty_string_unless_strict() {
        let results = HashMap::new();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let out = resolver.resolve(&json!({"k": "{{memory.absent}}"})).unwrap();
        assert_eq!(out["k"], json!(""));

        let strict = TemplateResolver::new(&results, HashMap::new()).with_strict_memory(true);
        assert!(strict.resolve(&json!({"k": "{{memory.absent}}"})).is_err());
    }

    #[test]
    fn env_resolution_and_profile_block() {
        std::env::set_var("IML_TEMPLATE_TEST_VAR", "42");
        let results = HashMap::new();
        let resolver = TemplateResolver::new(&results, HashMap::new());
        let out = resolver
            .resolve(&json!({"v": "{{env.IML_TEMPLATE_TEST_VAR}}"}))
            .unwrap();
        assert_eq!(out["v"], json!("42"));

        let blocked = TemplateResolver::new(&results, HashMap::new()).with_env_access(false);
        assert!(blocked
            .resolve(&json!({"v": "{{env.IML_TEMPLATE_TEST_VAR}}"}))
            .is_err());
    }

    #[test]
    fn arrays_and_nested_objects_are_traversed() {
        let results = results();
        let memory = HashMap::from([("name".to_string(), json!("bridge"))]);
        let resolver = TemplateResolver::new(&results, memory);
        let out = resolver
            .resolve(&json!({
                "list": ["{{memory.name}}", {"deep": "{{result.a1.output}}"}]
            }))
            .unwrap();
        assert_eq!(out["list"][0], json!("bridge"));
        assert_eq!(out["list"][1]["deep"], json!("hello"));
    }
}

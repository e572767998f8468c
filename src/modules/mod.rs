//! Module registry - dispatch of `(module_id, action)` to typed handlers.
//!
//! A module is a manifest (id, version, platform support, declared actions
//! with param specs) plus one async handler per action. Handlers are plain
//! closures registered alongside the manifest, so concrete modules can live
//! anywhere - another crate, a test fixture, a dynamic loader - without this
//! crate knowing their internals.
//!
//! Dispatch is synchronous from the executor's perspective: the handler
//! future is awaited in place. Handlers receive a cancellation token and
//! must honour it at their own suspension points.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Future;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::errors::{BridgeError, BridgeResult};

pub type HandlerFuture = Pin<Box<dyn Future<Output = BridgeResult<Value>> + Send>>;
pub type ModuleHandler =
    Arc<dyn Fn(Value, CancellationToken) -> HandlerFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Int,
    Float,
    Bool,
    Object,
    Array,
    Any,
}

/// Declarative parameter spec. Validation is data-driven: the registry
/// checks presence and kind, applies defaults and performs the one safe
/// coercion (int literal where a float is expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, default: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            default,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Coarse capability class used by permission tooling ("read", "write",
    /// "execute", "network", ...).
    #[serde(default)]
    pub permission_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platform_support: Vec<String>,
    pub actions: Vec<ActionSpec>,
}

impl ModuleManifest {
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegisteredModule {
    manifest: ModuleManifest,
    handlers: HashMap<String, ModuleHandler>,
}

pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, RegisteredModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module with one handler per declared action. Every
    /// declared action must have a handler and vice versa.
    pub async fn register(
        &self,
        manifest: ModuleManifest,
        handlers: HashMap<String, ModuleHandler>,
    ) -> BridgeResult<()> {
        for action in &manifest.actions {
            if !handlers.contains_key(&action.name) {
                return Err(BridgeError::Config(format!(
                    "module '{}' declares action '{}' without a handler",
                    manifest.module_id, action.name
                )));
            }
        }
        for name in handlers.keys() {
            if manifest.action(name).is_none() {
                return Err(BridgeError::Config(format!(
                    "module '{}' has a handler for undeclared action '{}'",
                    manifest.module_id, name
                )));
            }
        }

        let module_id = manifest.module_id.clone();
        let mut modules = self.modules.write().await;
        modules.insert(
            module_id.clone(),
            RegisteredModule { manifest, handlers },
        );
        log::info!("[ModuleRegistry] registered module '{}'", module_id);
        Ok(())
    }

    pub async fn manifest(&self, module_id: &str) -> Option<ModuleManifest> {
        self.modules
            .read()
            .await
            .get(module_id)
            .map(|m| m.manifest.clone())
    }

    pub async fn list(&self) -> Vec<ModuleManifest> {
        let mut manifests: Vec<ModuleManifest> = self
            .modules
            .read()
            .await
            .values()
            .map(|m| m.manifest.clone())
            .collect();
        manifests.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        manifests
    }

    pub async fn action_spec(&self, module_id: &str, action: &str) -> Option<ActionSpec> {
        self.modules
            .read()
            .await
            .get(module_id)
            .and_then(|m| m.manifest.action(action).cloned())
    }

    /// Validate params against the declared spec and invoke the handler.
    pub async fn dispatch(
        &self,
        module_id: &str,
        action: &str,
        params: Value,
        token: CancellationToken,
    ) -> BridgeResult<Value> {
        let (spec, handler) = {
            let modules = self.modules.read().await;
            let module = modules.get(module_id).ok_or_else(|| {
                BridgeError::UnknownAction(module_id.to_string(), action.to_string())
            })?;
            let spec = module.manifest.action(action).cloned().ok_or_else(|| {
                BridgeError::UnknownAction(module_id.to_string(), action.to_string())
            })?;
            let handler = module.handlers.get(action).cloned().ok_or_else(|| {
                BridgeError::UnknownAction(module_id.to_string(), action.to_string())
            })?;
            (spec, handler)
        };

        let validated = validate_params(&spec, params)?;
        handler(validated, token).await
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply defaults, enforce presence and kinds, coerce ints to floats where
/// the declared param kind is float. Undeclared keys pass through untouched.
fn validate_params(spec: &ActionSpec, params: Value) -> BridgeResult<Value> {
    let mut map = match params {
        Value::Object(map) => map,
        other => {
            return Err(BridgeError::Module(format!(
                "action '{}' params must be an object, got {}",
                spec.name,
                kind_name(&other)
            )))
        }
    };

    for param in &spec.params {
        match map.get(&param.name) {
            None | Some(Value::Null) => {
                if let Some(default) = &param.default {
                    map.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(BridgeError::Module(format!(
                        "action '{}' missing required param '{}'",
                        spec.name, param.name
                    )));
                }
            }
            Some(value) => {
                let coerced = coerce(value, param.kind).ok_or_else(|| {
                    BridgeError::Module(format!(
                        "action '{}' param '{}' expected {:?}, got {}",
                        spec.name,
                        param.name,
                        param.kind,
                        kind_name(value)
                    ))
                })?;
                if let Some(new_value) = coerced {
                    map.insert(param.name.clone(), new_value);
                }
            }
        }
    }

    Ok(Value::Object(map))
}

/// `Ok(None)` = value already conforms; `Ok(Some(v))` = replace with the
/// coerced value; `None` (outer) = type mismatch.
#[allow(clippy::option_option)]
fn coerce(value: &Value, kind: ParamKind) -> Option<Option<Value>> {
    match kind {
        ParamKind::Any => Some(None),
        ParamKind::String => value.is_string().then_some(None),
        ParamKind::Int => value.as_i64().map(|_| None),
        ParamKind::Float => {
            if value.is_f64() {
                Some(None)
            } else {
                value
                    .as_i64()
                    .map(|i| Some(Value::from(i as f64)))
            }
        }
        ParamKind::Bool => value.is_boolean().then_some(None),
        ParamKind::Object => value.is_object().then_some(None),
        ParamKind::Array => value.is_array().then_some(None),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Wrap an async closure into the registry handler shape.
pub fn handler<F, Fut>(f: F) -> ModuleHandler
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
{
    Arc::new(move |params, token| Box::pin(f(params, token)))
}

/// A tiny built-in module useful for smoke tests and the capability prompt:
/// `iml.echo` returns its params, `iml.sleep` waits (honouring cancellation).
pub async fn register_builtin(registry: &ModuleRegistry) -> BridgeResult<()> {
    let manifest = ModuleManifest {
        module_id: "iml".to_string(),
        version: "1.0.0".to_string(),
        description: "Built-in diagnostics module".to_string(),
        platform_support: vec!["linux".to_string(), "macos".to_string(), "windows".to_string()],
        actions: vec![
            ActionSpec {
                name: "echo".to_string(),
                description: "Return the given params unchanged".to_string(),
                params: vec![],
                permission_class: "read".to_string(),
            },
            ActionSpec {
                name: "sleep".to_string(),
                description: "Wait for the given number of seconds".to_string(),
                params: vec![ParamSpec::optional(
                    "seconds",
                    ParamKind::Float,
                    Some(Value::from(1.0)),
                )],
                permission_class: "read".to_string(),
            },
        ],
    };

    let mut handlers: HashMap<String, ModuleHandler> = HashMap::new();
    handlers.insert(
        "echo".to_string(),
        handler(|params, _token| async move { Ok(params) }),
    );
    handlers.insert(
        "sleep".to_string(),
        handler(|params, token| async move {
            let seconds = params
                .get("seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)) => {
                    Ok(serde_json::json!({"slept": seconds}))
                }
                _ = token.cancelled() => Err(BridgeError::Cancelled),
            }
        }),
    );

    registry.register(manifest, handlers).await
}

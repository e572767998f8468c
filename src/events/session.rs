//! Session context propagation - maps a running plan back to the trigger
//! that launched it.
//!
//! The daemon binds `plan_id -> trigger context` just before submitting a
//! triggered plan and unbinds when the plan reaches a terminal state. Any
//! component that needs to know *why* a plan is running (template namespace,
//! chain-depth accounting, event session fields) looks the context up by id
//! on demand; nothing holds a long-lived handle to the record.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

/// Well-known context key carrying the trigger chain depth into a plan.
pub const KEY_TRIGGER_CHAIN_DEPTH: &str = "trigger_chain_depth";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub trigger_id: Option<String>,
    pub trigger_name: Option<String>,
    pub event_type: Option<String>,
    pub session_id: Option<String>,
    pub fields: HashMap<String, Value>,
}

impl SessionContext {
    pub fn chain_depth(&self) -> u32 {
        self.fields
            .get(KEY_TRIGGER_CHAIN_DEPTH)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

pub struct SessionContextPropagator {
    contexts: RwLock<HashMap<String, SessionContext>>,
}

impl SessionContextPropagator {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Associate a context with `plan_id`. Overwrites a previous binding.
    pub fn bind(&self, plan_id: &str, context: SessionContext) {
        self.contexts
            .write()
            .expect("session context lock poisoned")
            .insert(plan_id.to_string(), context);
        log::debug!("[SessionContext] bound plan {}", plan_id);
    }

    pub fn get(&self, plan_id: &str) -> Option<SessionContext> {
        self.contexts
            .read()
            .expect("session context lock poisoned")
            .get(plan_id)
            .cloned()
    }

    /// Remove the binding once the plan terminates.
    pub fn unbind(&self, plan_id: &str) {
        let removed = self
            .contexts
            .write()
            .expect("session context lock poisoned")
            .remove(plan_id);
        if removed.is_some() {
            log::debug!("[SessionContext] unbound plan {}", plan_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.contexts
            .read()
            .expect("session context lock poisoned")
            .len()
    }
}

impl Default for SessionContextPropagator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_get_unbind() {
        let propagator = SessionContextPropagator::new();
        let mut ctx = SessionContext {
            trigger_id: Some("t1".to_string()),
            ..Default::default()
        };
        ctx.fields
            .insert(KEY_TRIGGER_CHAIN_DEPTH.to_string(), json!(2));

        propagator.bind("p1", ctx.clone());
        let got = propagator.get("p1").unwrap();
        assert_eq!(got.trigger_id.as_deref(), Some("t1"));
        assert_eq!(got.chain_depth(), 2);

        propagator.unbind("p1");
        assert!(propagator.get("p1").is_none());
        assert_eq!(propagator.active_count(), 0);
    }

    #[test]
    fn chain_depth_defaults_to_zero() {
        assert_eq!(SessionContext::default().chain_depth(), 0);
    }
}

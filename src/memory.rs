//! Session-scoped key-value memory.
//!
//! Backs the `{{memory.<key>}}` template namespace and the per-action
//! `memory.read_keys` / `memory.write_key` configuration. Keys written
//! without a session land in a shared global scope; session keys shadow
//! global ones on read.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Default)]
struct Scopes {
    global: HashMap<String, Value>,
    sessions: HashMap<String, HashMap<String, Value>>,
}

pub struct KeyValueStore {
    scopes: RwLock<Scopes>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self {
            scopes: RwLock::new(Scopes::default()),
        }
    }

    pub async fn set(&self, key: &str, value: Value, session_id: Option<&str>) {
        let mut scopes = self.scopes.write().await;
        match session_id {
            Some(session) => {
                scopes
                    .sessions
                    .entry(session.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
            None => {
                scopes.global.insert(key.to_string(), value);
            }
        }
    }

    pub async fn get(&self, key: &str, session_id: Option<&str>) -> Option<Value> {
        let scopes = self.scopes.read().await;
        if let Some(session) = session_id {
            if let Some(value) = scopes.sessions.get(session).and_then(|m| m.get(key)) {
                return Some(value.clone());
            }
        }
        scopes.global.get(key).cloned()
    }

    /// Fetch several keys at once; absent keys are simply missing from the map.
    pub async fn get_many(
        &self,
        keys: &[String],
        session_id: Option<&str>,
    ) -> HashMap<String, Value> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key, session_id).await {
                out.insert(key.clone(), value);
            }
        }
        out
    }

    /// Drop all keys belonging to one session.
    pub async fn clear_session(&self, session_id: &str) {
        self.scopes.write().await.sessions.remove(session_id);
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn session_keys_shadow_global() {
        let store = KeyValueStore::new();
        store.set("name", json!("global"), None).await;
        store.set("name", json!("scoped"), Some("s1")).await;

        assert_eq!(store.get("name", None).await, Some(json!("global")));
        assert_eq!(store.get("name", Some("s1")).await, Some(json!("scoped")));
        assert_eq!(store.get("name", Some("s2")).await, Some(json!("global")));
    }

    #[tokio::test]
    async fn get_many_skips_missing() {
        let store = KeyValueStore::new();
        store.set("a", json!(1), None).await;
        let out = store
            .get_many(&["a".to_string(), "missing".to_string()], None)
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out["a"], json!(1));
    }

    #[tokio::test]
    async fn clear_session_removes_scoped_keys_only() {
        let store = KeyValueStore::new();
        store.set("k", json!("g"), None).await;
        store.set("k", json!("s"), Some("s1")).await;
        store.clear_session("s1").await;
        assert_eq!(store.get("k", Some("s1")).await, Some(json!("g")));
    }
}

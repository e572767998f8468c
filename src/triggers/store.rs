//! Trigger persistence.
//!
//! One table, `triggers`, holding the full JSON definition plus promoted
//! columns for the fields the daemon queries at startup. The `state` column
//! is authoritative: fast-path state updates touch only the column, so on
//! load the column value overrides whatever state the JSON payload carries.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::errors::{BridgeError, BridgeResult};
use crate::triggers::models::{TriggerDefinition, TriggerState};

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS triggers (
    trigger_id  TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    state       TEXT NOT NULL DEFAULT 'registered',
    enabled     INTEGER NOT NULL DEFAULT 1,
    definition  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    expires_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_triggers_state   ON triggers(state);
CREATE INDEX IF NOT EXISTS idx_triggers_enabled ON triggers(enabled);
";

pub struct TriggerStore {
    conn: Mutex<Connection>,
}

impl TriggerStore {
    pub fn open(path: &Path) -> BridgeResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::Store(format!("create trigger dir: {}", e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Store(format!("open trigger db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| BridgeError::Store(format!("initialise trigger schema: {}", e)))?;
        log::info!("[TriggerStore] opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> BridgeResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BridgeError::Store(format!("open in-memory trigger db: {}", e)))?;
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| BridgeError::Store(format!("initialise trigger schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> BridgeResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BridgeError::Store("trigger store lock poisoned".to_string()))
    }

    /// Upsert by trigger_id; refreshes `updated_at`.
    pub fn save(&self, trigger: &mut TriggerDefinition) -> BridgeResult<()> {
        trigger.updated_at = Utc::now();
        let definition = serde_json::to_string(trigger)
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO triggers
                 (trigger_id, name, state, enabled, definition, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(trigger_id) DO UPDATE SET
                 name       = excluded.name,
                 state      = excluded.state,
                 enabled    = excluded.enabled,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at",
            params![
                trigger.trigger_id,
                trigger.name,
                trigger.state.as_str(),
                trigger.enabled as i64,
                definition,
                trigger.created_at.to_rfc3339(),
                trigger.updated_at.to_rfc3339(),
                trigger.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| BridgeError::Store(format!("save trigger: {}", e)))?;
        Ok(())
    }

    /// Fast-path state transition without re-serialising the definition.
    pub fn update_state(&self, trigger_id: &str, state: TriggerState) -> BridgeResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE triggers SET state = ?1, updated_at = ?2 WHERE trigger_id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), trigger_id],
        )
        .map_err(|e| BridgeError::Store(format!("update trigger state: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, trigger_id: &str) -> BridgeResult<Option<TriggerDefinition>> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT definition, state FROM triggers WHERE trigger_id = ?1",
                params![trigger_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        row.map(|(definition, state)| hydrate(&definition, &state))
            .transpose()
    }

    pub fn list_all(&self) -> BridgeResult<Vec<TriggerDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT definition, state FROM triggers ORDER BY created_at ASC")
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .and_then(|m| m.collect())
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        rows.iter()
            .map(|(definition, state)| hydrate(definition, state))
            .collect()
    }

    /// All enabled triggers to re-arm at daemon startup.
    pub fn load_enabled(&self) -> BridgeResult<Vec<TriggerDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT definition, state FROM triggers WHERE enabled = 1")
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .and_then(|m| m.collect())
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        rows.iter()
            .map(|(definition, state)| hydrate(definition, state))
            .collect()
    }

    pub fn delete(&self, trigger_id: &str) -> BridgeResult<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM triggers WHERE trigger_id = ?1",
                params![trigger_id],
            )
            .map_err(|e| BridgeError::Store(format!("delete trigger: {}", e)))?;
        Ok(deleted > 0)
    }

    /// Remove triggers whose `expires_at` is in the past; returns the ids.
    pub fn purge_expired(&self) -> BridgeResult<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT trigger_id FROM triggers WHERE expires_at IS NOT NULL AND expires_at < ?1")
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let expired: Vec<String> = stmt
            .query_map(params![now], |row| row.get(0))
            .and_then(|m| m.collect())
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        drop(stmt);
        if !expired.is_empty() {
            conn.execute(
                "DELETE FROM triggers WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![now],
            )
            .map_err(|e| BridgeError::Store(format!("purge triggers: {}", e)))?;
        }
        Ok(expired)
    }
}

/// Reconstruct a definition; the state column overrides the JSON payload.
fn hydrate(definition: &str, state: &str) -> BridgeResult<TriggerDefinition> {
    let mut trigger: TriggerDefinition = serde_json::from_str(definition)
        .map_err(|e| BridgeError::Store(format!("corrupt trigger definition: {}", e)))?;
    trigger.state = state
        .parse()
        .map_err(|e: String| BridgeError::Store(e))?;
    Ok(trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger() -> TriggerDefinition {
        serde_json::from_value(json!({
            "name": "nightly",
            "condition": {"type": "temporal", "kind": "cron", "schedule": "0 2 * * *"},
            "plan_template": {"description": "backup", "actions": []},
            "max_fires_per_hour": 4,
            "resource_lock": "backup"
        }))
        .unwrap()
    }

    #[test]
    fn save_then_get_round_trips() {
        let store = TriggerStore::open_in_memory().unwrap();
        let mut t = trigger();
        store.save(&mut t).unwrap();
        let loaded = store.get(&t.trigger_id).unwrap().unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.resource_lock.as_deref(), Some("backup"));
        assert_eq!(loaded.condition, t.condition);
    }

    #[test]
    fn state_column_wins_over_json_payload() {
        let store = TriggerStore::open_in_memory().unwrap();
        let mut t = trigger();
        t.state = TriggerState::Active;
        store.save(&mut t).unwrap();

        // Fast-path update touches only the column; the JSON still says
        // "active".
        store
            .update_state(&t.trigger_id, TriggerState::Throttled)
            .unwrap();
        let loaded = store.get(&t.trigger_id).unwrap().unwrap();
        assert_eq!(loaded.state, TriggerState::Throttled);
    }

    #[test]
    fn load_enabled_skips_disabled_triggers() {
        let store = TriggerStore::open_in_memory().unwrap();
        let mut on = trigger();
        store.save(&mut on).unwrap();
        let mut off = trigger();
        off.enabled = false;
        store.save(&mut off).unwrap();

        let loaded = store.load_enabled().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].trigger_id, on.trigger_id);
    }

    #[test]
    fn purge_expired_removes_only_past_expiry() {
        let store = TriggerStore::open_in_memory().unwrap();
        let mut stale = trigger();
        stale.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.save(&mut stale).unwrap();
        let mut fresh = trigger();
        fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.save(&mut fresh).unwrap();
        let mut forever = trigger();
        store.save(&mut forever).unwrap();

        let purged = store.purge_expired().unwrap();
        assert_eq!(purged, vec![stale.trigger_id.clone()]);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn delete_reports_existence() {
        let store = TriggerStore::open_in_memory().unwrap();
        let mut t = trigger();
        store.save(&mut t).unwrap();
        assert!(store.delete(&t.trigger_id).unwrap());
        assert!(!store.delete(&t.trigger_id).unwrap());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.db");
        let mut t = trigger();
        {
            let store = TriggerStore::open(&path).unwrap();
            store.save(&mut t).unwrap();
            store.update_state(&t.trigger_id, TriggerState::Active).unwrap();
        }
        let store = TriggerStore::open(&path).unwrap();
        let loaded = store.get(&t.trigger_id).unwrap().unwrap();
        assert_eq!(loaded.state, TriggerState::Active);
    }
}

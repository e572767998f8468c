//! Durable plan/action state.
//!
//! SQLite-backed store for [`ExecutionState`] records. The store owns all
//! durable state: the executor mutates a plan's record only while the plan
//! is RUNNING and everything survives a daemon restart.
//!
//! `rusqlite::Connection` is `Send` but not `Sync`; wrapping it in a `Mutex`
//! serialises writes and makes the store shareable across tasks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::models::{ActionStatus, IMLPlan, PlanStatus};
use crate::security::RejectionDetails;

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS plans (
    plan_id     TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    data        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    plan_id     TEXT NOT NULL,
    action_id   TEXT NOT NULL,
    state       TEXT NOT NULL,
    started_at  TEXT,
    ended_at    TEXT,
    result      TEXT,
    error       TEXT,
    attempt     INTEGER NOT NULL DEFAULT 0,
    module      TEXT NOT NULL DEFAULT '',
    action      TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (plan_id, action_id)
);

CREATE INDEX IF NOT EXISTS idx_actions_plan_id ON actions(plan_id);
CREATE INDEX IF NOT EXISTS idx_plans_status    ON plans(status);
";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-action runtime record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub state: ActionStatus,
    pub module: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Value>,
}

/// Per-plan runtime record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub plan_id: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_details: Option<RejectionDetails>,
    pub actions: BTreeMap<String, ActionRecord>,
}

impl ExecutionState {
    pub fn from_plan(plan: &IMLPlan) -> Self {
        let now = Utc::now();
        let actions = plan
            .actions
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    ActionRecord {
                        action_id: a.id.clone(),
                        state: ActionStatus::Pending,
                        module: a.module.clone(),
                        action: a.action.clone(),
                        started_at: None,
                        ended_at: None,
                        result: None,
                        error: None,
                        attempt: 0,
                        approval: None,
                    },
                )
            })
            .collect();
        Self {
            plan_id: plan.plan_id.clone(),
            status: PlanStatus::Queued,
            created_at: now,
            updated_at: now,
            session_id: plan.session_id.clone(),
            rejection_details: None,
            actions,
        }
    }

    pub fn action(&self, action_id: &str) -> Option<&ActionRecord> {
        self.actions.get(action_id)
    }

    /// A plan succeeds when every action ended COMPLETED or SKIPPED.
    pub fn all_settled_clean(&self) -> bool {
        self.actions
            .values()
            .all(|a| matches!(a.state, ActionStatus::Completed | ActionStatus::Skipped))
    }

    pub fn any_failed(&self) -> bool {
        self.actions
            .values()
            .any(|a| a.state == ActionStatus::Failed)
    }
}

/// Fields persisted in the `data` JSON column alongside the promoted ones.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rejection_details: Option<RejectionDetails>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct PlanStateStore {
    conn: Mutex<Connection>,
}

impl PlanStateStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> BridgeResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::Store(format!("create state dir: {}", e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Store(format!("open state db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| BridgeError::Store(format!("initialise schema: {}", e)))?;
        log::info!("[StateStore] opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Purely in-memory store, used by tests and ephemeral runs.
    pub fn open_in_memory() -> BridgeResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BridgeError::Store(format!("open in-memory db: {}", e)))?;
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| BridgeError::Store(format!("initialise schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> BridgeResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BridgeError::Store("state store lock poisoned".to_string()))
    }

    /// Persist a freshly created state (plan row plus one row per action).
    pub fn create(&self, state: &ExecutionState) -> BridgeResult<()> {
        let data = serde_json::to_string(&PlanData {
            session_id: state.session_id.clone(),
            rejection_details: state.rejection_details.clone(),
        })
        .map_err(|e| BridgeError::Store(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO plans (plan_id, status, created_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                state.plan_id,
                state.status.as_str(),
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                data,
            ],
        )
        .map_err(|e| BridgeError::Store(format!("insert plan: {}", e)))?;

        for record in state.actions.values() {
            conn.execute(
                "INSERT OR REPLACE INTO actions
                 (plan_id, action_id, state, attempt, module, action)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.plan_id,
                    record.action_id,
                    record.state.as_str(),
                    record.attempt,
                    record.module,
                    record.action,
                ],
            )
            .map_err(|e| BridgeError::Store(format!("insert action: {}", e)))?;
        }
        Ok(())
    }

    pub fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> BridgeResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE plans SET status = ?1, updated_at = ?2 WHERE plan_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), plan_id],
        )
        .map_err(|e| BridgeError::Store(format!("update plan status: {}", e)))?;
        Ok(())
    }

    /// Merge rejection details into the plan's `data` column; round-trips
    /// verbatim. Does not change the status column.
    pub fn set_rejection_details(
        &self,
        plan_id: &str,
        details: &RejectionDetails,
    ) -> BridgeResult<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT data FROM plans WHERE plan_id = ?1",
                params![plan_id],
                |row| row.get(0),
            )
            .ok();
        let mut data: PlanData = existing
            .as_deref()
            .and_then(|d| serde_json::from_str(d).ok())
            .unwrap_or_default();
        data.rejection_details = Some(details.clone());
        let serialized =
            serde_json::to_string(&data).map_err(|e| BridgeError::Store(e.to_string()))?;
        conn.execute(
            "UPDATE plans SET data = ?1, updated_at = ?2 WHERE plan_id = ?3",
            params![serialized, Utc::now().to_rfc3339(), plan_id],
        )
        .map_err(|e| BridgeError::Store(format!("set rejection details: {}", e)))?;
        Ok(())
    }

    /// Record an admission rejection: details plus terminal REJECTED status.
    pub fn set_rejection(
        &self,
        plan_id: &str,
        details: &RejectionDetails,
    ) -> BridgeResult<()> {
        self.set_rejection_details(plan_id, details)?;
        self.update_plan_status(plan_id, PlanStatus::Rejected)
    }

    pub fn update_action(&self, plan_id: &str, record: &ActionRecord) -> BridgeResult<()> {
        let result_json = record
            .result
            .as_ref()
            .map(|r| serde_json::to_string(r))
            .transpose()
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE actions SET state = ?1, started_at = ?2, ended_at = ?3,
                    result = ?4, error = ?5, attempt = ?6
             WHERE plan_id = ?7 AND action_id = ?8",
            params![
                record.state.as_str(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.ended_at.map(|t| t.to_rfc3339()),
                result_json,
                record.error,
                record.attempt,
                plan_id,
                record.action_id,
            ],
        )
        .map_err(|e| BridgeError::Store(format!("update action: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, plan_id: &str) -> BridgeResult<Option<ExecutionState>> {
        let conn = self.lock()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT status, created_at, updated_at, data FROM plans WHERE plan_id = ?1",
                params![plan_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .ok();
        let Some((status, created_at, updated_at, data)) = row else {
            return Ok(None);
        };

        let data: PlanData = serde_json::from_str(&data).unwrap_or_default();
        let mut state = ExecutionState {
            plan_id: plan_id.to_string(),
            status: status
                .parse()
                .map_err(|e: String| BridgeError::Store(e))?,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            session_id: data.session_id,
            rejection_details: data.rejection_details,
            actions: BTreeMap::new(),
        };

        let mut stmt = conn
            .prepare(
                "SELECT action_id, state, started_at, ended_at, result, error, attempt,
                        module, action
                 FROM actions WHERE plan_id = ?1",
            )
            .map_err(|e| BridgeError::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())
            .map_err(|e| BridgeError::Store(format!("load actions: {}", e)))?;

        for (action_id, action_state, started, ended, result, error, attempt, module, action) in
            rows
        {
            state.actions.insert(
                action_id.clone(),
                ActionRecord {
                    action_id,
                    state: action_state
                        .parse()
                        .map_err(|e: String| BridgeError::Store(e))?,
                    module,
                    action,
                    started_at: started.as_deref().map(parse_time).transpose()?,
                    ended_at: ended.as_deref().map(parse_time).transpose()?,
                    result: result
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()
                        .map_err(|e| BridgeError::Store(e.to_string()))?,
                    error,
                    attempt,
                    approval: None,
                },
            );
        }
        Ok(Some(state))
    }

    pub fn list_plans(
        &self,
        status: Option<PlanStatus>,
        limit: usize,
    ) -> BridgeResult<Vec<(String, PlanStatus, DateTime<Utc>)>> {
        let conn = self.lock()?;
        let rows: Vec<(String, String, String)> = match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT plan_id, status, created_at FROM plans WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2",
                    )
                    .map_err(|e| BridgeError::Store(e.to_string()))?;
                stmt.query_map(params![status.as_str(), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .and_then(|m| m.collect())
                .map_err(|e| BridgeError::Store(e.to_string()))?
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT plan_id, status, created_at FROM plans
                         ORDER BY created_at DESC LIMIT ?1",
                    )
                    .map_err(|e| BridgeError::Store(e.to_string()))?;
                stmt.query_map(params![limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .and_then(|m| m.collect())
                .map_err(|e| BridgeError::Store(e.to_string()))?
            }
        };
        rows.into_iter()
            .map(|(id, status, created)| {
                Ok((
                    id,
                    status.parse().map_err(|e: String| BridgeError::Store(e))?,
                    parse_time(&created)?,
                ))
            })
            .collect()
    }
}

fn parse_time(raw: &str) -> BridgeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BridgeError::Store(format!("bad timestamp '{}': {}", raw, e)))
}

//! Trigger data model.
//!
//! A [`TriggerDefinition`] is the persisted unit: *what* to watch (the
//! condition), *what to do* on a fire (the plan template), and *how* to
//! manage it (priority, throttling, conflict policy, chaining, expiry).
//! Watchers and the daemon hold these records by id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// States and priorities
// ---------------------------------------------------------------------------

/// Lifecycle state machine:
///
/// ```text
/// register(enabled=false) -> INACTIVE
/// register(enabled=true)  -> REGISTERED -> ACTIVE
/// ACTIVE --watcher fires--> FIRED -> ACTIVE (re-arm)
/// ACTIVE --throttled------> THROTTLED -> ACTIVE (next interval)
/// ACTIVE --watcher error--> FAILED (manual re-enable required)
/// ACTIVE --deactivate()---> INACTIVE
/// ```
///
/// Composite triggers holding partial matches sit in WATCHING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Registered,
    Inactive,
    Active,
    Watching,
    Fired,
    Throttled,
    Failed,
}

impl TriggerState {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerState::Registered => "registered",
            TriggerState::Inactive => "inactive",
            TriggerState::Active => "active",
            TriggerState::Watching => "watching",
            TriggerState::Fired => "fired",
            TriggerState::Throttled => "throttled",
            TriggerState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(TriggerState::Registered),
            "inactive" => Ok(TriggerState::Inactive),
            "active" => Ok(TriggerState::Active),
            "watching" => Ok(TriggerState::Watching),
            "fired" => Ok(TriggerState::Fired),
            "throttled" => Ok(TriggerState::Throttled),
            "failed" => Ok(TriggerState::Failed),
            other => Err(format!("unknown trigger state '{}'", other)),
        }
    }
}

/// Fire priority; lower ordinal is more urgent (CRITICAL=0 .. BACKGROUND=4).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl TriggerPriority {
    pub fn ordinal(self) -> u8 {
        match self {
            TriggerPriority::Critical => 0,
            TriggerPriority::High => 1,
            TriggerPriority::Normal => 2,
            TriggerPriority::Low => 3,
            TriggerPriority::Background => 4,
        }
    }
}

/// What to do when a fire arrives while this trigger's resource lock is
/// held by a running plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Wait for the lock (bounded), then run.
    #[default]
    Queue,
    /// Cancel the holding plan, wait for it to settle, then run.
    Preempt,
    /// Drop the fire.
    Reject,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Temporal sub-kinds: repeat every N seconds, a cron schedule, or a single
/// absolute timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemporalSpec {
    Interval { interval_seconds: f64 },
    Cron { schedule: String },
    Once { run_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventKind {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMetric {
    CpuPercent,
    MemoryPercent,
    DiskPercent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompositeOperator {
    And,
    Or,
    Not,
    Seq,
    Window,
}

fn default_fs_events() -> Vec<FsEventKind> {
    vec![FsEventKind::Created, FsEventKind::Modified, FsEventKind::Deleted]
}

fn default_poll_interval() -> f64 {
    5.0
}

/// Discriminated union over every watcher kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    Temporal {
        #[serde(flatten)]
        spec: TemporalSpec,
    },
    Filesystem {
        path: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_fs_events")]
        events: Vec<FsEventKind>,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: f64,
    },
    Process {
        name: String,
        event: ProcessEventKind,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: f64,
    },
    Resource {
        metric: ResourceMetric,
        threshold: f64,
        #[serde(default)]
        duration_seconds: f64,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: f64,
    },
    Composite {
        operator: CompositeOperator,
        trigger_ids: Vec<String>,
        #[serde(default = "default_composite_timeout")]
        timeout_seconds: f64,
        /// NOT: fire when all sub-triggers were silent this long.
        #[serde(default = "default_silence")]
        silence_seconds: f64,
        /// WINDOW: required fire count inside the sliding window.
        #[serde(default = "default_window_count")]
        count: usize,
        #[serde(default = "default_window_seconds")]
        window_seconds: f64,
    },
}

fn default_composite_timeout() -> f64 {
    60.0
}

fn default_silence() -> f64 {
    300.0
}

fn default_window_count() -> usize {
    1
}

fn default_window_seconds() -> f64 {
    300.0
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Exponential moving average weight for fire latency.
const LATENCY_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerHealth {
    pub fire_count: u64,
    pub fail_count: u64,
    pub throttle_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub avg_latency_ms: f64,
}

impl TriggerHealth {
    pub fn record_fire(&mut self, latency_ms: f64) {
        self.fire_count += 1;
        self.last_fired_at = Some(Utc::now());
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms =
                (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms + LATENCY_EMA_ALPHA * latency_ms;
        }
    }

    pub fn record_fail(&mut self, error: &str) {
        self.fail_count += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn record_throttle(&mut self) {
        self.throttle_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_CHAIN_DEPTH: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    #[serde(default = "new_trigger_id")]
    pub trigger_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub condition: TriggerCondition,
    /// Parameterised IML plan submitted on each fire.
    pub plan_template: Value,
    #[serde(default = "default_state")]
    pub state: TriggerState,
    #[serde(default)]
    pub priority: TriggerPriority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum seconds between consecutive fires. 0 = no cooldown.
    #[serde(default)]
    pub min_interval_seconds: f64,
    /// Maximum fires per sliding hour. 0 = unlimited.
    #[serde(default)]
    pub max_fires_per_hour: u32,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Named mutex: two triggers sharing a lock never have plans running
    /// at the same time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trigger_id: Option<String>,
    /// Trigger-to-trigger registration depth along this causal chain.
    #[serde(default)]
    pub chain_depth: u32,
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub health: TriggerHealth,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn new_trigger_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_state() -> TriggerState {
    TriggerState::Registered
}

fn default_enabled() -> bool {
    true
}

fn default_max_chain_depth() -> u32 {
    DEFAULT_MAX_CHAIN_DEPTH
}

impl TriggerDefinition {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }

    /// Whether this trigger is eligible to fire right now. The cooldown is
    /// part of eligibility; the hourly cap is enforced by the scheduler.
    pub fn can_fire(&self) -> bool {
        if !self.enabled || self.is_expired() {
            return false;
        }
        // THROTTLED stays eligible so a throttled trigger re-arms on the
        // next interval once its cooldown or window clears.
        if !matches!(
            self.state,
            TriggerState::Active
                | TriggerState::Watching
                | TriggerState::Fired
                | TriggerState::Throttled
        ) {
            return false;
        }
        if self.min_interval_seconds > 0.0 {
            if let Some(last) = self.health.last_fired_at {
                let elapsed = (Utc::now() - last).num_milliseconds() as f64 / 1000.0;
                if elapsed < self.min_interval_seconds {
                    return false;
                }
            }
        }
        true
    }

    pub fn generate_plan_id(&self) -> String {
        format!("trigger_{}", &Uuid::new_v4().simple().to_string()[..12])
    }
}

/// Transient record carried from a watcher fire to plan submission; also
/// the `trigger.*` template namespace of the launched plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFireEvent {
    pub trigger_id: String,
    pub trigger_name: String,
    pub event_type: String,
    pub payload: Value,
    pub fired_at: DateTime<Utc>,
    #[serde(default)]
    pub plan_id: String,
}

impl TriggerFireEvent {
    pub fn new(trigger_id: &str, trigger_name: &str, event_type: &str, payload: Value) -> Self {
        Self {
            trigger_id: trigger_id.to_string(),
            trigger_name: trigger_name.to_string(),
            event_type: event_type.to_string(),
            payload,
            fired_at: Utc::now(),
            plan_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> TriggerDefinition {
        serde_json::from_value(json!({
            "name": "every-minute",
            "condition": {"type": "temporal", "kind": "interval", "interval_seconds": 60.0},
            "plan_template": {"description": "tick", "actions": []}
        }))
        .unwrap()
    }

    #[test]
    fn defaults_apply_on_deserialize() {
        let t = definition();
        assert_eq!(t.state, TriggerState::Registered);
        assert_eq!(t.priority, TriggerPriority::Normal);
        assert_eq!(t.conflict_policy, ConflictPolicy::Queue);
        assert_eq!(t.max_chain_depth, DEFAULT_MAX_CHAIN_DEPTH);
        assert!(t.enabled);
        assert!(!t.trigger_id.is_empty());
    }

    #[test]
    fn condition_union_round_trips() {
        let conditions = vec![
            json!({"type": "temporal", "kind": "cron", "schedule": "0 9 * * 1-5"}),
            json!({"type": "filesystem", "path": "/tmp/watch", "recursive": true}),
            json!({"type": "process", "name": "firefox", "event": "started"}),
            json!({"type": "resource", "metric": "cpu_percent", "threshold": 90.0,
                   "duration_seconds": 30.0}),
            json!({"type": "composite", "operator": "WINDOW", "trigger_ids": ["t1"],
                   "count": 3, "window_seconds": 300.0}),
        ];
        for raw in conditions {
            let parsed: TriggerCondition = serde_json::from_value(raw.clone()).unwrap();
            let back = serde_json::to_value(&parsed).unwrap();
            let reparsed: TriggerCondition = serde_json::from_value(back).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn cooldown_blocks_can_fire() {
        let mut t = definition();
        t.state = TriggerState::Active;
        t.min_interval_seconds = 3600.0;
        assert!(t.can_fire());
        t.health.record_fire(5.0);
        assert!(!t.can_fire());
    }

    #[test]
    fn disabled_failed_or_expired_triggers_cannot_fire() {
        let mut t = definition();
        t.state = TriggerState::Active;
        assert!(t.can_fire());

        t.enabled = false;
        assert!(!t.can_fire());
        t.enabled = true;

        t.state = TriggerState::Failed;
        assert!(!t.can_fire());
        t.state = TriggerState::Active;

        t.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!t.can_fire());
    }

    #[test]
    fn latency_ema_converges_towards_new_samples() {
        let mut health = TriggerHealth::default();
        health.record_fire(100.0);
        assert_eq!(health.avg_latency_ms, 100.0);
        health.record_fire(200.0);
        // 0.7 * 100 + 0.3 * 200
        assert!((health.avg_latency_ms - 130.0).abs() < 1e-9);
        assert_eq!(health.fire_count, 2);
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(TriggerPriority::Critical < TriggerPriority::Background);
        assert_eq!(TriggerPriority::Critical.ordinal(), 0);
        assert_eq!(TriggerPriority::Background.ordinal(), 4);
    }
}

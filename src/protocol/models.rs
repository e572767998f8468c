//! IML protocol v2 - canonical data model.
//!
//! Every structure in an IML plan is defined here and deserialised through
//! serde. This module is the single source of truth for the wire contract:
//! only data shapes and their local invariants live here, no business logic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// The only protocol version this daemon accepts.
pub const PROTOCOL_VERSION: &str = "2.0";

pub const MAX_ACTIONS_PER_PLAN: usize = 500;
pub const MAX_PLAN_DESCRIPTION_LEN: usize = 2000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MAX_RETRY_BACKOFF_SECONDS: f64 = 300.0;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How the plan was generated and what guarantees it carries.
///
/// `Direct` plans come straight out of the model (probabilistic); the daemon
/// validates structure and params but requires no reasoning trace.
/// `Compiled` plans must carry a four-phase [`CompilerTrace`] whose
/// generation phase was explicitly approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    #[default]
    Direct,
    Compiled,
}

/// What the executor does when an action terminates FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Mark all transitive descendants SKIPPED and fail the plan.
    #[default]
    Abort,
    /// Leave descendants eligible; the plan fails only at the end.
    Continue,
}

/// Lifecycle state of a single action within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Failed
                | ActionStatus::Skipped
                | ActionStatus::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Waiting => "waiting",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
            ActionStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "waiting" => Ok(ActionStatus::Waiting),
            "running" => Ok(ActionStatus::Running),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            "skipped" => Ok(ActionStatus::Skipped),
            "rolled_back" => Ok(ActionStatus::RolledBack),
            other => Err(format!("unknown action status '{}'", other)),
        }
    }
}

/// Aggregate lifecycle status of a submitted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Refused by an admission gate before any action ran.
    Rejected,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PlanStatus::Queued | PlanStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Queued => "queued",
            PlanStatus::Running => "running",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PlanStatus::Queued),
            "running" => Ok(PlanStatus::Running),
            "succeeded" => Ok(PlanStatus::Succeeded),
            "failed" => Ok(PlanStatus::Failed),
            "cancelled" => Ok(PlanStatus::Cancelled),
            "rejected" => Ok(PlanStatus::Rejected),
            other => Err(format!("unknown plan status '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Nested configuration
// ---------------------------------------------------------------------------

/// Retry policy applied to a failing action before it is marked FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

impl RetryConfig {
    /// Base delay before the `attempt`-th retry (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        self.backoff_seconds * 2f64.powi(attempt.saturating_sub(1) as i32)
    }
}

/// Inline compensation body executed during a rollback sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSpec {
    pub module: String,
    pub action: String,
    #[serde(default = "empty_object")]
    pub params: Value,
}

/// Per-action approval presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ApprovalSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub clarification_options: Vec<String>,
}

/// Perception capture hints around an action. Carried through to modules;
/// the capture pipeline itself lives outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PerceptionSpec {
    #[serde(default)]
    pub capture_before: bool,
    #[serde(default)]
    pub capture_after: bool,
}

/// Memory read/write configuration for an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySpec {
    #[serde(default)]
    pub read_keys: Vec<String>,
    #[serde(default)]
    pub write_key: Option<String>,
}

/// Structured reasoning trace required when `plan_mode = compiled`.
///
/// The trace is never executed. It is stored alongside the plan for audit
/// so the stated reasoning can be cross-checked against the emitted actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompilerTrace {
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub validation: Option<String>,
    #[serde(default)]
    pub generation_approved: bool,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl CompilerTrace {
    /// A trace is usable only when at least one phase carries content and
    /// the generation phase was explicitly approved.
    pub fn is_populated(&self) -> bool {
        let has_phase = [&self.analysis, &self.resolution, &self.validation]
            .iter()
            .any(|p| p.as_deref().is_some_and(|s| !s.trim().is_empty()));
        has_phase && self.generation_approved
    }
}

// ---------------------------------------------------------------------------
// Action and plan
// ---------------------------------------------------------------------------

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_target_node() -> String {
    "local".to_string()
}

/// A single executable action within an IML plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IMLAction {
    /// Unique identifier within the plan.
    pub id: String,
    /// Registered module id (snake_case, e.g. "filesystem").
    pub module: String,
    /// Action name as declared by the module.
    pub action: String,
    /// Action parameters. String values may contain
    /// `{{result.<id>.<path>}}`, `{{memory.<key>}}` or `{{env.<VAR>}}`
    /// template expressions, resolved immediately before dispatch.
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Action ids that must reach COMPLETED before this action runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Node addressing string. Only "local" is executable on this host.
    #[serde(default = "default_target_node")]
    pub target_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perception: Option<PerceptionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSpec>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl IMLAction {
    /// `module.action` key used for permission patterns and rate limiting.
    pub fn dispatch_key(&self) -> String {
        format!("{}.{}", self.module, self.action)
    }
}

/// Non-functional metadata attached to a plan for tracing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanMetadata {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// A complete IML plan - the top-level unit submitted to the daemon.
/// Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IMLPlan {
    #[serde(default = "new_plan_id")]
    pub plan_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    pub description: String,
    #[serde(default)]
    pub plan_mode: PlanMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Run the rollback sweep over COMPLETED actions when the plan fails.
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_trace: Option<CompilerTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PlanMetadata>,
    pub actions: Vec<IMLAction>,
}

fn new_plan_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl IMLPlan {
    pub fn get_action(&self, action_id: &str) -> Option<&IMLAction> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    /// Action ids in declaration order.
    pub fn action_ids(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.id.clone()).collect()
    }
}

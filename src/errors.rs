//! Crate-wide error type.
//!
//! Every fallible public API in the daemon returns `Result<T, BridgeError>`.
//! The variants map one-to-one onto the structured error kinds surfaced to
//! the SDK: no error crosses the HTTP boundary untyped, and nothing ever
//! carries a backtrace into model-bound output.

use thiserror::Error;

use crate::security::RejectionDetails;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed JSON or a type/shape mismatch while parsing a plan.
    #[error("schema error: {0}")]
    Schema(String),

    /// Semantic violations found by the plan validator. All violations are
    /// collected, not just the first.
    #[error("plan validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A pre-execution gate (scanner pipeline, intent verifier, permission
    /// guard or rate limiter) refused the plan before any action ran.
    #[error("plan rejected by {}: {}", .0.source, .0.verdict)]
    Rejected(Box<RejectionDetails>),

    #[error("permission denied: {module}.{action} is not allowed by profile '{profile}'")]
    PermissionDenied {
        module: String,
        action: String,
        profile: String,
    },

    /// Raised internally by the permission guard when an action must pause
    /// for an approval decision. Never surfaced to the caller directly.
    #[error("action '{action_id}' requires approval")]
    ApprovalRequired { plan_id: String, action_id: String },

    #[error("template '{expr}' could not be resolved: {reason}")]
    TemplateResolution { expr: String, reason: String },

    /// Error returned by a module handler, after retries were exhausted.
    #[error("module error: {0}")]
    Module(String),

    #[error("unknown action '{1}' on module '{0}'")]
    UnknownAction(String, String),

    #[error("action '{0}' timed out after {1}s")]
    Timeout(String, u64),

    #[error("cancelled")]
    Cancelled,

    #[error("rate limit exceeded for '{key}': max {limit} per {window}")]
    RateLimited {
        key: String,
        limit: u32,
        window: String,
    },

    #[error("state store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable kind for API responses and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Schema(_) => "schema_error",
            BridgeError::Validation(_) => "validation_error",
            BridgeError::Rejected(_) => "security_rejection",
            BridgeError::PermissionDenied { .. } => "permission_denied",
            BridgeError::ApprovalRequired { .. } => "approval_required",
            BridgeError::TemplateResolution { .. } => "template_resolution_error",
            BridgeError::Module(_) => "module_error",
            BridgeError::UnknownAction(_, _) => "unknown_action",
            BridgeError::Timeout(_, _) => "timeout",
            BridgeError::Cancelled => "cancelled",
            BridgeError::RateLimited { .. } => "rate_limited",
            BridgeError::Store(_) => "store_error",
            BridgeError::Config(_) => "config_error",
            BridgeError::Internal(_) => "internal_error",
        }
    }

    /// Concrete follow-up suggestions the SDK can show to the LLM.
    pub fn recommendations(&self) -> Vec<String> {
        match self {
            BridgeError::Validation(violations) => violations
                .iter()
                .map(|v| format!("Fix and resubmit: {}", v))
                .collect(),
            BridgeError::PermissionDenied {
                module, action, ..
            } => vec![format!(
                "'{}.{}' is outside the active profile; use an allowed action or request a profile change",
                module, action
            )],
            BridgeError::TemplateResolution { expr, .. } => vec![format!(
                "Check that the action referenced by '{}' is listed in depends_on and produces that field",
                expr
            )],
            BridgeError::RateLimited { key, .. } => {
                vec![format!("Wait before calling '{}' again", key)]
            }
            BridgeError::Timeout(action_id, _) => vec![format!(
                "Retry '{}' with a smaller payload or split the work",
                action_id
            )],
            _ => Vec::new(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

//! Approval gate - coordinates human decisions between the executor (which
//! waits) and the API layer (which signals).
//!
//! Each outstanding approval is keyed by `(plan_id, action_id)` and backed
//! by a oneshot channel: the executor parks on the receiver while other
//! ready actions keep running; `POST /plans/:id/actions/:aid/approve`
//! resolves the sender. A decision of `approve_always` additionally
//! whitelists the `module.action` pair for the rest of the session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// A caller's reply to an approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    ApproveAlways,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Approve with replacement params.
    ApproveWithChanges { params: Value },
    /// Select one of the offered clarification options.
    Choose { option_index: usize },
    /// Postpone; the executor keeps waiting with a fresh timeout.
    Defer,
}

/// What a timed-out approval resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    #[default]
    Reject,
    Skip,
}

/// The executor-facing outcome of one approval round.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved {
        params: Option<Value>,
        chosen_option: Option<String>,
        always: bool,
    },
    Rejected {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub plan_id: String,
    pub action_id: String,
    pub module: String,
    pub action: String,
    pub params: Value,
    pub prompt: String,
    pub clarification_options: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

struct Entry {
    request: PendingApproval,
    sender: oneshot::Sender<ApprovalDecision>,
}

pub struct ApprovalGate {
    pending: Mutex<HashMap<(String, String), Entry>>,
    auto_approved: Mutex<std::collections::HashSet<String>>,
    default_timeout: Duration,
    timeout_behavior: TimeoutBehavior,
}

impl ApprovalGate {
    pub fn new(default_timeout: Duration, timeout_behavior: TimeoutBehavior) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            auto_approved: Mutex::new(std::collections::HashSet::new()),
            default_timeout,
            timeout_behavior,
        }
    }

    /// Park until a decision arrives or the timeout expires. `Defer` re-arms
    /// the wait with a fresh timeout instead of resolving.
    pub async fn request_approval(&self, request: PendingApproval) -> ApprovalOutcome {
        let dispatch_key = format!("{}.{}", request.module, request.action);
        if self
            .auto_approved
            .lock()
            .expect("approval gate lock poisoned")
            .contains(&dispatch_key)
        {
            log::info!(
                "[ApprovalGate] {}:{} auto-approved from a prior approve_always",
                request.plan_id,
                request.action_id
            );
            return ApprovalOutcome::Approved {
                params: None,
                chosen_option: None,
                always: true,
            };
        }

        loop {
            let key = (request.plan_id.clone(), request.action_id.clone());
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .expect("approval gate lock poisoned")
                .insert(
                    key.clone(),
                    Entry {
                        request: request.clone(),
                        sender: tx,
                    },
                );

            let decision = tokio::time::timeout(self.default_timeout, rx).await;
            self.pending
                .lock()
                .expect("approval gate lock poisoned")
                .remove(&key);

            let decision = match decision {
                Ok(Ok(decision)) => decision,
                // Timed out, or the sender was dropped without a decision.
                _ => {
                    let reason =
                        format!("approval timed out after {:?}", self.default_timeout);
                    return match self.timeout_behavior {
                        TimeoutBehavior::Reject => ApprovalOutcome::Rejected { reason },
                        TimeoutBehavior::Skip => ApprovalOutcome::Skipped { reason },
                    };
                }
            };

            match decision {
                ApprovalDecision::Approve => {
                    return ApprovalOutcome::Approved {
                        params: None,
                        chosen_option: None,
                        always: false,
                    }
                }
                ApprovalDecision::ApproveAlways => {
                    self.auto_approved
                        .lock()
                        .expect("approval gate lock poisoned")
                        .insert(dispatch_key.clone());
                    return ApprovalOutcome::Approved {
                        params: None,
                        chosen_option: None,
                        always: true,
                    };
                }
                ApprovalDecision::ApproveWithChanges { params } => {
                    return ApprovalOutcome::Approved {
                        params: Some(params),
                        chosen_option: None,
                        always: false,
                    }
                }
                ApprovalDecision::Choose { option_index } => {
                    let chosen = request
                        .clarification_options
                        .get(option_index)
                        .cloned();
                    return match chosen {
                        Some(option) => ApprovalOutcome::Approved {
                            params: None,
                            chosen_option: Some(option),
                            always: false,
                        },
                        None => ApprovalOutcome::Rejected {
                            reason: format!(
                                "clarification option {} does not exist",
                                option_index
                            ),
                        },
                    };
                }
                ApprovalDecision::Reject { reason } => {
                    return ApprovalOutcome::Rejected {
                        reason: reason.unwrap_or_else(|| "rejected by approver".to_string()),
                    }
                }
                ApprovalDecision::Defer => {
                    log::info!(
                        "[ApprovalGate] {}:{} deferred, re-arming",
                        request.plan_id,
                        request.action_id
                    );
                    continue;
                }
            }
        }
    }

    /// Resolve a pending approval. Returns false when nothing is waiting
    /// under that key.
    pub fn submit_decision(
        &self,
        plan_id: &str,
        action_id: &str,
        decision: ApprovalDecision,
    ) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("approval gate lock poisoned")
            .remove(&(plan_id.to_string(), action_id.to_string()));
        match entry {
            Some(entry) => entry.sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn pending_requests(&self, plan_id: Option<&str>) -> Vec<PendingApproval> {
        let pending = self.pending.lock().expect("approval gate lock poisoned");
        pending
            .values()
            .filter(|e| plan_id.is_none_or(|p| e.request.plan_id == p))
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("approval gate lock poisoned")
            .len()
    }
}

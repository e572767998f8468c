//! Plan executor - drives a validated plan through admission, wave-based
//! execution, retry, cascade failure, approval gating, rollback and
//! cancellation.
//!
//! Lifecycle of one action:
//!
//! ```text
//! PENDING -> WAITING      scheduler accepted it into the current wave
//! WAITING -> RUNNING      permission + templates resolved, module slot held
//! RUNNING -> COMPLETED    module success
//! RUNNING -> FAILED       module error after retries exhausted
//! *       -> SKIPPED      cascade policy, approval skip, or cancellation
//! COMPLETED -> ROLLED_BACK  rollback sweep after plan failure
//! ```
//!
//! Admission outcomes (scanner pipeline, intent verifier, permission guard,
//! rate limiter) are decided before a worker slot is consumed; a rejected
//! plan persists status REJECTED with its rejection details and no action
//! ever reaches RUNNING.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::{BridgeError, BridgeResult};
use crate::events::{
    EventBus, SessionContextPropagator, UniversalEvent, TOPIC_ACTIONS, TOPIC_PLANS,
    TOPIC_SECURITY,
};
use crate::memory::KeyValueStore;
use crate::modules::ModuleRegistry;
use crate::orchestration::approval::{ApprovalGate, ApprovalOutcome, PendingApproval};
use crate::orchestration::dag::DagScheduler;
use crate::orchestration::resources::ResourceManager;
use crate::orchestration::rollback::RollbackEngine;
use crate::protocol::models::{
    ActionStatus, IMLAction, IMLPlan, OnFailure, PlanStatus, RetryConfig,
};
use crate::protocol::template::TemplateResolver;
use crate::protocol::validator;
use crate::security::guard::PermissionGuard;
use crate::security::rate_limiter::ActionRateLimiter;
use crate::security::sanitizer::OutputSanitizer;
use crate::security::scanners::SecurityPipeline;
use crate::security::verifier::IntentVerifier;
use crate::security::{RejectionDetails, RejectionSource};
use crate::store::{ActionRecord, ExecutionState, PlanStateStore};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_concurrent_plans: usize,
    pub action_timeout: Duration,
    pub strict_memory: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_plans: 5,
            action_timeout: Duration::from_secs(300),
            strict_memory: false,
        }
    }
}

/// Terminal notification published for every finished plan.
#[derive(Debug, Clone)]
pub struct PlanCompletion {
    pub plan_id: String,
    pub status: PlanStatus,
}

/// Everything the executor composes over. Kept as a parts struct so wiring
/// stays readable at the call sites.
pub struct ExecutorParts {
    pub registry: Arc<ModuleRegistry>,
    pub guard: Arc<PermissionGuard>,
    pub store: Arc<PlanStateStore>,
    pub pipeline: Option<Arc<SecurityPipeline>>,
    pub verifier: Option<Arc<IntentVerifier>>,
    pub sanitizer: Arc<OutputSanitizer>,
    pub approvals: Arc<ApprovalGate>,
    pub memory: Arc<KeyValueStore>,
    pub resources: Arc<ResourceManager>,
    pub limiter: Arc<ActionRateLimiter>,
    pub bus: Arc<dyn EventBus>,
    pub propagator: Arc<SessionContextPropagator>,
}

pub struct PlanExecutor {
    registry: Arc<ModuleRegistry>,
    guard: Arc<PermissionGuard>,
    store: Arc<PlanStateStore>,
    pipeline: Option<Arc<SecurityPipeline>>,
    verifier: Option<Arc<IntentVerifier>>,
    sanitizer: Arc<OutputSanitizer>,
    approvals: Arc<ApprovalGate>,
    memory: Arc<KeyValueStore>,
    resources: Arc<ResourceManager>,
    limiter: Arc<ActionRateLimiter>,
    bus: Arc<dyn EventBus>,
    propagator: Arc<SessionContextPropagator>,
    rollback: RollbackEngine,
    plan_slots: Arc<Semaphore>,
    running: Mutex<HashMap<String, CancellationToken>>,
    completions: broadcast::Sender<PlanCompletion>,
    settings: ExecutorSettings,
}

impl PlanExecutor {
    pub fn new(parts: ExecutorParts, settings: ExecutorSettings) -> Arc<Self> {
        let (completions, _) = broadcast::channel(256);
        Arc::new(Self {
            rollback: RollbackEngine::new(parts.registry.clone()),
            registry: parts.registry,
            guard: parts.guard,
            store: parts.store,
            pipeline: parts.pipeline,
            verifier: parts.verifier,
            sanitizer: parts.sanitizer,
            approvals: parts.approvals,
            memory: parts.memory,
            resources: parts.resources,
            limiter: parts.limiter,
            bus: parts.bus,
            propagator: parts.propagator,
            plan_slots: Arc::new(Semaphore::new(settings.max_concurrent_plans.max(1))),
            running: Mutex::new(HashMap::new()),
            completions,
            settings,
        })
    }

    pub fn approvals(&self) -> Arc<ApprovalGate> {
        self.approvals.clone()
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<PlanCompletion> {
        self.completions.subscribe()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Fire-and-forget submission: run the plan as a background task and
    /// return its id immediately.
    pub fn submit(self: &Arc<Self>, plan: IMLPlan) -> String {
        let plan_id = plan.plan_id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(plan).await {
                log::error!("[Executor] background plan failed at admission: {}", e);
            }
        });
        plan_id
    }

    /// Cancel a plan by id. RUNNING actions are signalled; WAITING actions
    /// become SKIPPED; the plan persists as CANCELLED.
    pub fn cancel(&self, plan_id: &str) -> bool {
        let running = self.running.lock().expect("running map poisoned");
        match running.get(plan_id) {
            Some(token) => {
                log::info!("[Executor] cancelling plan {}", plan_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, plan_id: &str) -> bool {
        self.running
            .lock()
            .expect("running map poisoned")
            .contains_key(plan_id)
    }

    /// Execute a plan to completion and return its final state.
    ///
    /// Validation errors return `Err` synchronously; admission rejections
    /// return `Ok` with status REJECTED and populated rejection details.
    pub async fn run(self: &Arc<Self>, plan: IMLPlan) -> BridgeResult<ExecutionState> {
        validator::validate(&plan)?;

        let plan_id = plan.plan_id.clone();
        let session_id = self.session_for(&plan);
        let mut state = ExecutionState::from_plan(&plan);
        self.store.create(&state)?;
        self.emit_plan_event("plan.submitted", &plan, json!({})).await;

        // Admission gates run before a worker slot is consumed.
        if let Some(details) = self.admission(&plan, &session_id).await {
            log::warn!(
                "[Executor] plan {} rejected by {} before execution",
                plan_id,
                details.source
            );
            self.store.set_rejection(&plan_id, &details)?;
            state.status = PlanStatus::Rejected;
            state.rejection_details = Some(details.clone());
            self.emit_plan_event(
                "plan.rejected",
                &plan,
                json!({"source": details.source.to_string(), "risk_score": details.risk_score}),
            )
            .await;
            self.finish(&plan_id, PlanStatus::Rejected);
            return Ok(state);
        }

        let _slot = self
            .plan_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::Internal("executor slot pool closed".to_string()))?;

        let token = CancellationToken::new();
        self.running
            .lock()
            .expect("running map poisoned")
            .insert(plan_id.clone(), token.clone());

        self.store.update_plan_status(&plan_id, PlanStatus::Running)?;
        self.emit_plan_event("plan.started", &plan, json!({})).await;

        let shared = Arc::new(AsyncMutex::new(state));
        let results: Arc<AsyncMutex<HashMap<String, Value>>> =
            Arc::new(AsyncMutex::new(HashMap::new()));

        let final_status = self
            .execute_body(&plan, &session_id, &shared, &results, &token)
            .await;

        self.store.update_plan_status(&plan_id, final_status)?;
        let mut state = {
            let mut guard = shared.lock().await;
            guard.status = final_status;
            guard.updated_at = Utc::now();
            guard.clone()
        };
        // A rate-limit trip surfaces as plan-level rejection details.
        if let Some(details) = state.rejection_details.clone() {
            self.store.set_rejection_details(&plan_id, &details)?;
        }

        let event_type = match final_status {
            PlanStatus::Succeeded => "plan.completed",
            PlanStatus::Cancelled => "plan.cancelled",
            _ => "plan.failed",
        };
        self.emit_plan_event(event_type, &plan, json!({"status": final_status.as_str()}))
            .await;
        log::info!(
            "[Executor] plan {} finished with status {}",
            plan_id,
            final_status.as_str()
        );

        self.running
            .lock()
            .expect("running map poisoned")
            .remove(&plan_id);
        self.finish(&plan_id, final_status);
        state.status = final_status;
        Ok(state)
    }

    fn finish(&self, plan_id: &str, status: PlanStatus) {
        self.propagator.unbind(plan_id);
        let _ = self.completions.send(PlanCompletion {
            plan_id: plan_id.to_string(),
            status,
        });
    }

    fn session_for(&self, plan: &IMLPlan) -> String {
        plan.session_id
            .clone()
            .unwrap_or_else(|| plan.plan_id.clone())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    async fn admission(&self, plan: &IMLPlan, session_id: &str) -> Option<RejectionDetails> {
        if let Some(pipeline) = &self.pipeline {
            let result = pipeline.scan_plan(plan).await;
            if !result.allowed {
                return Some(result.rejection_details());
            }
        }

        if let Some(verifier) = &self.verifier {
            let verdict = verifier.verify_plan(plan).await;
            if !verdict.is_safe() {
                return Some(verdict.rejection_details());
            }
        }

        if let Err(e) = self.guard.check_plan(plan) {
            let mut details =
                RejectionDetails::new(RejectionSource::PermissionGuard, "reject", 1.0);
            details.recommendations = e.recommendations();
            details.threat_types = vec!["permission_denied".to_string()];
            return Some(details);
        }

        for action in &plan.actions {
            if !self.limiter.check(session_id, &action.dispatch_key()) {
                let mut details =
                    RejectionDetails::new(RejectionSource::RateLimiter, "reject", 1.0);
                details.recommendations =
                    vec![format!("wait before calling '{}' again", action.dispatch_key())];
                return Some(details);
            }
        }

        None
    }

    // ------------------------------------------------------------------
    // Wave loop
    // ------------------------------------------------------------------

    async fn execute_body(
        self: &Arc<Self>,
        plan: &IMLPlan,
        session_id: &str,
        state: &Arc<AsyncMutex<ExecutionState>>,
        results: &Arc<AsyncMutex<HashMap<String, Value>>>,
        token: &CancellationToken,
    ) -> PlanStatus {
        let scheduler = DagScheduler::new(plan);
        let waves = match scheduler.waves() {
            Ok(waves) => waves,
            Err(e) => {
                log::error!("[Executor] wave construction failed: {}", e);
                return PlanStatus::Failed;
            }
        };

        let mut cascade_skipped: HashSet<String> = HashSet::new();
        let mut aborted = false;

        for wave in &waves {
            if token.is_cancelled() {
                break;
            }

            let mut runnable: Vec<&IMLAction> = Vec::new();
            for action_id in &wave.action_ids {
                if cascade_skipped.contains(action_id) {
                    self.skip_action(plan, action_id, state, "dependency failed")
                        .await;
                } else if let Some(action) = plan.get_action(action_id) {
                    self.update_record(plan, action_id, state, |r| {
                        r.state = ActionStatus::Waiting;
                    })
                    .await;
                    runnable.push(action);
                }
            }

            let tasks: Vec<_> = runnable
                .into_iter()
                .map(|action| self.run_action(plan, action, session_id, state, results, token))
                .collect();
            futures::future::join_all(tasks).await;

            // Cascade: a FAILED action with abort policy skips its
            // transitive descendants and ends the plan.
            for action in &plan.actions {
                let failed = {
                    let guard = state.lock().await;
                    guard
                        .action(&action.id)
                        .map(|r| r.state == ActionStatus::Failed)
                        .unwrap_or(false)
                };
                if failed && action.on_failure == OnFailure::Abort {
                    let new_skips: Vec<String> = scheduler
                        .descendants(&action.id)
                        .into_iter()
                        .filter(|id| !cascade_skipped.contains(id))
                        .collect();
                    if !new_skips.is_empty() {
                        log::warn!(
                            "[Executor] cascading {} skips from failed action {}",
                            new_skips.len(),
                            action.id
                        );
                    }
                    cascade_skipped.extend(new_skips);
                    aborted = true;
                }
            }

            if aborted {
                break;
            }
        }

        if token.is_cancelled() {
            self.skip_non_terminal(plan, state, "plan cancelled").await;
            return PlanStatus::Cancelled;
        }

        if aborted {
            self.skip_non_terminal(plan, state, "plan aborted after failure")
                .await;
        }

        let (clean, _failed) = {
            let guard = state.lock().await;
            (guard.all_settled_clean(), guard.any_failed())
        };
        let final_status = if clean {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        };

        if final_status == PlanStatus::Failed && plan.rollback_on_failure {
            self.rollback_sweep(plan, &scheduler, state, results, token)
                .await;
        }

        final_status
    }

    // ------------------------------------------------------------------
    // Single action
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        self: &Arc<Self>,
        plan: &IMLPlan,
        action: &IMLAction,
        session_id: &str,
        state: &Arc<AsyncMutex<ExecutionState>>,
        results: &Arc<AsyncMutex<HashMap<String, Value>>>,
        token: &CancellationToken,
    ) {
        if action.target_node != "local" {
            self.fail_action(
                plan,
                &action.id,
                state,
                &format!("target_node '{}' is not executable on this host", action.target_node),
            )
            .await;
            return;
        }

        // Memory context for {{memory.*}} references.
        let memory_context = match &action.memory {
            Some(spec) if !spec.read_keys.is_empty() => {
                self.memory
                    .get_many(&spec.read_keys, Some(session_id))
                    .await
            }
            _ => HashMap::new(),
        };

        // Late-bind templates against completed predecessors.
        let results_snapshot = results.lock().await.clone();
        let resolver = TemplateResolver::new(&results_snapshot, memory_context)
            .with_env_access(self.guard.allow_env_templates())
            .with_strict_memory(self.settings.strict_memory);
        let mut resolved_params = match resolver.resolve(&action.params) {
            Ok(params) => params,
            Err(e) => {
                self.fail_action(plan, &action.id, state, &e.to_string()).await;
                return;
            }
        };

        // Permission re-check at dispatch time; the approval gate wins.
        match self.guard.check_action(action, &plan.plan_id) {
            Ok(()) => {}
            Err(BridgeError::ApprovalRequired { .. }) => {
                match self
                    .gate_on_approval(plan, action, state, resolved_params.clone(), token)
                    .await
                {
                    Some(params) => resolved_params = params,
                    None => return,
                }
            }
            Err(e) => {
                self.fail_action(plan, &action.id, state, &e.to_string()).await;
                return;
            }
        }

        // Resolved values may point at new paths; re-run the sandbox check.
        if let Err(e) =
            self.guard
                .check_sandbox_params(&action.module, &action.action, &resolved_params)
        {
            self.fail_action(plan, &action.id, state, &e.to_string()).await;
            return;
        }

        // Per-(identity, action) rate limiting.
        if let Err(e) = self
            .limiter
            .check_and_record(session_id, &action.dispatch_key())
        {
            let mut details =
                RejectionDetails::new(RejectionSource::RateLimiter, "reject", 1.0);
            details.recommendations = e.recommendations();
            state.lock().await.rejection_details = Some(details);
            self.fail_action(plan, &action.id, state, &e.to_string()).await;
            return;
        }

        // Module slot; held across retries so the action stays RUNNING.
        let _permit = self.resources.acquire(&action.module).await;
        if token.is_cancelled() {
            self.skip_action(plan, &action.id, state, "plan cancelled").await;
            return;
        }

        let retry = action.retry.clone().unwrap_or(RetryConfig {
            max_attempts: 1,
            backoff_seconds: 1.0,
        });

        self.update_record(plan, &action.id, state, |r| {
            r.state = ActionStatus::Running;
            r.started_at = Some(Utc::now());
        })
        .await;
        self.emit_action_event("action.started", plan, action, json!({})).await;

        for attempt in 1..=retry.max_attempts {
            self.update_record(plan, &action.id, state, |r| {
                r.attempt = attempt;
            })
            .await;

            let dispatch = self.registry.dispatch(
                &action.module,
                &action.action,
                resolved_params.clone(),
                token.child_token(),
            );
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(BridgeError::Cancelled),
                result = tokio::time::timeout(self.settings.action_timeout, dispatch) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(BridgeError::Timeout(
                            action.id.clone(),
                            self.settings.action_timeout.as_secs(),
                        )),
                    }
                }
            };

            match outcome {
                Ok(raw) => {
                    let clean =
                        self.sanitizer
                            .sanitize(&raw, &action.module, &action.action);
                    results.lock().await.insert(action.id.clone(), clean.clone());

                    if let Some(spec) = &action.memory {
                        if let Some(write_key) = &spec.write_key {
                            self.memory
                                .set(write_key, clean.clone(), Some(session_id))
                                .await;
                        }
                    }

                    self.update_record(plan, &action.id, state, |r| {
                        r.state = ActionStatus::Completed;
                        r.ended_at = Some(Utc::now());
                        r.result = Some(clean.clone());
                        r.error = None;
                    })
                    .await;
                    self.emit_action_event("action.completed", plan, action, json!({"attempt": attempt}))
                        .await;
                    return;
                }
                Err(BridgeError::Cancelled) => {
                    self.skip_action(plan, &action.id, state, "cancelled while running")
                        .await;
                    return;
                }
                Err(e) if attempt < retry.max_attempts => {
                    let delay = jittered(retry.delay_for_attempt(attempt));
                    log::warn!(
                        "[Executor] action {} attempt {}/{} failed ({}), retrying in {:.2}s",
                        action.id,
                        attempt,
                        retry.max_attempts,
                        e,
                        delay
                    );
                    self.emit_action_event(
                        "action.retrying",
                        plan,
                        action,
                        json!({"attempt": attempt, "delay_seconds": delay}),
                    )
                    .await;
                    // Cancellation interrupts the backoff sleep, not a call
                    // already in flight.
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.skip_action(plan, &action.id, state, "cancelled during backoff")
                                .await;
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                    }
                }
                Err(e) => {
                    self.fail_action(plan, &action.id, state, &e.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Park the action on the approval gate. Returns the (possibly
    /// replaced) params on approval, or None when the action was resolved
    /// as rejected/skipped.
    async fn gate_on_approval(
        self: &Arc<Self>,
        plan: &IMLPlan,
        action: &IMLAction,
        state: &Arc<AsyncMutex<ExecutionState>>,
        resolved_params: Value,
        token: &CancellationToken,
    ) -> Option<Value> {
        let spec = action.approval.clone().unwrap_or_default();
        let request = PendingApproval {
            plan_id: plan.plan_id.clone(),
            action_id: action.id.clone(),
            module: action.module.clone(),
            action: action.action.clone(),
            params: resolved_params.clone(),
            prompt: if spec.prompt.is_empty() {
                format!("Execute {}.{}", action.module, action.action)
            } else {
                spec.prompt.clone()
            },
            clarification_options: spec.clarification_options.clone(),
            requested_at: Utc::now(),
        };

        self.emit_security_event(
            "approval.requested",
            plan,
            json!({"action_id": action.id, "module": action.module, "action": action.action}),
        )
        .await;
        log::info!(
            "[Executor] action {}:{} awaiting approval",
            plan.plan_id,
            action.id
        );

        // A cancelled plan stops waiting; the action was still WAITING and
        // becomes SKIPPED.
        let outcome = tokio::select! {
            _ = token.cancelled() => {
                self.skip_action(plan, &action.id, state, "plan cancelled").await;
                return None;
            }
            outcome = self.approvals.request_approval(request) => outcome,
        };
        match outcome {
            ApprovalOutcome::Approved {
                params,
                chosen_option,
                always,
            } => {
                self.update_record(plan, &action.id, state, |r| {
                    r.approval = Some(json!({
                        "decision": if always { "approve_always" } else { "approve" },
                        "chosen_option": chosen_option,
                        "modified": params.is_some(),
                        "decided_at": Utc::now().to_rfc3339(),
                    }));
                })
                .await;
                self.emit_security_event(
                    "approval.granted",
                    plan,
                    json!({"action_id": action.id}),
                )
                .await;
                Some(params.unwrap_or(resolved_params))
            }
            ApprovalOutcome::Rejected { reason } => {
                self.update_record(plan, &action.id, state, |r| {
                    r.approval = Some(json!({"decision": "reject", "reason": reason}));
                })
                .await;
                self.emit_security_event(
                    "approval.rejected",
                    plan,
                    json!({"action_id": action.id, "reason": reason}),
                )
                .await;
                self.fail_action(
                    plan,
                    &action.id,
                    state,
                    &format!("approval rejected: {}", reason),
                )
                .await;
                None
            }
            ApprovalOutcome::Skipped { reason } => {
                self.update_record(plan, &action.id, state, |r| {
                    r.approval = Some(json!({"decision": "skip", "reason": reason}));
                })
                .await;
                self.skip_action(plan, &action.id, state, &reason).await;
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Rollback sweep
    // ------------------------------------------------------------------

    async fn rollback_sweep(
        self: &Arc<Self>,
        plan: &IMLPlan,
        scheduler: &DagScheduler,
        state: &Arc<AsyncMutex<ExecutionState>>,
        results: &Arc<AsyncMutex<HashMap<String, Value>>>,
        token: &CancellationToken,
    ) {
        let order = match scheduler.reverse_topological_order() {
            Ok(order) => order,
            Err(_) => return,
        };
        let snapshot = results.lock().await.clone();

        for action_id in order {
            let Some(action) = plan.get_action(&action_id) else {
                continue;
            };
            let Some(spec) = &action.rollback else {
                continue;
            };
            let completed = {
                let guard = state.lock().await;
                guard
                    .action(&action_id)
                    .map(|r| r.state == ActionStatus::Completed)
                    .unwrap_or(false)
            };
            if !completed {
                continue;
            }

            match self
                .rollback
                .run_compensation(spec, &snapshot, token.child_token())
                .await
            {
                Ok(_) => {
                    self.update_record(plan, &action_id, state, |r| {
                        r.state = ActionStatus::RolledBack;
                        r.ended_at = Some(Utc::now());
                    })
                    .await;
                    self.emit_action_event("action.rolled_back", plan, action, json!({}))
                        .await;
                }
                Err(e) => {
                    // Recorded, never retried, never recursive.
                    log::error!(
                        "[Executor] rollback of {} failed: {}",
                        action_id,
                        e
                    );
                    self.update_record(plan, &action_id, state, |r| {
                        r.error = Some(format!("rollback failed: {}", e));
                    })
                    .await;
                    self.emit_action_event(
                        "action.rollback_failed",
                        plan,
                        action,
                        json!({"error": e.to_string()}),
                    )
                    .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Record helpers
    // ------------------------------------------------------------------

    async fn update_record<F>(
        &self,
        plan: &IMLPlan,
        action_id: &str,
        state: &Arc<AsyncMutex<ExecutionState>>,
        mutate: F,
    ) where
        F: FnOnce(&mut ActionRecord),
    {
        let record = {
            let mut guard = state.lock().await;
            guard.updated_at = Utc::now();
            match guard.actions.get_mut(action_id) {
                Some(record) => {
                    mutate(record);
                    record.clone()
                }
                None => return,
            }
        };
        if let Err(e) = self.store.update_action(&plan.plan_id, &record) {
            log::error!("[Executor] persisting action {} failed: {}", action_id, e);
        }
    }

    async fn fail_action(
        &self,
        plan: &IMLPlan,
        action_id: &str,
        state: &Arc<AsyncMutex<ExecutionState>>,
        error: &str,
    ) {
        log::error!("[Executor] action {}:{} failed: {}", plan.plan_id, action_id, error);
        self.update_record(plan, action_id, state, |r| {
            r.state = ActionStatus::Failed;
            r.error = Some(error.to_string());
            r.ended_at = Some(Utc::now());
        })
        .await;
        if let Some(action) = plan.get_action(action_id) {
            self.emit_action_event("action.failed", plan, action, json!({"error": error}))
                .await;
        }
    }

    async fn skip_action(
        &self,
        plan: &IMLPlan,
        action_id: &str,
        state: &Arc<AsyncMutex<ExecutionState>>,
        reason: &str,
    ) {
        let already_terminal = {
            let guard = state.lock().await;
            guard
                .action(action_id)
                .map(|r| r.state.is_terminal())
                .unwrap_or(true)
        };
        if already_terminal {
            return;
        }
        self.update_record(plan, action_id, state, |r| {
            r.state = ActionStatus::Skipped;
            r.error = Some(reason.to_string());
            r.ended_at = Some(Utc::now());
        })
        .await;
        if let Some(action) = plan.get_action(action_id) {
            self.emit_action_event("action.skipped", plan, action, json!({"reason": reason}))
                .await;
        }
    }

    async fn skip_non_terminal(
        &self,
        plan: &IMLPlan,
        state: &Arc<AsyncMutex<ExecutionState>>,
        reason: &str,
    ) {
        let pending: Vec<String> = {
            let guard = state.lock().await;
            guard
                .actions
                .values()
                .filter(|r| !r.state.is_terminal())
                .map(|r| r.action_id.clone())
                .collect()
        };
        for action_id in pending {
            self.skip_action(plan, &action_id, state, reason).await;
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn emit_plan_event(&self, event_type: &str, plan: &IMLPlan, payload: Value) {
        let mut body = json!({"plan_id": plan.plan_id});
        merge(&mut body, payload);
        let event = UniversalEvent::new(event_type, TOPIC_PLANS, "executor", body)
            .with_session(plan.session_id.clone())
            .with_correlation(plan.correlation_id.clone());
        self.bus.emit(event).await;
    }

    async fn emit_action_event(
        &self,
        event_type: &str,
        plan: &IMLPlan,
        action: &IMLAction,
        payload: Value,
    ) {
        let mut body = json!({
            "plan_id": plan.plan_id,
            "action_id": action.id,
            "module": action.module,
            "action": action.action,
        });
        merge(&mut body, payload);
        let event = UniversalEvent::new(event_type, TOPIC_ACTIONS, "executor", body)
            .with_session(plan.session_id.clone())
            .with_correlation(plan.correlation_id.clone());
        self.bus.emit(event).await;
    }

    async fn emit_security_event(&self, event_type: &str, plan: &IMLPlan, payload: Value) {
        let mut body = json!({"plan_id": plan.plan_id});
        merge(&mut body, payload);
        let event = UniversalEvent::new(event_type, TOPIC_SECURITY, "executor", body)
            .with_session(plan.session_id.clone());
        self.bus.emit(event).await;
    }
}

/// Backoff delay with ±20% jitter.
fn jittered(base: f64) -> f64 {
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    (base * factor).max(0.0)
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (k, v) in extra {
            target.insert(k, v);
        }
    }
}

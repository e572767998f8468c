//! Trigger daemon - lifecycle owner of the reactive subsystem.
//!
//! On start it loads every enabled trigger from the store, arms one watcher
//! per trigger, starts the priority fire scheduler, a health loop (watcher
//! failure detection + expiry purge) and a completion listener that frees
//! scheduler slots and resource locks when triggered plans terminate.
//!
//! The daemon exclusively owns each [`TriggerDefinition`] after
//! registration; watchers are owned by the daemon, never by the definition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::{BridgeError, BridgeResult};
use crate::events::{
    EventBus, SessionContext, SessionContextPropagator, UniversalEvent, EventPriority,
    KEY_TRIGGER_CHAIN_DEPTH, TOPIC_TRIGGERS,
};
use crate::orchestration::executor::PlanExecutor;
use crate::protocol::parser::parse_plan;
use crate::triggers::conflict::{ConflictResolver, QUEUE_WAIT_TIMEOUT};
use crate::triggers::models::{
    ConflictPolicy, TriggerDefinition, TriggerFireEvent, TriggerPriority, TriggerState,
};
use crate::triggers::scheduler::{CancelCallback, EnqueueResult, FireScheduler, SubmitCallback};
use crate::triggers::store::TriggerStore;
use crate::triggers::watchers::{spawn_watcher, FireCallback, SubFire, WatcherHandle};

#[derive(Debug, Clone)]
pub struct TriggerDaemonConfig {
    pub max_concurrent_plans: usize,
    pub max_chain_depth: u32,
    pub health_interval: Duration,
}

impl Default for TriggerDaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_plans: 5,
            max_chain_depth: 5,
            health_interval: Duration::from_secs(30),
        }
    }
}

pub struct TriggerDaemon {
    store: Arc<TriggerStore>,
    executor: Arc<PlanExecutor>,
    bus: Arc<dyn EventBus>,
    propagator: Arc<SessionContextPropagator>,
    config: TriggerDaemonConfig,

    triggers: Mutex<HashMap<String, TriggerDefinition>>,
    watchers: Mutex<HashMap<String, Arc<WatcherHandle>>>,
    conflict: ConflictResolver,
    scheduler: Mutex<Option<Arc<FireScheduler>>>,
    stop: CancellationToken,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl std::fmt::Debug for TriggerDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDaemon").finish_non_exhaustive()
    }
}

impl TriggerDaemon {
    pub fn new(
        store: Arc<TriggerStore>,
        executor: Arc<PlanExecutor>,
        bus: Arc<dyn EventBus>,
        propagator: Arc<SessionContextPropagator>,
        config: TriggerDaemonConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            bus,
            propagator,
            config,
            triggers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            conflict: ConflictResolver::new(),
            scheduler: Mutex::new(None),
            stop: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        {
            let mut started = self.started.lock().expect("daemon started lock poisoned");
            if *started {
                return Ok(());
            }
            *started = true;
        }

        // Scheduler callbacks close over the daemon.
        let submit_daemon = self.clone();
        let submit: SubmitCallback = Arc::new(move |trigger, fire| {
            let daemon = submit_daemon.clone();
            Box::pin(async move { daemon.submit_for_trigger(trigger, fire).await })
        });
        let cancel_executor = self.executor.clone();
        let cancel: CancelCallback = Arc::new(move |plan_id| {
            let executor = cancel_executor.clone();
            Box::pin(async move {
                executor.cancel(&plan_id);
            })
        });
        let scheduler = Arc::new(FireScheduler::new(
            submit,
            cancel,
            self.config.max_concurrent_plans,
        ));
        scheduler.start();
        *self.scheduler.lock().expect("scheduler slot poisoned") = Some(scheduler.clone());

        // Re-arm persisted triggers.
        let enabled = self.store.load_enabled()?;
        let count = enabled.len();
        for mut trigger in enabled {
            if matches!(
                trigger.state,
                TriggerState::Registered | TriggerState::Fired | TriggerState::Throttled
            ) {
                trigger.state = TriggerState::Active;
                self.store.update_state(&trigger.trigger_id, TriggerState::Active)?;
            }
            let id = trigger.trigger_id.clone();
            self.triggers
                .lock()
                .expect("trigger cache poisoned")
                .insert(id.clone(), trigger);
            if self.cached(&id).map(|t| t.state) == Some(TriggerState::Active)
                || self.cached(&id).map(|t| t.state) == Some(TriggerState::Watching)
            {
                self.arm(&id).await;
            }
        }

        // Health loop: watcher failures and expiry purge.
        let health_daemon = self.clone();
        let health = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_daemon.stop.cancelled() => return,
                    _ = tokio::time::sleep(health_daemon.config.health_interval) => {}
                }
                health_daemon.check_health().await;
                health_daemon.purge_expired().await;
            }
        });

        // Completion listener frees scheduler slots and resource locks.
        let completion_daemon = self.clone();
        let mut completions = self.executor.subscribe_completions();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = completion_daemon.stop.cancelled() => return,
                    received = completions.recv() => match received {
                        Ok(completion) => {
                            completion_daemon.conflict.release_all_for(&completion.plan_id);
                            if let Some(scheduler) = completion_daemon.current_scheduler() {
                                scheduler.on_plan_completed(&completion.plan_id);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("[TriggerDaemon] completion stream lagged by {}", skipped);
                        }
                        Err(_) => return,
                    }
                }
            }
        });

        self.background
            .lock()
            .expect("background tasks poisoned")
            .extend([health, listener]);

        log::info!("[TriggerDaemon] started with {} trigger(s)", count);
        Ok(())
    }

    pub async fn shutdown(&self) {
        {
            let mut started = self.started.lock().expect("daemon started lock poisoned");
            if !*started {
                return;
            }
            *started = false;
        }
        self.stop.cancel();

        let tasks: Vec<_> = self
            .background
            .lock()
            .expect("background tasks poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        let handles: Vec<Arc<WatcherHandle>> = self
            .watchers
            .lock()
            .expect("watcher map poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.stop().await;
        }

        let scheduler = self
            .scheduler
            .lock()
            .expect("scheduler slot poisoned")
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
        log::info!("[TriggerDaemon] stopped");
    }

    fn current_scheduler(&self) -> Option<Arc<FireScheduler>> {
        self.scheduler
            .lock()
            .expect("scheduler slot poisoned")
            .clone()
    }

    fn cached(&self, trigger_id: &str) -> Option<TriggerDefinition> {
        self.triggers
            .lock()
            .expect("trigger cache poisoned")
            .get(trigger_id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Registration API
    // ------------------------------------------------------------------

    /// Register a trigger (armed immediately when enabled). Fails when the
    /// chain depth exceeds the definition's or the daemon's cap.
    pub async fn register(
        self: &Arc<Self>,
        mut trigger: TriggerDefinition,
    ) -> BridgeResult<TriggerDefinition> {
        let cap = trigger.max_chain_depth.min(self.config.max_chain_depth);
        if trigger.chain_depth > cap {
            return Err(BridgeError::Validation(vec![format!(
                "trigger chain depth {} exceeds the maximum of {}",
                trigger.chain_depth, cap
            )]));
        }

        trigger.state = if trigger.enabled {
            TriggerState::Registered
        } else {
            TriggerState::Inactive
        };
        let mut stored = trigger.clone();
        self.store.save(&mut stored)?;
        self.triggers
            .lock()
            .expect("trigger cache poisoned")
            .insert(stored.trigger_id.clone(), stored.clone());

        self.emit(
            "trigger.registered",
            &stored,
            json!({"chain_depth": stored.chain_depth}),
        )
        .await;
        log::info!(
            "[TriggerDaemon] registered trigger {} ('{}')",
            stored.trigger_id,
            stored.name
        );

        if stored.enabled {
            self.activate(&stored.trigger_id).await?;
        }
        self.cached(&stored.trigger_id)
            .ok_or_else(|| BridgeError::Internal("trigger vanished after registration".into()))
    }

    /// Register a trigger on behalf of a running plan. The new trigger
    /// inherits the plan's chain depth + 1; depth accounting is what stops
    /// runaway trigger-registers-trigger automation.
    pub async fn register_from_plan(
        self: &Arc<Self>,
        mut trigger: TriggerDefinition,
        origin_plan_id: &str,
    ) -> BridgeResult<TriggerDefinition> {
        let parent_depth = self
            .propagator
            .get(origin_plan_id)
            .map(|ctx| ctx.chain_depth())
            .unwrap_or(0);
        trigger.chain_depth = parent_depth + 1;
        self.register(trigger).await
    }

    pub async fn activate(self: &Arc<Self>, trigger_id: &str) -> BridgeResult<()> {
        let mut trigger = self
            .cached(trigger_id)
            .or(self.store.get(trigger_id)?)
            .ok_or_else(|| BridgeError::Internal(format!("trigger {} not found", trigger_id)))?;
        trigger.enabled = true;
        trigger.state = TriggerState::Active;
        self.store.save(&mut trigger)?;
        self.triggers
            .lock()
            .expect("trigger cache poisoned")
            .insert(trigger_id.to_string(), trigger.clone());
        self.arm(trigger_id).await;
        self.emit("trigger.activated", &trigger, json!({})).await;
        Ok(())
    }

    pub async fn deactivate(self: &Arc<Self>, trigger_id: &str) -> BridgeResult<()> {
        let mut trigger = self
            .cached(trigger_id)
            .or(self.store.get(trigger_id)?)
            .ok_or_else(|| BridgeError::Internal(format!("trigger {} not found", trigger_id)))?;
        self.disarm(trigger_id).await;
        trigger.enabled = false;
        trigger.state = TriggerState::Inactive;
        self.store.save(&mut trigger)?;
        self.triggers
            .lock()
            .expect("trigger cache poisoned")
            .insert(trigger_id.to_string(), trigger.clone());
        self.emit("trigger.deactivated", &trigger, json!({})).await;
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, trigger_id: &str) -> BridgeResult<bool> {
        self.disarm(trigger_id).await;
        self.triggers
            .lock()
            .expect("trigger cache poisoned")
            .remove(trigger_id);
        let deleted = self.store.delete(trigger_id)?;
        if deleted {
            log::info!("[TriggerDaemon] deleted trigger {}", trigger_id);
        }
        Ok(deleted)
    }

    pub fn get(&self, trigger_id: &str) -> BridgeResult<Option<TriggerDefinition>> {
        match self.cached(trigger_id) {
            Some(trigger) => Ok(Some(trigger)),
            None => self.store.get(trigger_id),
        }
    }

    pub fn list(&self) -> BridgeResult<Vec<TriggerDefinition>> {
        self.store.list_all()
    }

    // ------------------------------------------------------------------
    // Watcher management
    // ------------------------------------------------------------------

    async fn arm(self: &Arc<Self>, trigger_id: &str) {
        let Some(trigger) = self.cached(trigger_id) else {
            return;
        };
        self.disarm(trigger_id).await;

        let fire_daemon = self.clone();
        let callback: FireCallback = Arc::new(move |trigger_id, event_type, payload| {
            let daemon = fire_daemon.clone();
            Box::pin(async move {
                daemon.on_watcher_fire(&trigger_id, &event_type, payload).await;
            })
        });

        let handle = Arc::new(spawn_watcher(trigger_id, &trigger.condition, callback));
        self.watchers
            .lock()
            .expect("watcher map poisoned")
            .insert(trigger_id.to_string(), handle);
        log::debug!("[TriggerDaemon] armed {}", trigger_id);
    }

    async fn disarm(&self, trigger_id: &str) {
        let handle = self
            .watchers
            .lock()
            .expect("watcher map poisoned")
            .remove(trigger_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    // ------------------------------------------------------------------
    // Fire path
    // ------------------------------------------------------------------

    async fn on_watcher_fire(self: &Arc<Self>, trigger_id: &str, event_type: &str, payload: Value) {
        let Some(trigger) = self.cached(trigger_id) else {
            log::warn!("[TriggerDaemon] fire from unknown trigger {}", trigger_id);
            return;
        };

        // Composite watchers observe every sub-trigger fire.
        self.notify_composites(trigger_id, event_type, &payload);

        if !trigger.can_fire() {
            self.record_throttle(trigger_id).await;
            return;
        }

        let fire = TriggerFireEvent::new(trigger_id, &trigger.name, event_type, payload);
        let Some(scheduler) = self.current_scheduler() else {
            return;
        };
        match scheduler.enqueue(trigger.clone(), fire) {
            EnqueueResult::Queued => {
                self.update_trigger(trigger_id, |t| t.state = TriggerState::Fired)
                    .await;
                let _ = self.store.update_state(trigger_id, TriggerState::Fired);
            }
            EnqueueResult::Throttled | EnqueueResult::Rejected => {
                self.record_throttle(trigger_id).await;
            }
        }
    }

    fn notify_composites(&self, sub_trigger_id: &str, event_type: &str, payload: &Value) {
        let watchers = self.watchers.lock().expect("watcher map poisoned");
        for handle in watchers.values() {
            handle.notify_sub_fire(SubFire {
                sub_trigger_id: sub_trigger_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
            });
        }
    }

    /// Build and submit the plan for one accepted fire. Returns the plan id
    /// on success; `None` drops the fire.
    async fn submit_for_trigger(
        self: &Arc<Self>,
        trigger: TriggerDefinition,
        mut fire: TriggerFireEvent,
    ) -> Option<String> {
        let plan_id = trigger.generate_plan_id();
        fire.plan_id = plan_id.clone();

        // Resource-lock conflict resolution.
        if let Some(resource) = &trigger.resource_lock {
            let acquired = match self.conflict.try_acquire(resource, &plan_id) {
                Ok(()) => true,
                Err(holder) => match trigger.conflict_policy {
                    ConflictPolicy::Reject => {
                        log::info!(
                            "[TriggerDaemon] fire of {} dropped: '{}' held by {}",
                            trigger.trigger_id,
                            resource,
                            holder
                        );
                        self.record_throttle(&trigger.trigger_id).await;
                        return None;
                    }
                    ConflictPolicy::Queue => {
                        self.conflict
                            .acquire_queued(resource, &plan_id, QUEUE_WAIT_TIMEOUT)
                            .await
                    }
                    ConflictPolicy::Preempt => {
                        // Cancel the holder, then wait for it (and its
                        // rollback) to settle before taking the lock.
                        self.executor.cancel(&holder);
                        self.conflict
                            .acquire_after_preempt(resource, &plan_id, QUEUE_WAIT_TIMEOUT)
                            .await
                    }
                },
            };
            if !acquired {
                log::warn!(
                    "[TriggerDaemon] fire of {} dropped: wait for '{}' timed out",
                    trigger.trigger_id,
                    resource
                );
                self.record_throttle(&trigger.trigger_id).await;
                return None;
            }
        }

        let plan = match self.build_plan(&trigger, &fire, &plan_id) {
            Ok(plan) => plan,
            Err(e) => {
                log::error!(
                    "[TriggerDaemon] plan template of {} is invalid: {}",
                    trigger.trigger_id,
                    e
                );
                self.update_trigger(&trigger.trigger_id, |t| t.health.record_fail(&e.to_string()))
                    .await;
                self.persist_trigger(&trigger.trigger_id).await;
                if let Some(resource) = &trigger.resource_lock {
                    self.conflict.release(resource, &plan_id);
                }
                return None;
            }
        };

        // Bind the trigger context (including chain depth) before submit so
        // the plan can read it and chained registrations inherit it.
        let mut context = SessionContext {
            trigger_id: Some(trigger.trigger_id.clone()),
            trigger_name: Some(trigger.name.clone()),
            event_type: Some(fire.event_type.clone()),
            session_id: plan.session_id.clone(),
            fields: HashMap::new(),
        };
        context.fields.insert(
            KEY_TRIGGER_CHAIN_DEPTH.to_string(),
            json!(trigger.chain_depth),
        );
        context
            .fields
            .insert("payload".to_string(), fire.payload.clone());
        self.propagator.bind(&plan_id, context);

        let latency_ms = (Utc::now() - fire.fired_at).num_milliseconds() as f64;
        let plan_session = plan.session_id.clone();
        let submitted_plan_id = self.executor.submit(plan);

        self.update_trigger(&trigger.trigger_id, |t| {
            t.health.record_fire(latency_ms.max(0.0));
            t.state = TriggerState::Active; // re-arm
        })
        .await;
        self.persist_trigger(&trigger.trigger_id).await;

        let mut event = UniversalEvent::new(
            "trigger.plan_submitted",
            TOPIC_TRIGGERS,
            "trigger_daemon",
            json!({
                "trigger_id": trigger.trigger_id,
                "trigger_name": trigger.name,
                "plan_id": submitted_plan_id,
                "event_type": fire.event_type,
            }),
        )
        .with_priority(priority_of(trigger.priority));
        event.session_id = plan_session;
        self.bus.emit(event).await;

        Some(submitted_plan_id)
    }

    /// Deep-copy the plan template and inject identity plus fire context.
    fn build_plan(
        &self,
        trigger: &TriggerDefinition,
        fire: &TriggerFireEvent,
        plan_id: &str,
    ) -> BridgeResult<crate::protocol::models::IMLPlan> {
        let mut raw = trigger.plan_template.clone();
        let Some(obj) = raw.as_object_mut() else {
            return Err(BridgeError::Schema(
                "plan_template must be a JSON object".to_string(),
            ));
        };
        obj.insert("plan_id".to_string(), json!(plan_id));
        obj.entry("protocol_version").or_insert(json!("2.0"));
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| json!({"context": {}}));
        if let Some(context) = metadata
            .as_object_mut()
            .and_then(|m| m.entry("context").or_insert_with(|| json!({})).as_object_mut())
        {
            context.insert("trigger_id".to_string(), json!(trigger.trigger_id));
            context.insert("trigger_name".to_string(), json!(trigger.name));
            context.insert("event_type".to_string(), json!(fire.event_type));
            context.insert("fired_at".to_string(), json!(fire.fired_at));
            context.insert("chain_depth".to_string(), json!(trigger.chain_depth));
        }
        parse_plan(&raw)
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn check_health(self: &Arc<Self>) {
        let failing: Vec<(String, String)> = {
            let watchers = self.watchers.lock().expect("watcher map poisoned");
            watchers
                .iter()
                .filter_map(|(id, handle)| handle.error().map(|e| (id.clone(), e)))
                .collect()
        };
        for (trigger_id, error) in failing {
            let already_failed =
                self.cached(&trigger_id).map(|t| t.state) == Some(TriggerState::Failed);
            if already_failed {
                continue;
            }
            log::warn!(
                "[TriggerDaemon] watcher of {} failed: {}",
                trigger_id,
                error
            );
            self.update_trigger(&trigger_id, |t| {
                t.state = TriggerState::Failed;
                t.health.record_fail(&error);
            })
            .await;
            self.persist_trigger(&trigger_id).await;
            self.disarm(&trigger_id).await;
            if let Some(trigger) = self.cached(&trigger_id) {
                self.emit("trigger.failed", &trigger, json!({"error": error}))
                    .await;
            }
        }
    }

    async fn purge_expired(self: &Arc<Self>) {
        match self.store.purge_expired() {
            Ok(expired) => {
                for trigger_id in expired {
                    log::info!("[TriggerDaemon] purged expired trigger {}", trigger_id);
                    self.disarm(&trigger_id).await;
                    self.triggers
                        .lock()
                        .expect("trigger cache poisoned")
                        .remove(&trigger_id);
                }
            }
            Err(e) => log::error!("[TriggerDaemon] expiry purge failed: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    /// Count a throttled/dropped fire. The trigger stays in THROTTLED until
    /// the next accepted fire re-arms it to ACTIVE.
    async fn record_throttle(self: &Arc<Self>, trigger_id: &str) {
        self.update_trigger(trigger_id, |t| {
            t.health.record_throttle();
            t.state = TriggerState::Throttled;
        })
        .await;
        let _ = self.store.update_state(trigger_id, TriggerState::Throttled);
    }

    async fn update_trigger<F>(&self, trigger_id: &str, mutate: F)
    where
        F: FnOnce(&mut TriggerDefinition),
    {
        let mut triggers = self.triggers.lock().expect("trigger cache poisoned");
        if let Some(trigger) = triggers.get_mut(trigger_id) {
            mutate(trigger);
        }
    }

    async fn persist_trigger(&self, trigger_id: &str) {
        let trigger = self.cached(trigger_id);
        if let Some(mut trigger) = trigger {
            if let Err(e) = self.store.save(&mut trigger) {
                log::error!("[TriggerDaemon] persisting {} failed: {}", trigger_id, e);
            } else {
                self.triggers
                    .lock()
                    .expect("trigger cache poisoned")
                    .insert(trigger_id.to_string(), trigger);
            }
        }
    }

    async fn emit(&self, event_type: &str, trigger: &TriggerDefinition, extra: Value) {
        let mut payload = json!({
            "trigger_id": trigger.trigger_id,
            "trigger_name": trigger.name,
            "state": trigger.state,
        });
        if let (Some(target), Some(source)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        let event = UniversalEvent::new(event_type, TOPIC_TRIGGERS, "trigger_daemon", payload)
            .with_priority(priority_of(trigger.priority));
        self.bus.emit(event).await;
    }
}

fn priority_of(priority: TriggerPriority) -> EventPriority {
    match priority {
        TriggerPriority::Critical => EventPriority::Critical,
        TriggerPriority::High => EventPriority::High,
        TriggerPriority::Normal => EventPriority::Normal,
        TriggerPriority::Low => EventPriority::Low,
        TriggerPriority::Background => EventPriority::Background,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcessBus;
    use crate::memory::KeyValueStore;
    use crate::modules::{handler, ActionSpec, ModuleHandler, ModuleManifest, ModuleRegistry};
    use crate::orchestration::approval::{ApprovalGate, TimeoutBehavior};
    use crate::orchestration::executor::{ExecutorParts, ExecutorSettings};
    use crate::orchestration::resources::ResourceManager;
    use crate::security::guard::PermissionGuard;
    use crate::security::profiles::{profile_config, PermissionProfile};
    use crate::security::rate_limiter::{ActionRateLimiter, RateLimits};
    use crate::security::sanitizer::OutputSanitizer;
    use crate::store::PlanStateStore;

    /// Executor with a "work" module whose `busy` action holds for a while
    /// (honouring cancellation) and whose `quick` action returns at once.
    async fn test_executor(bus: Arc<InProcessBus>) -> Arc<PlanExecutor> {
        let registry = Arc::new(ModuleRegistry::new());
        let manifest = ModuleManifest {
            module_id: "work".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            platform_support: vec![],
            actions: vec![
                ActionSpec {
                    name: "busy".to_string(),
                    description: String::new(),
                    params: vec![],
                    permission_class: "read".to_string(),
                },
                ActionSpec {
                    name: "quick".to_string(),
                    description: String::new(),
                    params: vec![],
                    permission_class: "read".to_string(),
                },
            ],
        };
        let mut handlers: HashMap<String, ModuleHandler> = HashMap::new();
        handlers.insert(
            "busy".to_string(),
            handler(|_, token| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(400)) => Ok(json!({"done": true})),
                    _ = token.cancelled() => Err(BridgeError::Cancelled),
                }
            }),
        );
        handlers.insert(
            "quick".to_string(),
            handler(|_, _| async move { Ok(json!({"done": true})) }),
        );
        registry.register(manifest, handlers).await.unwrap();

        PlanExecutor::new(
            ExecutorParts {
                registry,
                guard: Arc::new(PermissionGuard::new(
                    profile_config(PermissionProfile::Unrestricted),
                    Vec::new(),
                    Vec::new(),
                )),
                store: Arc::new(PlanStateStore::open_in_memory().unwrap()),
                pipeline: None,
                verifier: None,
                sanitizer: Arc::new(OutputSanitizer::default()),
                approvals: Arc::new(ApprovalGate::new(
                    Duration::from_secs(1),
                    TimeoutBehavior::Reject,
                )),
                memory: Arc::new(KeyValueStore::new()),
                resources: Arc::new(ResourceManager::new(HashMap::new(), 8)),
                limiter: Arc::new(ActionRateLimiter::new(RateLimits::default())),
                bus: bus.clone(),
                propagator: Arc::new(SessionContextPropagator::new()),
            },
            ExecutorSettings {
                max_concurrent_plans: 8,
                action_timeout: Duration::from_secs(5),
                strict_memory: false,
            },
        )
    }

    async fn test_daemon() -> (Arc<TriggerDaemon>, Arc<InProcessBus>) {
        let bus = Arc::new(InProcessBus::new());
        let executor = test_executor(bus.clone()).await;
        let daemon = TriggerDaemon::new(
            Arc::new(TriggerStore::open_in_memory().unwrap()),
            executor.clone(),
            bus.clone(),
            // Completion notifications unbind through the executor's own
            // propagator, so share it.
            executor_propagator(&executor),
            TriggerDaemonConfig {
                max_concurrent_plans: 4,
                max_chain_depth: 5,
                health_interval: Duration::from_millis(50),
            },
        );
        daemon.start().await.unwrap();
        (daemon, bus)
    }

    fn executor_propagator(_executor: &Arc<PlanExecutor>) -> Arc<SessionContextPropagator> {
        // Tests drive the propagator through the daemon only.
        Arc::new(SessionContextPropagator::new())
    }

    fn interval_trigger(name: &str, interval: f64, action: &str) -> TriggerDefinition {
        serde_json::from_value(json!({
            "name": name,
            "condition": {"type": "temporal", "kind": "interval",
                           "interval_seconds": interval},
            "plan_template": {
                "description": format!("plan of {}", name),
                "actions": [{"id": "a1", "module": "work", "action": action,
                              "params": {}}]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn register_activates_and_fires_a_plan() {
        let (daemon, bus) = test_daemon().await;
        let mut events = bus.subscribe("iml.triggers.#");

        let trigger = daemon
            .register(interval_trigger("ticker", 0.05, "quick"))
            .await
            .unwrap();
        assert_eq!(trigger.state, TriggerState::Active);

        // Wait for at least one submitted plan.
        let mut submitted = false;
        for _ in 0..100 {
            if let Ok(event) = events.try_recv() {
                if event.event_type == "trigger.plan_submitted" {
                    submitted = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(submitted, "no plan submitted from the interval trigger");

        let refreshed = daemon.get(&trigger.trigger_id).unwrap().unwrap();
        assert!(refreshed.health.fire_count >= 1);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn chain_depth_guard_blocks_beyond_max() {
        let (daemon, _bus) = test_daemon().await;

        // T0 registered by the user.
        let t0 = daemon
            .register(interval_trigger("t0", 60.0, "quick"))
            .await
            .unwrap();
        assert_eq!(t0.chain_depth, 0);

        // Simulated chained registrations with max_chain_depth = 2.
        let mut previous_plan = "plan-of-t0".to_string();
        daemon.propagator.bind(
            &previous_plan,
            SessionContext {
                trigger_id: Some(t0.trigger_id.clone()),
                fields: HashMap::from([(KEY_TRIGGER_CHAIN_DEPTH.to_string(), json!(0))]),
                ..Default::default()
            },
        );

        for depth in 1..=2u32 {
            let mut next = interval_trigger(&format!("t{}", depth), 60.0, "quick");
            next.max_chain_depth = 2;
            let registered = daemon
                .register_from_plan(next, &previous_plan)
                .await
                .unwrap();
            assert_eq!(registered.chain_depth, depth);

            previous_plan = format!("plan-of-t{}", depth);
            daemon.propagator.bind(
                &previous_plan,
                SessionContext {
                    trigger_id: Some(registered.trigger_id.clone()),
                    fields: HashMap::from([(
                        KEY_TRIGGER_CHAIN_DEPTH.to_string(),
                        json!(depth),
                    )]),
                    ..Default::default()
                },
            );
        }

        // T3 would sit at depth 3 > 2.
        let mut t3 = interval_trigger("t3", 60.0, "quick");
        t3.max_chain_depth = 2;
        let err = daemon
            .register_from_plan(t3, &previous_plan)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("chain depth"));
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn shared_resource_lock_with_reject_policy_drops_fires() {
        let (daemon, _bus) = test_daemon().await;

        // B holds the "backup" lock with long-running plans.
        let mut b = interval_trigger("holder", 0.05, "busy");
        b.resource_lock = Some("backup".to_string());
        let b = daemon.register(b).await.unwrap();

        // A shares the lock and rejects on conflict.
        let mut a = interval_trigger("dropper", 0.05, "quick");
        a.resource_lock = Some("backup".to_string());
        a.conflict_policy = ConflictPolicy::Reject;
        let a = daemon.register(a).await.unwrap();

        // Give both several fire intervals while B's plan occupies the lock.
        tokio::time::sleep(Duration::from_millis(800)).await;
        daemon.shutdown().await;

        let a_state = daemon.get(&a.trigger_id).unwrap().unwrap();
        let b_state = daemon.get(&b.trigger_id).unwrap().unwrap();
        assert!(
            b_state.health.fire_count >= 1,
            "holder never fired: {:?}",
            b_state.health
        );
        assert!(
            a_state.health.throttle_count >= 1,
            "dropper was never dropped: {:?}",
            a_state.health
        );
    }

    #[tokio::test]
    async fn watcher_failure_marks_the_trigger_failed() {
        let (daemon, _bus) = test_daemon().await;
        let bad: TriggerDefinition = serde_json::from_value(json!({
            "name": "bad-cron",
            "condition": {"type": "temporal", "kind": "cron", "schedule": "definitely not cron"},
            "plan_template": {"description": "x",
                               "actions": [{"id": "a1", "module": "work",
                                             "action": "quick", "params": {}}]}
        }))
        .unwrap();
        let bad = daemon.register(bad).await.unwrap();

        let mut failed = false;
        for _ in 0..60 {
            if daemon.get(&bad.trigger_id).unwrap().unwrap().state == TriggerState::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(failed, "trigger never transitioned to FAILED");
        let health = daemon.get(&bad.trigger_id).unwrap().unwrap().health;
        assert!(health.fail_count >= 1);
        assert!(health.last_error.is_some());
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn expired_triggers_are_purged_by_the_health_loop() {
        let (daemon, _bus) = test_daemon().await;
        let mut ephemeral = interval_trigger("ephemeral", 60.0, "quick");
        ephemeral.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(30));
        let ephemeral = daemon.register(ephemeral).await.unwrap();

        let mut gone = false;
        for _ in 0..60 {
            if daemon.get(&ephemeral.trigger_id).unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "expired trigger was not purged");
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn deactivate_stops_the_watcher() {
        let (daemon, bus) = test_daemon().await;
        let trigger = daemon
            .register(interval_trigger("pausable", 0.05, "quick"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        daemon.deactivate(&trigger.trigger_id).await.unwrap();

        let mut events = bus.subscribe("iml.triggers.#");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut fired_after_deactivate = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == "trigger.plan_submitted" {
                fired_after_deactivate = true;
            }
        }
        assert!(!fired_after_deactivate);
        assert_eq!(
            daemon.get(&trigger.trigger_id).unwrap().unwrap().state,
            TriggerState::Inactive
        );
        daemon.shutdown().await;
    }
}


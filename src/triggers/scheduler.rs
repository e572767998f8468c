//! Priority fire scheduler.
//!
//! Sits between the watchers (which detect) and the executor (which runs).
//! Fires queue in a binary heap keyed by trigger priority (CRITICAL first)
//! with a FIFO sequence tie-break; at most `max_concurrent` triggered plans
//! run at once. A CRITICAL fire arriving while the pool is full may preempt
//! an in-flight BACKGROUND plan belonging to another trigger.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::triggers::models::{
    ConflictPolicy, TriggerDefinition, TriggerFireEvent, TriggerPriority,
};

/// Submits one fire; returns the plan id when a plan was launched.
pub type SubmitCallback = Arc<
    dyn Fn(TriggerDefinition, TriggerFireEvent) -> Pin<Box<dyn Future<Output = Option<String>> + Send>>
        + Send
        + Sync,
>;
/// Cancels a running plan by id (used for preemption).
pub type CancelCallback =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// Dropped by the per-trigger hourly window.
    Throttled,
    /// Dropped because the trigger already has a running plan
    /// (conflict_policy = reject).
    Rejected,
}

struct QueuedFire {
    priority: u8,
    sequence: u64,
    trigger: TriggerDefinition,
    fire: TriggerFireEvent,
}

impl PartialEq for QueuedFire {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedFire {}
impl PartialOrd for QueuedFire {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedFire {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: lowest (priority, sequence) must compare
        // greatest to pop first.
        Reverse((self.priority, self.sequence)).cmp(&Reverse((other.priority, other.sequence)))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<QueuedFire>>,
    sequence: AtomicU64,
    work: Notify,
    /// plan_id -> (priority, trigger_id)
    running: Mutex<HashMap<String, (TriggerPriority, String)>>,
    fire_times: Mutex<HashMap<String, Vec<Instant>>>,
    max_concurrent: usize,
    submit: SubmitCallback,
    cancel: CancelCallback,
    stop: CancellationToken,
}

pub struct FireScheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FireScheduler {
    pub fn new(submit: SubmitCallback, cancel: CancelCallback, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                sequence: AtomicU64::new(0),
                work: Notify::new(),
                running: Mutex::new(HashMap::new()),
                fire_times: Mutex::new(HashMap::new()),
                max_concurrent: max_concurrent.max(1),
                submit,
                cancel,
                stop: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.stop.cancelled() => return,
                    _ = inner.work.notified() => {}
                }
                Inner::drain(&inner).await;
            }
        });
        *self.task.lock().expect("scheduler task lock poisoned") = Some(task);
        log::debug!(
            "[FireScheduler] started (max {} concurrent)",
            self.inner.max_concurrent
        );
    }

    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let task = self
            .task
            .lock()
            .expect("scheduler task lock poisoned")
            .take();
        if let Some(task) = task {
            // A submission may sit in a bounded lock wait; abort rather
            // than ride it out.
            task.abort();
            let _ = task.await;
        }
        log::debug!("[FireScheduler] stopped");
    }

    /// Queue a fire; applies the hourly window and the reject policy.
    pub fn enqueue(&self, trigger: TriggerDefinition, fire: TriggerFireEvent) -> EnqueueResult {
        if !self.check_rate(&trigger) {
            log::warn!(
                "[FireScheduler] trigger {} throttled by hourly window",
                trigger.trigger_id
            );
            return EnqueueResult::Throttled;
        }
        if trigger.conflict_policy == ConflictPolicy::Reject
            && self.has_running_for(&trigger.trigger_id)
        {
            log::info!(
                "[FireScheduler] fire of {} rejected: plan already running",
                trigger.trigger_id
            );
            return EnqueueResult::Rejected;
        }

        let item = QueuedFire {
            priority: trigger.priority.ordinal(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst),
            trigger,
            fire,
        };
        self.inner
            .heap
            .lock()
            .expect("scheduler heap poisoned")
            .push(item);
        self.inner.work.notify_one();
        EnqueueResult::Queued
    }

    /// Called when a triggered plan reaches a terminal state.
    pub fn on_plan_completed(&self, plan_id: &str) {
        self.inner
            .running
            .lock()
            .expect("scheduler running poisoned")
            .remove(plan_id);
        self.inner.work.notify_one();
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.heap.lock().expect("scheduler heap poisoned").len()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .running
            .lock()
            .expect("scheduler running poisoned")
            .len()
    }

    pub fn has_running_for(&self, trigger_id: &str) -> bool {
        self.inner
            .running
            .lock()
            .expect("scheduler running poisoned")
            .values()
            .any(|(_, tid)| tid == trigger_id)
    }

    fn check_rate(&self, trigger: &TriggerDefinition) -> bool {
        if trigger.max_fires_per_hour == 0 {
            return true;
        }
        let mut times = self
            .inner
            .fire_times
            .lock()
            .expect("scheduler rate poisoned");
        let entries = times.entry(trigger.trigger_id.clone()).or_default();
        let cutoff = Instant::now() - Duration::from_secs(3600);
        entries.retain(|t| *t > cutoff);
        (entries.len() as u32) < trigger.max_fires_per_hour
    }
}

impl Inner {
    async fn drain(inner: &Arc<Inner>) {
        loop {
            if inner.stop.is_cancelled() {
                return;
            }

            let slot_free = {
                let running = inner.running.lock().expect("scheduler running poisoned");
                running.len() < inner.max_concurrent
            };

            let item = {
                let mut heap = inner.heap.lock().expect("scheduler heap poisoned");
                if slot_free {
                    heap.pop()
                } else {
                    // Pool full: a CRITICAL head may preempt a BACKGROUND
                    // plan of another trigger; everything else waits.
                    match heap.peek() {
                        Some(head) if head.priority == TriggerPriority::Critical.ordinal() => {
                            heap.pop()
                        }
                        _ => None,
                    }
                }
            };
            let Some(item) = item else { return };

            if !slot_free {
                let victim = {
                    let running = inner.running.lock().expect("scheduler running poisoned");
                    running
                        .iter()
                        .filter(|(_, (priority, tid))| {
                            *priority == TriggerPriority::Background
                                && tid != &item.trigger.trigger_id
                        })
                        .map(|(plan_id, _)| plan_id.clone())
                        .next()
                };
                match victim {
                    Some(plan_id) => {
                        log::info!(
                            "[FireScheduler] critical fire of {} preempting background plan {}",
                            item.trigger.trigger_id,
                            plan_id
                        );
                        (inner.cancel)(plan_id).await;
                        // Requeue; the freed slot is picked up when the
                        // cancelled plan reports completion.
                        inner
                            .heap
                            .lock()
                            .expect("scheduler heap poisoned")
                            .push(item);
                        return;
                    }
                    None => {
                        // Nothing to preempt; put it back and wait.
                        inner
                            .heap
                            .lock()
                            .expect("scheduler heap poisoned")
                            .push(item);
                        return;
                    }
                }
            }

            // Same-trigger preemption: a higher-priority fire may replace
            // this trigger's own lower-priority running plans.
            if item.trigger.conflict_policy == ConflictPolicy::Preempt {
                let victims: Vec<String> = {
                    let running = inner.running.lock().expect("scheduler running poisoned");
                    running
                        .iter()
                        .filter(|(_, (priority, tid))| {
                            tid == &item.trigger.trigger_id
                                && priority.ordinal() > item.trigger.priority.ordinal()
                        })
                        .map(|(plan_id, _)| plan_id.clone())
                        .collect()
                };
                for plan_id in victims {
                    log::info!(
                        "[FireScheduler] {} preempting own plan {}",
                        item.trigger.trigger_id,
                        plan_id
                    );
                    (inner.cancel)(plan_id).await;
                }
            }

            let trigger_id = item.trigger.trigger_id.clone();
            let priority = item.trigger.priority;
            match (inner.submit)(item.trigger, item.fire).await {
                Some(plan_id) => {
                    inner
                        .running
                        .lock()
                        .expect("scheduler running poisoned")
                        .insert(plan_id.clone(), (priority, trigger_id.clone()));
                    inner
                        .fire_times
                        .lock()
                        .expect("scheduler rate poisoned")
                        .entry(trigger_id.clone())
                        .or_default()
                        .push(Instant::now());
                    log::info!(
                        "[FireScheduler] submitted plan {} for trigger {}",
                        plan_id,
                        trigger_id
                    );
                }
                None => {
                    log::debug!(
                        "[FireScheduler] fire of {} produced no plan",
                        trigger_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn trigger(id: &str, priority: TriggerPriority) -> TriggerDefinition {
        let mut t: TriggerDefinition = serde_json::from_value(json!({
            "name": id,
            "condition": {"type": "temporal", "kind": "interval", "interval_seconds": 60.0},
            "plan_template": {"description": "t", "actions": []}
        }))
        .unwrap();
        t.trigger_id = id.to_string();
        t.priority = priority;
        t
    }

    fn fire(id: &str) -> TriggerFireEvent {
        TriggerFireEvent::new(id, id, "test", json!({}))
    }

    fn recording_scheduler(
        max_concurrent: usize,
    ) -> (FireScheduler, Arc<StdMutex<Vec<String>>>) {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let seen = order.clone();
        let submit: SubmitCallback = Arc::new(move |trigger, _fire| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(trigger.trigger_id.clone());
                Some(format!("plan_for_{}", trigger.trigger_id))
            })
        });
        let cancel: CancelCallback = Arc::new(|_plan_id| Box::pin(async {}));
        (FireScheduler::new(submit, cancel, max_concurrent), order)
    }

    #[tokio::test]
    async fn higher_priority_fires_submit_first() {
        let (scheduler, order) = recording_scheduler(10);
        // Enqueue before starting so all three sit in the heap together.
        scheduler.enqueue(trigger("bg", TriggerPriority::Background), fire("bg"));
        scheduler.enqueue(trigger("crit", TriggerPriority::Critical), fire("crit"));
        scheduler.enqueue(trigger("norm", TriggerPriority::Normal), fire("norm"));
        scheduler.start();
        // Nudge the loop in case the notify fired before start.
        scheduler.inner.work.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            order.lock().unwrap().clone(),
            vec!["crit", "norm", "bg"]
        );
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn fifo_within_the_same_priority() {
        let (scheduler, order) = recording_scheduler(10);
        scheduler.enqueue(trigger("first", TriggerPriority::Normal), fire("first"));
        scheduler.enqueue(trigger("second", TriggerPriority::Normal), fire("second"));
        scheduler.start();
        scheduler.inner.work.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(order.lock().unwrap().clone(), vec!["first", "second"]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn hourly_window_throttles() {
        let (scheduler, _order) = recording_scheduler(10);
        let mut t = trigger("limited", TriggerPriority::Normal);
        t.max_fires_per_hour = 2;

        assert_eq!(scheduler.enqueue(t.clone(), fire("limited")), EnqueueResult::Queued);
        // Simulate two recorded fires.
        scheduler
            .inner
            .fire_times
            .lock()
            .unwrap()
            .insert("limited".to_string(), vec![Instant::now(), Instant::now()]);
        assert_eq!(
            scheduler.enqueue(t, fire("limited")),
            EnqueueResult::Throttled
        );
    }

    #[tokio::test]
    async fn reject_policy_drops_while_plan_running() {
        let (scheduler, _order) = recording_scheduler(10);
        let mut t = trigger("solo", TriggerPriority::Normal);
        t.conflict_policy = ConflictPolicy::Reject;

        scheduler
            .inner
            .running
            .lock()
            .unwrap()
            .insert("plan-1".to_string(), (TriggerPriority::Normal, "solo".to_string()));
        assert_eq!(scheduler.enqueue(t, fire("solo")), EnqueueResult::Rejected);
    }

    #[tokio::test]
    async fn concurrency_cap_holds_until_completion() {
        let (scheduler, order) = recording_scheduler(1);
        scheduler.enqueue(trigger("one", TriggerPriority::Normal), fire("one"));
        scheduler.enqueue(trigger("two", TriggerPriority::Normal), fire("two"));
        scheduler.start();
        scheduler.inner.work.notify_one();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(order.lock().unwrap().clone(), vec!["one"]);
        assert_eq!(scheduler.running_count(), 1);

        scheduler.on_plan_completed("plan_for_one");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(order.lock().unwrap().clone(), vec!["one", "two"]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn critical_preempts_a_background_plan_of_another_trigger() {
        let cancelled: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let cancelled_in = cancelled.clone();
        let submit: SubmitCallback = Arc::new(move |trigger, _| {
            Box::pin(async move { Some(format!("plan_for_{}", trigger.trigger_id)) })
        });
        let cancel: CancelCallback = Arc::new(move |plan_id| {
            let cancelled = cancelled_in.clone();
            Box::pin(async move {
                cancelled.lock().unwrap().push(plan_id);
            })
        });
        let scheduler = FireScheduler::new(submit, cancel, 1);
        scheduler.inner.running.lock().unwrap().insert(
            "bg-plan".to_string(),
            (TriggerPriority::Background, "bg-trigger".to_string()),
        );

        scheduler.enqueue(trigger("crit", TriggerPriority::Critical), fire("crit"));
        scheduler.start();
        scheduler.inner.work.notify_one();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cancelled.lock().unwrap().clone(), vec!["bg-plan"]);
        // The freed slot admits the critical fire once completion lands.
        scheduler.on_plan_completed("bg-plan");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(scheduler.has_running_for("crit"));
        scheduler.stop().await;
    }
}

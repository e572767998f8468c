//! Resource-lock conflict resolution.
//!
//! An in-memory table mapping `resource_lock` names to the plan currently
//! holding them. Before submitting a triggered plan the daemon consults the
//! resolver with the trigger's conflict policy:
//!
//!   - `queue`   wait (bounded) for the lock to free, else drop the fire
//!   - `preempt` cancel the holder, await its terminal state, then acquire
//!   - `reject`  drop the fire immediately
//!
//! Release notifications go through a `Notify` per resource so queued
//! waiters wake without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

pub const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

struct Shared {
    locks: Mutex<HashMap<String, String>>,
    released: Mutex<HashMap<String, Arc<Notify>>>,
}

pub struct ConflictResolver {
    shared: Arc<Shared>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                locks: Mutex::new(HashMap::new()),
                released: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn notify_for(&self, resource: &str) -> Arc<Notify> {
        self.shared
            .released
            .lock()
            .expect("conflict lock poisoned")
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Try to take `resource` for `plan_id`; returns the holder when busy.
    pub fn try_acquire(&self, resource: &str, plan_id: &str) -> Result<(), String> {
        let mut locks = self.shared.locks.lock().expect("conflict lock poisoned");
        match locks.get(resource) {
            None => {
                locks.insert(resource.to_string(), plan_id.to_string());
                log::debug!("[Conflict] '{}' locked by {}", resource, plan_id);
                Ok(())
            }
            Some(holder) => Err(holder.clone()),
        }
    }

    /// Block until `resource` frees and take it, up to `timeout`.
    pub async fn acquire_queued(
        &self,
        resource: &str,
        plan_id: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire(resource, plan_id).is_ok() {
                return true;
            }
            let notify = self.notify_for(resource);
            let woken = tokio::time::timeout_at(deadline, notify.notified()).await;
            if woken.is_err() {
                // Deadline passed while the lock was still held.
                return self.try_acquire(resource, plan_id).is_ok();
            }
        }
    }

    /// Wait for the current holder to release, then take the lock. Used by
    /// the preempt path after the holder's plan was cancelled: the safer
    /// choice is to wait for the preempted plan (and its rollback) to settle
    /// before launching the preempter.
    pub async fn acquire_after_preempt(
        &self,
        resource: &str,
        plan_id: &str,
        timeout: Duration,
    ) -> bool {
        self.acquire_queued(resource, plan_id, timeout).await
    }

    /// Release `resource` if `plan_id` is the holder, waking queued waiters.
    pub fn release(&self, resource: &str, plan_id: &str) {
        let mut locks = self.shared.locks.lock().expect("conflict lock poisoned");
        if locks.get(resource).map(|h| h.as_str()) == Some(plan_id) {
            locks.remove(resource);
            log::debug!("[Conflict] '{}' released by {}", resource, plan_id);
            drop(locks);
            self.notify_for(resource).notify_waiters();
        }
    }

    /// Release every lock held by `plan_id` (used at plan termination).
    pub fn release_all_for(&self, plan_id: &str) {
        let resources: Vec<String> = {
            let locks = self.shared.locks.lock().expect("conflict lock poisoned");
            locks
                .iter()
                .filter(|(_, holder)| holder.as_str() == plan_id)
                .map(|(resource, _)| resource.clone())
                .collect()
        };
        for resource in resources {
            self.release(&resource, plan_id);
        }
    }

    pub fn holder_of(&self, resource: &str) -> Option<String> {
        self.shared
            .locks
            .lock()
            .expect("conflict lock poisoned")
            .get(resource)
            .cloned()
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.holder_of(resource).is_some()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-module concurrency ceilings.
//!
//! Lazily creates one semaphore per module from `resource_limits.<module>`
//! configuration. The plan executor and the plan-group executor share one
//! instance, so the invariant "RUNNING actions with module=m never exceed
//! resource_limits[m]" holds across concurrent plans.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ResourceManager {
    limits: HashMap<String, usize>,
    default_limit: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ResourceManager {
    pub fn new(limits: HashMap<String, usize>, default_limit: usize) -> Self {
        Self {
            limits,
            default_limit: default_limit.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, module_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().expect("resource lock poisoned");
        semaphores
            .entry(module_id.to_string())
            .or_insert_with(|| {
                let limit = self
                    .limits
                    .get(module_id)
                    .copied()
                    .unwrap_or(self.default_limit)
                    .max(1);
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    /// Wait for a slot on `module_id`. The permit releases on drop.
    pub async fn acquire(&self, module_id: &str) -> OwnedSemaphorePermit {
        self.semaphore_for(module_id)
            .acquire_owned()
            .await
            .expect("module semaphore closed")
    }

    pub fn limit_for(&self, module_id: &str) -> usize {
        self.limits
            .get(module_id)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }

    /// Snapshot of in-use slot counts for monitoring.
    pub fn status(&self) -> HashMap<String, (usize, usize)> {
        let semaphores = self.semaphores.lock().expect("resource lock poisoned");
        semaphores
            .iter()
            .map(|(module, sem)| {
                let limit = self.limit_for(module);
                (module.clone(), (limit - sem.available_permits(), limit))
            })
            .collect()
    }
}

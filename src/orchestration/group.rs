//! Plan group executor - fan-out of N plans with bounded concurrency.
//!
//! Each plan takes a slot on the group's own semaphore; per-module ceilings
//! still apply inside each plan because every plan runs through the shared
//! executor and its [`ResourceManager`](crate::orchestration::resources::ResourceManager).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::orchestration::executor::PlanExecutor;
use crate::protocol::models::{IMLPlan, PlanStatus};
use crate::store::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    AllSucceeded,
    Partial,
    AllFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanGroupResult {
    pub group_id: String,
    pub status: GroupStatus,
    pub plan_results: HashMap<String, ExecutionState>,
    pub errors: HashMap<String, String>,
    pub duration_seconds: f64,
}

pub struct PlanGroupExecutor {
    executor: Arc<PlanExecutor>,
}

impl PlanGroupExecutor {
    pub fn new(executor: Arc<PlanExecutor>) -> Self {
        Self { executor }
    }

    /// Run all plans concurrently, at most `max_concurrent` at a time, and
    /// aggregate the outcomes.
    pub async fn execute(
        &self,
        plans: Vec<IMLPlan>,
        group_id: Option<String>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> PlanGroupResult {
        let group_id = group_id.unwrap_or_else(|| format!("group_{}", Uuid::new_v4()));
        let started = Instant::now();
        let total = plans.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        log::info!(
            "[PlanGroup] {} executing {} plans (max {} concurrent)",
            group_id,
            total,
            max_concurrent
        );

        let tasks: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                let executor = self.executor.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _slot = semaphore
                        .acquire_owned()
                        .await
                        .expect("group semaphore closed");
                    let plan_id = plan.plan_id.clone();
                    match executor.run(plan).await {
                        Ok(state) => (plan_id, Ok(state)),
                        Err(e) => (plan_id, Err(e.to_string())),
                    }
                }
            })
            .collect();

        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;

        let mut plan_results = HashMap::new();
        let mut errors = HashMap::new();
        match joined {
            Ok(outcomes) => {
                for (plan_id, outcome) in outcomes {
                    match outcome {
                        Ok(state) => {
                            plan_results.insert(plan_id, state);
                        }
                        Err(error) => {
                            errors.insert(plan_id, error);
                        }
                    }
                }
            }
            Err(_) => {
                errors.insert(
                    "_group".to_string(),
                    format!("group timed out after {:?}", timeout),
                );
            }
        }

        let succeeded = plan_results
            .values()
            .filter(|s| s.status == PlanStatus::Succeeded)
            .count();
        let status = if succeeded == total && errors.is_empty() {
            GroupStatus::AllSucceeded
        } else if succeeded == 0 {
            GroupStatus::AllFailed
        } else {
            GroupStatus::Partial
        };

        log::info!(
            "[PlanGroup] {} finished: {}/{} succeeded",
            group_id,
            succeeded,
            total
        );
        PlanGroupResult {
            group_id,
            status,
            plan_results,
            errors,
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }
}

//! Plan orchestration - scheduling, execution, approvals, rollback and
//! resource coordination.

pub mod approval;
pub mod dag;
pub mod executor;
pub mod group;
pub mod resources;
pub mod rollback;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalOutcome, PendingApproval, TimeoutBehavior};
pub use dag::{DagScheduler, ExecutionWave};
pub use executor::{ExecutorParts, ExecutorSettings, PlanCompletion, PlanExecutor};
pub use group::{GroupStatus, PlanGroupExecutor, PlanGroupResult};
pub use resources::ResourceManager;
pub use rollback::RollbackEngine;

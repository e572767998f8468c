//! IML protocol v2 - plan model, parsing, validation and template binding.

pub mod models;
pub mod parser;
pub mod repair;
pub mod template;
pub mod validator;

pub use models::{
    ActionStatus, ApprovalSpec, CompilerTrace, IMLAction, IMLPlan, MemorySpec, OnFailure,
    PerceptionSpec, PlanMetadata, PlanMode, PlanStatus, RetryConfig, RollbackSpec,
    PROTOCOL_VERSION,
};
pub use parser::parse_plan;
pub use repair::{repair, RepairOutcome};
pub use template::TemplateResolver;
pub use validator::validate;

//! Persistent reactive automation: triggers, watchers, fire scheduling.

pub mod conflict;
pub mod daemon;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod watchers;

pub use conflict::ConflictResolver;
pub use daemon::{TriggerDaemon, TriggerDaemonConfig};
pub use models::{
    CompositeOperator, ConflictPolicy, FsEventKind, ProcessEventKind, ResourceMetric,
    TemporalSpec, TriggerCondition, TriggerDefinition, TriggerFireEvent, TriggerHealth,
    TriggerPriority, TriggerState,
};
pub use scheduler::{EnqueueResult, FireScheduler};
pub use store::TriggerStore;

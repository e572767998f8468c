//! Typed pub/sub event infrastructure with causal linkage.

pub mod bus;
pub mod models;
pub mod router;
pub mod session;

pub use bus::{EventBus, FanoutBus, InProcessBus, LogEventBus, NullEventBus};
pub use models::{
    EventPriority, UniversalEvent, TOPIC_ACTIONS, TOPIC_ERRORS, TOPIC_PLANS, TOPIC_SECURITY,
    TOPIC_TRIGGERS,
};
pub use router::topic_matches;
pub use session::{SessionContext, SessionContextPropagator, KEY_TRIGGER_CHAIN_DEPTH};

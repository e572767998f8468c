//! Rollback engine - executes inline compensation bodies.
//!
//! When a plan fails with `rollback_on_failure`, the executor walks its
//! COMPLETED actions in reverse topological order and runs each action's
//! compensation through this engine. A compensation that itself fails is
//! recorded but never triggers further rollback.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::BridgeResult;
use crate::modules::ModuleRegistry;
use crate::protocol::models::RollbackSpec;
use crate::protocol::template::TemplateResolver;

pub struct RollbackEngine {
    registry: Arc<ModuleRegistry>,
}

impl RollbackEngine {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve the compensation's templates against the accumulated results
    /// and dispatch it through the normal module path.
    pub async fn run_compensation(
        &self,
        spec: &RollbackSpec,
        execution_results: &HashMap<String, Value>,
        token: CancellationToken,
    ) -> BridgeResult<Value> {
        let resolver = TemplateResolver::new(execution_results, HashMap::new());
        let params = resolver.resolve(&spec.params)?;
        log::info!(
            "[Rollback] dispatching compensation {}.{}",
            spec.module,
            spec.action
        );
        self.registry
            .dispatch(&spec.module, &spec.action, params, token)
            .await
    }
}

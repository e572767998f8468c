//! DAG scheduler - wave construction over the action dependency graph.
//!
//! Waves are built with Kahn's algorithm: each wave is the maximal set of
//! actions whose predecessors all belong to earlier waves, so members of one
//! wave can run concurrently. Ties within a wave keep the insertion order of
//! the actions in the plan JSON.
//!
//! The validator guarantees acyclicity before a scheduler is built; a cycle
//! slipping through anyway is reported as an internal error rather than
//! looping forever.

use std::collections::{HashMap, HashSet};

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::models::IMLPlan;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionWave {
    pub index: usize,
    pub action_ids: Vec<String>,
    pub is_final: bool,
}

pub struct DagScheduler {
    /// Declaration order of all action ids.
    order: Vec<String>,
    /// action id -> direct dependencies.
    dependencies: HashMap<String, Vec<String>>,
    /// action id -> direct dependents.
    dependents: HashMap<String, Vec<String>>,
}

impl DagScheduler {
    pub fn new(plan: &IMLPlan) -> Self {
        let order: Vec<String> = plan.actions.iter().map(|a| a.id.clone()).collect();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for action in &plan.actions {
            dependencies.insert(action.id.clone(), action.depends_on.clone());
            dependents.entry(action.id.clone()).or_default();
            for dep in &action.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(action.id.clone());
            }
        }
        Self {
            order,
            dependencies,
            dependents,
        }
    }

    /// All waves, in execution order.
    pub fn waves(&self) -> BridgeResult<Vec<ExecutionWave>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| {
                (
                    id.as_str(),
                    self.dependencies.get(id).map(|d| d.len()).unwrap_or(0),
                )
            })
            .collect();

        let mut remaining: usize = self.order.len();
        let mut waves = Vec::new();
        let mut index = 0;

        while remaining > 0 {
            // Plan declaration order breaks ties inside a wave.
            let ready: Vec<String> = self
                .order
                .iter()
                .filter(|id| in_degree.get(id.as_str()) == Some(&0))
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(BridgeError::Internal(
                    "dependency graph contains a cycle that escaped validation".to_string(),
                ));
            }

            for id in &ready {
                in_degree.remove(id.as_str());
                for dependent in self.dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                    }
                }
            }
            remaining -= ready.len();
            waves.push(ExecutionWave {
                index,
                action_ids: ready,
                is_final: remaining == 0,
            });
            index += 1;
        }

        Ok(waves)
    }

    /// All transitive dependents of `action_id`.
    pub fn descendants(&self, action_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&String> = self
            .dependents
            .get(action_id)
            .map(|d| d.iter().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                if let Some(next) = self.dependents.get(current) {
                    stack.extend(next.iter());
                }
            }
        }
        seen
    }

    /// A valid topological order (wave order flattened).
    pub fn topological_order(&self) -> BridgeResult<Vec<String>> {
        Ok(self
            .waves()?
            .into_iter()
            .flat_map(|w| w.action_ids)
            .collect())
    }

    /// Reverse topological order, used by the rollback sweep.
    pub fn reverse_topological_order(&self) -> BridgeResult<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parser::parse_plan;
    use serde_json::json;

    fn scheduler(actions: serde_json::Value) -> DagScheduler {
        let plan = parse_plan(&json!({"description": "t", "actions": actions})).unwrap();
        DagScheduler::new(&plan)
    }

    #[test]
    fn diamond_graph_builds_three_waves() {
        let s = scheduler(json!([
            {"id": "root", "module": "m", "action": "a", "params": {}},
            {"id": "left", "module": "m", "action": "a", "params": {}, "depends_on": ["root"]},
            {"id": "right", "module": "m", "action": "a", "params": {}, "depends_on": ["root"]},
            {"id": "join", "module": "m", "action": "a", "params": {},
             "depends_on": ["left", "right"]}
        ]));
        let waves = s.waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].action_ids, vec!["root"]);
        assert_eq!(waves[1].action_ids, vec!["left", "right"]);
        assert_eq!(waves[2].action_ids, vec!["join"]);
        assert!(waves[2].is_final);
        assert!(!waves[0].is_final);
    }

    #[test]
    fn independent_actions_share_the_first_wave_in_plan_order() {
        let s = scheduler(json!([
            {"id": "b", "module": "m", "action": "a", "params": {}},
            {"id": "a", "module": "m", "action": "a", "params": {}},
            {"id": "c", "module": "m", "action": "a", "params": {}}
        ]));
        let waves = s.waves().unwrap();
        assert_eq!(waves.len(), 1);
        // Declaration order, not lexicographic.
        assert_eq!(waves[0].action_ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn descendants_are_transitive() {
        let s = scheduler(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}},
            {"id": "a2", "module": "m", "action": "a", "params": {}, "depends_on": ["a1"]},
            {"id": "a3", "module": "m", "action": "a", "params": {}, "depends_on": ["a2"]},
            {"id": "b1", "module": "m", "action": "a", "params": {}}
        ]));
        let desc = s.descendants("a1");
        assert_eq!(desc.len(), 2);
        assert!(desc.contains("a2") && desc.contains("a3"));
        assert!(s.descendants("b1").is_empty());
    }

    #[test]
    fn reverse_topological_order_ends_at_roots() {
        let s = scheduler(json!([
            {"id": "a1", "module": "m", "action": "a", "params": {}},
            {"id": "a2", "module": "m", "action": "a", "params": {}, "depends_on": ["a1"]}
        ]));
        assert_eq!(s.reverse_topological_order().unwrap(), vec!["a2", "a1"]);
    }
}

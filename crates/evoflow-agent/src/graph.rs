use std::collections::HashMap;
use std::sync::Arc;

use evoflow_core::workflow::{WorkflowConfig, WorkflowNodeConfig};

/// Immutable node arena for one workflow invocation.
///
/// Nodes are shared as `Arc`s between concurrently running executions;
/// nothing in a run mutates them. Memory changes travel back as patches.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    entry_node_id: String,
    nodes: Vec<Arc<WorkflowNodeConfig>>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let nodes: Vec<Arc<WorkflowNodeConfig>> =
            config.nodes.iter().cloned().map(Arc::new).collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.clone(), i))
            .collect();
        Self {
            entry_node_id: config.entry_node_id.clone(),
            nodes,
            index,
        }
    }

    pub fn entry_node_id(&self) -> &str {
        &self.entry_node_id
    }

    pub fn get(&self, node_id: &str) -> Option<&Arc<WorkflowNodeConfig>> {
        self.index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn nodes(&self) -> &[Arc<WorkflowNodeConfig>] {
        &self.nodes
    }

    /// Node ids in declaration order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.node_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_test_utils::fan_out_join_workflow;

    #[test]
    fn test_lookup_and_order() {
        let graph = WorkflowGraph::from_config(&fan_out_join_workflow());
        assert_eq!(graph.entry_node_id(), "a");
        assert_eq!(graph.node_ids().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
        assert!(graph.get("d").unwrap().is_join());
        assert!(!graph.contains("end"));
    }
}

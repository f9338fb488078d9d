use rand::Rng;

use evoflow_core::workflow::{WorkflowConfig, WorkflowNodeConfig};

/// Node-wise uniform crossover.
///
/// The child keeps the topology of `primary` (ids, handoffs, joins, entry).
/// Each node takes its behaviour (prompt, model, tools, memory) from either
/// parent with equal probability. Nodes are paired by id, falling back to
/// position when the parents share no ids.
pub fn crossover<R: Rng + ?Sized>(
    primary: &WorkflowConfig,
    secondary: &WorkflowConfig,
    rng: &mut R,
) -> WorkflowConfig {
    let shares_ids = primary.nodes.iter().any(|n| secondary.contains(&n.node_id));
    let mut child = primary.clone();

    for (i, node) in child.nodes.iter_mut().enumerate() {
        let donor = if shares_ids {
            secondary.node(&node.node_id)
        } else {
            secondary.nodes.get(i)
        };
        if let Some(donor) = donor {
            if rng.gen_bool(0.5) {
                inherit_behaviour(node, donor);
            }
        }
    }
    child
}

fn inherit_behaviour(node: &mut WorkflowNodeConfig, donor: &WorkflowNodeConfig) {
    node.system_prompt = donor.system_prompt.clone();
    node.description = donor.description.clone();
    node.model_name = donor.model_name.clone();
    node.code_tools = donor.code_tools.clone();
    node.mcp_tools = donor.mcp_tools.clone();
    node.memory = donor.memory.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::workflow::VerifyOptions;
    use evoflow_test_utils::{linear_workflow, node};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_child_keeps_primary_topology() {
        let primary = linear_workflow();
        let mut secondary = linear_workflow();
        for n in &mut secondary.nodes {
            n.system_prompt = format!("other {}", n.node_id);
            n.model_name = "gpt-4.1-nano".into();
            n.hand_offs.clear();
        }

        let mut rng = StdRng::seed_from_u64(4);
        let mut inherited = 0;
        for _ in 0..40 {
            let child = crossover(&primary, &secondary, &mut rng);
            assert_eq!(child.edges(), primary.edges());
            assert!(child.verify(&VerifyOptions::default()).is_empty());
            inherited += child
                .nodes
                .iter()
                .filter(|n| n.system_prompt.starts_with("other"))
                .count();
        }
        // Both parents contribute over many draws.
        assert!(inherited > 10 && inherited < 70);
    }

    #[test]
    fn test_disjoint_parents_pair_by_position() {
        let primary = WorkflowConfig::new("x", vec![node("x")]);
        let secondary = WorkflowConfig::new("y", vec![node("y").with_prompt("from y")]);
        let mut rng = StdRng::seed_from_u64(0);
        let children: Vec<WorkflowConfig> =
            (0..20).map(|_| crossover(&primary, &secondary, &mut rng)).collect();
        assert!(children.iter().all(|c| c.nodes[0].node_id == "x"));
        assert!(children.iter().any(|c| c.nodes[0].system_prompt == "from y"));
    }
}

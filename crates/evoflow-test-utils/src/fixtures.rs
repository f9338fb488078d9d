use evoflow_core::workflow::{WorkflowConfig, WorkflowNodeConfig};

pub const TEST_MODEL: &str = "gpt-4.1-mini";

pub fn node(id: &str) -> WorkflowNodeConfig {
    WorkflowNodeConfig::new(id, TEST_MODEL)
        .with_description(format!("{} agent", id))
        .with_prompt(format!("You are agent {}.", id))
}

/// `a -> b -> end`
pub fn linear_workflow() -> WorkflowConfig {
    WorkflowConfig::new("a", vec![node("a").with_hand_offs(["b"]), node("b")])
}

/// `a` fans out to `b` and `c`, both feed the join node `d`.
pub fn fan_out_join_workflow() -> WorkflowConfig {
    WorkflowConfig::new(
        "a",
        vec![
            node("a").with_hand_offs(["b", "c"]).parallel(),
            node("b").with_hand_offs(["d"]),
            node("c").with_hand_offs(["d"]),
            node("d").with_wait_for(["b", "c"]).with_hand_offs(["end"]),
        ],
    )
}

/// Supervisor `boss` with workers `w1` and `w2`.
pub fn hierarchical_workflow() -> WorkflowConfig {
    WorkflowConfig::new(
        "boss",
        vec![
            node("boss").with_hand_offs(["w1", "w2"]),
            node("w1"),
            node("w2"),
        ],
    )
}

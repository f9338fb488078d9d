//! Choosing where a node's output goes next.

use std::sync::Arc;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::payload::Payload;
use evoflow_core::workflow::{HandOffType, WorkflowNodeConfig, END_NODE_ID};

use crate::graph::WorkflowGraph;

/// Name of the routing tool offered to nodes with more than one candidate.
pub const HANDOFF_TOOL: &str = "handoff";

/// Everything a resolver may look at.
pub struct HandoffInput<'a> {
    pub node: &'a WorkflowNodeConfig,
    pub graph: &'a WorkflowGraph,
    pub task_prompt: &'a str,
    pub output: &'a str,
    /// Target picked through the `handoff` tool, if the model called it.
    pub tool_choice: Option<&'a str>,
}

/// Next hops and the payload each one receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffResult {
    pub next_node_ids: Vec<String>,
    pub per_target_payload: Vec<(String, Payload)>,
}

impl HandoffResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(target: impl Into<String>, payload: Payload) -> Self {
        let mut result = Self::default();
        result.push(target, payload);
        result
    }

    pub fn push(&mut self, target: impl Into<String>, payload: Payload) {
        let target = target.into();
        if self.next_node_ids.contains(&target) {
            return;
        }
        self.next_node_ids.push(target.clone());
        self.per_target_payload.push((target, payload));
    }

    pub fn is_empty(&self) -> bool {
        self.next_node_ids.is_empty()
    }
}

/// Strategy for routing between nodes, selected by coordination type.
pub trait HandoffResolver: Send + Sync + 'static {
    fn coordination_type(&self) -> &'static str;

    /// Targets a node may hand off to (may include `end`).
    fn candidates(&self, node: &WorkflowNodeConfig, graph: &WorkflowGraph) -> Vec<String>;

    fn resolve(&self, input: &HandoffInput<'_>) -> HandoffResult;

    /// Routing for a node that failed. Nothing is forwarded by default.
    fn on_failure(&self, input: &HandoffInput<'_>, error: &str) -> HandoffResult {
        let _ = (input, error);
        HandoffResult::none()
    }
}

/// Build the resolver for a coordination type.
pub fn resolver_for(coordination_type: &str) -> Result<Arc<dyn HandoffResolver>> {
    match coordination_type {
        "sequential" => Ok(Arc::new(SequentialResolver)),
        "hierarchical" => Ok(Arc::new(HierarchicalResolver)),
        other => Err(EvoflowError::UnsupportedCoordination(other.to_string())),
    }
}

/// A `HANDOFF: <id>` line naming one of the candidates.
fn directive(output: &str, candidates: &[String]) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let line = line.trim();
        let head = line.get(..8)?;
        let rest = line.get(8..)?;
        if !head.eq_ignore_ascii_case("handoff:") {
            return None;
        }
        let target = rest.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
        candidates.iter().find(|c| *c == target).cloned()
    })
}

/// The only candidate (other than `end`) mentioned as a whole word.
fn single_mention(output: &str, candidates: &[String]) -> Option<String> {
    let mut mentioned = candidates.iter().filter(|c| *c != END_NODE_ID).filter(|c| {
        regex::Regex::new(&format!(r"\b{}\b", regex::escape(c)))
            .map(|re| re.is_match(output))
            .unwrap_or(false)
    });
    match (mentioned.next(), mentioned.next()) {
        (Some(only), None) => Some(only.clone()),
        _ => None,
    }
}

fn explicit_choice(input: &HandoffInput<'_>, candidates: &[String]) -> Option<String> {
    input
        .tool_choice
        .filter(|t| candidates.iter().any(|c| c == t))
        .map(str::to_string)
        .or_else(|| directive(input.output, candidates))
}

/// Follows each node's declared `handOffs`.
pub struct SequentialResolver;

impl SequentialResolver {
    fn payload_for(target: &str, input: &HandoffInput<'_>) -> Payload {
        if target == END_NODE_ID {
            Payload::result(input.output)
        } else {
            Payload::Sequential {
                prompt: input.output.to_string(),
                context: Some(input.task_prompt.to_string()),
            }
        }
    }
}

impl HandoffResolver for SequentialResolver {
    fn coordination_type(&self) -> &'static str {
        "sequential"
    }

    fn candidates(&self, node: &WorkflowNodeConfig, _graph: &WorkflowGraph) -> Vec<String> {
        let declared: Vec<String> = node
            .distinct_hand_offs()
            .into_iter()
            .map(str::to_string)
            .collect();
        if declared.is_empty() {
            vec![END_NODE_ID.to_string()]
        } else {
            declared
        }
    }

    fn resolve(&self, input: &HandoffInput<'_>) -> HandoffResult {
        let candidates = self.candidates(input.node, input.graph);

        if input.node.hand_off_type == HandOffType::Parallel {
            let mut result = HandoffResult::none();
            for target in &candidates {
                result.push(target, Self::payload_for(target, input));
            }
            return result;
        }

        let target = explicit_choice(input, &candidates)
            .or_else(|| (candidates.len() == 1).then(|| candidates[0].clone()))
            .or_else(|| single_mention(input.output, &candidates))
            .unwrap_or_else(|| END_NODE_ID.to_string());

        let payload = Self::payload_for(&target, input);
        HandoffResult::single(target, payload)
    }
}

/// The entry node supervises; every other node reports back to it.
pub struct HierarchicalResolver;

impl HierarchicalResolver {
    fn is_supervisor(node: &WorkflowNodeConfig, graph: &WorkflowGraph) -> bool {
        node.node_id == graph.entry_node_id()
    }
}

impl HandoffResolver for HierarchicalResolver {
    fn coordination_type(&self) -> &'static str {
        "hierarchical"
    }

    fn candidates(&self, node: &WorkflowNodeConfig, graph: &WorkflowGraph) -> Vec<String> {
        graph
            .node_ids()
            .filter(|id| *id != node.node_id)
            .map(str::to_string)
            .chain(std::iter::once(END_NODE_ID.to_string()))
            .collect()
    }

    fn resolve(&self, input: &HandoffInput<'_>) -> HandoffResult {
        let candidates = self.candidates(input.node, input.graph);
        let supervisor = input.graph.entry_node_id();
        let delegate = |target: String| {
            let payload = Payload::Delegation {
                prompt: input.output.to_string(),
                context: Some(input.task_prompt.to_string()),
            };
            HandoffResult::single(target, payload)
        };

        if Self::is_supervisor(input.node, input.graph) {
            let choice = explicit_choice(input, &candidates)
                .or_else(|| single_mention(input.output, &candidates));
            return match choice {
                Some(target) if target != END_NODE_ID => delegate(target),
                _ => HandoffResult::single(END_NODE_ID, Payload::result(input.output)),
            };
        }

        match explicit_choice(input, &candidates) {
            Some(target) if target == END_NODE_ID || target == supervisor => {
                HandoffResult::single(target, Payload::result(input.output))
            }
            Some(target) => delegate(target),
            None => HandoffResult::single(supervisor, Payload::result(input.output)),
        }
    }

    fn on_failure(&self, input: &HandoffInput<'_>, error: &str) -> HandoffResult {
        if Self::is_supervisor(input.node, input.graph) {
            return HandoffResult::none();
        }
        let work_done = (!input.output.is_empty()).then(|| input.output.to_string());
        HandoffResult::single(
            input.graph.entry_node_id(),
            Payload::ResultError {
                message: error.to_string(),
                work_done,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::workflow::WorkflowConfig;
    use evoflow_test_utils::{fan_out_join_workflow, hierarchical_workflow, node};

    fn resolve(
        resolver: &dyn HandoffResolver,
        config: &WorkflowConfig,
        node_id: &str,
        output: &str,
        tool_choice: Option<&str>,
    ) -> HandoffResult {
        let graph = WorkflowGraph::from_config(config);
        let node = graph.get(node_id).unwrap().clone();
        resolver.resolve(&HandoffInput {
            node: &node,
            graph: &graph,
            task_prompt: "task",
            output,
            tool_choice,
        })
    }

    fn branching() -> WorkflowConfig {
        WorkflowConfig::new(
            "a",
            vec![
                node("a").with_hand_offs(["writer", "critic"]),
                node("writer"),
                node("critic"),
            ],
        )
    }

    #[test]
    fn test_unknown_coordination_type() {
        assert!(matches!(
            resolver_for("anarchic"),
            Err(EvoflowError::UnsupportedCoordination(_))
        ));
        assert_eq!(resolver_for("hierarchical").unwrap().coordination_type(), "hierarchical");
    }

    #[test]
    fn test_sequential_tool_choice_wins() {
        let r = resolve(&SequentialResolver, &branching(), "a", "critic please", Some("writer"));
        assert_eq!(r.next_node_ids, vec!["writer"]);
        assert!(matches!(r.per_target_payload[0].1, Payload::Sequential { .. }));
    }

    #[test]
    fn test_sequential_directive_line() {
        let r = resolve(&SequentialResolver, &branching(), "a", "draft done\nHANDOFF: critic", None);
        assert_eq!(r.next_node_ids, vec!["critic"]);
    }

    #[test]
    fn test_sequential_single_mention() {
        let r = resolve(&SequentialResolver, &branching(), "a", "send this to the writer", None);
        assert_eq!(r.next_node_ids, vec!["writer"]);
    }

    #[test]
    fn test_sequential_ambiguous_goes_to_end() {
        let r = resolve(&SequentialResolver, &branching(), "a", "writer or critic?", None);
        assert_eq!(r.next_node_ids, vec![END_NODE_ID]);
        assert_eq!(r.per_target_payload[0].1, Payload::result("writer or critic?"));
    }

    #[test]
    fn test_sequential_tool_choice_outside_candidates_ignored() {
        let r = resolve(&SequentialResolver, &branching(), "a", "", Some("nobody"));
        assert_eq!(r.next_node_ids, vec![END_NODE_ID]);
    }

    #[test]
    fn test_sequential_sole_candidate_and_implicit_end() {
        let config = fan_out_join_workflow();
        let r = resolve(&SequentialResolver, &config, "b", "x", None);
        assert_eq!(r.next_node_ids, vec!["d"]);

        let config = WorkflowConfig::new("solo", vec![node("solo")]);
        let r = resolve(&SequentialResolver, &config, "solo", "x", None);
        assert_eq!(r.next_node_ids, vec![END_NODE_ID]);
    }

    #[test]
    fn test_parallel_fans_out_to_all() {
        let r = resolve(&SequentialResolver, &fan_out_join_workflow(), "a", "x", Some("b"));
        assert_eq!(r.next_node_ids, vec!["b", "c"]);
        assert_eq!(r.per_target_payload.len(), 2);
    }

    #[test]
    fn test_hierarchical_supervisor_delegates_or_ends() {
        let config = hierarchical_workflow();
        let r = resolve(&HierarchicalResolver, &config, "boss", "w2 should research", None);
        assert_eq!(r.next_node_ids, vec!["w2"]);
        assert!(matches!(r.per_target_payload[0].1, Payload::Delegation { .. }));

        let r = resolve(&HierarchicalResolver, &config, "boss", "final answer: 42", None);
        assert_eq!(r.next_node_ids, vec![END_NODE_ID]);
        assert_eq!(r.per_target_payload[0].1, Payload::result("final answer: 42"));
    }

    #[test]
    fn test_hierarchical_worker_reports_to_supervisor() {
        let config = hierarchical_workflow();
        let r = resolve(&HierarchicalResolver, &config, "w1", "found it, w2 may help", None);
        assert_eq!(r.next_node_ids, vec!["boss"]);
        assert_eq!(r.per_target_payload[0].1, Payload::result("found it, w2 may help"));

        let r = resolve(&HierarchicalResolver, &config, "w1", "x", Some("w2"));
        assert_eq!(r.next_node_ids, vec!["w2"]);
    }

    #[test]
    fn test_hierarchical_worker_failure_returns_result_error() {
        let config = hierarchical_workflow();
        let graph = WorkflowGraph::from_config(&config);
        let worker = graph.get("w1").unwrap().clone();
        let input = HandoffInput {
            node: &worker,
            graph: &graph,
            task_prompt: "task",
            output: "",
            tool_choice: None,
        };
        let r = HierarchicalResolver.on_failure(&input, "rate limited");
        assert_eq!(r.next_node_ids, vec!["boss"]);
        assert_eq!(
            r.per_target_payload[0].1,
            Payload::ResultError {
                message: "rate limited".into(),
                work_done: None
            }
        );
        assert!(SequentialResolver.on_failure(&input, "x").is_empty());
    }

    #[test]
    fn test_hierarchical_candidates_cover_every_node() {
        let config = hierarchical_workflow();
        let graph = WorkflowGraph::from_config(&config);
        let boss = graph.get("boss").unwrap();
        assert_eq!(HierarchicalResolver.candidates(boss, &graph), vec!["w1", "w2", "end"]);
    }
}

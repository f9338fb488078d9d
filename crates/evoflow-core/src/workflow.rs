//! Workflow graph configuration and structural verification.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EvoflowError, Result};
use crate::message::START_NODE_ID;

/// The canonical terminal target collecting a run's final outputs.
pub const END_NODE_ID: &str = "end";

/// How a node distributes its output over its declared handoffs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandOffType {
    /// The resolver picks exactly one target.
    #[default]
    Conditional,
    /// Every declared handoff receives the output.
    Parallel,
}

/// One agent in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    pub model_name: String,
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    #[serde(default)]
    pub code_tools: Vec<String>,
    #[serde(default)]
    pub hand_offs: Vec<String>,
    #[serde(default)]
    pub memory: BTreeMap<String, String>,
    /// Predecessors that must all deliver before this node runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<Vec<String>>,
    #[serde(default)]
    pub hand_off_type: HandOffType,
}

impl WorkflowNodeConfig {
    pub fn new(node_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            description: String::new(),
            system_prompt: String::new(),
            model_name: model_name.into(),
            mcp_tools: vec![],
            code_tools: vec![],
            hand_offs: vec![],
            memory: BTreeMap::new(),
            wait_for: None,
            hand_off_type: HandOffType::Conditional,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_hand_offs<S: Into<String>>(mut self, targets: impl IntoIterator<Item = S>) -> Self {
        self.hand_offs = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_code_tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.code_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mcp_tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.mcp_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wait_for<S: Into<String>>(mut self, preds: impl IntoIterator<Item = S>) -> Self {
        self.wait_for = Some(preds.into_iter().map(Into::into).collect());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.hand_off_type = HandOffType::Parallel;
        self
    }

    /// All tools (code tools first, then MCP tools) in declaration order.
    pub fn all_tools(&self) -> Vec<&str> {
        self.code_tools
            .iter()
            .chain(self.mcp_tools.iter())
            .map(String::as_str)
            .collect()
    }

    /// Whether this node is a join point (waits on more than one predecessor).
    pub fn is_join(&self) -> bool {
        self.wait_for.as_ref().is_some_and(|w| w.len() > 1)
    }

    /// Declared handoffs without duplicates, in declaration order.
    pub fn distinct_hand_offs(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.hand_offs
            .iter()
            .map(String::as_str)
            .filter(|t| seen.insert(*t))
            .collect()
    }
}

/// A workflow: an entry node plus an ordered node list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub entry_node_id: String,
    pub nodes: Vec<WorkflowNodeConfig>,
}

/// A directed edge as drawn for a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for WorkflowEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Limits applied when verifying a workflow.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Maximum number of tools per node (0 = unlimited).
    pub max_tools_per_agent: usize,
    /// Tools that may be referenced. `None` accepts any tool name.
    pub active_tools: Option<HashSet<String>>,
    /// Models that may be referenced. `None` accepts any model name.
    pub allowed_models: Option<HashSet<String>>,
}

/// A structural problem found by [`WorkflowConfig::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    EmptyWorkflow,
    MissingEntry(String),
    DuplicateNodeId(String),
    ReservedNodeId(String),
    UnknownHandoff { node_id: String, target: String },
    UnknownWaitFor { node_id: String, predecessor: String },
    TooManyTools { node_id: String, count: usize, max: usize },
    InactiveTool { node_id: String, tool: String },
    DisallowedModel { node_id: String, model: String },
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "workflow has no nodes"),
            Self::MissingEntry(id) => write!(f, "entry node '{}' does not exist", id),
            Self::DuplicateNodeId(id) => write!(f, "node id '{}' is used more than once", id),
            Self::ReservedNodeId(id) => write!(f, "node id '{}' is reserved", id),
            Self::UnknownHandoff { node_id, target } => write!(
                f,
                "node '{}' hands off to '{}', which is neither a node nor '{}'",
                node_id, target, END_NODE_ID
            ),
            Self::UnknownWaitFor {
                node_id,
                predecessor,
            } => write!(
                f,
                "node '{}' waits for unknown node '{}'",
                node_id, predecessor
            ),
            Self::TooManyTools {
                node_id,
                count,
                max,
            } => write!(
                f,
                "node '{}' declares {} tools, the maximum is {}",
                node_id, count, max
            ),
            Self::InactiveTool { node_id, tool } => {
                write!(f, "node '{}' uses inactive tool '{}'", node_id, tool)
            }
            Self::DisallowedModel { node_id, model } => {
                write!(f, "node '{}' uses disallowed model '{}'", node_id, model)
            }
        }
    }
}

impl WorkflowConfig {
    pub fn new(entry_node_id: impl Into<String>, nodes: Vec<WorkflowNodeConfig>) -> Self {
        Self {
            entry_node_id: entry_node_id.into(),
            nodes,
        }
    }

    /// Load a workflow from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNodeConfig> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut WorkflowNodeConfig> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    /// Check every structural invariant and return all violations found.
    pub fn verify(&self, options: &VerifyOptions) -> Vec<VerificationError> {
        let mut errors = Vec::new();

        if self.nodes.is_empty() {
            errors.push(VerificationError::EmptyWorkflow);
            return errors;
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.node_id == END_NODE_ID || node.node_id == START_NODE_ID {
                errors.push(VerificationError::ReservedNodeId(node.node_id.clone()));
            }
            if !ids.insert(node.node_id.as_str()) {
                errors.push(VerificationError::DuplicateNodeId(node.node_id.clone()));
            }
        }

        if !ids.contains(self.entry_node_id.as_str()) {
            errors.push(VerificationError::MissingEntry(self.entry_node_id.clone()));
        }

        for node in &self.nodes {
            for target in &node.hand_offs {
                if target != END_NODE_ID && !ids.contains(target.as_str()) {
                    errors.push(VerificationError::UnknownHandoff {
                        node_id: node.node_id.clone(),
                        target: target.clone(),
                    });
                }
            }

            for pred in node.wait_for.iter().flatten() {
                if !ids.contains(pred.as_str()) {
                    errors.push(VerificationError::UnknownWaitFor {
                        node_id: node.node_id.clone(),
                        predecessor: pred.clone(),
                    });
                }
            }

            let tools = node.all_tools();
            if options.max_tools_per_agent > 0 && tools.len() > options.max_tools_per_agent {
                errors.push(VerificationError::TooManyTools {
                    node_id: node.node_id.clone(),
                    count: tools.len(),
                    max: options.max_tools_per_agent,
                });
            }

            if let Some(active) = &options.active_tools {
                for tool in tools {
                    if !active.contains(tool) {
                        errors.push(VerificationError::InactiveTool {
                            node_id: node.node_id.clone(),
                            tool: tool.to_string(),
                        });
                    }
                }
            }

            if let Some(models) = &options.allowed_models {
                if !models.contains(&node.model_name) {
                    errors.push(VerificationError::DisallowedModel {
                        node_id: node.node_id.clone(),
                        model: node.model_name.clone(),
                    });
                }
            }
        }

        errors
    }

    /// Verify and turn violations into an [`EvoflowError::InvalidWorkflow`].
    pub fn ensure_valid(&self, options: &VerifyOptions) -> Result<()> {
        let errors = self.verify(options);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EvoflowError::InvalidWorkflow(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ))
        }
    }

    /// Derive the orchestration edges of this workflow.
    ///
    /// `start` points at the entry node, every declared handoff becomes an
    /// edge, and nodes without handoffs route to `end`. Duplicate edges are
    /// collapsed, so a node listing `end` explicitly yields a single edge.
    pub fn edges(&self) -> Vec<WorkflowEdge> {
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        let mut push = |from: &str, to: &str| {
            let edge = WorkflowEdge {
                from: from.to_string(),
                to: to.to_string(),
            };
            if seen.insert(edge.clone()) {
                edges.push(edge);
            }
        };

        push(START_NODE_ID, &self.entry_node_id);
        for node in &self.nodes {
            if node.hand_offs.is_empty() {
                push(&node.node_id, END_NODE_ID);
            }
            for target in &node.hand_offs {
                push(&node.node_id, target);
            }
        }
        edges
    }

    /// Return a copy with the given per-node patches applied.
    pub fn with_node_patches(&self, patches: &HashMap<String, NodePatch>) -> Self {
        let mut next = self.clone();
        for node in &mut next.nodes {
            if let Some(patch) = patches.get(&node.node_id) {
                patch.apply(node);
            }
        }
        next
    }
}

/// Changes a run made to one node's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub memory: Option<BTreeMap<String, String>>,
    pub system_prompt: Option<String>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.system_prompt.is_none()
    }

    pub fn apply(&self, node: &mut WorkflowNodeConfig) {
        if let Some(memory) = &self.memory {
            node.memory = memory.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            node.system_prompt = prompt.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> WorkflowNodeConfig {
        WorkflowNodeConfig::new(id, "gpt-4.1-mini")
    }

    fn edge_strings(config: &WorkflowConfig) -> Vec<String> {
        config.edges().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_linear_edges() {
        let config = WorkflowConfig::new(
            "a",
            vec![node("a").with_hand_offs(["b"]), node("b")],
        );
        assert_eq!(edge_strings(&config), vec!["start->a", "a->b", "b->end"]);
    }

    #[test]
    fn test_two_sinks_share_end_without_duplicates() {
        let config = WorkflowConfig::new(
            "a",
            vec![
                node("a").with_hand_offs(["b", "c"]).parallel(),
                node("b").with_hand_offs(["end"]),
                node("c"),
            ],
        );
        let edges = edge_strings(&config);
        assert_eq!(edges, vec!["start->a", "a->b", "a->c", "b->end", "c->end"]);
        assert_eq!(edges.iter().filter(|e| e.ends_with("->end")).count(), 2);
    }

    #[test]
    fn test_explicit_end_yields_single_edge() {
        let config = WorkflowConfig::new("x", vec![node("x").with_hand_offs(["end", "end"])]);
        let edges = edge_strings(&config);
        assert_eq!(edges.iter().filter(|e| *e == "x->end").count(), 1);
    }

    #[test]
    fn test_verify_accepts_valid_workflow() {
        let config = WorkflowConfig::new(
            "a",
            vec![node("a").with_hand_offs(["b"]), node("b").with_hand_offs(["end"])],
        );
        assert!(config.verify(&VerifyOptions::default()).is_empty());
        assert!(config.ensure_valid(&VerifyOptions::default()).is_ok());
    }

    #[test]
    fn test_verify_reports_every_problem() {
        let config = WorkflowConfig::new(
            "missing",
            vec![
                node("a")
                    .with_hand_offs(["ghost"])
                    .with_code_tools(["t1", "t2", "t3"])
                    .with_wait_for(["nobody"]),
                node("a"),
                node("end"),
            ],
        );
        let options = VerifyOptions {
            max_tools_per_agent: 2,
            active_tools: Some(["t1".to_string(), "t2".to_string()].into_iter().collect()),
            allowed_models: None,
        };
        let errors = config.verify(&options);
        assert!(errors.contains(&VerificationError::MissingEntry("missing".into())));
        assert!(errors.contains(&VerificationError::DuplicateNodeId("a".into())));
        assert!(errors.contains(&VerificationError::ReservedNodeId("end".into())));
        assert!(errors.contains(&VerificationError::UnknownHandoff {
            node_id: "a".into(),
            target: "ghost".into()
        }));
        assert!(errors.contains(&VerificationError::UnknownWaitFor {
            node_id: "a".into(),
            predecessor: "nobody".into()
        }));
        assert!(errors.contains(&VerificationError::TooManyTools {
            node_id: "a".into(),
            count: 3,
            max: 2
        }));
        assert!(errors.contains(&VerificationError::InactiveTool {
            node_id: "a".into(),
            tool: "t3".into()
        }));
    }

    #[test]
    fn test_empty_workflow() {
        let config = WorkflowConfig::new("a", vec![]);
        assert_eq!(
            config.verify(&VerifyOptions::default()),
            vec![VerificationError::EmptyWorkflow]
        );
    }

    #[test]
    fn test_camel_case_round_trip() {
        let json = r#"{
            "entryNodeId": "a",
            "nodes": [{
                "nodeId": "a",
                "description": "d",
                "systemPrompt": "p",
                "modelName": "m",
                "mcpTools": [],
                "codeTools": ["json_query"],
                "handOffs": ["end"],
                "memory": {"k": "v"},
                "waitFor": ["b", "c"],
                "handOffType": "parallel"
            }]
        }"#;
        let config: WorkflowConfig = serde_json::from_str(json).unwrap();
        let n = config.node("a").unwrap();
        assert_eq!(n.code_tools, vec!["json_query"]);
        assert_eq!(n.memory.get("k").map(String::as_str), Some("v"));
        assert!(n.is_join());
        assert_eq!(n.hand_off_type, HandOffType::Parallel);
    }

    #[test]
    fn test_node_patches_are_copy_on_write() {
        let config = WorkflowConfig::new("a", vec![node("a"), node("b")]);
        let mut patches = HashMap::new();
        patches.insert(
            "a".to_string(),
            NodePatch {
                memory: Some([("fact".to_string(), "42".to_string())].into_iter().collect()),
                system_prompt: None,
            },
        );
        patches.insert(
            "b".to_string(),
            NodePatch {
                memory: None,
                system_prompt: Some("Be brief.".into()),
            },
        );
        let patched = config.with_node_patches(&patches);
        assert!(config.node("a").unwrap().memory.is_empty());
        assert_eq!(patched.node("a").unwrap().memory["fact"], "42");
        assert_eq!(patched.node("a").unwrap().system_prompt, config.node("a").unwrap().system_prompt);
        assert!(patched.node("b").unwrap().memory.is_empty());
        assert_eq!(patched.node("b").unwrap().system_prompt, "Be brief.");
    }
}

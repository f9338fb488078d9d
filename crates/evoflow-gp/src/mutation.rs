//! Structural and prompt edits applied to a workflow.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use evoflow_agent::{DispatchFailure, ModelDispatcher};
use evoflow_core::types::{ChatMessage, ModelRequest};
use evoflow_core::workflow::{HandOffType, WorkflowConfig, WorkflowNodeConfig, END_NODE_ID};

use crate::gene_pool::GenePool;
use crate::poisson::mutation_edit_count;

/// One applied edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    ModelSwap { node_id: String, model: String },
    PromptTweak { node_id: String },
    AddNode { node_id: String },
    RemoveNode { node_id: String },
    AddTool { node_id: String, tool: String },
    RemoveTool { node_id: String, tool: String },
    RewireHandoff { node_id: String, target: String },
}

#[derive(Debug, Clone, Copy)]
enum EditKind {
    ModelSwap,
    PromptTweak,
    AddNode,
    RemoveNode,
    AddTool,
    RemoveTool,
    RewireHandoff,
}

const EDIT_KINDS: [EditKind; 7] = [
    EditKind::ModelSwap,
    EditKind::PromptTweak,
    EditKind::AddNode,
    EditKind::RemoveNode,
    EditKind::AddTool,
    EditKind::RemoveTool,
    EditKind::RewireHandoff,
];

pub struct Mutator {
    pool: Arc<GenePool>,
    lambda: f64,
}

impl Mutator {
    pub fn new(pool: Arc<GenePool>, lambda: f64) -> Self {
        Self { pool, lambda }
    }

    /// Apply max(1, Poisson(λ)) edits to a copy of `config`.
    ///
    /// Edit kinds that do not apply (e.g. removing from a single-node
    /// workflow) are redrawn, a bounded number of times.
    pub fn mutate<R: Rng + ?Sized>(&self, config: &WorkflowConfig, rng: &mut R) -> (WorkflowConfig, Vec<Edit>) {
        let wanted = mutation_edit_count(rng, self.lambda);
        let mut child = config.clone();
        let mut edits = Vec::with_capacity(wanted);
        let mut attempts = 0;
        while edits.len() < wanted && attempts < wanted * 8 {
            attempts += 1;
            let kind = EDIT_KINDS[rng.gen_range(0..EDIT_KINDS.len())];
            if let Some(edit) = self.apply(kind, &mut child, rng) {
                edits.push(edit);
            }
        }
        debug!(wanted, applied = edits.len(), "Mutation applied");
        (child, edits)
    }

    fn apply<R: Rng + ?Sized>(&self, kind: EditKind, config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
        match kind {
            EditKind::ModelSwap => self.swap_model(config, rng),
            EditKind::PromptTweak => tweak_prompt(config, rng),
            EditKind::AddNode => self.add_node(config, rng),
            EditKind::RemoveNode => remove_node(config, rng),
            EditKind::AddTool => self.add_tool(config, rng),
            EditKind::RemoveTool => remove_tool(config, rng),
            EditKind::RewireHandoff => rewire_handoff(config, rng),
        }
    }

    fn swap_model<R: Rng + ?Sized>(&self, config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
        let node = config.nodes.choose_mut(rng)?;
        let alternatives: Vec<&String> = self
            .pool
            .models
            .iter()
            .filter(|m| **m != node.model_name)
            .collect();
        let model = (*alternatives.choose(rng)?).clone();
        node.model_name = model.clone();
        Some(Edit::ModelSwap {
            node_id: node.node_id.clone(),
            model,
        })
    }

    /// Insert a new node after a random existing one, taking over its handoffs.
    fn add_node<R: Rng + ?Sized>(&self, config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
        if config.nodes.len() >= self.pool.max_nodes || config.nodes.is_empty() {
            return None;
        }
        let mut fresh = self.pool.random_node(config, rng);
        let parent_idx = rng.gen_range(0..config.nodes.len());
        let parent_id = config.nodes[parent_idx].node_id.clone();
        let parent_parallel = config.nodes[parent_idx].hand_off_type == HandOffType::Parallel;

        if parent_parallel {
            config.nodes[parent_idx].hand_offs.push(fresh.node_id.clone());
        } else {
            fresh.hand_offs = std::mem::take(&mut config.nodes[parent_idx].hand_offs);
            config.nodes[parent_idx].hand_offs = vec![fresh.node_id.clone()];
            // Joins that waited on the parent now hear from the new node.
            for target in &fresh.hand_offs {
                if let Some(wait) = config
                    .node_mut(target)
                    .and_then(|t| t.wait_for.as_mut())
                {
                    for pred in wait.iter_mut().filter(|p| **p == parent_id) {
                        *pred = fresh.node_id.clone();
                    }
                }
            }
        }

        let node_id = fresh.node_id.clone();
        config.nodes.insert(parent_idx + 1, fresh);
        Some(Edit::AddNode { node_id })
    }

    fn add_tool<R: Rng + ?Sized>(&self, config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
        let max = self.pool.max_tools_per_agent;
        let pool = &self.pool;
        let candidates: Vec<usize> = config
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| max == 0 || n.all_tools().len() < max)
            .map(|(i, _)| i)
            .collect();
        let idx = *candidates.choose(rng)?;
        let node = &mut config.nodes[idx];
        let fresh: Vec<&String> = pool
            .tools
            .iter()
            .filter(|t| !node.code_tools.contains(t) && !node.mcp_tools.contains(t))
            .collect();
        let tool = (*fresh.choose(rng)?).clone();
        node.code_tools.push(tool.clone());
        Some(Edit::AddTool {
            node_id: node.node_id.clone(),
            tool,
        })
    }
}

fn tweak_prompt<R: Rng + ?Sized>(config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
    let node = config.nodes.choose_mut(rng)?;
    let hint = GenePool::random_hint(rng);
    if node.system_prompt.contains(hint) {
        node.system_prompt = node.system_prompt.replace(hint, "").trim().to_string();
    } else if node.system_prompt.is_empty() {
        node.system_prompt = hint.to_string();
    } else {
        node.system_prompt = format!("{} {}", node.system_prompt.trim_end(), hint);
    }
    Some(Edit::PromptTweak {
        node_id: node.node_id.clone(),
    })
}

/// Remove a non-entry node; its predecessors inherit its handoffs.
fn remove_node<R: Rng + ?Sized>(config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
    let removable: Vec<String> = config
        .nodes
        .iter()
        .filter(|n| n.node_id != config.entry_node_id)
        .map(|n| n.node_id.clone())
        .collect();
    let victim_id = removable.choose(rng)?.clone();
    let idx = config.nodes.iter().position(|n| n.node_id == victim_id)?;
    let victim = config.nodes.remove(idx);

    let predecessors: Vec<String> = config
        .nodes
        .iter()
        .filter(|n| n.hand_offs.contains(&victim_id))
        .map(|n| n.node_id.clone())
        .collect();

    for node in &mut config.nodes {
        if node.hand_offs.contains(&victim_id) {
            let mut next: Vec<String> = Vec::new();
            for target in &node.hand_offs {
                let replacement: Vec<&String> = if *target == victim_id {
                    victim.hand_offs.iter().collect()
                } else {
                    vec![target]
                };
                for t in replacement {
                    if *t != node.node_id && *t != victim_id && !next.contains(t) {
                        next.push(t.clone());
                    }
                }
            }
            node.hand_offs = next;
        }
        if let Some(wait) = node.wait_for.as_mut() {
            if wait.contains(&victim_id) {
                wait.retain(|p| *p != victim_id);
                for pred in &predecessors {
                    if *pred != node.node_id && !wait.contains(pred) {
                        wait.push(pred.clone());
                    }
                }
            }
        }
    }

    Some(Edit::RemoveNode { node_id: victim_id })
}

fn remove_tool<R: Rng + ?Sized>(config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
    let with_tools: Vec<usize> = config
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.code_tools.is_empty())
        .map(|(i, _)| i)
        .collect();
    let node = &mut config.nodes[*with_tools.choose(rng)?];
    let pos = rng.gen_range(0..node.code_tools.len());
    let tool = node.code_tools.remove(pos);
    Some(Edit::RemoveTool {
        node_id: node.node_id.clone(),
        tool,
    })
}

/// Point one handoff of a sequential node somewhere else.
fn rewire_handoff<R: Rng + ?Sized>(config: &mut WorkflowConfig, rng: &mut R) -> Option<Edit> {
    let joins: Vec<String> = config
        .nodes
        .iter()
        .filter(|n| n.wait_for.as_ref().is_some_and(|w| !w.is_empty()))
        .map(|n| n.node_id.clone())
        .collect();
    let all_ids: Vec<String> = config.nodes.iter().map(|n| n.node_id.clone()).collect();

    let sources: Vec<usize> = config
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.hand_off_type == HandOffType::Conditional)
        .map(|(i, _)| i)
        .collect();
    let node = &mut config.nodes[*sources.choose(rng)?];

    let targets: Vec<String> = all_ids
        .into_iter()
        .chain(std::iter::once(END_NODE_ID.to_string()))
        .filter(|t| *t != node.node_id && !joins.contains(t) && !node.hand_offs.contains(t))
        .collect();
    let target = targets.choose(rng)?.clone();

    // Handoffs into a join stay put so the join keeps its inputs.
    let replaceable: Vec<usize> = node
        .hand_offs
        .iter()
        .enumerate()
        .filter(|(_, t)| !joins.contains(t))
        .map(|(i, _)| i)
        .collect();
    match replaceable.choose(rng) {
        Some(&i) => node.hand_offs[i] = target.clone(),
        None => node.hand_offs.push(target.clone()),
    }

    Some(Edit::RewireHandoff {
        node_id: node.node_id.clone(),
        target,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewrittenPrompt {
    system_prompt: String,
}

/// LLM-assisted prompt mutation.
pub struct PromptRewriter {
    dispatcher: Arc<ModelDispatcher>,
    model: String,
}

impl PromptRewriter {
    pub fn new(dispatcher: Arc<ModelDispatcher>, model: impl Into<String>) -> Self {
        Self {
            dispatcher,
            model: model.into(),
        }
    }

    /// Return a rewritten system prompt for `node` and the cost of producing it.
    pub async fn rewrite(
        &self,
        node: &WorkflowNodeConfig,
        cancel: &CancellationToken,
    ) -> Result<(String, f64), DispatchFailure> {
        let request = ModelRequest::structured(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "You improve system prompts for agents in a multi-agent workflow. Keep the \
                     agent's role, make the instructions sharper, and keep it under 120 words.",
                ),
                ChatMessage::user(format!(
                    "Agent '{}' ({}):\n{}",
                    node.node_id, node.description, node.system_prompt
                )),
            ],
            serde_json::json!({
                "type": "object",
                "properties": { "systemPrompt": { "type": "string" } },
                "required": ["systemPrompt"]
            }),
        );
        let reply = self
            .dispatcher
            .dispatch_structured::<RewrittenPrompt>(request, cancel)
            .await?;
        Ok((reply.value.system_prompt, reply.usd_cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::config::{AgentConfig, GpConfig};
    use evoflow_core::workflow::VerifyOptions;
    use evoflow_test_utils::{fan_out_join_workflow, linear_workflow, node};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool() -> Arc<GenePool> {
        let gp = GpConfig {
            allowed_tools: vec!["text_stats".into()],
            ..GpConfig::default()
        };
        Arc::new(GenePool::from_config(&gp, &AgentConfig::default()))
    }

    fn structural() -> VerifyOptions {
        VerifyOptions::default()
    }

    #[test]
    fn test_mutation_applies_at_least_one_edit() {
        let mutator = Mutator::new(pool(), 2.0);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let (child, edits) = mutator.mutate(&linear_workflow(), &mut rng);
            assert!(!edits.is_empty());
            assert_eq!(child.verify(&structural()), vec![]);
        }
    }

    #[test]
    fn test_mutations_keep_joins_consistent() {
        let mutator = Mutator::new(pool(), 3.0);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let (child, _) = mutator.mutate(&fan_out_join_workflow(), &mut rng);
            assert_eq!(child.verify(&structural()), vec![]);
            for n in child.nodes.iter().filter(|n| n.is_join()) {
                for pred in n.wait_for.iter().flatten() {
                    let p = child.node(pred).unwrap();
                    assert!(
                        p.hand_offs.contains(&n.node_id),
                        "{} waits for {} which does not hand off to it",
                        n.node_id,
                        pred
                    );
                }
            }
        }
    }

    #[test]
    fn test_remove_node_reconnects_predecessors() {
        let mut config = WorkflowConfig::new(
            "a",
            vec![
                node("a").with_hand_offs(["b"]),
                node("b").with_hand_offs(["c"]),
                node("c"),
            ],
        );
        // Only b and c are removable; retry until b is picked.
        let mut rng = StdRng::seed_from_u64(0);
        loop {
            let mut attempt = config.clone();
            if let Some(Edit::RemoveNode { node_id }) = remove_node(&mut attempt, &mut rng) {
                if node_id == "b" {
                    config = attempt;
                    break;
                }
            }
        }
        assert_eq!(config.node("a").unwrap().hand_offs, vec!["c"]);
    }

    #[test]
    fn test_single_node_cannot_lose_its_entry() {
        let mut config = WorkflowConfig::new("a", vec![node("a")]);
        let mut rng = StdRng::seed_from_u64(9);
        assert!(remove_node(&mut config, &mut rng).is_none());
        assert_eq!(config.nodes.len(), 1);
    }

    #[test]
    fn test_add_node_respects_max_nodes() {
        let gp = GpConfig {
            max_nodes: 2,
            ..GpConfig::default()
        };
        let mutator = Mutator::new(Arc::new(GenePool::from_config(&gp, &AgentConfig::default())), 1.0);
        let mut config = linear_workflow();
        let mut rng = StdRng::seed_from_u64(2);
        assert!(mutator.add_node(&mut config, &mut rng).is_none());
    }
}

//! Building blocks for random workflows.

use rand::seq::SliceRandom;
use rand::Rng;

use evoflow_core::config::{AgentConfig, GpConfig};
use evoflow_core::workflow::{WorkflowConfig, WorkflowNodeConfig};

const FALLBACK_MODEL: &str = "gpt-4.1-mini";

/// Role name, description and system prompt.
const ROLES: &[(&str, &str, &str)] = &[
    (
        "researcher",
        "Collects the facts the task depends on",
        "You research the task and list the facts and figures needed to solve it.",
    ),
    (
        "planner",
        "Breaks the task into steps",
        "You break the task into a short numbered plan that another agent can follow.",
    ),
    (
        "solver",
        "Works out the answer",
        "You solve the task carefully and state the answer explicitly.",
    ),
    (
        "critic",
        "Checks work for mistakes",
        "You review the work you receive, point out mistakes and correct them.",
    ),
    (
        "writer",
        "Turns results into the final answer",
        "You turn the material you receive into a clear, complete final answer.",
    ),
    (
        "verifier",
        "Confirms the answer matches the task",
        "You check that the answer actually addresses the task and fix any gaps.",
    ),
];

/// Sentences appended to prompts by mutation.
pub const PROMPT_HINTS: &[&str] = &[
    "Be concise.",
    "Think step by step before answering.",
    "Double-check every number you report.",
    "State your assumptions explicitly.",
    "Quote the exact figures you rely on.",
    "Prefer short bullet points.",
];

/// Models, tools and roles evolution may draw from.
#[derive(Debug, Clone)]
pub struct GenePool {
    pub models: Vec<String>,
    pub tools: Vec<String>,
    pub max_nodes: usize,
    pub max_tools_per_agent: usize,
}

impl GenePool {
    pub fn from_config(gp: &GpConfig, agent: &AgentConfig) -> Self {
        let models = if gp.allowed_models.is_empty() {
            vec![FALLBACK_MODEL.to_string()]
        } else {
            gp.allowed_models.clone()
        };
        Self {
            models,
            tools: gp.allowed_tools.clone(),
            max_nodes: gp.max_nodes.max(1),
            max_tools_per_agent: agent.max_tools_per_agent,
        }
    }

    /// The model used when nothing better is known.
    pub fn default_model(&self) -> &str {
        self.models.first().map(String::as_str).unwrap_or(FALLBACK_MODEL)
    }

    pub fn random_model<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.models
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }

    pub fn random_hint<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
        PROMPT_HINTS.choose(rng).copied().unwrap_or("Be concise.")
    }

    /// A node id not used in `config`, derived from `base`.
    pub fn fresh_node_id(config: &WorkflowConfig, base: &str) -> String {
        if !config.contains(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|id| !config.contains(id))
            .unwrap_or_else(|| format!("{}-{}", base, uuid::Uuid::new_v4().simple()))
    }

    /// A node with a random role, model and (maybe) a tool.
    pub fn random_node<R: Rng + ?Sized>(
        &self,
        config: &WorkflowConfig,
        rng: &mut R,
    ) -> WorkflowNodeConfig {
        let (role, description, prompt) = ROLES[rng.gen_range(0..ROLES.len())];
        let mut node = WorkflowNodeConfig::new(
            Self::fresh_node_id(config, role),
            self.random_model(rng),
        )
        .with_description(description)
        .with_prompt(prompt);
        if self.max_tools_per_agent > 0 && !self.tools.is_empty() && rng.gen_bool(0.5) {
            if let Some(tool) = self.tools.choose(rng) {
                node.code_tools.push(tool.clone());
            }
        }
        node
    }

    /// A random chain of nodes, occasionally with a forward skip edge.
    pub fn random_workflow<R: Rng + ?Sized>(&self, rng: &mut R) -> WorkflowConfig {
        let size = rng.gen_range(1..=self.max_nodes);
        let mut config = WorkflowConfig::new("", vec![]);
        for _ in 0..size {
            let node = self.random_node(&config, rng);
            config.nodes.push(node);
        }
        config.entry_node_id = config.nodes[0].node_id.clone();

        let ids: Vec<String> = config.nodes.iter().map(|n| n.node_id.clone()).collect();
        for (i, node) in config.nodes.iter_mut().enumerate() {
            if let Some(next) = ids.get(i + 1) {
                node.hand_offs.push(next.clone());
            }
            if i + 2 < ids.len() && rng.gen_bool(0.2) {
                let skip = rng.gen_range(i + 2..ids.len());
                node.hand_offs.push(ids[skip].clone());
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::workflow::VerifyOptions;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool() -> GenePool {
        let gp = GpConfig {
            allowed_tools: vec!["text_stats".into(), "number_stats".into()],
            ..GpConfig::default()
        };
        GenePool::from_config(&gp, &AgentConfig::default())
    }

    #[test]
    fn test_random_workflows_are_valid() {
        let pool = pool();
        let options = VerifyOptions {
            max_tools_per_agent: pool.max_tools_per_agent,
            active_tools: Some(pool.tools.iter().cloned().collect()),
            allowed_models: Some(pool.models.iter().cloned().collect()),
        };
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let wf = pool.random_workflow(&mut rng);
            assert!(wf.nodes.len() <= pool.max_nodes);
            assert_eq!(wf.verify(&options), vec![]);
        }
    }

    #[test]
    fn test_fresh_node_id_avoids_collisions() {
        let config = WorkflowConfig::new(
            "solver",
            vec![
                WorkflowNodeConfig::new("solver", "m"),
                WorkflowNodeConfig::new("solver-2", "m"),
            ],
        );
        assert_eq!(GenePool::fresh_node_id(&config, "solver"), "solver-3");
        assert_eq!(GenePool::fresh_node_id(&config, "critic"), "critic");
    }

    #[test]
    fn test_empty_model_list_falls_back() {
        let gp = GpConfig {
            allowed_models: vec![],
            ..GpConfig::default()
        };
        let pool = GenePool::from_config(&gp, &AgentConfig::default());
        assert_eq!(pool.default_model(), FALLBACK_MODEL);
    }
}

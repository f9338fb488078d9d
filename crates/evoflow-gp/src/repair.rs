//! Bringing invalid offspring back to a runnable workflow.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use evoflow_agent::{DispatchFailure, ModelDispatcher};
use evoflow_core::error::EvoflowError;
use evoflow_core::message::START_NODE_ID;
use evoflow_core::types::{ChatMessage, ModelRequest};
use evoflow_core::workflow::{
    VerificationError, VerifyOptions, WorkflowConfig, WorkflowNodeConfig, END_NODE_ID,
};

use crate::gene_pool::GenePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMethod {
    /// Already valid.
    Unchanged,
    /// Fixed by the repair model.
    Llm,
    /// Fixed by deterministic clean-up.
    Sanitized,
}

#[derive(Debug, Clone)]
pub struct Repaired {
    pub config: WorkflowConfig,
    pub usd_cost: f64,
    pub method: RepairMethod,
}

#[derive(Deserialize)]
struct RepairReply {
    workflow: WorkflowConfig,
}

pub struct Repairer {
    dispatcher: Option<Arc<ModelDispatcher>>,
    model: String,
    options: VerifyOptions,
    pool: Arc<GenePool>,
}

impl Repairer {
    pub fn new(pool: Arc<GenePool>, options: VerifyOptions) -> Self {
        Self {
            dispatcher: None,
            model: pool.default_model().to_string(),
            options,
            pool,
        }
    }

    /// Ask `model` to fix invalid workflows before falling back to sanitizing.
    pub fn with_model(mut self, dispatcher: Arc<ModelDispatcher>, model: impl Into<String>) -> Self {
        self.dispatcher = Some(dispatcher);
        self.model = model.into();
        self
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// Return a workflow that passes verification, together with what fixing it cost.
    pub async fn repair(&self, config: WorkflowConfig, cancel: &CancellationToken) -> Repaired {
        let errors = config.verify(&self.options);
        if errors.is_empty() {
            return Repaired {
                config,
                usd_cost: 0.0,
                method: RepairMethod::Unchanged,
            };
        }

        let mut usd_cost = 0.0;
        if let Some(dispatcher) = &self.dispatcher {
            match self.ask_model(dispatcher, &config, &errors, cancel).await {
                Ok((fixed, cost)) => {
                    usd_cost += cost;
                    let remaining = fixed.verify(&self.options);
                    if remaining.is_empty() {
                        debug!(errors = errors.len(), "Workflow repaired by model");
                        return Repaired {
                            config: fixed,
                            usd_cost,
                            method: RepairMethod::Llm,
                        };
                    }
                    debug!(remaining = remaining.len(), "Model repair left errors");
                }
                Err(failure) => {
                    usd_cost += failure.usd_cost;
                    warn!(error = %failure, "Model repair failed");
                }
            }
        }

        Repaired {
            config: self.sanitize(config),
            usd_cost,
            method: RepairMethod::Sanitized,
        }
    }

    async fn ask_model(
        &self,
        dispatcher: &ModelDispatcher,
        config: &WorkflowConfig,
        errors: &[VerificationError],
        cancel: &CancellationToken,
    ) -> Result<(WorkflowConfig, f64), DispatchFailure> {
        let problems = errors
            .iter()
            .map(|e| format!("- {}", e))
            .collect::<Vec<_>>()
            .join("\n");
        let mut constraints = Vec::new();
        if self.options.max_tools_per_agent > 0 {
            constraints.push(format!(
                "at most {} tools per node",
                self.options.max_tools_per_agent
            ));
        }
        if let Some(tools) = &self.options.active_tools {
            constraints.push(format!("tools from: {}", sorted(tools).join(", ")));
        }
        if let Some(models) = &self.options.allowed_models {
            constraints.push(format!("models from: {}", sorted(models).join(", ")));
        }

        let request = ModelRequest::structured(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "You fix multi-agent workflow definitions. Change as little as possible and \
                     return the whole corrected workflow.",
                ),
                ChatMessage::user(format!(
                    "Workflow:\n{}\n\nProblems:\n{}\n\nConstraints: {}",
                    serde_json::to_string_pretty(config).map_err(EvoflowError::from)?,
                    problems,
                    if constraints.is_empty() {
                        "none".to_string()
                    } else {
                        constraints.join("; ")
                    }
                )),
            ],
            serde_json::json!({
                "type": "object",
                "properties": { "workflow": { "type": "object" } },
                "required": ["workflow"]
            }),
        );
        let reply = dispatcher
            .dispatch_structured::<RepairReply>(request, cancel)
            .await?;
        Ok((reply.value.workflow, reply.usd_cost))
    }

    /// Deterministically drop or replace whatever breaks verification.
    pub fn sanitize(&self, mut config: WorkflowConfig) -> WorkflowConfig {
        if config.nodes.is_empty() {
            let node = WorkflowNodeConfig::new("solver", self.allowed_model())
                .with_description("Works out the answer")
                .with_prompt("You solve the task carefully and state the answer explicitly.");
            return WorkflowConfig::new("solver", vec![node]);
        }

        // Ids: reserved names are renamed, duplicates dropped.
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for mut node in std::mem::take(&mut config.nodes) {
            if node.node_id == END_NODE_ID || node.node_id == START_NODE_ID {
                let kept = WorkflowConfig::new("", nodes.clone());
                node.node_id = GenePool::fresh_node_id(&kept, &format!("{}-node", node.node_id));
            }
            if seen.insert(node.node_id.clone()) {
                nodes.push(node);
            }
        }
        config.nodes = nodes;

        if !config.contains(&config.entry_node_id) {
            config.entry_node_id = config.nodes[0].node_id.clone();
        }

        let ids: HashSet<String> = config.nodes.iter().map(|n| n.node_id.clone()).collect();
        for node in &mut config.nodes {
            node.hand_offs
                .retain(|t| t == END_NODE_ID || ids.contains(t));
        }

        // Joins only wait for nodes that actually hand off to them.
        let feeds: HashSet<(String, String)> = config
            .nodes
            .iter()
            .flat_map(|n| {
                n.hand_offs
                    .iter()
                    .map(move |t| (n.node_id.clone(), t.clone()))
            })
            .collect();
        for node in &mut config.nodes {
            if let Some(wait) = node.wait_for.as_mut() {
                let id = node.node_id.clone();
                wait.retain(|p| feeds.contains(&(p.clone(), id.clone())));
                if wait.is_empty() {
                    node.wait_for = None;
                }
            }
        }

        let max_tools = self.options.max_tools_per_agent;
        let allowed_model = self.allowed_model();
        for node in &mut config.nodes {
            if let Some(active) = &self.options.active_tools {
                node.code_tools.retain(|t| active.contains(t));
                node.mcp_tools.retain(|t| active.contains(t));
            }
            if max_tools > 0 {
                node.code_tools.truncate(max_tools);
                let room = max_tools - node.code_tools.len();
                node.mcp_tools.truncate(room);
            }
            if let Some(models) = &self.options.allowed_models {
                if !models.contains(&node.model_name) {
                    node.model_name = allowed_model.clone();
                }
            }
        }

        config
    }

    fn allowed_model(&self) -> String {
        let preferred = self.pool.default_model().to_string();
        match &self.options.allowed_models {
            Some(models) if !models.contains(&preferred) => sorted(models)
                .into_iter()
                .next()
                .unwrap_or(preferred),
            _ => preferred,
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut items: Vec<String> = set.iter().cloned().collect();
    items.sort();
    items
}

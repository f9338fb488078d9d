//! Rewriting a node's memory and prompt from feedback on earlier runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use evoflow_core::traits::WorkflowStore;
use evoflow_core::types::{ChatMessage, ModelRequest};
use evoflow_core::workflow::WorkflowNodeConfig;

use crate::dispatch::{DispatchFailure, ModelDispatcher};

/// Outcome of one self-improvement pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Improvement {
    pub memory: BTreeMap<String, String>,
    /// Revised system prompt; `None` keeps the current one.
    pub system_prompt: Option<String>,
    pub usd_cost: f64,
    /// Set when the model's reply had to be discarded or reshaped.
    pub warning: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImprovementReply {
    #[serde(default)]
    memory: serde_json::Value,
    #[serde(default)]
    system_prompt: Option<String>,
}

pub struct SelfImprover {
    dispatcher: Arc<ModelDispatcher>,
    store: Arc<dyn WorkflowStore>,
    history: usize,
}

impl SelfImprover {
    pub fn new(
        dispatcher: Arc<ModelDispatcher>,
        store: Arc<dyn WorkflowStore>,
        history: usize,
    ) -> Self {
        Self {
            dispatcher,
            store,
            history,
        }
    }

    pub async fn improve(
        &self,
        node: &WorkflowNodeConfig,
        feedback: &str,
        cancel: &CancellationToken,
    ) -> Result<Improvement, DispatchFailure> {
        let summaries = match self
            .store
            .retrieve_node_summaries(node.node_id.clone(), self.history)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Could not load node summaries");
                vec![]
            }
        };

        let mut prompt = format!(
            "Role of this agent:\n{}\n\nCurrent memory (JSON):\n{}\n\nFeedback on the last run:\n{}\n",
            node.system_prompt,
            serde_json::to_string(&node.memory).unwrap_or_else(|_| "{}".into()),
            feedback,
        );
        if !summaries.is_empty() {
            prompt.push_str("\nRecent work by this agent:\n");
            for s in &summaries {
                prompt.push_str(&format!("- {}\n", s.summary));
            }
        }

        let request = ModelRequest::structured(
            node.model_name.clone(),
            vec![
                ChatMessage::system(
                    "You maintain the long-term memory and instructions of an agent. Return the \
                     full updated memory as an object of short string facts the agent should \
                     remember. Include a revised systemPrompt only when the feedback shows the \
                     current instructions are wrong or incomplete.",
                ),
                ChatMessage::user(prompt),
            ],
            serde_json::json!({
                "type": "object",
                "properties": {
                    "memory": { "type": "object", "additionalProperties": { "type": "string" } },
                    "systemPrompt": { "type": "string" }
                },
                "required": ["memory"]
            }),
        );

        let reply = self
            .dispatcher
            .dispatch_structured::<ImprovementReply>(request, cancel)
            .await?;

        let (memory, warning) = normalize_memory(&node.memory, reply.value.memory);
        if let Some(w) = &warning {
            warn!(node_id = %node.node_id, warning = %w, "Self-improvement reply adjusted");
        }
        let system_prompt = reply
            .value
            .system_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && *p != node.system_prompt);
        info!(
            node_id = %node.node_id,
            entries = memory.len(),
            prompt_rewritten = system_prompt.is_some(),
            "Node config updated"
        );

        Ok(Improvement {
            memory,
            system_prompt,
            usd_cost: reply.usd_cost,
            warning,
        })
    }
}

/// Turn a model-supplied memory value into a string map.
///
/// An array resets memory to empty; a missing value keeps the current one.
fn normalize_memory(
    current: &BTreeMap<String, String>,
    value: serde_json::Value,
) -> (BTreeMap<String, String>, Option<String>) {
    match value {
        serde_json::Value::Object(map) => {
            let memory = map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect();
            (memory, None)
        }
        serde_json::Value::Array(_) => (
            BTreeMap::new(),
            Some("memory returned as an array; reset to empty".to_string()),
        ),
        serde_json::Value::Null => (current.clone(), None),
        other => (
            current.clone(),
            Some(format!("memory returned as {}; kept previous memory", other)),
        ),
    }
}

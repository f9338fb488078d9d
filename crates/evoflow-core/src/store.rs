//! Persistence records and in-process [`WorkflowStore`] implementations.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{EvoflowError, Result};
use crate::message::{Message, MessagePatch};
use crate::traits::WorkflowStore;
use crate::workflow::{WorkflowConfig, WorkflowNodeConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersionRecord {
    pub wf_version_id: String,
    pub workflow_id: String,
    pub generation: u32,
    pub parent_ids: Vec<String>,
    /// Operator that produced this version ("seed", "mutation", ...).
    pub operator: String,
    pub config: WorkflowConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub workflow_invocation_id: String,
    pub wf_version_id: Option<String>,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationUpdate {
    pub status: InvocationStatus,
    pub usd_cost: f64,
    pub final_output: Option<String>,
    pub fitness: Option<f64>,
    pub feedback: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVersionRecord {
    pub node_version_id: String,
    pub wf_version_id: String,
    pub config: WorkflowNodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInvocationRecord {
    pub node_invocation_id: String,
    pub workflow_invocation_id: String,
    pub node_id: String,
    pub summary: String,
    pub usd_cost: f64,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_invocation_id: String,
    pub node_id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Store that accepts everything and remembers nothing (mock mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl WorkflowStore for NoopStore {
    fn ensure_workflow_exists(&self, _: String, _: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn create_workflow_version(&self, _: WorkflowVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn create_workflow_invocation(&self, _: InvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn update_workflow_invocation(
        &self,
        _: String,
        _: InvocationUpdate,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn save_node_version(&self, _: NodeVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn save_node_invocation(&self, _: NodeInvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn save_message(&self, _: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn update_message(&self, _: String, _: MessagePatch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn retrieve_node_summaries(
        &self,
        _: String,
        _: usize,
    ) -> BoxFuture<'_, Result<Vec<NodeSummary>>> {
        Box::pin(async { Ok(vec![]) })
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    workflows: Vec<(String, String)>,
    versions: Vec<WorkflowVersionRecord>,
    invocations: Vec<(InvocationRecord, Option<InvocationUpdate>)>,
    node_versions: Vec<NodeVersionRecord>,
    node_invocations: Vec<NodeInvocationRecord>,
    messages: Vec<Message>,
}

/// Store that keeps every record in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| EvoflowError::Database(format!("store lock poisoned: {}", e)))?;
        Ok(f(&mut state))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_state(|s| s.messages.clone()).unwrap_or_default()
    }

    pub fn versions(&self) -> Vec<WorkflowVersionRecord> {
        self.with_state(|s| s.versions.clone()).unwrap_or_default()
    }

    pub fn node_versions(&self) -> Vec<NodeVersionRecord> {
        self.with_state(|s| s.node_versions.clone())
            .unwrap_or_default()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.with_state(|s| s.workflows.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn invocation_update(&self, workflow_invocation_id: &str) -> Option<InvocationUpdate> {
        self.with_state(|s| {
            s.invocations
                .iter()
                .find(|(r, _)| r.workflow_invocation_id == workflow_invocation_id)
                .and_then(|(_, u)| u.clone())
        })
        .ok()
        .flatten()
    }

    pub fn invocation_count(&self) -> usize {
        self.with_state(|s| s.invocations.len()).unwrap_or(0)
    }
}

impl WorkflowStore for InMemoryStore {
    fn ensure_workflow_exists(
        &self,
        workflow_id: String,
        description: String,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                if !s.workflows.iter().any(|(id, _)| *id == workflow_id) {
                    s.workflows.push((workflow_id, description));
                }
            })
        })
    }

    fn create_workflow_version(&self, record: WorkflowVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.with_state(|s| s.versions.push(record)) })
    }

    fn create_workflow_invocation(&self, record: InvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.with_state(|s| s.invocations.push((record, None))) })
    }

    fn update_workflow_invocation(
        &self,
        workflow_invocation_id: String,
        update: InvocationUpdate,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                s.invocations
                    .iter_mut()
                    .find(|(r, _)| r.workflow_invocation_id == workflow_invocation_id)
                    .map(|(_, u)| *u = Some(update))
                    .ok_or_else(|| {
                        EvoflowError::Database(format!(
                            "unknown workflow invocation {}",
                            workflow_invocation_id
                        ))
                    })
            })?
        })
    }

    fn save_node_version(&self, record: NodeVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.with_state(|s| s.node_versions.push(record)) })
    }

    fn save_node_invocation(&self, record: NodeInvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.with_state(|s| s.node_invocations.push(record)) })
    }

    fn save_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.with_state(|s| s.messages.push(message)) })
    }

    fn update_message(
        &self,
        message_id: String,
        patch: MessagePatch,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.with_state(|s| {
                let message = s
                    .messages
                    .iter_mut()
                    .find(|m| m.message_id == message_id)
                    .ok_or_else(|| {
                        EvoflowError::Database(format!("unknown message {}", message_id))
                    })?;
                if let Some(payload) = patch.payload {
                    message.payload = payload;
                }
                if let Some(to) = patch.to_node_id {
                    message.to_node_id = to;
                }
                Ok(())
            })?
        })
    }

    fn retrieve_node_summaries(
        &self,
        node_id: String,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NodeSummary>>> {
        Box::pin(async move {
            self.with_state(|s| {
                s.node_invocations
                    .iter()
                    .rev()
                    .filter(|r| r.node_id == node_id)
                    .take(limit)
                    .map(|r| NodeSummary {
                        node_invocation_id: r.node_invocation_id.clone(),
                        node_id: r.node_id.clone(),
                        summary: r.summary.clone(),
                        created_at: r.created_at,
                    })
                    .collect()
            })
        })
    }
}

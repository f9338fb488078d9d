use futures::future::BoxFuture;

use crate::error::Result;
use crate::message::{Message, MessagePatch};
use crate::pricing::ModelPricing;
use crate::store::{
    InvocationRecord, InvocationUpdate, NodeInvocationRecord, NodeSummary, NodeVersionRecord,
    WorkflowVersionRecord,
};
use crate::types::*;

/// Model client — one request in, one response out.
///
/// Used identically by node execution, self-improvement, repair and judging.
pub trait ModelClient: Send + Sync + 'static {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// Tool — extensible tool execution.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Durable record keeping for workflows, invocations and messages.
///
/// Callers in the execution path treat every method as best-effort: failures
/// are logged, never propagated into a run.
pub trait WorkflowStore: Send + Sync + 'static {
    fn ensure_workflow_exists(
        &self,
        workflow_id: String,
        description: String,
    ) -> BoxFuture<'_, Result<()>>;

    fn create_workflow_version(&self, record: WorkflowVersionRecord) -> BoxFuture<'_, Result<()>>;

    fn create_workflow_invocation(&self, record: InvocationRecord) -> BoxFuture<'_, Result<()>>;

    fn update_workflow_invocation(
        &self,
        workflow_invocation_id: String,
        update: InvocationUpdate,
    ) -> BoxFuture<'_, Result<()>>;

    fn save_node_version(&self, record: NodeVersionRecord) -> BoxFuture<'_, Result<()>>;

    fn save_node_invocation(&self, record: NodeInvocationRecord) -> BoxFuture<'_, Result<()>>;

    fn save_message(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    fn update_message(&self, message_id: String, patch: MessagePatch)
        -> BoxFuture<'_, Result<()>>;

    /// Most recent summaries recorded for a node, newest first.
    fn retrieve_node_summaries(
        &self,
        node_id: String,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NodeSummary>>>;
}

/// Per-model token pricing lookup.
pub trait PricingCatalog: Send + Sync + 'static {
    fn find_model(&self, name: &str) -> Option<ModelPricing>;
}

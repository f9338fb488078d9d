//! Store doubles.

use futures::future::BoxFuture;

use evoflow_core::error::Result;
use evoflow_core::message::{Message, MessagePatch};
use evoflow_core::store::{
    InMemoryStore, InvocationRecord, InvocationUpdate, NodeInvocationRecord, NodeSummary,
    NodeVersionRecord, WorkflowVersionRecord,
};
use evoflow_core::traits::WorkflowStore;

/// An [`InMemoryStore`] whose `save_message` never completes.
#[derive(Default)]
pub struct StalledStore {
    pub inner: InMemoryStore,
}

impl StalledStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for StalledStore {
    fn ensure_workflow_exists(&self, workflow_id: String, description: String) -> BoxFuture<'_, Result<()>> {
        self.inner.ensure_workflow_exists(workflow_id, description)
    }

    fn create_workflow_version(&self, record: WorkflowVersionRecord) -> BoxFuture<'_, Result<()>> {
        self.inner.create_workflow_version(record)
    }

    fn create_workflow_invocation(&self, record: InvocationRecord) -> BoxFuture<'_, Result<()>> {
        self.inner.create_workflow_invocation(record)
    }

    fn update_workflow_invocation(
        &self,
        workflow_invocation_id: String,
        update: InvocationUpdate,
    ) -> BoxFuture<'_, Result<()>> {
        self.inner.update_workflow_invocation(workflow_invocation_id, update)
    }

    fn save_node_version(&self, record: NodeVersionRecord) -> BoxFuture<'_, Result<()>> {
        self.inner.save_node_version(record)
    }

    fn save_node_invocation(&self, record: NodeInvocationRecord) -> BoxFuture<'_, Result<()>> {
        self.inner.save_node_invocation(record)
    }

    fn save_message(&self, _message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(futures::future::pending())
    }

    fn update_message(&self, message_id: String, patch: MessagePatch) -> BoxFuture<'_, Result<()>> {
        self.inner.update_message(message_id, patch)
    }

    fn retrieve_node_summaries(
        &self,
        node_id: String,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NodeSummary>>> {
        self.inner.retrieve_node_summaries(node_id, limit)
    }
}

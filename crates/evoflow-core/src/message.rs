use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Payload;

/// Id used as `from_node_id` of the synthetic entry message.
pub const START_NODE_ID: &str = "start";

/// Envelope carrying a payload from one node to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    /// Node invocation that produced this message; `None` only for the entry message.
    pub origin_invocation_id: Option<String>,
    pub seq: u64,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub workflow_invocation_id: String,
}

impl Message {
    pub fn new(
        from_node_id: impl Into<String>,
        to_node_id: impl Into<String>,
        origin_invocation_id: Option<String>,
        seq: u64,
        payload: Payload,
        workflow_invocation_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            from_node_id: from_node_id.into(),
            to_node_id: to_node_id.into(),
            origin_invocation_id,
            seq,
            payload,
            created_at: Utc::now(),
            reply_to: None,
            workflow_invocation_id: workflow_invocation_id.into(),
        }
    }

    /// The synthetic message that seeds a workflow invocation.
    pub fn entry(
        entry_node_id: impl Into<String>,
        prompt: impl Into<String>,
        seq: u64,
        workflow_invocation_id: impl Into<String>,
    ) -> Self {
        Self::new(
            START_NODE_ID,
            entry_node_id,
            None,
            seq,
            Payload::sequential(prompt),
            workflow_invocation_id,
        )
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Late correction applied through `WorkflowStore::update_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node_id: Option<String>,
}

/// Monotonic sequence numbers for messages of one workflow invocation.
///
/// Shared between concurrently executing nodes of the same invocation.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of sequence values handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_entry_message_has_no_origin() {
        let m = Message::entry("a", "task", 0, "wfi-1");
        assert_eq!(m.from_node_id, START_NODE_ID);
        assert_eq!(m.to_node_id, "a");
        assert!(m.origin_invocation_id.is_none());
        assert_eq!(m.payload, Payload::sequential("task"));
    }

    #[tokio::test]
    async fn test_sequence_is_unique_across_tasks() {
        let counter = Arc::new(SequenceCounter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = counter.clone();
            handles.push(tokio::spawn(async move {
                (0..100).map(|_| c.next()).collect::<Vec<_>>()
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(counter.issued(), 800);
    }

    #[test]
    fn test_camel_case_wire_format() {
        let m = Message::new("a", "b", Some("inv".into()), 3, Payload::result("x"), "wfi")
            .with_reply_to("prev");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["fromNodeId"], "a");
        assert_eq!(json["originInvocationId"], "inv");
        assert_eq!(json["replyTo"], "prev");
        assert_eq!(json["seq"], 3);
    }
}

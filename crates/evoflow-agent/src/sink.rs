use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use evoflow_core::message::Message;
use evoflow_core::store::NodeInvocationRecord;
use evoflow_core::traits::WorkflowStore;

enum SinkRecord {
    Message(Message),
    NodeInvocation(NodeInvocationRecord),
}

/// Fire-and-forget persistence of run records.
///
/// Records are written by a background task in submission order. Each record
/// is attempted once; failures are logged and never reach the run.
pub struct MessageSink {
    tx: mpsc::UnboundedSender<SinkRecord>,
    handle: JoinHandle<()>,
    pending: Arc<AtomicUsize>,
}

impl MessageSink {
    /// Start the background writer. Must be called inside a Tokio runtime.
    pub fn spawn(store: Arc<dyn WorkflowStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkRecord>();
        let pending = Arc::new(AtomicUsize::new(0));
        let written = pending.clone();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match record {
                    SinkRecord::Message(message) => {
                        let id = message.message_id.clone();
                        if let Err(e) = store.save_message(message).await {
                            warn!(message_id = %id, error = %e, "Failed to persist message");
                        }
                    }
                    SinkRecord::NodeInvocation(record) => {
                        let id = record.node_invocation_id.clone();
                        if let Err(e) = store.save_node_invocation(record).await {
                            warn!(node_invocation_id = %id, error = %e, "Failed to persist node invocation");
                        }
                    }
                }
                written.fetch_sub(1, Ordering::Relaxed);
            }
            debug!("Message sink drained");
        });
        Self { tx, handle, pending }
    }

    pub fn send(&self, message: Message) {
        self.push(SinkRecord::Message(message));
    }

    pub fn send_node_invocation(&self, record: NodeInvocationRecord) {
        self.push(SinkRecord::NodeInvocation(record));
    }

    fn push(&self, record: SinkRecord) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(record).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            warn!("Message sink closed; record dropped");
        }
    }

    /// Records queued or being written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Stop accepting records and wait up to `timeout` for queued ones to be
    /// written. Whatever is still unwritten after that is abandoned.
    pub async fn close(self, timeout: Duration) {
        let Self {
            tx,
            mut handle,
            pending,
        } = self;
        drop(tx);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Message sink task failed"),
            Err(_) => {
                handle.abort();
                warn!(
                    abandoned = pending.load(Ordering::Relaxed),
                    timeout_ms = timeout.as_millis() as u64,
                    "Message sink flush timed out; unwritten records abandoned"
                );
            }
        }
    }
}

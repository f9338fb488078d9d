//! Driving a workflow invocation from the entry message to `end`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evoflow_core::config::AgentConfig;
use evoflow_core::error::Result;
use evoflow_core::event::EventBus;
use evoflow_core::message::{Message, SequenceCounter, START_NODE_ID};
use evoflow_core::payload::{extract_text_from_payload, AggregatedEntry, Payload};
use evoflow_core::store::{InvocationRecord, InvocationStatus, InvocationUpdate, NodeInvocationRecord};
use evoflow_core::traits::WorkflowStore;
use evoflow_core::types::{AgentStep, StepKind, WorkflowEvent};
use evoflow_core::workflow::{NodePatch, VerifyOptions, WorkflowConfig, WorkflowEdge, END_NODE_ID};

use crate::graph::WorkflowGraph;
use crate::node::{NodeExecutor, NodeInvocationContext, NodeInvocationResult};
use crate::sink::MessageSink;

/// What a workflow invocation is asked to do.
#[derive(Debug, Clone, Default)]
pub struct WorkflowInput {
    pub prompt: String,
    /// Evaluation feedback from an earlier run, handed to self-improvement.
    pub feedback: Option<String>,
    pub wf_version_id: Option<String>,
}

impl WorkflowInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    pub fn with_version(mut self, wf_version_id: impl Into<String>) -> Self {
        self.wf_version_id = Some(wf_version_id.into());
        self
    }
}

/// A payload that reached `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalOutput {
    pub from_node_id: String,
    pub payload: Payload,
    pub text: String,
}

/// A join node whose predecessors never all arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfiredJoin {
    pub node_id: String,
    pub received: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowRunResult {
    pub workflow_invocation_id: String,
    pub final_outputs: Vec<FinalOutput>,
    /// Node results in completion order.
    pub node_results: Vec<NodeInvocationResult>,
    /// Every message of the invocation, entry message first.
    pub messages: Vec<Message>,
    pub traversed_edges: Vec<WorkflowEdge>,
    /// Per-node memory and prompt rewrites from self-improvement.
    pub node_patches: HashMap<String, NodePatch>,
    pub unfired_joins: Vec<UnfiredJoin>,
    pub usd_cost: f64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub invocation_limit_reached: bool,
}

impl WorkflowRunResult {
    /// Texts of all final outputs, in arrival order.
    pub fn final_output(&self) -> String {
        self.final_outputs
            .iter()
            .map(|o| o.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && !self.final_outputs.is_empty()
    }

    pub fn failed_nodes(&self) -> usize {
        self.node_results.iter().filter(|r| r.failed()).count()
    }

    /// The workflow with this run's node rewrites applied.
    pub fn updated_config(&self, original: &WorkflowConfig) -> WorkflowConfig {
        original.with_node_patches(&self.node_patches)
    }

    pub fn agent_steps(&self) -> impl Iterator<Item = (&str, &AgentStep)> {
        self.node_results
            .iter()
            .flat_map(|r| r.agent_steps.iter().map(move |s| (r.node_id.as_str(), s)))
    }

    /// Plain-text rendition of every node's steps, for judging.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for result in &self.node_results {
            out.push_str(&format!("### {}", result.node_id));
            if result.failed() {
                out.push_str(" (failed)");
            }
            out.push('\n');
            for step in &result.agent_steps {
                let line = match step.kind {
                    StepKind::Text => step.output.clone(),
                    StepKind::ToolCall => format!(
                        "tool {}({}) -> {}",
                        step.name.as_deref().unwrap_or_default(),
                        step.args.as_ref().map(ToString::to_string).unwrap_or_default(),
                        step.output
                    ),
                    StepKind::Handoff => format!("handoff -> {}", step.output),
                    StepKind::Warning => format!("warning: {}", step.output),
                    StepKind::Error => format!("error: {}", step.output),
                };
                out.push_str(&line);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

/// Messages collected for a join node.
#[derive(Default)]
struct JoinBuffer {
    received: Vec<Message>,
    fired: bool,
}

/// Bookkeeping of one invocation.
struct RunState {
    workflow_invocation_id: String,
    seq: Arc<SequenceCounter>,
    sink: MessageSink,
    queue: VecDeque<Message>,
    joins: HashMap<String, JoinBuffer>,
    final_outputs: Vec<FinalOutput>,
    messages: Vec<Message>,
    edges: Vec<WorkflowEdge>,
    seen_edges: HashSet<WorkflowEdge>,
}

impl RunState {
    fn record(&mut self, message: &Message) {
        self.sink.send(message.clone());
        self.messages.push(message.clone());
    }

    fn traverse(&mut self, from: &str, to: &str) {
        let edge = WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
        };
        if self.seen_edges.insert(edge.clone()) {
            self.edges.push(edge);
        }
    }
}

pub struct WorkflowOrchestrator {
    executor: Arc<NodeExecutor>,
    store: Arc<dyn WorkflowStore>,
    event_bus: Arc<EventBus>,
    config: AgentConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        executor: Arc<NodeExecutor>,
        store: Arc<dyn WorkflowStore>,
        event_bus: Arc<EventBus>,
        config: AgentConfig,
    ) -> Self {
        Self {
            executor,
            store,
            event_bus,
            config,
        }
    }

    pub fn executor(&self) -> &Arc<NodeExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Run `workflow` on `input` until nothing is left to execute.
    ///
    /// Only structural problems are errors; node failures, guard rejections
    /// and cancellation are reported in the result.
    pub async fn invoke(
        &self,
        workflow: &WorkflowConfig,
        input: WorkflowInput,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRunResult> {
        workflow.ensure_valid(&VerifyOptions::default())?;

        let started = Instant::now();
        let workflow_invocation_id = Uuid::new_v4().to_string();
        let graph = Arc::new(WorkflowGraph::from_config(workflow));
        let seq = Arc::new(SequenceCounter::new());

        if let Err(e) = self
            .store
            .create_workflow_invocation(InvocationRecord {
                workflow_invocation_id: workflow_invocation_id.clone(),
                wf_version_id: input.wf_version_id.clone(),
                prompt: input.prompt.clone(),
                started_at: Utc::now(),
            })
            .await
        {
            warn!(error = %e, "Failed to record workflow invocation");
        }

        self.event_bus.publish(WorkflowEvent::InvocationStarted {
            workflow_invocation_id: workflow_invocation_id.clone(),
            entry_node_id: workflow.entry_node_id.clone(),
        });
        info!(
            workflow_invocation_id = %workflow_invocation_id,
            entry = %workflow.entry_node_id,
            nodes = workflow.nodes.len(),
            "Workflow invocation started"
        );

        let mut state = RunState {
            workflow_invocation_id: workflow_invocation_id.clone(),
            seq: seq.clone(),
            sink: MessageSink::spawn(self.store.clone()),
            queue: VecDeque::new(),
            joins: HashMap::new(),
            final_outputs: Vec::new(),
            messages: Vec::new(),
            edges: Vec::new(),
            seen_edges: HashSet::new(),
        };

        let entry = Message::entry(
            &workflow.entry_node_id,
            &input.prompt,
            seq.next(),
            &workflow_invocation_id,
        );
        state.record(&entry);
        state.traverse(START_NODE_ID, &workflow.entry_node_id);
        state.queue.push_back(entry);

        let max_concurrent = self.config.max_concurrent_nodes.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut node_results: Vec<NodeInvocationResult> = Vec::new();
        let mut node_patches = HashMap::new();
        let mut started_nodes = 0usize;
        let mut invocation_limit_reached = false;

        loop {
            while in_flight.len() < max_concurrent && !cancel.is_cancelled() {
                let Some(message) = state.queue.pop_front() else {
                    break;
                };
                if started_nodes >= self.config.max_node_invocations {
                    warn!(
                        limit = self.config.max_node_invocations,
                        pending = state.queue.len() + 1,
                        "Node invocation limit reached; dropping pending work"
                    );
                    invocation_limit_reached = true;
                    state.queue.clear();
                    break;
                }
                let Some(node) = graph.get(&message.to_node_id).cloned() else {
                    warn!(target = %message.to_node_id, "Message addressed to unknown node dropped");
                    continue;
                };
                started_nodes += 1;

                self.event_bus.publish(WorkflowEvent::NodeStarted {
                    workflow_invocation_id: workflow_invocation_id.clone(),
                    node_id: node.node_id.clone(),
                });
                in_flight.push(self.executor.execute(NodeInvocationContext {
                    node,
                    graph: graph.clone(),
                    incoming: message,
                    workflow_invocation_id: workflow_invocation_id.clone(),
                    seq: seq.clone(),
                    task_prompt: input.prompt.clone(),
                    feedback: input.feedback.clone(),
                    cancel: cancel.clone(),
                }));
            }

            // Running nodes observe the token themselves and finish early.
            let Some(result) = in_flight.next().await else {
                break;
            };
            self.absorb(&graph, &mut state, &result);
            if let Some(patch) = result.node_patch() {
                node_patches.insert(result.node_id.clone(), patch);
            }
            node_results.push(result);
        }

        let unfired_joins = unfired_joins(&graph, &state.joins);
        for join in &unfired_joins {
            warn!(node_id = %join.node_id, missing = ?join.missing, "Join never released");
        }

        let cancelled = cancel.is_cancelled();
        let usd_cost: f64 = node_results.iter().map(|r| r.usd_cost).sum();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let RunState {
            sink,
            final_outputs,
            messages,
            edges,
            ..
        } = state;
        sink.close(Duration::from_millis(self.config.message_flush_timeout_ms)).await;

        let status = if cancelled {
            InvocationStatus::Cancelled
        } else if final_outputs.is_empty() {
            InvocationStatus::Failed
        } else {
            InvocationStatus::Completed
        };

        let result = WorkflowRunResult {
            workflow_invocation_id: workflow_invocation_id.clone(),
            final_outputs,
            node_results,
            messages,
            traversed_edges: edges,
            node_patches,
            unfired_joins,
            usd_cost,
            elapsed_ms,
            cancelled,
            invocation_limit_reached,
        };

        if let Err(e) = self
            .store
            .update_workflow_invocation(
                workflow_invocation_id.clone(),
                InvocationUpdate {
                    status,
                    usd_cost,
                    final_output: (!result.final_outputs.is_empty()).then(|| result.final_output()),
                    fitness: None,
                    feedback: None,
                    finished_at: Utc::now(),
                },
            )
            .await
        {
            warn!(error = %e, "Failed to update workflow invocation");
        }

        self.event_bus.publish(WorkflowEvent::InvocationCompleted {
            workflow_invocation_id: workflow_invocation_id.clone(),
            usd_cost,
            elapsed_ms,
        });
        info!(
            workflow_invocation_id = %workflow_invocation_id,
            status = status.as_str(),
            nodes_run = result.node_results.len(),
            usd_cost,
            elapsed_ms,
            "Workflow invocation finished"
        );

        Ok(result)
    }

    /// Record a finished node and route its outgoing messages.
    fn absorb(&self, graph: &WorkflowGraph, state: &mut RunState, result: &NodeInvocationResult) {
        self.event_bus.publish(WorkflowEvent::NodeCompleted {
            workflow_invocation_id: state.workflow_invocation_id.clone(),
            node_id: result.node_id.clone(),
            usd_cost: result.usd_cost,
            failed: result.failed(),
        });
        state.sink.send_node_invocation(NodeInvocationRecord {
            node_invocation_id: result.node_invocation_id.clone(),
            workflow_invocation_id: state.workflow_invocation_id.clone(),
            node_id: result.node_id.clone(),
            summary: result.summary.clone(),
            usd_cost: result.usd_cost,
            failed: result.failed(),
            created_at: Utc::now(),
        });
        if !result.next_ids.is_empty() {
            self.event_bus.publish(WorkflowEvent::HandoffResolved {
                from_node_id: result.node_id.clone(),
                next_node_ids: result.next_ids.clone(),
            });
        }

        for message in &result.outgoing_messages {
            state.record(message);
            state.traverse(&message.from_node_id, &message.to_node_id);

            if message.to_node_id == END_NODE_ID {
                state.final_outputs.push(FinalOutput {
                    from_node_id: message.from_node_id.clone(),
                    payload: message.payload.clone(),
                    text: extract_text_from_payload(&message.payload),
                });
                continue;
            }

            match graph.get(&message.to_node_id) {
                None => {
                    warn!(target = %message.to_node_id, "Handoff to unknown node dropped");
                }
                Some(target) if target.is_join() => {
                    let wait_for = target.wait_for.clone().unwrap_or_default();
                    self.offer_to_join(state, &target.node_id, &wait_for, message);
                }
                Some(_) => state.queue.push_back(message.clone()),
            }
        }
    }

    /// Buffer a message for a join node; release one aggregated message once
    /// every predecessor has delivered.
    fn offer_to_join(
        &self,
        state: &mut RunState,
        join_id: &str,
        wait_for: &[String],
        message: &Message,
    ) {
        let buffer = state.joins.entry(join_id.to_string()).or_default();

        if !wait_for.iter().any(|p| *p == message.from_node_id) {
            warn!(join = join_id, from = %message.from_node_id, "Message from a non-predecessor dropped at join");
            return;
        }
        if buffer.fired {
            warn!(join = join_id, from = %message.from_node_id, "Join already released; message dropped");
            return;
        }
        if buffer
            .received
            .iter()
            .any(|m| m.from_node_id == message.from_node_id)
        {
            warn!(join = join_id, from = %message.from_node_id, "Duplicate join input dropped");
            return;
        }

        buffer.received.push(message.clone());
        debug!(join = join_id, received = buffer.received.len(), expected = wait_for.len(), "Join input buffered");

        let complete = wait_for
            .iter()
            .all(|p| buffer.received.iter().any(|m| m.from_node_id == *p));
        if !complete {
            return;
        }
        buffer.fired = true;

        let entries: Vec<AggregatedEntry> = wait_for
            .iter()
            .filter_map(|p| buffer.received.iter().find(|m| m.from_node_id == *p))
            .map(|m| AggregatedEntry {
                from_node_id: m.from_node_id.clone(),
                payload: m.payload.clone(),
            })
            .collect();
        let inputs = entries.len();
        let Some(payload) = Payload::aggregated(entries) else {
            return;
        };

        let aggregated = Message::new(
            &message.from_node_id,
            join_id,
            message.origin_invocation_id.clone(),
            state.seq.next(),
            payload,
            &state.workflow_invocation_id,
        )
        .with_reply_to(&message.message_id);

        self.event_bus.publish(WorkflowEvent::JoinReleased {
            node_id: join_id.to_string(),
            inputs,
        });
        info!(join = join_id, inputs, "Join released");

        state.record(&aggregated);
        state.queue.push_back(aggregated);
    }
}

fn unfired_joins(graph: &WorkflowGraph, joins: &HashMap<String, JoinBuffer>) -> Vec<UnfiredJoin> {
    graph
        .nodes()
        .iter()
        .filter_map(|node| {
            let buffer = joins.get(&node.node_id)?;
            if buffer.fired {
                return None;
            }
            let received: Vec<String> = buffer
                .received
                .iter()
                .map(|m| m.from_node_id.clone())
                .collect();
            let missing = node
                .wait_for
                .iter()
                .flatten()
                .filter(|p| !received.contains(p))
                .cloned()
                .collect();
            Some(UnfiredJoin {
                node_id: node.node_id.clone(),
                received,
                missing,
            })
        })
        .collect()
}

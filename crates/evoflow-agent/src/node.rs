//! Running a single node: model call, tool loop, handoff, outgoing messages.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evoflow_core::config::AgentConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::message::{Message, SequenceCounter, START_NODE_ID};
use evoflow_core::payload::{extract_text_from_payload, Payload};
use evoflow_core::types::{
    AgentStep, ChatMessage, ContentBlock, ModelRequest, ToolContext, ToolDefinition,
};
use evoflow_core::workflow::{HandOffType, NodePatch, WorkflowNodeConfig, END_NODE_ID};
use evoflow_tools::{ToolRegistry, ValidationOutcome};

use crate::dispatch::{truncate, ModelDispatcher};
use crate::graph::WorkflowGraph;
use crate::handoff::{HandoffInput, HandoffResolver, HANDOFF_TOOL};
use crate::self_improve::SelfImprover;

const SUMMARY_CHARS: usize = 200;

/// Everything one node execution needs.
pub struct NodeInvocationContext {
    pub node: Arc<WorkflowNodeConfig>,
    pub graph: Arc<WorkflowGraph>,
    pub incoming: Message,
    pub workflow_invocation_id: String,
    pub seq: Arc<SequenceCounter>,
    /// The prompt the workflow invocation was started with.
    pub task_prompt: String,
    /// Feedback from a previous evaluation, used for self-improvement.
    pub feedback: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeError {
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeInvocationResult {
    pub node_id: String,
    pub node_invocation_id: String,
    pub final_output: String,
    pub summary: String,
    /// What this node produced, as a payload (result or error).
    pub reply_message: Payload,
    pub next_ids: Vec<String>,
    pub outgoing_messages: Vec<Message>,
    pub usd_cost: f64,
    pub error: Option<NodeError>,
    pub agent_steps: Vec<AgentStep>,
    /// New memory for the node, when self-improvement rewrote it.
    pub updated_memory: Option<BTreeMap<String, String>>,
    /// New system prompt, when self-improvement rewrote it.
    pub updated_system_prompt: Option<String>,
}

impl NodeInvocationResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Config changes this invocation made to its node, if any.
    pub fn node_patch(&self) -> Option<NodePatch> {
        let patch = NodePatch {
            memory: self.updated_memory.clone(),
            system_prompt: self.updated_system_prompt.clone(),
        };
        (!patch.is_empty()).then_some(patch)
    }
}

/// Mutable state of one execution.
#[derive(Default)]
struct NodeRun {
    steps: Vec<AgentStep>,
    usd_cost: f64,
    tool_choice: Option<String>,
    last_text: String,
}

impl NodeRun {
    fn warn(&mut self, name: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        warn!(tool = name.unwrap_or("-"), warning = %message, "Node warning");
        self.steps
            .push(AgentStep::warning(name.map(str::to_string), message, self.usd_cost));
    }
}

pub struct NodeExecutor {
    dispatcher: Arc<ModelDispatcher>,
    tools: Arc<ToolRegistry>,
    resolver: Arc<dyn HandoffResolver>,
    improver: Option<SelfImprover>,
    config: AgentConfig,
}

impl NodeExecutor {
    pub fn new(
        dispatcher: Arc<ModelDispatcher>,
        tools: Arc<ToolRegistry>,
        resolver: Arc<dyn HandoffResolver>,
        config: AgentConfig,
    ) -> Self {
        Self {
            dispatcher,
            tools,
            resolver,
            improver: None,
            config,
        }
    }

    pub fn with_self_improvement(mut self, improver: SelfImprover) -> Self {
        self.improver = Some(improver);
        self
    }

    pub fn dispatcher(&self) -> &Arc<ModelDispatcher> {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &Arc<dyn HandoffResolver> {
        &self.resolver
    }

    /// Execute a node. Failures are reported in the result, never as `Err`.
    pub async fn execute(&self, ctx: NodeInvocationContext) -> NodeInvocationResult {
        let mut node = (*ctx.node).clone();
        let node_invocation_id = Uuid::new_v4().to_string();
        let mut run = NodeRun::default();
        let mut memory = node.memory.clone();
        let mut updated_memory = None;
        let mut updated_system_prompt = None;

        if let (Some(improver), Some(feedback)) = (&self.improver, ctx.feedback.as_deref()) {
            match improver.improve(&node, feedback, &ctx.cancel).await {
                Ok(improvement) => {
                    run.usd_cost += improvement.usd_cost;
                    if let Some(w) = improvement.warning {
                        run.warn(Some("self_improve"), w);
                    }
                    memory = improvement.memory.clone();
                    updated_memory = Some(improvement.memory);
                    if let Some(prompt) = improvement.system_prompt {
                        node.system_prompt = prompt.clone();
                        updated_system_prompt = Some(prompt);
                    }
                }
                Err(failure) => {
                    run.usd_cost += failure.usd_cost;
                    run.warn(
                        Some("self_improve"),
                        format!("self-improvement skipped: {}", failure.error),
                    );
                }
            }
        }

        debug!(node_id = %node.node_id, from = %ctx.incoming.from_node_id, "Executing node");

        let outcome = self.run_model(&ctx, &node, &memory, &mut run).await;

        let (final_output, reply_message, handoff, error) = match outcome {
            Ok(output) => {
                run.steps.push(AgentStep::text(&output, run.usd_cost));
                let handoff = self.resolver.resolve(&HandoffInput {
                    node: &node,
                    graph: &ctx.graph,
                    task_prompt: &ctx.task_prompt,
                    output: &output,
                    tool_choice: run.tool_choice.as_deref(),
                });
                let reply = Payload::result(&output);
                (output, reply, handoff, None)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(node_id = %node.node_id, error = %message, "Node failed");
                run.steps.push(AgentStep::error(&message, run.usd_cost));
                let partial = std::mem::take(&mut run.last_text);
                let handoff = self.resolver.on_failure(
                    &HandoffInput {
                        node: &node,
                        graph: &ctx.graph,
                        task_prompt: &ctx.task_prompt,
                        output: &partial,
                        tool_choice: None,
                    },
                    &message,
                );
                let error = NodeError {
                    message: message.clone(),
                    stack: Some(format!("{:?}", e)),
                };
                let reply = Payload::Error {
                    message,
                    stack: error.stack.clone(),
                };
                (partial, reply, handoff, Some(error))
            }
        };

        let outgoing_messages: Vec<Message> = handoff
            .per_target_payload
            .into_iter()
            .map(|(target, payload)| {
                Message::new(
                    &node.node_id,
                    target,
                    Some(node_invocation_id.clone()),
                    ctx.seq.next(),
                    payload,
                    &ctx.workflow_invocation_id,
                )
                .with_reply_to(&ctx.incoming.message_id)
            })
            .collect();

        info!(
            node_id = %node.node_id,
            next = ?handoff.next_node_ids,
            usd_cost = run.usd_cost,
            failed = error.is_some(),
            "Node finished"
        );

        NodeInvocationResult {
            node_id: node.node_id.clone(),
            node_invocation_id,
            summary: truncate(&final_output, SUMMARY_CHARS),
            final_output,
            reply_message,
            next_ids: handoff.next_node_ids,
            outgoing_messages,
            usd_cost: run.usd_cost,
            error,
            agent_steps: run.steps,
            updated_memory,
            updated_system_prompt,
        }
    }

    async fn run_model(
        &self,
        ctx: &NodeInvocationContext,
        node: &WorkflowNodeConfig,
        memory: &BTreeMap<String, String>,
        run: &mut NodeRun,
    ) -> Result<String> {
        let mut definitions = self.tool_definitions(node, run);
        let offered: HashSet<String> = definitions.iter().map(|d| d.name.clone()).collect();

        let candidates = self.resolver.candidates(node, &ctx.graph);
        let routed_by_model =
            candidates.len() > 1 && node.hand_off_type != HandOffType::Parallel;
        if routed_by_model {
            definitions.push(handoff_definition(&candidates));
        }

        let mut messages = vec![
            ChatMessage::system(system_prompt(node, memory, &ctx.graph, &candidates, routed_by_model)),
            ChatMessage::user(user_text(ctx)),
        ];

        let mut round = 0;
        loop {
            let request = ModelRequest::text(node.model_name.clone(), messages.clone())
                .with_tools(definitions.clone());
            let reply = match self.dispatcher.dispatch(request, &ctx.cancel).await {
                Ok(reply) => reply,
                Err(failure) => {
                    run.usd_cost += failure.usd_cost;
                    return Err(failure.error);
                }
            };
            run.usd_cost += reply.usd_cost;
            let response = reply.value;

            let text = response.text();
            if !text.is_empty() {
                run.last_text = text;
            }

            let calls: Vec<(String, String, Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            if calls.is_empty() {
                return Ok(std::mem::take(&mut run.last_text));
            }
            if round >= self.config.max_tool_rounds {
                run.warn(
                    None,
                    format!("tool round limit ({}) reached", self.config.max_tool_rounds),
                );
                return Ok(std::mem::take(&mut run.last_text));
            }
            round += 1;

            let only_handoff = calls.iter().all(|(_, name, _)| name == HANDOFF_TOOL);
            messages.push(ChatMessage::assistant(response.content));

            for (id, name, input) in calls {
                let (content, is_error) = self
                    .run_tool_call(ctx, node, &offered, &name, input, run)
                    .await?;
                messages.push(ChatMessage::tool_result(id, content, is_error));
            }

            if only_handoff && run.tool_choice.is_some() && !run.last_text.is_empty() {
                return Ok(std::mem::take(&mut run.last_text));
            }
        }
    }

    /// Definitions for the node's tools, capped to `max_tools_per_agent`.
    fn tool_definitions(&self, node: &WorkflowNodeConfig, run: &mut NodeRun) -> Vec<ToolDefinition> {
        let mut names = node.all_tools();
        let max = self.config.max_tools_per_agent;
        if max > 0 && names.len() > max {
            run.warn(
                None,
                format!(
                    "node declares {} tools; only the first {} are offered",
                    names.len(),
                    max
                ),
            );
            names.truncate(max);
        }
        names.retain(|name| {
            if self.tools.contains(name) {
                true
            } else {
                run.warn(Some(*name), format!("tool '{}' is not registered", name));
                false
            }
        });
        self.tools.definitions_for(&names)
    }

    async fn run_tool_call(
        &self,
        ctx: &NodeInvocationContext,
        node: &WorkflowNodeConfig,
        offered: &HashSet<String>,
        name: &str,
        input: Value,
        run: &mut NodeRun,
    ) -> Result<(String, bool)> {
        if name == HANDOFF_TOOL {
            return Ok(match input.get("target").and_then(Value::as_str) {
                Some(target) => {
                    let target = target.to_string();
                    run.steps
                        .push(AgentStep::handoff(&target, input.clone(), run.usd_cost));
                    let reply = format!("Handoff to '{}' recorded.", target);
                    run.tool_choice = Some(target);
                    (reply, false)
                }
                None => {
                    run.warn(Some(HANDOFF_TOOL), "handoff call without a 'target'");
                    ("The handoff tool requires a string 'target'.".to_string(), true)
                }
            });
        }

        if !offered.contains(name) {
            let message = EvoflowError::ToolNotFound(name.to_string()).to_string();
            run.warn(Some(name), format!("call skipped: {}", message));
            return Ok((message, true));
        }

        let args = match self.tools.validate(name, &input) {
            Ok(ValidationOutcome::Valid(args)) => args,
            Ok(ValidationOutcome::Corrected { args, issues }) => {
                for issue in &issues {
                    run.warn(Some(name), format!("argument corrected: {}", issue));
                }
                args
            }
            Ok(ValidationOutcome::Rejected { issues }) => {
                let detail = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                run.warn(Some(name), format!("call skipped: {}", detail));
                return Ok((format!("Invalid arguments: {}", detail), true));
            }
            Err(e) => {
                run.warn(Some(name), format!("call skipped: {}", e));
                return Ok((e.to_string(), true));
            }
        };

        let tool_ctx = ToolContext::new(&node.node_id, &ctx.workflow_invocation_id);
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EvoflowError::Cancelled),
            r = self.tools.execute(name, args.clone(), tool_ctx) => r,
        };

        let (content, is_error) = match outcome {
            Ok(result) => (result.content, result.is_error),
            Err(e) => (e.to_string(), true),
        };
        debug!(node_id = %node.node_id, tool = name, is_error, "Tool call complete");
        run.steps
            .push(AgentStep::tool_call(name, args, &content, run.usd_cost));
        Ok((content, is_error))
    }
}

fn handoff_definition(candidates: &[String]) -> ToolDefinition {
    ToolDefinition {
        name: HANDOFF_TOOL.to_string(),
        description: format!(
            "Choose who receives your output next. Use \"{}\" to finish the workflow.",
            END_NODE_ID
        ),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "enum": candidates }
            },
            "required": ["target"]
        }),
    }
}

fn system_prompt(
    node: &WorkflowNodeConfig,
    memory: &BTreeMap<String, String>,
    graph: &WorkflowGraph,
    candidates: &[String],
    routed_by_model: bool,
) -> String {
    let mut prompt = node.system_prompt.clone();

    if !memory.is_empty() {
        prompt.push_str("\n\n## Memory\n");
        for (key, value) in memory {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }

    if routed_by_model {
        prompt.push_str("\n\n## Handoff\nWhen you are done, decide who receives your output:\n");
        for id in candidates {
            let description = if id == END_NODE_ID {
                "finish the workflow with your output as the answer"
            } else {
                graph.get(id).map(|n| n.description.as_str()).unwrap_or_default()
            };
            prompt.push_str(&format!("- {}: {}\n", id, description));
        }
        prompt.push_str(&format!(
            "Call the `{}` tool with the target, or end your reply with a line `HANDOFF: <id>`.",
            HANDOFF_TOOL
        ));
    }

    prompt
}

fn user_text(ctx: &NodeInvocationContext) -> String {
    let text = extract_text_from_payload(&ctx.incoming.payload);
    if ctx.incoming.from_node_id == START_NODE_ID {
        return text;
    }
    format!(
        "Original task:\n{}\n\nMessage from '{}' ({}):\n{}",
        ctx.task_prompt,
        ctx.incoming.from_node_id,
        ctx.incoming.payload.kind(),
        text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::AdmissionController;
    use crate::handoff::{HierarchicalResolver, SequentialResolver};
    use evoflow_core::config::RetryConfig;
    use evoflow_core::error::ProviderErrorKind;
    use evoflow_core::event::EventBus;
    use evoflow_core::pricing::StaticCatalog;
    use evoflow_core::types::StepKind;
    use evoflow_core::workflow::WorkflowConfig;
    use evoflow_core::InMemoryStore;
    use evoflow_test_utils::*;
    use serde_json::json;

    fn dispatcher(client: Arc<ScriptedModelClient>) -> Arc<ModelDispatcher> {
        retrying_dispatcher(client, 0)
    }

    fn retrying_dispatcher(client: Arc<ScriptedModelClient>, max_retries: u32) -> Arc<ModelDispatcher> {
        Arc::new(ModelDispatcher::new(
            client,
            Arc::new(StaticCatalog::with_defaults()),
            Arc::new(AdmissionController::unlimited()),
            RetryConfig {
                max_retries,
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            },
            Arc::new(EventBus::default()),
        ))
    }

    fn executor(client: Arc<ScriptedModelClient>, resolver: Arc<dyn HandoffResolver>) -> NodeExecutor {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(FailingTool);
        NodeExecutor::new(dispatcher(client), Arc::new(tools), resolver, AgentConfig::default())
    }

    fn context(config: &WorkflowConfig, node_id: &str, incoming: Message) -> NodeInvocationContext {
        let graph = Arc::new(WorkflowGraph::from_config(config));
        NodeInvocationContext {
            node: graph.get(node_id).unwrap().clone(),
            graph,
            incoming,
            workflow_invocation_id: "wfi".into(),
            seq: Arc::new(SequenceCounter::new()),
            task_prompt: "the task".into(),
            feedback: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_linear_node_hands_off_to_sole_candidate() {
        let client = Arc::new(ScriptedModelClient::new().then_text("draft"));
        let exec = executor(client.clone(), Arc::new(SequentialResolver));
        let config = linear_workflow();
        let incoming = Message::entry("a", "the task", 0, "wfi");
        let incoming_id = incoming.message_id.clone();

        let result = exec.execute(context(&config, "a", incoming)).await;
        assert!(!result.failed());
        assert_eq!(result.final_output, "draft");
        assert_eq!(result.next_ids, vec!["b"]);
        assert_eq!(result.outgoing_messages.len(), 1);
        let out = &result.outgoing_messages[0];
        assert_eq!(out.to_node_id, "b");
        assert_eq!(out.reply_to.as_deref(), Some(incoming_id.as_str()));
        assert_eq!(out.origin_invocation_id.as_deref(), Some(result.node_invocation_id.as_str()));
        assert!(result.usd_cost > 0.0);

        // A sole candidate needs no routing tool.
        let sent = client.requests();
        assert!(sent[0].tools.iter().all(|t| t.name != HANDOFF_TOOL));
        assert_eq!(last_user_text(&sent[0]), "the task");
    }

    #[tokio::test]
    async fn test_handoff_tool_choice_routes() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(tool_call_response(HANDOFF_TOOL, json!({"target": "w2"})))
                .then_text("w1 found nothing useful"),
        );
        let exec = executor(client.clone(), Arc::new(HierarchicalResolver));
        let config = hierarchical_workflow();
        let result = exec
            .execute(context(&config, "boss", Message::entry("boss", "t", 0, "wfi")))
            .await;
        assert_eq!(result.next_ids, vec!["w2"]);
        assert!(result.agent_steps.iter().any(|s| s.kind == StepKind::Handoff));
        assert!(system_text(&client.requests()[0]).contains("HANDOFF: <id>"));
    }

    #[tokio::test]
    async fn test_tool_loop_records_steps() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(tool_call_response("echo", json!({"text": 42})))
                .then_text("echoed"),
        );
        let exec = executor(client.clone(), Arc::new(SequentialResolver));
        let config = WorkflowConfig::new("a", vec![node("a").with_code_tools(["echo"])]);
        let result = exec
            .execute(context(&config, "a", Message::entry("a", "t", 0, "wfi")))
            .await;

        assert_eq!(result.final_output, "echoed");
        let kinds: Vec<StepKind> = result.agent_steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::Warning, StepKind::ToolCall, StepKind::Text]);
        assert_eq!(result.agent_steps[1].output, "42");
        assert_eq!(result.next_ids, vec![END_NODE_ID]);
    }

    #[tokio::test]
    async fn test_rejected_arguments_skip_the_call() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(tool_call_response("echo", json!({"items": "${list}"})))
                .then_text("gave up"),
        );
        let exec = executor(client.clone(), Arc::new(SequentialResolver));
        let config = WorkflowConfig::new("a", vec![node("a").with_code_tools(["echo"])]);
        let result = exec
            .execute(context(&config, "a", Message::entry("a", "t", 0, "wfi")))
            .await;

        assert!(!result.failed());
        assert!(result.agent_steps.iter().all(|s| s.kind != StepKind::ToolCall));
        assert!(result.agent_steps[0].output.starts_with("call skipped"));
        let second = &client.requests()[1];
        let last = second.messages.last().unwrap();
        assert!(matches!(
            &last.content[0],
            ContentBlock::ToolResult { is_error: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_tools_are_capped_and_unknown_tools_skipped() {
        let client = Arc::new(ScriptedModelClient::new());
        let exec = executor(client.clone(), Arc::new(SequentialResolver));
        let config = WorkflowConfig::new(
            "a",
            vec![node("a").with_code_tools(["echo", "ghost", "failing", "extra"])],
        );
        let result = exec
            .execute(context(&config, "a", Message::entry("a", "t", 0, "wfi")))
            .await;

        let warnings = result
            .agent_steps
            .iter()
            .filter(|s| s.kind == StepKind::Warning)
            .count();
        assert_eq!(warnings, 2);
        let names: Vec<String> = client.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["echo", "failing"]);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let client = Arc::new(
            ScriptedModelClient::new().then_error(ProviderErrorKind::Client(400), "bad request"),
        );
        let exec = executor(client, Arc::new(HierarchicalResolver));
        let config = hierarchical_workflow();
        let incoming = Message::new("boss", "w1", Some("x".into()), 1, Payload::delegation("go"), "wfi");
        let result = exec.execute(context(&config, "w1", incoming)).await;

        assert!(result.failed());
        assert!(matches!(result.reply_message, Payload::Error { .. }));
        assert_eq!(result.next_ids, vec!["boss"]);
        assert!(matches!(
            result.outgoing_messages[0].payload,
            Payload::ResultError { .. }
        ));
    }

    #[tokio::test]
    async fn test_forwarded_message_carries_task_and_sender() {
        let client = Arc::new(ScriptedModelClient::new());
        let exec = executor(client.clone(), Arc::new(SequentialResolver));
        let config = linear_workflow();
        let incoming = Message::new("a", "b", Some("x".into()), 1, Payload::sequential("draft"), "wfi");
        exec.execute(context(&config, "b", incoming)).await;

        let text = last_user_text(&client.requests()[0]);
        assert!(text.contains("the task"));
        assert!(text.contains("'a'"));
        assert!(text.ends_with("draft"));
    }

    #[tokio::test]
    async fn test_self_improvement_patches_memory() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(json_response(json!({"memory": {"tip": "cite sources"}})))
                .then_text("answer"),
        );
        let improver = SelfImprover::new(dispatcher(client.clone()), Arc::new(InMemoryStore::new()), 3);
        let exec = executor(client.clone(), Arc::new(SequentialResolver)).with_self_improvement(improver);
        let config = WorkflowConfig::new("a", vec![node("a")]);
        let mut ctx = context(&config, "a", Message::entry("a", "t", 0, "wfi"));
        ctx.feedback = Some("no sources".into());

        let result = exec.execute(ctx).await;
        assert_eq!(result.updated_memory.unwrap()["tip"], "cite sources");
        assert!(system_text(&client.requests()[1]).contains("- tip: cite sources"));
    }

    #[tokio::test]
    async fn test_failed_self_improvement_still_counts_its_spend() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then_text("not json")
                .then_text("still not json")
                .then_text("answer"),
        );
        let dispatcher = retrying_dispatcher(client.clone(), 1);
        let improver = SelfImprover::new(dispatcher.clone(), Arc::new(InMemoryStore::new()), 3);
        let exec = NodeExecutor::new(
            dispatcher.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(SequentialResolver),
            AgentConfig::default(),
        )
        .with_self_improvement(improver);
        let config = WorkflowConfig::new("a", vec![node("a")]);
        let mut ctx = context(&config, "a", Message::entry("a", "t", 0, "wfi"));
        ctx.feedback = Some("be better".into());

        let result = exec.execute(ctx).await;
        assert!(!result.failed());
        assert_eq!(result.final_output, "answer");
        assert!(result.updated_memory.is_none());
        assert_eq!(client.call_count(), 3);
        assert!(result
            .agent_steps
            .iter()
            .any(|s| s.kind == StepKind::Warning));
        assert!((result.usd_cost - dispatcher.admission().total_spent()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_self_improvement_prompt_applies_to_current_run() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(json_response(json!({
                    "memory": {},
                    "systemPrompt": "You are agent a. Answer in French."
                })))
                .then_text("bonjour"),
        );
        let improver = SelfImprover::new(dispatcher(client.clone()), Arc::new(InMemoryStore::new()), 3);
        let exec = executor(client.clone(), Arc::new(SequentialResolver)).with_self_improvement(improver);
        let config = WorkflowConfig::new("a", vec![node("a")]);
        let mut ctx = context(&config, "a", Message::entry("a", "t", 0, "wfi"));
        ctx.feedback = Some("user wanted French".into());

        let result = exec.execute(ctx).await;
        assert!(system_text(&client.requests()[1]).starts_with("You are agent a. Answer in French."));
        let patch = result.node_patch().unwrap();
        assert_eq!(patch.system_prompt.as_deref(), Some("You are agent a. Answer in French."));
    }
}

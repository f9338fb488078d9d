use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdmissionRejection;

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Execution context handed to a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub node_id: String,
    pub workflow_invocation_id: String,
}

impl ToolContext {
    pub fn new(node_id: impl Into<String>, workflow_invocation_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            workflow_invocation_id: workflow_invocation_id.into(),
        }
    }
}

/// Tool definition for sending to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the model should shape its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMode {
    Text,
    /// Answer with a single JSON document matching the schema.
    Structured { schema: serde_json::Value },
}

/// A request sent through the model client port.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub mode: ResponseMode,
    pub tools: Vec<ToolDefinition>,
}

impl ModelRequest {
    pub fn text(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            mode: ResponseMode::Text,
            tools: vec![],
        }
    }

    pub fn structured(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        schema: serde_json::Value,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            mode: ResponseMode::Structured { schema },
            tools: vec![],
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens: 0,
        }
    }
}

/// The model's reply to a single request.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Kind of an entry in a node's step log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Text,
    ToolCall,
    Handoff,
    Warning,
    Error,
}

/// Normalized record of one step taken by a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(rename = "return")]
    pub output: String,
    /// Cumulative cost of the node at the time the step was recorded.
    #[serde(default)]
    pub cumulative_cost_usd: f64,
}

impl AgentStep {
    pub fn text(output: impl Into<String>, cost: f64) -> Self {
        Self {
            kind: StepKind::Text,
            name: None,
            args: None,
            output: output.into(),
            cumulative_cost_usd: cost,
        }
    }

    pub fn tool_call(
        name: impl Into<String>,
        args: serde_json::Value,
        output: impl Into<String>,
        cost: f64,
    ) -> Self {
        Self {
            kind: StepKind::ToolCall,
            name: Some(name.into()),
            args: Some(args),
            output: output.into(),
            cumulative_cost_usd: cost,
        }
    }

    pub fn handoff(target: impl Into<String>, args: serde_json::Value, cost: f64) -> Self {
        Self {
            kind: StepKind::Handoff,
            name: Some("handoff".to_string()),
            args: Some(args),
            output: target.into(),
            cumulative_cost_usd: cost,
        }
    }

    pub fn warning(name: Option<String>, output: impl Into<String>, cost: f64) -> Self {
        Self {
            kind: StepKind::Warning,
            name,
            args: None,
            output: output.into(),
            cumulative_cost_usd: cost,
        }
    }

    pub fn error(output: impl Into<String>, cost: f64) -> Self {
        Self {
            kind: StepKind::Error,
            name: None,
            args: None,
            output: output.into(),
            cumulative_cost_usd: cost,
        }
    }
}

/// Event broadcast to all subscribers of the [`crate::EventBus`].
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A workflow invocation started.
    InvocationStarted {
        workflow_invocation_id: String,
        entry_node_id: String,
    },
    /// A node began executing.
    NodeStarted {
        workflow_invocation_id: String,
        node_id: String,
    },
    /// A node finished (successfully or not).
    NodeCompleted {
        workflow_invocation_id: String,
        node_id: String,
        usd_cost: f64,
        failed: bool,
    },
    /// The handoff resolver picked the next hop(s).
    HandoffResolved {
        from_node_id: String,
        next_node_ids: Vec<String>,
    },
    /// A join node received all of its predecessors.
    JoinReleased { node_id: String, inputs: usize },
    /// An admission guard refused a model call.
    AdmissionRejected { rejection: AdmissionRejection },
    /// A workflow invocation finished.
    InvocationCompleted {
        workflow_invocation_id: String,
        usd_cost: f64,
        elapsed_ms: u64,
    },
    /// A GP generation was evaluated and selected.
    GenerationCompleted {
        generation: u32,
        best_fitness: f64,
        avg_fitness: f64,
        evaluation_cost: f64,
    },
}

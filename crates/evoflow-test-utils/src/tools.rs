use futures::future::BoxFuture;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Tool;
use evoflow_core::types::{ToolContext, ToolResult};

/// Returns its `text` argument.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the given text back."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "items": { "type": "array" }
            },
            "required": ["text"]
        })
    }
    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let text = input["text"].as_str().unwrap_or_default().to_string();
            Ok(ToolResult::success(text))
        })
    }
}

/// Sleeps far past its one-second timeout.
pub struct SlowTool;

impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Never finishes in time."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn timeout_secs(&self) -> u64 {
        1
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(ToolResult::success("late"))
        })
    }
}

/// Always fails.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }
    fn description(&self) -> &str {
        "Always fails."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Err(EvoflowError::ToolExecution {
                tool: "failing".into(),
                message: "boom".into(),
            })
        })
    }
}

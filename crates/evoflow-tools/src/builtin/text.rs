use futures::future::BoxFuture;
use serde::Deserialize;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Tool;
use evoflow_core::types::{ToolContext, ToolResult};

// ── RegexExtractTool ────────────────────────────────────────────

pub struct RegexExtractTool;

#[derive(Deserialize)]
struct RegexExtractInput {
    text: String,
    pattern: String,
    #[serde(default = "default_max_matches")]
    max_matches: usize,
}

fn default_max_matches() -> usize {
    20
}

impl Tool for RegexExtractTool {
    fn name(&self) -> &str {
        "regex_extract"
    }
    fn description(&self) -> &str {
        "Return every match of a regular expression in a text (first capture group if present)."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to search" },
                "pattern": { "type": "string", "description": "Regular expression" },
                "max_matches": { "type": "integer", "description": "Maximum matches to return (default 20)" }
            },
            "required": ["text", "pattern"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: RegexExtractInput = serde_json::from_value(input)
                .map_err(|e| EvoflowError::ToolValidation(e.to_string()))?;
            let re = match regex::Regex::new(&p.pattern) {
                Ok(re) => re,
                Err(e) => return Ok(ToolResult::error(format!("Invalid regex: {}", e))),
            };
            let matches: Vec<&str> = re
                .captures_iter(&p.text)
                .filter_map(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| m.as_str())
                .take(p.max_matches)
                .collect();
            Ok(ToolResult::success(
                serde_json::to_string(&matches).unwrap_or_else(|_| "[]".into()),
            ))
        })
    }
}

// ── TextStatsTool ───────────────────────────────────────────────

pub struct TextStatsTool;

#[derive(Deserialize)]
struct TextStatsInput {
    text: String,
}

impl Tool for TextStatsTool {
    fn name(&self) -> &str {
        "text_stats"
    }
    fn description(&self) -> &str {
        "Count characters, words and lines of a text."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string", "description": "Text to measure" } },
            "required": ["text"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: TextStatsInput = serde_json::from_value(input)
                .map_err(|e| EvoflowError::ToolValidation(e.to_string()))?;
            let stats = serde_json::json!({
                "chars": p.text.chars().count(),
                "words": p.text.split_whitespace().count(),
                "lines": p.text.lines().count(),
            });
            Ok(ToolResult::success(stats.to_string()))
        })
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Tool;
use evoflow_core::types::{ToolContext, ToolDefinition, ToolResult};

use crate::validation::{validate_args, ValidationOutcome};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for the named tools, in the order given. Unknown names are skipped.
    pub fn definitions_for<S: AsRef<str>>(&self, names: &[S]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n.as_ref()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Validate arguments for a call to `name` against its schema.
    pub fn validate(&self, name: &str, input: &serde_json::Value) -> Result<ValidationOutcome> {
        let tool = self
            .get(name)
            .ok_or_else(|| EvoflowError::ToolNotFound(name.to_string()))?;
        Ok(validate_args(&tool.input_schema(), input))
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| EvoflowError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(EvoflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::data::NumberStatsTool);
        registry.register(crate::builtin::text::RegexExtractTool);
        registry.register(crate::builtin::text::TextStatsTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_test_utils::{EchoTool, SlowTool};
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let result = registry
            .execute("echo", json!({"text": "hi"}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolNotFound(_)));
        assert!(registry.validate("nope", &json!({})).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry
            .execute("slow", json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolTimeout { .. }));
    }

    #[test]
    fn test_definitions_follow_requested_order() {
        let registry = ToolRegistry::with_builtins();
        let defs = registry.definitions_for(&["text_stats", "missing", "json_query"]);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["text_stats", "json_query"]);
    }

    #[test]
    fn test_builtins_listed() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.list(),
            vec!["json_query", "number_stats", "regex_extract", "text_stats"]
        );
    }
}

use futures::future::BoxFuture;
use serde::Deserialize;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Tool;
use evoflow_core::types::{ToolContext, ToolResult};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    json: String,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'foo.bar[0].baz')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "type": "string", "description": "JSON string to query" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| EvoflowError::ToolValidation(e.to_string()))?;
            let value: serde_json::Value = serde_json::from_str(&p.json)
                .map_err(|e| EvoflowError::ToolValidation(format!("Invalid JSON: {}", e)))?;
            let result = json_path_query(&value, &p.path);
            Ok(ToolResult::success(
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| "null".into()),
            ))
        })
    }
}

fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // key[0][1]
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
        for idx in indexes
            .split(|c| c == '[' || c == ']')
            .filter(|s| !s.is_empty())
        {
            match idx.parse::<usize>().ok().and_then(|i| current.get(i)) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
    }
    current.clone()
}

// ── NumberStatsTool ─────────────────────────────────────────────

pub struct NumberStatsTool;

#[derive(Deserialize)]
struct NumberStatsInput {
    values: Vec<f64>,
    #[serde(default)]
    precision: Option<u32>,
}

impl Tool for NumberStatsTool {
    fn name(&self) -> &str {
        "number_stats"
    }
    fn description(&self) -> &str {
        "Compute count, sum, mean, min and max of a list of numbers."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "values": { "type": "array", "items": { "type": "number" }, "description": "Numbers to summarize" },
                "precision": { "type": "integer", "description": "Decimal places to round to" }
            },
            "required": ["values"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: NumberStatsInput = serde_json::from_value(input)
                .map_err(|e| EvoflowError::ToolValidation(e.to_string()))?;
            if p.values.is_empty() {
                return Ok(ToolResult::error("No values given"));
            }
            let round = |x: f64| match p.precision {
                Some(d) => {
                    let f = 10f64.powi(d as i32);
                    (x * f).round() / f
                }
                None => x,
            };
            let sum: f64 = p.values.iter().sum();
            let min = p.values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = p.values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let stats = serde_json::json!({
                "count": p.values.len(),
                "sum": round(sum),
                "mean": round(sum / p.values.len() as f64),
                "min": round(min),
                "max": round(max),
            });
            Ok(ToolResult::success(stats.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_path_query() {
        let v = json!({"items": [{"name": "a"}, {"name": "b", "tags": [[1, 2]]}]});
        assert_eq!(json_path_query(&v, "items[1].name"), json!("b"));
        assert_eq!(json_path_query(&v, "items[1].tags[0][1]"), json!(2));
        assert_eq!(json_path_query(&v, "items[5].name"), serde_json::Value::Null);
        assert_eq!(json_path_query(&v, "missing.deep"), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_json_query_tool() {
        let out = JsonQueryTool
            .execute(
                json!({"json": "{\"a\": {\"b\": 3}}", "path": "a.b"}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "3");
    }

    #[tokio::test]
    async fn test_number_stats() {
        let out = NumberStatsTool
            .execute(json!({"values": [1.0, 2.0, 4.0], "precision": 2}), ToolContext::default())
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["count"], 3);
        assert_eq!(v["sum"], 7.0);
        assert_eq!(v["mean"], 2.33);
        assert_eq!(v["max"], 4.0);
    }

    #[tokio::test]
    async fn test_number_stats_empty() {
        let out = NumberStatsTool
            .execute(json!({"values": []}), ToolContext::default())
            .await
            .unwrap();
        assert!(out.is_error);
    }
}

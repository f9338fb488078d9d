use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EvoflowError, Result};

/// Top-level evoflow configuration (`evoflow.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub gp: GpConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model used by the CLI when a workflow does not name one.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_request_timeout(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4.1-mini".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }
fn default_request_timeout() -> u64 { 120 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// "sequential" or "hierarchical".
    #[serde(default = "default_coordination_type")]
    pub coordination_type: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            coordination_type: default_coordination_type(),
        }
    }
}

fn default_coordination_type() -> String { "sequential".to_string() }

/// Admission-control limits on the shared model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: usize,
    #[serde(default = "default_enable_spending_limits")]
    pub enable_spending_limits: bool,
    #[serde(default = "default_max_spend_usd")]
    pub max_spend_usd: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_window_ms: default_rate_window_ms(),
            max_requests_per_window: default_max_requests_per_window(),
            enable_spending_limits: default_enable_spending_limits(),
            max_spend_usd: default_max_spend_usd(),
        }
    }
}

fn default_rate_window_ms() -> u64 { 10_000 }
fn default_max_requests_per_window() -> usize { 30 }
fn default_enable_spending_limits() -> bool { true }
fn default_max_spend_usd() -> f64 { 5.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tools_per_agent")]
    pub max_tools_per_agent: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Upper bound on node executions within one workflow invocation.
    #[serde(default = "default_max_node_invocations")]
    pub max_node_invocations: usize,
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// Rewrite node memory from past feedback before each run.
    #[serde(default)]
    pub self_improve: bool,
    #[serde(default = "default_summary_history")]
    pub summary_history: usize,
    /// How long a finished run waits for queued records to reach the store.
    #[serde(default = "default_message_flush_timeout_ms")]
    pub message_flush_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tools_per_agent: default_max_tools_per_agent(),
            max_tool_rounds: default_max_tool_rounds(),
            max_node_invocations: default_max_node_invocations(),
            max_concurrent_nodes: default_max_concurrent_nodes(),
            self_improve: false,
            summary_history: default_summary_history(),
            message_flush_timeout_ms: default_message_flush_timeout_ms(),
        }
    }
}

fn default_max_tools_per_agent() -> usize { 3 }
fn default_max_tool_rounds() -> usize { 5 }
fn default_max_node_invocations() -> usize { 50 }
fn default_max_concurrent_nodes() -> usize { 4 }
fn default_summary_history() -> usize { 3 }
fn default_message_flush_timeout_ms() -> u64 { 5_000 }

/// Judge model and fitness scoring weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_accuracy_weight")]
    pub accuracy_weight: f64,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_time_weight")]
    pub time_weight: f64,
    /// Cost and time bonuses only apply at or above this accuracy.
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
    #[serde(default = "default_cost_budget_usd")]
    pub cost_budget_usd: f64,
    #[serde(default = "default_time_budget_seconds")]
    pub time_budget_seconds: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            judge_model: default_judge_model(),
            accuracy_weight: default_accuracy_weight(),
            cost_weight: default_cost_weight(),
            time_weight: default_time_weight(),
            accuracy_threshold: default_accuracy_threshold(),
            cost_budget_usd: default_cost_budget_usd(),
            time_budget_seconds: default_time_budget_seconds(),
        }
    }
}

fn default_judge_model() -> String { "gpt-4.1-mini".to_string() }
fn default_accuracy_weight() -> f64 { 0.8 }
fn default_cost_weight() -> f64 { 0.1 }
fn default_time_weight() -> f64 { 0.1 }
fn default_accuracy_threshold() -> f64 { 60.0 }
fn default_cost_budget_usd() -> f64 { 0.10 }
fn default_time_budget_seconds() -> f64 { 120.0 }

/// Genetic-programming loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_generation_amount")]
    pub generation_amount: u32,
    #[serde(default = "default_maximum_time_minutes")]
    pub maximum_time_minutes: u64,
    /// Mean number of edits applied by one mutation.
    #[serde(default = "default_mutation_lambda")]
    pub mutation_lambda: f64,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    #[serde(default = "default_immigration_rate")]
    pub immigration_rate: f64,
    /// Fraction of the ranked population kept each generation.
    #[serde(default = "default_survival_rate")]
    pub survival_rate: f64,
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// JSON file holding an array of workflow configs to start from.
    #[serde(default)]
    pub seed_file: Option<String>,
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub llm_prompt_mutation: bool,
    /// Model used for repair and prompt rewriting; defaults to the judge model.
    #[serde(default)]
    pub operator_model: Option<String>,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            generation_amount: default_generation_amount(),
            maximum_time_minutes: default_maximum_time_minutes(),
            mutation_lambda: default_mutation_lambda(),
            mutation_rate: default_mutation_rate(),
            crossover_rate: default_crossover_rate(),
            immigration_rate: default_immigration_rate(),
            survival_rate: default_survival_rate(),
            tournament_size: default_tournament_size(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            max_nodes: default_max_nodes(),
            seed: None,
            seed_file: None,
            allowed_models: default_allowed_models(),
            allowed_tools: vec![],
            llm_prompt_mutation: false,
            operator_model: None,
        }
    }
}

fn default_population_size() -> usize { 8 }
fn default_generation_amount() -> u32 { 5 }
fn default_maximum_time_minutes() -> u64 { 60 }
fn default_mutation_lambda() -> f64 { 2.0 }
fn default_mutation_rate() -> f64 { 0.6 }
fn default_crossover_rate() -> f64 { 0.3 }
fn default_immigration_rate() -> f64 { 0.1 }
fn default_survival_rate() -> f64 { 0.5 }
fn default_tournament_size() -> usize { 3 }
fn default_max_concurrent_evaluations() -> usize { 4 }
fn default_max_nodes() -> usize { 6 }
fn default_allowed_models() -> Vec<String> {
    vec!["gpt-4.1-mini".to_string(), "gpt-4.1-nano".to_string()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    None,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::None,
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String { "evoflow.db".to_string() }

/// One `[[pricing]]` override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cached_input_per_million: Option<f64>,
    #[serde(default = "default_context_length")]
    pub context_length: u64,
}

fn default_context_length() -> u64 { 128_000 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| EvoflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let gp = &self.gp;
        if gp.population_size < 4 {
            return Err(EvoflowError::Config(format!(
                "gp.population_size must be at least 4, got {}",
                gp.population_size
            )));
        }
        if !(gp.survival_rate > 0.0 && gp.survival_rate <= 1.0) {
            return Err(EvoflowError::Config(format!(
                "gp.survival_rate must be in (0, 1], got {}",
                gp.survival_rate
            )));
        }
        let rates = [gp.mutation_rate, gp.crossover_rate, gp.immigration_rate];
        if rates.iter().any(|r| *r < 0.0) || rates.iter().sum::<f64>() <= 0.0 {
            return Err(EvoflowError::Config(
                "gp operator rates must be non-negative and not all zero".to_string(),
            ));
        }
        if gp.mutation_lambda <= 0.0 {
            return Err(EvoflowError::Config(
                "gp.mutation_lambda must be positive".to_string(),
            ));
        }
        if self.limits.max_requests_per_window == 0 {
            return Err(EvoflowError::Config(
                "limits.max_requests_per_window must be positive".to_string(),
            ));
        }
        if self.agent.max_concurrent_nodes == 0 || gp.max_concurrent_evaluations == 0 {
            return Err(EvoflowError::Config(
                "concurrency limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry settings for model calls, falling back to defaults.
    pub fn retry(&self) -> RetryConfig {
        self.model.retry.clone().unwrap_or_default()
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_EVOFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_EVOFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.coordination.coordination_type, "sequential");
        assert_eq!(config.limits.rate_window_ms, 10_000);
        assert!(config.limits.enable_spending_limits);
        assert_eq!(config.agent.max_tools_per_agent, 3);
        assert_eq!(config.agent.max_node_invocations, 50);
        assert_eq!(config.gp.population_size, 8);
        assert_eq!(config.gp.mutation_lambda, 2.0);
        assert_eq!(config.persistence.backend, PersistenceBackend::None);
        assert_eq!(config.retry().max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_parse() {
        let toml_str = r#"
[model]
model_id = "gpt-4.1"
api_key = "sk-test"

[coordination]
coordination_type = "hierarchical"

[limits]
rate_window_ms = 500
max_requests_per_window = 2
enable_spending_limits = false

[gp]
population_size = 6
seed = 42
allowed_tools = ["json_query"]

[persistence]
backend = "sqlite"
path = "/tmp/evo.db"

[[pricing]]
model = "local"
input_per_million = 0.0
output_per_million = 0.0
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.model_id, "gpt-4.1");
        assert_eq!(config.coordination.coordination_type, "hierarchical");
        assert_eq!(config.limits.max_requests_per_window, 2);
        assert!(!config.limits.enable_spending_limits);
        assert_eq!(config.gp.seed, Some(42));
        assert_eq!(config.gp.allowed_tools, vec!["json_query"]);
        assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
        assert_eq!(config.pricing[0].context_length, 128_000);
    }

    #[test]
    fn test_small_population_rejected() {
        let config: AppConfig = toml::from_str("[gp]\npopulation_size = 3\n").unwrap();
        assert!(matches!(config.validate(), Err(EvoflowError::Config(_))));
    }

    #[test]
    fn test_zero_rates_rejected() {
        let config: AppConfig = toml::from_str(
            "[gp]\nmutation_rate = 0.0\ncrossover_rate = 0.0\nimmigration_rate = 0.0\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

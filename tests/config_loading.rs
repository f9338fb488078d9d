use std::io::Write;

use evoflow_core::config::{AppConfig, PersistenceBackend};
use evoflow_core::error::EvoflowError;

fn load(toml_content: &str) -> evoflow_core::Result<AppConfig> {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    AppConfig::load(tmp.path())
}

#[test]
fn test_load_full_config_from_file() {
    let config = load(
        r#"
[model]
provider = "openai"
model_id = "gpt-4.1"
api_key = "sk-test-key"
max_tokens = 2048

[model.retry]
max_retries = 2
initial_backoff_ms = 500
max_backoff_ms = 4000

[coordination]
coordination_type = "hierarchical"

[limits]
rate_window_ms = 5000
max_requests_per_window = 10
enable_spending_limits = true
max_spend_usd = 1.5

[agent]
max_tools_per_agent = 2
self_improve = true

[evaluation]
judge_model = "gpt-4.1-nano"
accuracy_threshold = 70

[gp]
population_size = 6
generation_amount = 3
maximum_time_minutes = 15
seed = 42
allowed_models = ["gpt-4.1-mini"]
allowed_tools = ["text_stats"]

[persistence]
backend = "sqlite"
path = "/tmp/evoflow-test.db"

[[pricing]]
model = "local-llama"
input_per_million = 0.0
output_per_million = 0.0
"#,
    )
    .expect("load config");

    assert_eq!(config.model.model_id, "gpt-4.1");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.retry().max_retries, 2);
    assert_eq!(config.coordination.coordination_type, "hierarchical");
    assert_eq!(config.limits.max_requests_per_window, 10);
    assert_eq!(config.agent.max_tools_per_agent, 2);
    assert!(config.agent.self_improve);
    assert_eq!(config.evaluation.judge_model, "gpt-4.1-nano");
    assert_eq!(config.evaluation.accuracy_threshold, 70.0);
    assert_eq!(config.gp.population_size, 6);
    assert_eq!(config.gp.seed, Some(42));
    assert_eq!(config.gp.allowed_tools, vec!["text_stats"]);
    assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
    assert_eq!(config.pricing.len(), 1);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("EVOFLOW_TEST_API_KEY", "expanded-key-value");
    let config = load(
        r#"
[model]
api_key = "${EVOFLOW_TEST_API_KEY}"
"#,
    )
    .expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));
    std::env::remove_var("EVOFLOW_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = load(
        r#"
[model]
model_id = "gpt-4.1-mini"
"#,
    )
    .expect("load config");

    assert_eq!(config.coordination.coordination_type, "sequential");
    assert_eq!(config.limits.rate_window_ms, 10_000);
    assert_eq!(config.agent.max_tools_per_agent, 3);
    assert_eq!(config.gp.population_size, 8);
    assert_eq!(config.gp.mutation_lambda, 2.0);
    assert_eq!(config.persistence.backend, PersistenceBackend::None);
    assert!(config.pricing.is_empty());
}

#[test]
fn test_small_population_is_rejected() {
    let result = load(
        r#"
[gp]
population_size = 3
"#,
    );
    assert!(matches!(result, Err(EvoflowError::Config(_))));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let config = AppConfig::default();
    let text = toml::to_string_pretty(&config).expect("serialize");
    let parsed: AppConfig = toml::from_str(&text).expect("parse");
    assert_eq!(parsed.gp.population_size, config.gp.population_size);
}

pub mod providers;
pub mod retry;

use std::sync::Arc;

use evoflow_core::config::ModelConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ModelClient;

pub use providers::openai::OpenAiClient;
pub use retry::calculate_backoff;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    match config.provider.as_str() {
        "openai" | "openrouter" | "ollama" | "groq" | "vllm" | "compatible" => {
            Ok(Arc::new(OpenAiClient::new(config)?))
        }
        other => Err(EvoflowError::Config(format!(
            "unsupported model provider '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_config_error() {
        let config = ModelConfig {
            provider: "carrier-pigeon".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(create_client(&config), Err(EvoflowError::Config(_))));
    }

    #[test]
    fn test_openai_provider_builds() {
        assert!(create_client(&ModelConfig::default()).is_ok());
    }
}

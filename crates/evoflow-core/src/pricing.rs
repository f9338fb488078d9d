use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::PricingEntry;
use crate::traits::PricingCatalog;
use crate::types::TokenUsage;

/// Token pricing for one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cached_input_per_million: Option<f64>,
    pub context_length: u64,
}

impl ModelPricing {
    /// Cost of one call. Cached input tokens are billed at the cached rate
    /// when the model has one, otherwise at the regular input rate.
    pub fn usd_cost(&self, usage: &TokenUsage) -> f64 {
        let cached = usage.cached_input_tokens.min(usage.input_tokens);
        let uncached = usage.input_tokens - cached;
        let cached_rate = self
            .cached_input_per_million
            .unwrap_or(self.input_per_million);

        (uncached as f64 * self.input_per_million
            + cached as f64 * cached_rate
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// In-memory catalog seeded with common OpenAI-compatible models.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: HashMap<String, ModelPricing>,
}

impl StaticCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut catalog = Self::default();
        catalog.insert("gpt-4.1", pricing(2.0, 8.0, Some(0.5), 1_047_576));
        catalog.insert("gpt-4.1-mini", pricing(0.4, 1.6, Some(0.1), 1_047_576));
        catalog.insert("gpt-4.1-nano", pricing(0.1, 0.4, Some(0.025), 1_047_576));
        catalog.insert("gpt-4o", pricing(2.5, 10.0, Some(1.25), 128_000));
        catalog.insert("gpt-4o-mini", pricing(0.15, 0.6, Some(0.075), 128_000));
        catalog
    }

    /// Defaults overlaid with entries from `[[pricing]]`.
    pub fn from_entries(entries: &[PricingEntry]) -> Self {
        let mut catalog = Self::with_defaults();
        for entry in entries {
            catalog.insert(
                &entry.model,
                pricing(
                    entry.input_per_million,
                    entry.output_per_million,
                    entry.cached_input_per_million,
                    entry.context_length,
                ),
            );
        }
        catalog
    }

    pub fn insert(&mut self, model: &str, pricing: ModelPricing) {
        self.models.insert(model.to_string(), pricing);
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PricingCatalog for StaticCatalog {
    fn find_model(&self, name: &str) -> Option<ModelPricing> {
        if let Some(p) = self.models.get(name) {
            return Some(*p);
        }
        // Provider-prefixed ids such as "openai/gpt-4.1-mini"
        name.rsplit_once('/')
            .and_then(|(_, bare)| self.models.get(bare).copied())
    }
}

fn pricing(input: f64, output: f64, cached: Option<f64>, context_length: u64) -> ModelPricing {
    ModelPricing {
        input_per_million: input,
        output_per_million: output,
        cached_input_per_million: cached,
        context_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_cost() {
        let p = pricing(1.0, 2.0, Some(0.5), 1000);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            cached_input_tokens: 200_000,
        };
        // 800k * 1.0 + 200k * 0.5 + 500k * 2.0
        assert!((p.usd_cost(&usage) - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_cached_without_rate_uses_input_rate() {
        let p = pricing(1.0, 0.0, None, 1000);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cached_input_tokens: 1_000_000,
        };
        assert!((p.usd_cost(&usage) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_with_provider_prefix_and_overrides() {
        let catalog = StaticCatalog::from_entries(&[PricingEntry {
            model: "local-llama".into(),
            input_per_million: 0.0,
            output_per_million: 0.0,
            cached_input_per_million: None,
            context_length: 8192,
        }]);
        assert!(catalog.find_model("openai/gpt-4.1-mini").is_some());
        assert_eq!(catalog.find_model("local-llama").unwrap().context_length, 8192);
        assert!(catalog.find_model("unknown").is_none());
    }
}

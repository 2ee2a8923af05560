use std::collections::BTreeMap;

use dotprompt_common::config::ModelConfig;
use serde::Serialize;

use crate::error::{Result, RuntimeError};

/// Pricing and routing data for one model id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    /// Name sent on the wire; usually the same as `name`.
    pub wire_name: String,
    /// Price per input token.
    pub input: f64,
    /// Price per output token.
    pub output: f64,
    pub context: Option<u64>,
}

impl ModelInfo {
    pub fn new(name: &str, provider: &str, input: f64, output: f64) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            wire_name: name.to_string(),
            input,
            output,
            context: None,
        }
    }

    pub fn with_context(mut self, context: u64) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> (f64, f64) {
        (tokens_in as f64 * self.input, tokens_out as f64 * self.output)
    }
}

/// Model id → provider and price table.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog seeded with commonly used models.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for info in [
            ModelInfo::new("gpt-4o", "OpenAI", 0.0000025, 0.00001).with_context(128_000),
            ModelInfo::new("gpt-4o-mini", "OpenAI", 0.00000015, 0.0000006).with_context(128_000),
            ModelInfo::new("gpt-4.1", "OpenAI", 0.000002, 0.000008).with_context(1_047_576),
            ModelInfo::new("o3-mini", "OpenAI", 0.0000011, 0.0000044).with_context(200_000),
            ModelInfo::new("claude-sonnet-4-20250514", "Anthropic", 0.000003, 0.000015)
                .with_context(200_000),
            ModelInfo::new("claude-3-5-haiku-20241022", "Anthropic", 0.0000008, 0.000004)
                .with_context(200_000),
            ModelInfo::new("gemini-2.0-flash", "Google", 0.0000001, 0.0000004)
                .with_context(1_048_576),
            ModelInfo::new("gemini-2.5-pro", "Google", 0.00000125, 0.00001)
                .with_context(1_048_576),
            ModelInfo::new("mistral-large-latest", "MistralAI", 0.000002, 0.000006)
                .with_context(131_072),
            ModelInfo::new("mistral-small-latest", "MistralAI", 0.0000002, 0.0000006)
                .with_context(32_768),
            ModelInfo::new("grok-3", "XAI", 0.000003, 0.000015).with_context(131_072),
            ModelInfo::new("deepseek-chat", "DeepSeek", 0.00000027, 0.0000011)
                .with_context(64_000),
        ] {
            catalog.insert(info);
        }
        catalog
    }

    /// Builtin entries overlaid with the `[models]` config sections.
    pub fn with_overrides(mut self, models: &BTreeMap<String, ModelConfig>) -> Self {
        for (name, config) in models {
            self.insert(ModelInfo {
                name: name.clone(),
                provider: config.provider.clone(),
                wire_name: config.wire_name.clone().unwrap_or_else(|| name.clone()),
                input: config.input,
                output: config.output,
                context: config.context,
            });
        }
        self
    }

    pub fn insert(&mut self, info: ModelInfo) {
        self.models.insert(info.name.clone(), info);
    }

    pub fn get(&self, name: &str) -> Result<&ModelInfo> {
        self.models
            .get(name)
            .ok_or_else(|| RuntimeError::ModelNotFound(format!("unknown model '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }
}

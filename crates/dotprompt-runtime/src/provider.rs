use std::collections::{BTreeMap, HashMap};

use dotprompt_common::config::ProviderConfig;
use dotprompt_common::{Conversation, Message};
use serde_json::Value;

use crate::catalog::ModelInfo;
use crate::error::{Result, RuntimeError};
use crate::providers::{AnthropicAdapter, GoogleAdapter, MistralAdapter, OpenAiAdapter};

// ============================================================================
// Adapter trait and wire types
// ============================================================================

/// A function the model may call, as advertised to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-request knobs taken from the variable store and config.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    /// Model name as the backend knows it.
    pub model: String,
    pub api_key: Option<String>,
    /// Overrides the adapter's default endpoint.
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// A fully built HTTP request, ready for a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// The decoded result of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
    pub cost_in: f64,
    pub cost_out: f64,
}

impl Completion {
    pub fn priced(messages: Vec<Message>, usage: TokenUsage, model: &ModelInfo) -> Self {
        let (cost_in, cost_out) = model.cost(usage.tokens_in, usage.tokens_out);
        Completion {
            messages,
            usage,
            cost_in,
            cost_out,
        }
    }
}

/// Translator between the universal message model and one backend's wire
/// schema. Adapters hold no per-conversation state.
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as used by the model catalog.
    fn name(&self) -> &str;

    fn requires_api_key(&self) -> bool {
        true
    }

    fn to_wire(
        &self,
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<WireRequest>;

    /// Decode a response body. A function call the backend sent without an
    /// id decodes with an empty id.
    fn from_wire(&self, body: &Value, model: &ModelInfo) -> Result<Completion>;
}

// ============================================================================
// Adapter registry
// ============================================================================

/// Provider name → adapter.
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
        }
    }

    /// Every backend this crate ships an adapter for.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(OpenAiAdapter::new());
        registry.register(OpenAiAdapter::compatible("XAI", "https://api.x.ai"));
        registry.register(OpenAiAdapter::compatible("DeepSeek", "https://api.deepseek.com"));
        registry.register(AnthropicAdapter::new());
        registry.register(GoogleAdapter::new());
        registry.register(MistralAdapter::new());
        registry
    }

    pub fn register(&mut self, adapter: impl ProviderAdapter + 'static) {
        self.adapters
            .insert(adapter.name().to_string(), Box::new(adapter));
    }

    pub fn get(&self, provider: &str) -> Result<&dyn ProviderAdapter> {
        self.adapters
            .get(provider)
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                RuntimeError::ModelNotFound(format!("no adapter for provider '{}'", provider))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Supplies API keys. Where keys are stored is not this crate's concern.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self, provider: &str) -> Option<String>;
}

/// Reads keys from environment variables, `<PROVIDER>_API_KEY` unless the
/// config names another variable.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    env_names: BTreeMap<String, String>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Self {
        let env_names = providers
            .iter()
            .filter_map(|(name, p)| p.api_key_env.clone().map(|env| (name.clone(), env)))
            .collect();
        Self { env_names }
    }

    pub fn env_name(&self, provider: &str) -> String {
        self.env_names
            .get(provider)
            .cloned()
            .unwrap_or_else(|| format!("{}_API_KEY", provider.to_uppercase()))
    }
}

impl CredentialSource for EnvCredentials {
    fn api_key(&self, provider: &str) -> Option<String> {
        std::env::var(self.env_name(provider))
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Fixed keys, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: &str, key: &str) -> Self {
        self.keys.insert(provider.to_string(), key.to_string());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn api_key(&self, provider: &str) -> Option<String> {
        self.keys.get(provider).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_all_backends() {
        let registry = AdapterRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["Anthropic", "DeepSeek", "Google", "MistralAI", "OpenAI", "XAI"]
        );
    }

    #[test]
    fn missing_adapter_is_model_not_found() {
        let registry = AdapterRegistry::empty();
        let err = registry.get("OpenAI").err().unwrap();
        assert!(matches!(err, RuntimeError::ModelNotFound(_)));
    }

    #[test]
    fn env_credentials_naming() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "OpenAI".to_string(),
            ProviderConfig {
                api_key_env: Some("MY_KEY".to_string()),
                base_url: None,
            },
        );
        let creds = EnvCredentials::from_config(&providers);
        assert_eq!(creds.env_name("OpenAI"), "MY_KEY");
        assert_eq!(creds.env_name("Anthropic"), "ANTHROPIC_API_KEY");
    }

    #[test]
    fn static_credentials() {
        let creds = StaticCredentials::new().with_key("Google", "g-key");
        assert_eq!(creds.api_key("Google").as_deref(), Some("g-key"));
        assert_eq!(creds.api_key("OpenAI"), None);
    }
}

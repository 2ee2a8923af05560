pub mod anthropic;
pub mod google;
pub mod mistral;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use mistral::MistralAdapter;
pub use openai::OpenAiAdapter;

use dotprompt_common::ImageRef;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::provider::ModelParams;

fn data_url(image: &ImageRef) -> String {
    format!("data:{};base64,{}", image.media_type, image.data)
}

fn base_url<'a>(params: &'a ModelParams, default: &'a str) -> &'a str {
    params
        .base_url
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
}

fn api_key<'a>(params: &'a ModelParams, provider: &str) -> Result<&'a str> {
    params
        .api_key
        .as_deref()
        .ok_or_else(|| RuntimeError::ProviderAuth {
            provider: provider.to_string(),
            message: "no API key configured".to_string(),
        })
}

fn token_count(usage: Option<&Value>, field: &str) -> u64 {
    usage
        .and_then(|u| u.get(field))
        .and_then(|t| t.as_u64())
        .unwrap_or(0)
}

/// Function arguments sent as a JSON string by chat-completions style APIs.
fn decode_arguments(provider: &str, raw: Option<&Value>) -> Result<Value> {
    match raw {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Value::Object(Default::default())),
        Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| {
            RuntimeError::translation(provider, format!("function arguments are not JSON: {}", e))
        }),
        Some(other) => Ok(other.clone()),
    }
}

/// An error object some backends return with a 200 status.
fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    Some(
        error
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| error.to_string()),
    )
}

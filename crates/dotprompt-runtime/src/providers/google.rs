use dotprompt_common::{ContentBlock, Conversation, Message, Role};
use serde_json::{json, Value};

use crate::catalog::ModelInfo;
use crate::error::{Result, RuntimeError};
use crate::provider::{Completion, ModelParams, ProviderAdapter, TokenUsage, ToolDeclaration, WireRequest};

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const NAME: &str = "Google";

/// Gemini `generateContent` adapter.
///
/// Gemini often omits function call ids. Such calls decode with an empty id
/// and the engine assigns one that is unique within the conversation.
#[derive(Debug, Default)]
pub struct GoogleAdapter;

impl GoogleAdapter {
    pub fn new() -> Self {
        GoogleAdapter
    }

    pub fn build_request_body(
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<Value> {
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for message in conversation {
            if message.role == Role::System {
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => system_parts.push(json!({"text": text})),
                        other => {
                            return Err(RuntimeError::translation(
                                NAME,
                                format!("{} content is not allowed in a system message", other.kind_name()),
                            ))
                        }
                    }
                }
                continue;
            }
            let parts = message
                .content
                .iter()
                .map(|block| encode_part(message.role, block))
                .collect::<Result<Vec<_>>>()?;
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            contents.push(json!({"role": role, "parts": parts}));
        }

        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["system_instruction"] = json!({ "parts": system_parts });
        }

        let mut generation = serde_json::Map::new();
        if let Some(temp) = params.temperature {
            generation.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max) = params.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut parameters = t.parameters.clone();
                    strip_additional_properties(&mut parameters);
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        Ok(body)
    }

    pub fn parse_response(json: &Value) -> Result<(Message, TokenUsage)> {
        if let Some(message) = super::error_message(json) {
            return Err(RuntimeError::api(NAME, message));
        }

        let candidate = json
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| RuntimeError::api(NAME, "no candidates in response"))?;
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|p| p.as_slice())
            .unwrap_or_default();

        let mut content = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                content.push(ContentBlock::text(text));
            } else if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| RuntimeError::translation(NAME, "functionCall without a name"))?;
                let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                content.push(ContentBlock::call(id, name, args));
            } else {
                return Err(RuntimeError::translation(
                    NAME,
                    format!("unsupported response part {}", part),
                ));
            }
        }

        let usage = json.get("usageMetadata");
        let usage = TokenUsage {
            tokens_in: super::token_count(usage, "promptTokenCount"),
            tokens_out: super::token_count(usage, "candidatesTokenCount"),
        };
        Ok((Message::new(Role::Assistant, content), usage))
    }
}

fn encode_part(role: Role, block: &ContentBlock) -> Result<Value> {
    match (role, block) {
        (Role::User | Role::Assistant, ContentBlock::Text { text }) => Ok(json!({"text": text})),
        (Role::User, ContentBlock::Image { image }) => Ok(json!({
            "inlineData": {"mimeType": image.media_type, "data": image.data}
        })),
        (Role::Assistant, ContentBlock::FunctionCall { id, name, arguments }) => Ok(json!({
            "functionCall": {"id": id, "name": name, "args": arguments}
        })),
        (
            Role::Tool,
            ContentBlock::FunctionResult {
                id,
                name,
                content,
                is_error,
            },
        ) => {
            let response = if *is_error {
                json!({"error": content})
            } else {
                json!({"content": content})
            };
            Ok(json!({
                "functionResponse": {"id": id, "name": name, "response": response}
            }))
        }
        (role, other) => Err(RuntimeError::translation(
            NAME,
            format!("{} content is not allowed in a {} message", other.kind_name(), role),
        )),
    }
}

/// Gemini rejects `additionalProperties` anywhere in a parameter schema.
fn strip_additional_properties(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("additionalProperties");
            for value in map.values_mut() {
                strip_additional_properties(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_additional_properties(item);
            }
        }
        _ => {}
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn to_wire(
        &self,
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<WireRequest> {
        let body = Self::build_request_body(conversation, tools, params)?;
        let key = super::api_key(params, NAME)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            super::base_url(params, GOOGLE_BASE_URL),
            params.model
        );
        Ok(WireRequest {
            url,
            headers: vec![
                ("x-goog-api-key".to_string(), key.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn from_wire(&self, body: &Value, model: &ModelInfo) -> Result<Completion> {
        let (message, usage) = Self::parse_response(body)?;
        Ok(Completion::priced(vec![message], usage, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ModelParams {
        ModelParams {
            model: "gemini-2.0-flash".to_string(),
            api_key: Some("g".to_string()),
            temperature: Some(0.2),
            ..Default::default()
        }
    }

    #[test]
    fn roles_and_system_instruction() {
        let conv = Conversation::from(vec![
            Message::text(Role::System, "terse"),
            Message::text(Role::User, "hi"),
            Message::text(Role::Assistant, "hello"),
        ]);
        let body = GoogleAdapter::build_request_body(&conv, &[], &params()).unwrap();
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "terse");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["temperature"], 0.2);
    }

    #[test]
    fn function_turns_and_declarations() {
        let conv = Conversation::from(vec![
            Message::new(
                Role::Assistant,
                vec![ContentBlock::call("f-1", "lookup", json!({"q": "a"}))],
            ),
            Message::new(Role::Tool, vec![ContentBlock::result("f-1", "lookup", "found")]),
        ]);
        let tools = vec![ToolDeclaration {
            name: "lookup".into(),
            description: "Look up".into(),
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {"q": {"type": "object", "additionalProperties": false}}
            }),
        }];
        let body = GoogleAdapter::build_request_body(&conv, &tools, &params()).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(body["contents"][1]["role"], "user");
        assert_eq!(
            body["contents"][1]["parts"][0]["functionResponse"]["response"]["content"],
            "found"
        );
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert!(decl["parameters"].get("additionalProperties").is_none());
        assert!(decl["parameters"]["properties"]["q"]
            .get("additionalProperties")
            .is_none());
    }

    #[test]
    fn url_names_model() {
        let req = GoogleAdapter::new()
            .to_wire(&Conversation::new(), &[], &params())
            .unwrap();
        assert_eq!(
            req.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn parse_response_keeps_missing_call_ids_empty() {
        let json = json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "ok"},
                {"functionCall": {"name": "lookup", "args": {"q": "x"}}},
                {"functionCall": {"id": "fc-7", "name": "lookup", "args": {"q": "y"}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3}
        });
        let (message, usage) = GoogleAdapter::parse_response(&json).unwrap();
        let ids: Vec<_> = message.function_calls().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["", "fc-7"]);
        assert_eq!(usage, TokenUsage { tokens_in: 7, tokens_out: 3 });
    }

    #[test]
    fn unknown_part_is_translation_error() {
        let json = json!({"candidates": [{"content": {"parts": [{"executableCode": {}}]}}]});
        assert!(matches!(
            GoogleAdapter::parse_response(&json),
            Err(RuntimeError::Translation { .. })
        ));
    }

    #[test]
    fn round_trip_preserves_model_turn() {
        let original = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("thinking"),
                ContentBlock::call("lookup-1", "lookup", json!({"q": 1})),
            ],
        );
        let conv = Conversation::from(vec![original.clone()]);
        let body = GoogleAdapter::build_request_body(&conv, &[], &params()).unwrap();
        let response = json!({"candidates": [{"content": body["contents"][0].clone()}]});
        let (decoded, _) = GoogleAdapter::parse_response(&response).unwrap();
        assert_eq!(decoded, original);
    }
}

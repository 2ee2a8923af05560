use dotprompt_common::{ContentBlock, Conversation, Message, Role};
use serde_json::{json, Value};

use crate::catalog::ModelInfo;
use crate::error::{Result, RuntimeError};
use crate::provider::{Completion, ModelParams, ProviderAdapter, TokenUsage, ToolDeclaration, WireRequest};

const MISTRAL_BASE_URL: &str = "https://api.mistral.ai";
const NAME: &str = "MistralAI";

/// Mistral chat completions adapter. Close to OpenAI's schema, but content is
/// always a part array, `image_url` is a bare string and tool messages carry
/// the function name.
#[derive(Debug, Default)]
pub struct MistralAdapter;

impl MistralAdapter {
    pub fn new() -> Self {
        MistralAdapter
    }

    pub fn build_request_body(
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<Value> {
        let mut messages = Vec::with_capacity(conversation.len());
        for message in conversation {
            if message.role == Role::Tool {
                for block in &message.content {
                    match block {
                        ContentBlock::FunctionResult {
                            id,
                            name,
                            content,
                            is_error,
                        } => {
                            let content = if *is_error {
                                format!("Error: {}", content)
                            } else {
                                content.clone()
                            };
                            messages.push(json!({
                                "role": "tool",
                                "name": name,
                                "tool_call_id": id,
                                "content": content,
                            }));
                        }
                        other => {
                            return Err(RuntimeError::translation(
                                NAME,
                                format!("{} content is not allowed in a tool message", other.kind_name()),
                            ))
                        }
                    }
                }
                continue;
            }

            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in &message.content {
                match (message.role, block) {
                    (_, ContentBlock::Text { text }) => {
                        parts.push(json!({"type": "text", "text": text}))
                    }
                    (Role::User, ContentBlock::Image { image }) => parts.push(json!({
                        "type": "image_url",
                        "image_url": super::data_url(image),
                    })),
                    (Role::Assistant, ContentBlock::FunctionCall { id, name, arguments }) => {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments.to_string()},
                        }))
                    }
                    (role, other) => {
                        return Err(RuntimeError::translation(
                            NAME,
                            format!("{} content is not allowed in a {} message", other.kind_name(), role),
                        ))
                    }
                }
            }
            let mut msg = json!({"role": message.role.to_string(), "content": parts});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            messages.push(msg);
        }

        let mut body = json!({
            "model": params.model,
            "messages": messages,
        });
        if let Some(temp) = params.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = params.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tool_defs);
            body["tool_choice"] = json!("auto");
        }
        Ok(body)
    }

    pub fn parse_response(json: &Value) -> Result<(Message, TokenUsage)> {
        if let Some(message) = super::error_message(json) {
            return Err(RuntimeError::api(NAME, message));
        }
        let message = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| RuntimeError::api(NAME, "no choices in response"))?;

        let mut content = Vec::new();
        match message.get("content") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) if text.is_empty() => {}
            Some(Value::String(text)) => content.push(ContentBlock::text(text.as_str())),
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                            content.push(ContentBlock::text(text));
                        }
                        other => {
                            return Err(RuntimeError::translation(
                                NAME,
                                format!("unsupported response content part {:?}", other),
                            ))
                        }
                    }
                }
            }
            Some(other) => {
                return Err(RuntimeError::translation(
                    NAME,
                    format!("unexpected content value {}", other),
                ))
            }
        }

        for call in message
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default()
        {
            let id = call.get("id").and_then(|i| i.as_str()).unwrap_or("");
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .ok_or_else(|| RuntimeError::translation(NAME, "tool call without a name"))?;
            let arguments = super::decode_arguments(NAME, function.and_then(|f| f.get("arguments")))?;
            content.push(ContentBlock::call(id, name, arguments));
        }

        let usage = json.get("usage");
        let usage = TokenUsage {
            tokens_in: super::token_count(usage, "prompt_tokens"),
            tokens_out: super::token_count(usage, "completion_tokens"),
        };
        Ok((Message::new(Role::Assistant, content), usage))
    }
}

impl ProviderAdapter for MistralAdapter {
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
        Ok(WireRequest {
            url: format!("{}/v1/chat/completions", super::base_url(params, MISTRAL_BASE_URL)),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {}", key)),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
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
    use dotprompt_common::ImageRef;

    fn params() -> ModelParams {
        ModelParams {
            model: "mistral-large-latest".to_string(),
            api_key: Some("m".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn content_is_part_array_with_string_image_url() {
        let conv = Conversation::from(vec![Message::new(
            Role::User,
            vec![
                ContentBlock::text("see"),
                ContentBlock::Image {
                    image: ImageRef {
                        path: "p.png".into(),
                        media_type: "image/png".into(),
                        data: "QQ==".into(),
                    },
                },
            ],
        )]);
        let body = MistralAdapter::build_request_body(&conv, &[], &params()).unwrap();
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["text"], "see");
        assert_eq!(content[1]["image_url"], "data:image/png;base64,QQ==");
    }

    #[test]
    fn tools_set_tool_choice_auto() {
        let tools = vec![ToolDeclaration {
            name: "f".into(),
            description: "d".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = MistralAdapter::build_request_body(&Conversation::new(), &tools, &params()).unwrap();
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "f");
    }

    #[test]
    fn tool_message_carries_name() {
        let conv = Conversation::from(vec![
            Message::new(Role::Assistant, vec![ContentBlock::call("abc123xyz", "f", json!({}))]),
            Message::new(Role::Tool, vec![ContentBlock::result("abc123xyz", "f", "42")]),
        ]);
        let body = MistralAdapter::build_request_body(&conv, &[], &params()).unwrap();
        assert_eq!(body["messages"][1]["name"], "f");
        assert_eq!(body["messages"][1]["tool_call_id"], "abc123xyz");
    }

    #[test]
    fn round_trip_preserves_assistant_turn() {
        let original = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("sure"),
                ContentBlock::call("abc123xyz", "f", json!({"n": 2})),
            ],
        );
        let conv = Conversation::from(vec![original.clone()]);
        let body = MistralAdapter::build_request_body(&conv, &[], &params()).unwrap();
        let response = json!({
            "choices": [{"message": body["messages"][0].clone()}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2}
        });
        let (decoded, usage) = MistralAdapter::parse_response(&response).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(usage.tokens_in, 4);
    }
}

use dotprompt_common::{ContentBlock, Conversation, Message, Role};
use serde_json::{json, Value};

use crate::catalog::ModelInfo;
use crate::error::{Result, RuntimeError};
use crate::provider::{Completion, ModelParams, ProviderAdapter, TokenUsage, ToolDeclaration, WireRequest};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// OpenAI chat-completions adapter.
///
/// Also serves OpenAI-compatible endpoints (xAI, DeepSeek, local servers)
/// under a different provider name and base URL.
pub struct OpenAiAdapter {
    name: String,
    default_base_url: String,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self::compatible("OpenAI", OPENAI_BASE_URL)
    }

    pub fn compatible(name: &str, base_url: &str) -> Self {
        OpenAiAdapter {
            name: name.to_string(),
            default_base_url: base_url.to_string(),
        }
    }

    /// Build the JSON request body for the chat completions API.
    pub fn build_request_body(
        &self,
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<Value> {
        let mut messages = Vec::with_capacity(conversation.len());
        for message in conversation {
            match message.role {
                Role::Tool => {
                    for block in &message.content {
                        messages.push(self.tool_message(block)?);
                    }
                }
                _ => messages.push(self.chat_message(message)?),
            }
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
        }
        Ok(body)
    }

    fn chat_message(&self, message: &Message) -> Result<Value> {
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
                ContentBlock::Image { image } if message.role == Role::User => parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": super::data_url(image)},
                })),
                ContentBlock::FunctionCall {
                    id,
                    name,
                    arguments,
                } if message.role == Role::Assistant => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments.to_string()},
                })),
                other => {
                    return Err(RuntimeError::translation(
                        &self.name,
                        format!("{} content is not allowed in a {} message", other.kind_name(), message.role),
                    ))
                }
            }
        }

        let only_text = parts.iter().all(|p| p["type"] == "text");
        let content = if parts.is_empty() {
            Value::Null
        } else if only_text && parts.len() == 1 {
            parts[0]["text"].clone()
        } else {
            Value::Array(parts)
        };

        let mut msg = json!({
            "role": message.role.to_string(),
            "content": content,
        });
        if !tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(tool_calls);
        }
        Ok(msg)
    }

    fn tool_message(&self, block: &ContentBlock) -> Result<Value> {
        match block {
            ContentBlock::FunctionResult {
                id,
                content,
                is_error,
                ..
            } => {
                let content = if *is_error {
                    format!("Error: {}", content)
                } else {
                    content.clone()
                };
                Ok(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": content,
                }))
            }
            other => Err(RuntimeError::translation(
                &self.name,
                format!("{} content is not allowed in a tool message", other.kind_name()),
            )),
        }
    }

    /// Decode the assistant message and token usage from a response body.
    pub fn parse_response(&self, json: &Value) -> Result<(Message, TokenUsage)> {
        if let Some(message) = super::error_message(json) {
            return Err(RuntimeError::api(&self.name, message));
        }

        let message = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| RuntimeError::api(&self.name, "no choices in response"))?;

        let mut content = Vec::new();
        match message.get("content") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                if !text.is_empty() {
                    content.push(ContentBlock::text(text.as_str()));
                }
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    match (part.get("type").and_then(|t| t.as_str()), part.get("text")) {
                        (Some("text"), Some(Value::String(text))) => {
                            content.push(ContentBlock::text(text.as_str()))
                        }
                        (kind, _) => {
                            return Err(RuntimeError::translation(
                                &self.name,
                                format!("unsupported response content part {:?}", kind),
                            ))
                        }
                    }
                }
            }
            Some(other) => {
                return Err(RuntimeError::translation(
                    &self.name,
                    format!("unexpected content value {}", other),
                ))
            }
        }
        if content.is_empty() {
            if let Some(refusal) = message.get("refusal").and_then(|r| r.as_str()) {
                content.push(ContentBlock::text(refusal));
            }
        }

        if let Some(calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
            for call in calls {
                let kind = call.get("type").and_then(|t| t.as_str()).unwrap_or("function");
                if kind != "function" {
                    return Err(RuntimeError::translation(
                        &self.name,
                        format!("unsupported tool call type '{}'", kind),
                    ));
                }
                let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                let function = call.get("function");
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| RuntimeError::translation(&self.name, "tool call without a name"))?;
                let arguments =
                    super::decode_arguments(&self.name, function.and_then(|f| f.get("arguments")))?;
                content.push(ContentBlock::call(id, name, arguments));
            }
        }

        let usage = json.get("usage");
        let usage = TokenUsage {
            tokens_in: super::token_count(usage, "prompt_tokens"),
            tokens_out: super::token_count(usage, "completion_tokens"),
        };
        Ok((Message::new(Role::Assistant, content), usage))
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_wire(
        &self,
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<WireRequest> {
        let body = self.build_request_body(conversation, tools, params)?;
        let key = super::api_key(params, &self.name)?;
        let url = format!(
            "{}/v1/chat/completions",
            super::base_url(params, &self.default_base_url)
        );
        Ok(WireRequest {
            url,
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {}", key)),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn from_wire(&self, body: &Value, model: &ModelInfo) -> Result<Completion> {
        let (message, usage) = self.parse_response(body)?;
        Ok(Completion::priced(vec![message], usage, model))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dotprompt_common::ImageRef;

    fn params() -> ModelParams {
        ModelParams {
            model: "gpt-4o".to_string(),
            api_key: Some("sk-test".to_string()),
            temperature: Some(0.7),
            max_tokens: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn build_request_basic() {
        let conv = Conversation::from(vec![
            Message::text(Role::System, "be brief"),
            Message::text(Role::User, "Hello"),
        ]);
        let body = OpenAiAdapter::new()
            .build_request_body(&conv, &[], &params())
            .unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn build_request_with_image_and_tools() {
        let conv = Conversation::from(vec![Message::new(
            Role::User,
            vec![
                ContentBlock::text("what is this?"),
                ContentBlock::Image {
                    image: ImageRef {
                        path: "cat.png".into(),
                        media_type: "image/png".into(),
                        data: "AAAA".into(),
                    },
                },
            ],
        )]);
        let tools = vec![ToolDeclaration {
            name: "get_weather".to_string(),
            description: "Get weather for a city".to_string(),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }];
        let body = OpenAiAdapter::new()
            .build_request_body(&conv, &tools, &params())
            .unwrap();
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn tool_turns_are_encoded() {
        let conv = Conversation::from(vec![
            Message::new(
                Role::Assistant,
                vec![ContentBlock::call("call_1", "get_weather", json!({"city": "Paris"}))],
            ),
            Message::new(
                Role::Tool,
                vec![
                    ContentBlock::result("call_1", "get_weather", "sunny"),
                    ContentBlock::failed_result("call_2", "get_time", "timed out"),
                ],
            ),
        ]);
        let body = OpenAiAdapter::new()
            .build_request_body(&conv, &[], &params())
            .unwrap();
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(msgs[0]["content"].is_null());
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Paris\"}");
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["tool_call_id"], "call_1");
        assert_eq!(msgs[2]["content"], "Error: timed out");
    }

    #[test]
    fn image_in_assistant_message_is_translation_error() {
        let conv = Conversation::from(vec![Message::new(
            Role::Assistant,
            vec![ContentBlock::Image {
                image: ImageRef {
                    path: "x.png".into(),
                    media_type: "image/png".into(),
                    data: "AA".into(),
                },
            }],
        )]);
        let err = OpenAiAdapter::new()
            .build_request_body(&conv, &[], &params())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Translation { .. }));
    }

    #[test]
    fn to_wire_requires_key() {
        let mut p = params();
        p.api_key = None;
        let err = OpenAiAdapter::new()
            .to_wire(&Conversation::new(), &[], &p)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ProviderAuth { .. }));
    }

    #[test]
    fn compatible_endpoint_url() {
        let req = OpenAiAdapter::compatible("XAI", "https://api.x.ai/")
            .to_wire(&Conversation::new(), &[], &params())
            .unwrap();
        assert_eq!(req.url, "https://api.x.ai/v1/chat/completions");
        assert_eq!(req.headers[0].1, "Bearer sk-test");
    }

    #[test]
    fn parse_response_basic() {
        let json = json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello there!"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let model = ModelInfo::new("gpt-4o", "OpenAI", 0.1, 1.0);
        let completion = OpenAiAdapter::new().from_wire(&json, &model).unwrap();
        assert_eq!(completion.messages, vec![Message::text(Role::Assistant, "Hello there!")]);
        assert_eq!(completion.usage, TokenUsage { tokens_in: 10, tokens_out: 5 });
        assert_eq!(completion.cost_in, 1.0);
        assert_eq!(completion.cost_out, 5.0);
    }

    #[test]
    fn parse_response_with_tool_calls() {
        let json = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\": \"Paris\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 15, "completion_tokens": 8}
        });
        let (message, _) = OpenAiAdapter::new().parse_response(&json).unwrap();
        let calls: Vec<_> = message.function_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "call_123");
        assert_eq!(calls[0].1, "get_weather");
        assert_eq!(calls[0].2["city"], "Paris");
    }

    #[test]
    fn parse_response_error_object() {
        let json = json!({"error": {"message": "quota exceeded"}});
        let err = OpenAiAdapter::new().parse_response(&json).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(matches!(err, RuntimeError::ProviderApi { .. }));
    }

    #[test]
    fn round_trip_preserves_assistant_turn() {
        let original = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("let me check"),
                ContentBlock::call("call_9", "lookup", json!({"q": "rust"})),
            ],
        );
        let conv = Conversation::from(vec![original.clone()]);
        let body = OpenAiAdapter::new()
            .build_request_body(&conv, &[], &params())
            .unwrap();
        let response = json!({"choices": [{"message": body["messages"][0].clone()}]});
        let (decoded, _) = OpenAiAdapter::new().parse_response(&response).unwrap();
        assert_eq!(decoded, original);
    }
}

use dotprompt_common::{ContentBlock, Conversation, Message, Role};
use serde_json::{json, Value};

use crate::catalog::ModelInfo;
use crate::error::{Result, RuntimeError};
use crate::provider::{Completion, ModelParams, ProviderAdapter, TokenUsage, ToolDeclaration, WireRequest};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const NAME: &str = "Anthropic";

/// Anthropic messages API adapter (Claude).
#[derive(Debug, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        AnthropicAdapter
    }

    /// Build the JSON request body for the messages API.
    ///
    /// System messages are lifted into the top-level `system` field; tool
    /// results travel as `tool_result` blocks inside a user turn.
    pub fn build_request_body(
        conversation: &Conversation,
        tools: &[ToolDeclaration],
        params: &ModelParams,
    ) -> Result<Value> {
        let mut system_text = String::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in conversation {
            if message.role == Role::System {
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !system_text.is_empty() {
                                system_text.push('\n');
                            }
                            system_text.push_str(text);
                        }
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

            let content = message
                .content
                .iter()
                .map(|block| encode_block(message.role, block))
                .collect::<Result<Vec<_>>>()?;
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            messages.push(json!({"role": role, "content": content}));
        }

        let mut body = json!({
            "model": params.model,
            "messages": messages,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if let Some(temp) = params.temperature {
            body["temperature"] = json!(temp);
        }
        if !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tool_defs);
        }
        Ok(body)
    }

    /// Decode the assistant message and token usage from a response body.
    pub fn parse_response(json: &Value) -> Result<(Message, TokenUsage)> {
        if json.get("type").and_then(|t| t.as_str()) == Some("error") {
            let message = super::error_message(json).unwrap_or_else(|| json.to_string());
            return Err(RuntimeError::api(NAME, message));
        }

        let blocks = json
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| RuntimeError::api(NAME, "no content in response"))?;

        let mut content = Vec::with_capacity(blocks.len());
        for block in blocks {
            let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match block_type {
                "text" => {
                    let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    content.push(ContentBlock::text(text));
                }
                "tool_use" => {
                    let id = block.get("id").and_then(|i| i.as_str()).unwrap_or("");
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| RuntimeError::translation(NAME, "tool_use without a name"))?;
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    content.push(ContentBlock::call(id, name, input));
                }
                other => {
                    return Err(RuntimeError::translation(
                        NAME,
                        format!("unsupported response block type '{}'", other),
                    ))
                }
            }
        }

        let usage = json.get("usage");
        let usage = TokenUsage {
            tokens_in: super::token_count(usage, "input_tokens"),
            tokens_out: super::token_count(usage, "output_tokens"),
        };
        Ok((Message::new(Role::Assistant, content), usage))
    }
}

fn encode_block(role: Role, block: &ContentBlock) -> Result<Value> {
    match (role, block) {
        (Role::User | Role::Assistant, ContentBlock::Text { text }) => {
            Ok(json!({"type": "text", "text": text}))
        }
        (Role::User, ContentBlock::Image { image }) => Ok(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.media_type,
                "data": image.data,
            }
        })),
        (
            Role::Assistant,
            ContentBlock::FunctionCall {
                id,
                name,
                arguments,
            },
        ) => Ok(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        })),
        (
            Role::Tool,
            ContentBlock::FunctionResult {
                id,
                content,
                is_error,
                ..
            },
        ) => {
            let mut result = json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": content,
            });
            if *is_error {
                result["is_error"] = json!(true);
            }
            Ok(result)
        }
        (role, other) => Err(RuntimeError::translation(
            NAME,
            format!("{} content is not allowed in a {} message", other.kind_name(), role),
        )),
    }
}

impl ProviderAdapter for AnthropicAdapter {
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
            url: format!("{}/v1/messages", super::base_url(params, ANTHROPIC_BASE_URL)),
            headers: vec![
                ("x-api-key".to_string(), key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn from_wire(&self, body: &Value, model: &ModelInfo) -> Result<Completion> {
        let (message, usage) = Self::parse_response(body)?;
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
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: Some("ak".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn system_is_lifted_and_max_tokens_defaulted() {
        let conv = Conversation::from(vec![
            Message::text(Role::System, "You are helpful."),
            Message::text(Role::User, "Hello"),
        ]);
        let body = AnthropicAdapter::build_request_body(&conv, &[], &params()).unwrap();
        assert_eq!(body["system"], "You are helpful.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"][0]["text"], "Hello");
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn image_and_tool_blocks() {
        let conv = Conversation::from(vec![
            Message::new(
                Role::User,
                vec![ContentBlock::Image {
                    image: ImageRef {
                        path: "a.jpg".into(),
                        media_type: "image/jpeg".into(),
                        data: "/9j/".into(),
                    },
                }],
            ),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::call("toolu_1", "search", json!({"q": "x"}))],
            ),
            Message::new(
                Role::Tool,
                vec![ContentBlock::failed_result("toolu_1", "search", "no network")],
            ),
        ]);
        let tools = vec![ToolDeclaration {
            name: "search".into(),
            description: "Search".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = AnthropicAdapter::build_request_body(&conv, &tools, &params()).unwrap();
        let msgs = &body["messages"];
        assert_eq!(msgs[0]["content"][0]["source"]["media_type"], "image/jpeg");
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][0]["input"]["q"], "x");
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(msgs[2]["content"][0]["is_error"], true);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn headers_carry_key_and_version() {
        let req = AnthropicAdapter::new()
            .to_wire(&Conversation::new(), &[], &params())
            .unwrap();
        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
        assert!(req.headers.contains(&("x-api-key".to_string(), "ak".to_string())));
        assert!(req
            .headers
            .contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
    }

    #[test]
    fn parse_response_text_and_tool_use() {
        let json = json!({
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "toolu_01", "name": "get_weather", "input": {"city": "London"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        });
        let (message, usage) = AnthropicAdapter::parse_response(&json).unwrap();
        assert_eq!(message.text_content(), "Checking.");
        let calls: Vec<_> = message.function_calls().collect();
        assert_eq!(calls[0].0, "toolu_01");
        assert_eq!(calls[0].2["city"], "London");
        assert_eq!(usage, TokenUsage { tokens_in: 12, tokens_out: 8 });
    }

    #[test]
    fn unknown_block_is_translation_error() {
        let json = json!({"content": [{"type": "server_tool_use", "id": "x"}]});
        let err = AnthropicAdapter::parse_response(&json).unwrap_err();
        assert!(matches!(err, RuntimeError::Translation { .. }));
    }

    #[test]
    fn error_response() {
        let json = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        let err = AnthropicAdapter::parse_response(&json).unwrap_err();
        assert!(matches!(err, RuntimeError::ProviderApi { .. }));
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn round_trip_preserves_assistant_turn() {
        let original = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("one"),
                ContentBlock::call("toolu_2", "f", json!({"a": 1})),
                ContentBlock::text("two"),
            ],
        );
        let conv = Conversation::from(vec![original.clone()]);
        let body = AnthropicAdapter::build_request_body(&conv, &[], &params()).unwrap();
        let response = json!({"content": body["messages"][0]["content"].clone()});
        let (decoded, _) = AnthropicAdapter::parse_response(&response).unwrap();
        assert_eq!(decoded, original);
    }
}

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// An image attached to a message. The bytes are captured (base64) when the
/// image is attached, so a saved session does not depend on the file later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: String,
    pub media_type: String,
    pub data: String,
}

/// One typed element of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(flatten)]
        image: ImageRef,
    },
    FunctionCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    FunctionResult {
        id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn call(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ContentBlock::FunctionCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn result(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::FunctionResult {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failed_result(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ContentBlock::FunctionResult {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error: true,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Image { .. } => "image",
            ContentBlock::FunctionCall { .. } => "function_call",
            ContentBlock::FunctionResult { .. } => "function_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::text(text)])
    }

    /// Concatenated text blocks, joined with newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Function calls requested in this message, in order.
    pub fn function_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::FunctionCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    pub fn has_function_calls(&self) -> bool {
        self.function_calls().next().is_some()
    }
}

/// Append-only ordered list of messages.
///
/// Only the last message may still grow (the in-progress message); everything
/// before it is frozen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append `block` to the in-progress message when `accept` approves its
    /// role, otherwise start a new message with `role`.
    pub fn append_block(
        &mut self,
        accept: impl Fn(Role) -> bool,
        role: Role,
        block: ContentBlock,
    ) {
        match self.messages.last_mut() {
            Some(last) if accept(last.role) => last.content.push(block),
            _ => self.messages.push(Message::new(role, vec![block])),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Check call/result pairing: every function call must be answered by
    /// exactly one later result carrying the same id, and every result must
    /// answer an earlier call.
    pub fn check_call_pairing(&self) -> Result<(), String> {
        let mut open: Vec<(&str, usize)> = Vec::new();
        for message in &self.messages {
            for block in &message.content {
                match block {
                    ContentBlock::FunctionCall { id, .. } => {
                        if open.iter().any(|(o, _)| o == id) {
                            return Err(format!("function call id '{}' is used twice", id));
                        }
                        open.push((id.as_str(), 0));
                    }
                    ContentBlock::FunctionResult { id, .. } => {
                        match open.iter_mut().find(|(o, _)| o == id) {
                            Some((_, answers)) => {
                                *answers += 1;
                                if *answers > 1 {
                                    return Err(format!(
                                        "function call '{}' has more than one result",
                                        id
                                    ));
                                }
                            }
                            None => {
                                return Err(format!(
                                    "function result '{}' does not answer any earlier call",
                                    id
                                ))
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        if let Some((id, _)) = open.iter().find(|(_, answers)| *answers == 0) {
            return Err(format!("function call '{}' has no result", id));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_block_joins_matching_role() {
        let mut conv = Conversation::new();
        conv.push(Message::text(Role::User, "a"));
        conv.append_block(|r| r == Role::User, Role::User, ContentBlock::text("b"));
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].text_content(), "a\nb");

        conv.append_block(|r| r == Role::Tool, Role::Tool, ContentBlock::result("1", "f", "x"));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[1].role, Role::Tool);
    }

    #[test]
    fn call_pairing_detects_missing_result() {
        let mut conv = Conversation::new();
        conv.push(Message::new(
            Role::Assistant,
            vec![ContentBlock::call("c1", "lookup", json!({}))],
        ));
        assert!(conv.check_call_pairing().is_err());
        conv.push(Message::new(Role::Tool, vec![ContentBlock::result("c1", "lookup", "ok")]));
        assert!(conv.check_call_pairing().is_ok());
        conv.push(Message::new(Role::Tool, vec![ContentBlock::result("c1", "lookup", "again")]));
        assert!(conv.check_call_pairing().is_err());
    }

    #[test]
    fn result_before_call_is_rejected() {
        let conv = Conversation::from(vec![Message::new(
            Role::Tool,
            vec![ContentBlock::result("c9", "f", "x")],
        )]);
        let err = conv.check_call_pairing().unwrap_err();
        assert!(err.contains("c9"));
    }

    #[test]
    fn content_block_serializes_tagged() {
        let block = ContentBlock::failed_result("c1", "f", "boom");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json, json!({"type": "function_result", "id": "c1", "name": "f", "content": "boom", "is_error": true}));

        let ok = serde_json::to_value(ContentBlock::result("c2", "f", "fine")).unwrap();
        assert!(ok.get("is_error").is_none());

        let image = ContentBlock::Image {
            image: ImageRef {
                path: "a.png".into(),
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["media_type"], "image/png");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, image);
    }
}

use serde::{Deserialize, Serialize};

/// The closed set of statement kinds a prompt script can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Comment,
    SetModel,
    SystemMsg,
    UserMsg,
    AssistantMsg,
    ToolCall,
    ToolResult,
    Exec,
    SetVar,
    CallFunction,
    Include,
    AttachImage,
    EmitOutput,
    DebugDump,
    DeleteFiles,
    Halt,
    ContinuationText,
}

impl StatementKind {
    /// Every kind paired with the keyword that introduces it in column 0.
    pub const KEYWORDS: [(&'static str, StatementKind); 17] = [
        (".#", StatementKind::Comment),
        (".llm", StatementKind::SetModel),
        (".system", StatementKind::SystemMsg),
        (".user", StatementKind::UserMsg),
        (".assistant", StatementKind::AssistantMsg),
        (".tool_call", StatementKind::ToolCall),
        (".tool_result", StatementKind::ToolResult),
        (".exec", StatementKind::Exec),
        (".set", StatementKind::SetVar),
        (".cmd", StatementKind::CallFunction),
        (".include", StatementKind::Include),
        (".image", StatementKind::AttachImage),
        (".print", StatementKind::EmitOutput),
        (".debug", StatementKind::DebugDump),
        (".clear", StatementKind::DeleteFiles),
        (".exit", StatementKind::Halt),
        (".text", StatementKind::ContinuationText),
    ];

    pub fn from_keyword(keyword: &str) -> Option<StatementKind> {
        Self::KEYWORDS
            .iter()
            .find(|(k, _)| *k == keyword)
            .map(|(_, kind)| *kind)
    }

    pub fn keyword(&self) -> &'static str {
        Self::KEYWORDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(k, _)| *k)
            .unwrap_or(".text")
    }

    /// Kinds whose payload may absorb continuation lines.
    pub fn accepts_continuation(&self) -> bool {
        matches!(
            self,
            StatementKind::SystemMsg
                | StatementKind::UserMsg
                | StatementKind::AssistantMsg
                | StatementKind::ContinuationText
        )
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One executable unit of a prompt script.
///
/// `line` is the 1-based source line that introduced the statement; statements
/// synthesized by the parser (the completion suffix) carry line 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub line: usize,
    pub kind: StatementKind,
    pub payload: String,
}

impl Statement {
    pub fn new(line: usize, kind: StatementKind, payload: impl Into<String>) -> Self {
        Self {
            line,
            kind,
            payload: payload.into(),
        }
    }

    /// A statement the parser adds on its own.
    pub fn synthesized(kind: StatementKind, payload: impl Into<String>) -> Self {
        Self::new(0, kind, payload)
    }

    pub fn is_synthesized(&self) -> bool {
        self.line == 0
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:>4} {}", self.line, self.kind)
        } else {
            write!(f, "{:>4} {} {}", self.line, self.kind, self.payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup_round_trips() {
        for (keyword, kind) in StatementKind::KEYWORDS {
            assert_eq!(StatementKind::from_keyword(keyword), Some(kind));
            assert_eq!(kind.keyword(), keyword);
        }
        assert_eq!(StatementKind::from_keyword(".nope"), None);
    }

    #[test]
    fn only_message_kinds_accept_continuation() {
        assert!(StatementKind::UserMsg.accepts_continuation());
        assert!(StatementKind::ContinuationText.accepts_continuation());
        assert!(!StatementKind::Exec.accepts_continuation());
        assert!(!StatementKind::SetVar.accepts_continuation());
    }

    #[test]
    fn statement_serializes_with_snake_case_kind() {
        let stmt = Statement::new(3, StatementKind::SetModel, "{\"model\": \"gpt-4o\"}");
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["kind"], "set_model");
        assert_eq!(json["line"], 3);
    }
}

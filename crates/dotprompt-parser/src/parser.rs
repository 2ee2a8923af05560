use dotprompt_common::{Statement, StatementKind};

use crate::scanner::Scanner;

/// Payload of the synthesized output statement appended by auto-completion.
pub const LAST_RESPONSE_PAYLOAD: &str = "<<last_response>>";

/// A malformed script. Parsing stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// Byte range of the offending line within the source.
    pub offset: usize,
    pub len: usize,
    pub message: String,
}

/// Parse script text into an ordered statement sequence.
///
/// Pure: identical input always yields identical output.
pub fn parse(source: &str) -> Result<Vec<Statement>, ParseError> {
    let mut statements: Vec<Statement> = Vec::new();

    for line in Scanner::new(source) {
        match line.kind {
            Some(kind) => statements.push(Statement::new(line.number, kind, line.payload)),
            None => match statements.last_mut() {
                Some(prev) if prev.kind.accepts_continuation() => {
                    if !prev.payload.is_empty() {
                        prev.payload.push('\n');
                    }
                    prev.payload.push_str(line.payload);
                }
                Some(prev) => {
                    return Err(ParseError {
                        line: line.number,
                        offset: line.offset,
                        len: line.len,
                        message: format!(
                            "dangling continuation: text cannot follow a '{}' statement (line {})",
                            prev.kind, prev.line
                        ),
                    })
                }
                None => {
                    return Err(ParseError {
                        line: line.number,
                        offset: line.offset,
                        len: line.len,
                        message: "dangling continuation: text before the first statement"
                            .to_string(),
                    })
                }
            },
        }
    }

    complete(&mut statements);
    Ok(statements)
}

/// Statements for a follow-up user turn in a resumed conversation.
///
/// The message is taken verbatim; lines inside it are never read as keywords.
pub fn parse_continuation(message: &str) -> Vec<Statement> {
    let mut statements = vec![Statement::synthesized(StatementKind::UserMsg, message.trim_end())];
    complete(&mut statements);
    statements
}

/// Append the suffix that makes every script end by running the
/// conversation, printing the reply and halting.
fn complete(statements: &mut Vec<Statement>) {
    match statements.last().map(|s| s.kind) {
        Some(StatementKind::Halt) => return,
        Some(StatementKind::Exec) => {}
        _ => statements.push(Statement::synthesized(StatementKind::Exec, "")),
    }
    statements.push(Statement::synthesized(
        StatementKind::EmitOutput,
        LAST_RESPONSE_PAYLOAD,
    ));
    statements.push(Statement::synthesized(StatementKind::Halt, ""));
}

pub mod config;
pub mod message;
pub mod statement;

pub use config::{ConfigError, DotpromptConfig};
pub use message::{ContentBlock, Conversation, ImageRef, Message, Role};
pub use statement::{Statement, StatementKind};

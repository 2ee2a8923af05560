pub mod parser;
pub mod scanner;

pub use parser::{parse, parse_continuation, ParseError};
pub use scanner::{Line, Scanner};

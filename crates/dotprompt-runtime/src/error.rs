use dotprompt_common::StatementKind;
use thiserror::Error;

/// Errors raised while executing a statement.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("variable '{0}' is read-only")]
    ReadOnlyVariable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider auth error ({provider}): {message}")]
    ProviderAuth { provider: String, message: String },

    #[error("provider API error ({provider}): {message}")]
    ProviderApi { provider: String, message: String },

    #[error("translation error ({provider}): {message}")]
    Translation { provider: String, message: String },

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("function not found: '{0}'")]
    FunctionNotFound(String),

    #[error("function '{name}' timed out after {seconds:.1}s")]
    FunctionTimeout { name: String, seconds: f64 },

    #[error("function '{name}' failed: {message}")]
    FunctionExecution { name: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error("engine is {0}, not running")]
    NotRunning(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub(crate) fn translation(provider: &str, message: impl Into<String>) -> Self {
        RuntimeError::Translation {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn api(provider: &str, message: impl Into<String>) -> Self {
        RuntimeError::ProviderApi {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Short, stable name of the error kind for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::UndefinedVariable(_) => "UndefinedVariableError",
            RuntimeError::ReadOnlyVariable(_) => "ReadOnlyVariableError",
            RuntimeError::InvalidArgument(_) => "InvalidArgumentError",
            RuntimeError::ModelNotFound(_) => "ModelNotFoundError",
            RuntimeError::ProviderAuth { .. } => "ProviderAuthError",
            RuntimeError::ProviderApi { .. } => "ProviderAPIError",
            RuntimeError::Translation { .. } => "TranslationError",
            RuntimeError::InvalidConversation(_) => "InvalidConversationError",
            RuntimeError::FunctionNotFound(_) => "FunctionNotFoundError",
            RuntimeError::FunctionTimeout { .. } => "FunctionTimeoutError",
            RuntimeError::FunctionExecution { .. } => "FunctionExecutionError",
            RuntimeError::Serialization(_) => "SerializationError",
            RuntimeError::SessionNotFound(_) => "SessionNotFoundError",
            RuntimeError::SessionConflict(_) => "SessionConflictError",
            RuntimeError::NotRunning(_) => "EngineStateError",
            RuntimeError::Io(_) => "IoError",
            RuntimeError::Json(_) => "JsonError",
        }
    }
}

/// A failed step: which statement failed and why.
#[derive(Error, Debug)]
#[error("line {line} ({keyword}): {}: {error}", .error.kind())]
pub struct ExecError {
    pub line: usize,
    pub keyword: StatementKind,
    #[source]
    pub error: RuntimeError,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

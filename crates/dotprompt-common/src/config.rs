use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "dotprompt.toml";

/// Parsed `dotprompt.toml`, with every section defaulted.
#[derive(Debug, Clone)]
pub struct DotpromptConfig {
    pub functions: FunctionsSection,
    pub sessions: SessionsSection,
    pub limits: LimitsSection,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: BTreeMap<String, ModelConfig>,
    /// The directory relative paths in the config resolve against.
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionsSection {
    #[serde(default = "default_function_dirs")]
    pub dirs: Vec<PathBuf>,
    #[serde(default = "default_function_timeout")]
    pub timeout_secs: u64,
}

impl Default for FunctionsSection {
    fn default() -> Self {
        Self {
            dirs: default_function_dirs(),
            timeout_secs: default_function_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsSection {
    #[serde(default = "default_sessions_dir")]
    pub dir: PathBuf,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            dir: default_sessions_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// A price-table entry. Prices are per token.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub provider: String,
    #[serde(default)]
    pub wire_name: Option<String>,
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub context: Option<u64>,
}

fn default_function_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("prompts/functions")]
}
fn default_function_timeout() -> u64 {
    30
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("prompts/sessions")
}
fn default_max_tool_rounds() -> u32 {
    10
}
fn default_request_timeout() -> u64 {
    120
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    functions: FunctionsSection,
    #[serde(default)]
    sessions: SessionsSection,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    models: BTreeMap<String, ModelConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read dotprompt.toml: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid dotprompt.toml: {0}")]
    ParseError(String),
    #[error("invalid dotprompt.toml: [functions] timeout_secs must be greater than zero")]
    ZeroTimeout,
    #[error("invalid dotprompt.toml: [models.\"{0}\"] has an empty provider")]
    MissingProvider(String),
    #[error("invalid dotprompt.toml: [models.\"{0}\"] has a negative price")]
    NegativePrice(String),
}

impl DotpromptConfig {
    /// Defaults rooted at `root_dir`, used when no config file exists.
    pub fn defaults(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            functions: FunctionsSection::default(),
            sessions: SessionsSection::default(),
            limits: LimitsSection::default(),
            providers: BTreeMap::new(),
            models: BTreeMap::new(),
            root_dir: root_dir.into(),
        }
    }

    /// Function directories, resolved against the config root.
    pub fn function_dirs(&self) -> Vec<PathBuf> {
        self.functions
            .dirs
            .iter()
            .map(|d| self.resolve(d))
            .collect()
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.resolve(&self.sessions.dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }
}

/// Walk up from `start_dir` looking for `dotprompt.toml`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub fn load_config(path: &Path) -> Result<DotpromptConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let root_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    parse_config(&content, root_dir)
}

pub fn parse_config(content: &str, root_dir: PathBuf) -> Result<DotpromptConfig, ConfigError> {
    let raw: RawConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    if raw.functions.timeout_secs == 0 {
        return Err(ConfigError::ZeroTimeout);
    }
    for (name, model) in &raw.models {
        validate_model(name, model)?;
    }

    Ok(DotpromptConfig {
        functions: raw.functions,
        sessions: raw.sessions,
        limits: raw.limits,
        providers: raw.providers,
        models: raw.models,
        root_dir,
    })
}

/// Find the config above `start_dir` and load it, or fall back to defaults
/// rooted at `start_dir`.
pub fn discover_config(start_dir: &Path) -> Result<DotpromptConfig, ConfigError> {
    match find_config(start_dir) {
        Some(path) => load_config(&path),
        None => Ok(DotpromptConfig::defaults(start_dir)),
    }
}

fn validate_model(name: &str, model: &ModelConfig) -> Result<(), ConfigError> {
    if model.provider.trim().is_empty() {
        return Err(ConfigError::MissingProvider(name.to_string()));
    }
    if model.input < 0.0 || model.output < 0.0 {
        return Err(ConfigError::NegativePrice(name.to_string()));
    }
    Ok(())
}

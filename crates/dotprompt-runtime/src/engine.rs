use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dotprompt_common::{
    ContentBlock, Conversation, DotpromptConfig, Message, Role, Statement, StatementKind,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::catalog::{ModelCatalog, ModelInfo};
use crate::content::{ContentSource, FsContent};
use crate::error::{ExecError, Result, RuntimeError};
use crate::functions::FunctionRegistry;
use crate::glob;
use crate::provider::{AdapterRegistry, CredentialSource, EnvCredentials, ModelParams};
use crate::session::{SessionRecord, SessionStore};
use crate::state::{Counters, EngineStatus, ExecutionState};
use crate::transport::{HttpTransport, Transport};
use crate::variables::{parse_value, LAST_RESPONSE_VAR, MODEL_VAR};

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 10;

/// Optional variable naming the provider of a model missing from the catalog.
pub const PROVIDER_VAR: &str = "provider";
const TEMPERATURE_VAR: &str = "temperature";
const MAX_TOKENS_VAR: &str = "max_tokens";

// ============================================================================
// Runtime collaborators
// ============================================================================

/// Everything the engine talks to outside its own state.
pub struct Runtime {
    pub adapters: AdapterRegistry,
    pub catalog: ModelCatalog,
    pub functions: FunctionRegistry,
    pub transport: Box<dyn Transport>,
    pub credentials: Box<dyn CredentialSource>,
    pub content: Box<dyn ContentSource>,
    /// Endpoint overrides per provider.
    pub base_urls: BTreeMap<String, String>,
    pub max_tool_rounds: u32,
    /// Root for relative `.clear` patterns.
    pub work_dir: PathBuf,
}

impl Runtime {
    /// Built-in adapters and catalog, no functions, keys from the environment.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            adapters: AdapterRegistry::builtin(),
            catalog: ModelCatalog::builtin(),
            functions: FunctionRegistry::empty(),
            transport: Box::new(transport),
            credentials: Box::new(EnvCredentials::new()),
            content: Box::new(FsContent::new(".")),
            base_urls: BTreeMap::new(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            work_dir: PathBuf::from("."),
        }
    }

    /// Wire everything from a loaded config. `script_dir` anchors `.include`,
    /// `.image` and `.clear` paths.
    pub fn from_config(config: &DotpromptConfig, script_dir: &Path) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.limits.request_timeout_secs))?;
        let base_urls = config
            .providers
            .iter()
            .filter_map(|(name, p)| p.base_url.clone().map(|url| (name.clone(), url)))
            .collect();
        Ok(Self {
            adapters: AdapterRegistry::builtin(),
            catalog: ModelCatalog::builtin().with_overrides(&config.models),
            functions: FunctionRegistry::new(
                config.function_dirs(),
                Duration::from_secs(config.functions.timeout_secs),
            ),
            transport: Box::new(transport),
            credentials: Box::new(EnvCredentials::from_config(&config.providers)),
            content: Box::new(FsContent::new(script_dir)),
            base_urls,
            max_tool_rounds: config.limits.max_tool_rounds,
            work_dir: script_dir.to_path_buf(),
        })
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_credentials(mut self, credentials: impl CredentialSource + 'static) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_content(mut self, content: impl ContentSource + 'static) -> Self {
        self.content = Box::new(content);
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Executes statements one at a time against an [`ExecutionState`].
pub struct Engine {
    state: ExecutionState,
    status: EngineStatus,
    runtime: Runtime,
    revision: u64,
    created_at: chrono::DateTime<chrono::Utc>,
    output_handler: Box<dyn Fn(&str)>,
    diagnostic_handler: Box<dyn Fn(&str)>,
}

impl Engine {
    pub fn new(statements: Vec<Statement>, runtime: Runtime) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::with_state(ExecutionState::new(session_id, statements), EngineStatus::Running, runtime)
    }

    /// Rebuild an engine from a persisted record. The engine is always
    /// running afterwards; a failed session retries its failing statement.
    pub fn restore(record: SessionRecord, runtime: Runtime) -> Self {
        let mut engine = Self::with_state(record.state, EngineStatus::Running, runtime);
        engine.revision = record.revision;
        engine.created_at = record.created_at;
        info!(session = %engine.state.session_id, ip = engine.state.ip, "session restored");
        engine
    }

    fn with_state(state: ExecutionState, status: EngineStatus, runtime: Runtime) -> Self {
        Self {
            state,
            status,
            runtime,
            revision: 0,
            created_at: chrono::Utc::now(),
            output_handler: Box::new(|text| println!("{}", text)),
            diagnostic_handler: Box::new(|text| eprintln!("{}", text)),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.state.filename = Some(filename.into());
        self
    }

    /// Receives `.print` text.
    pub fn set_output_handler(&mut self, handler: impl Fn(&str) + 'static) {
        self.output_handler = Box::new(handler);
    }

    /// Receives `.debug` dumps.
    pub fn set_diagnostic_handler(&mut self, handler: impl Fn(&str) + 'static) {
        self.diagnostic_handler = Box::new(handler);
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Preset a variable before running, e.g. from the command line.
    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.state.variables.set(name, value)
    }

    /// Run until the script completes, fails, or is suspended.
    pub fn run(&mut self) -> std::result::Result<EngineStatus, ExecError> {
        while self.status == EngineStatus::Running {
            self.step()?;
        }
        Ok(self.status)
    }

    /// Execute the statement at the instruction pointer. Stepping an engine
    /// that is not running does nothing.
    ///
    /// The instruction pointer only advances past statements that succeeded,
    /// so a failed engine still points at the failing statement.
    pub fn step(&mut self) -> std::result::Result<EngineStatus, ExecError> {
        if self.status != EngineStatus::Running {
            return Ok(self.status);
        }
        let Some(statement) = self.state.current().cloned() else {
            self.status = EngineStatus::Completed;
            return Ok(self.status);
        };

        debug!(line = statement.line, keyword = %statement.kind, "step");
        match self.execute(&statement) {
            Ok(()) => {
                self.state.ip += 1;
                if self.status == EngineStatus::Running && self.state.is_finished() {
                    self.status = EngineStatus::Completed;
                }
                Ok(self.status)
            }
            Err(error) => {
                self.status = EngineStatus::Failed;
                warn!(line = statement.line, keyword = %statement.kind, error = %error, "statement failed");
                Err(ExecError {
                    line: statement.line,
                    keyword: statement.kind,
                    error,
                })
            }
        }
    }

    /// Pause and hand back a record that can be persisted and later restored.
    pub fn suspend(&mut self) -> SessionRecord {
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Suspended;
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> SessionRecord {
        let mut record = SessionRecord::new(self.state.clone(), self.status);
        record.revision = self.revision;
        record.created_at = self.created_at;
        record
    }

    /// Save a snapshot through `store`, tracking the revision it was written at.
    pub fn persist(&mut self, store: &dyn SessionStore) -> Result<SessionRecord> {
        let mut record = self.snapshot();
        store.save(&mut record)?;
        self.revision = record.revision;
        Ok(record)
    }

    /// Append statements to the program and make the engine runnable again.
    pub fn continue_with(&mut self, statements: Vec<Statement>) -> Result<()> {
        if self.status == EngineStatus::Failed {
            return Err(RuntimeError::NotRunning(self.status.to_string()));
        }
        self.state.statements.extend(statements);
        if !self.state.is_finished() {
            self.status = EngineStatus::Running;
        }
        Ok(())
    }

    // ========================================================================
    // Statement execution
    // ========================================================================

    fn substitute(&self, text: &str) -> Result<String> {
        self.state
            .variables
            .substitute(text, &self.state.vm_namespace())
    }

    fn execute(&mut self, statement: &Statement) -> Result<()> {
        match statement.kind {
            StatementKind::Comment => Ok(()),
            StatementKind::SetModel => self.set_model(&statement.payload),
            StatementKind::SystemMsg => self.role_message(Role::System, &statement.payload),
            StatementKind::UserMsg => self.role_message(Role::User, &statement.payload),
            StatementKind::AssistantMsg => self.role_message(Role::Assistant, &statement.payload),
            StatementKind::ContinuationText => {
                let text = self.substitute(&statement.payload)?;
                self.append_text(text);
                Ok(())
            }
            StatementKind::ToolCall => self.tool_call(&statement.payload),
            StatementKind::ToolResult => self.tool_result(&statement.payload),
            StatementKind::Exec => self.exec(),
            StatementKind::SetVar => self.set_var(&statement.payload),
            StatementKind::CallFunction => self.call_function(&statement.payload),
            StatementKind::Include => {
                let path = self.substitute(&statement.payload)?;
                let text = self.runtime.content.read_text(path.trim())?;
                self.append_text(text);
                Ok(())
            }
            StatementKind::AttachImage => {
                let path = self.substitute(&statement.payload)?;
                let image = self.runtime.content.read_image(path.trim())?;
                self.state.conversation.append_block(
                    |role| role == Role::User,
                    Role::User,
                    ContentBlock::Image { image },
                );
                Ok(())
            }
            StatementKind::EmitOutput => {
                let text = self.substitute(&statement.payload)?;
                (self.output_handler)(&text);
                Ok(())
            }
            StatementKind::DebugDump => self.debug_dump(&statement.payload),
            StatementKind::DeleteFiles => self.delete_files(&statement.payload),
            StatementKind::Halt => {
                self.status = EngineStatus::Completed;
                Ok(())
            }
        }
    }

    fn role_message(&mut self, role: Role, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        self.state.conversation.push(Message::text(role, text));
        Ok(())
    }

    /// Text joins the in-progress message unless that message is a tool
    /// message, in which case a new user message starts.
    fn append_text(&mut self, text: String) {
        self.state.conversation.append_block(
            |role| role != Role::Tool,
            Role::User,
            ContentBlock::text(text),
        );
    }

    fn set_model(&mut self, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        let trimmed = text.trim();
        let json_text = if trimmed.starts_with('{') {
            trimmed.to_string()
        } else {
            format!("{{{}}}", trimmed)
        };
        let parsed: Value = serde_json::from_str(&json_text)
            .map_err(|e| RuntimeError::InvalidArgument(format!("bad .llm parameters: {}", e)))?;
        let Value::Object(params) = parsed else {
            return Err(RuntimeError::InvalidArgument(
                ".llm expects a JSON object".to_string(),
            ));
        };
        let model = params
            .get(MODEL_VAR)
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidArgument(".llm requires \"model\"".to_string()))?
            .to_string();

        for (key, value) in params {
            self.state.variables.set(&key, value)?;
        }
        self.state.active_provider = self.runtime.catalog.get(&model).ok().map(|m| m.provider.clone());
        info!(model = %model, "model selected");
        self.state.active_model = Some(model);
        Ok(())
    }

    fn set_var(&mut self, payload: &str) -> Result<()> {
        let payload = payload.trim();
        let (name, raw) = match payload.split_once(char::is_whitespace) {
            Some((name, raw)) => (name, raw.trim()),
            None => (payload, ""),
        };
        let value = self.substitute(raw)?;
        self.state.variables.set(name, parse_value(&value))
    }

    fn tool_call(&mut self, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        let (id, name, rest) = split_id_name(&text, ".tool_call")?;
        let arguments = if rest.is_empty() {
            json!({})
        } else {
            serde_json::from_str(rest).map_err(|e| {
                RuntimeError::InvalidArgument(format!("bad .tool_call arguments: {}", e))
            })?
        };
        self.state.conversation.append_block(
            |role| role == Role::Assistant,
            Role::Assistant,
            ContentBlock::call(id, name, arguments),
        );
        Ok(())
    }

    fn tool_result(&mut self, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        let (id, name, rest) = split_id_name(&text, ".tool_result")?;
        self.state.conversation.append_block(
            |role| role == Role::Tool,
            Role::Tool,
            ContentBlock::result(id, name, rest),
        );
        Ok(())
    }

    fn call_function(&mut self, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        let call = parse_call(&text)?;
        self.runtime.functions.refresh()?;
        if !self.runtime.functions.contains(&call.name) {
            return Err(RuntimeError::FunctionNotFound(call.name));
        }

        let result = self.runtime.functions.invoke(&call.name, &call.arguments);
        match (call.target, result) {
            (Some(target), result) => self.state.variables.set(&target, Value::String(result?)),
            (None, Ok(output)) => {
                self.append_text(output);
                Ok(())
            }
            (None, Err(e)) => {
                warn!(function = %call.name, error = %e, "function call failed");
                // Recorded as a call paired with a failed result.
                let id = fresh_call_id(&call_ids(&self.state.conversation), &call.name);
                let message = format!("Error calling {}: {}", call.name, e);
                self.state.conversation.append_block(
                    |role| role == Role::Assistant,
                    Role::Assistant,
                    ContentBlock::call(id.clone(), call.name.clone(), call.arguments),
                );
                self.state.conversation.push(Message::new(
                    Role::Tool,
                    vec![ContentBlock::failed_result(id, call.name, message)],
                ));
                Ok(())
            }
        }
    }

    fn resolve_model(&self) -> Result<ModelInfo> {
        let name = self
            .state
            .variables
            .get_str(MODEL_VAR)
            .map(str::to_string)
            .or_else(|| self.state.active_model.clone())
            .ok_or_else(|| RuntimeError::ModelNotFound("no model selected; use .llm".to_string()))?;
        match self.runtime.catalog.get(&name) {
            Ok(info) => Ok(info.clone()),
            Err(e) => match self.state.variables.get_str(PROVIDER_VAR) {
                Some(provider) => Ok(ModelInfo::new(&name, provider, 0.0, 0.0)),
                None => Err(e),
            },
        }
    }

    /// Send the conversation to the active model, dispatching requested
    /// function calls until the model answers without any.
    fn exec(&mut self) -> Result<()> {
        let model = self.resolve_model()?;
        self.runtime.functions.refresh()?;
        let params = self.model_params(&model)?;
        let tools = self.runtime.functions.tool_declarations();

        let Engine { state, runtime, .. } = self;
        let adapter = runtime.adapters.get(&model.provider)?;
        if adapter.requires_api_key() && params.api_key.is_none() {
            return Err(RuntimeError::ProviderAuth {
                provider: model.provider.clone(),
                message: "no API key configured".to_string(),
            });
        }
        state.active_model = Some(model.name.clone());
        state.active_provider = Some(model.provider.clone());

        let mut rounds = 0u32;
        loop {
            state
                .conversation
                .check_call_pairing()
                .map_err(RuntimeError::InvalidConversation)?;
            let request = adapter.to_wire(&state.conversation, &tools, &params)?;
            info!(provider = %model.provider, model = %model.name, messages = state.conversation.len(), "provider call");
            let body = runtime.transport.send(&model.provider, &request)?;
            let mut completion = adapter.from_wire(&body, &model)?;
            assign_call_ids(&state.conversation, &mut completion.messages);
            state
                .counters
                .record(completion.usage, completion.cost_in, completion.cost_out);
            debug!(
                tokens_in = completion.usage.tokens_in,
                tokens_out = completion.usage.tokens_out,
                "provider call complete"
            );

            let calls: Vec<(String, String, Value)> = completion
                .messages
                .iter()
                .flat_map(|m| m.function_calls())
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();
            for message in completion.messages {
                state.conversation.push(message);
            }
            if calls.is_empty() {
                break;
            }

            rounds += 1;
            if rounds > runtime.max_tool_rounds {
                // Pending calls still get exactly one result each.
                let refused = calls
                    .into_iter()
                    .map(|(id, name, _)| {
                        let message = format!(
                            "Error calling {}: limit of {} function rounds reached",
                            name, runtime.max_tool_rounds
                        );
                        ContentBlock::failed_result(id, name, message)
                    })
                    .collect();
                state.conversation.push(Message::new(Role::Tool, refused));
                return Err(RuntimeError::api(
                    &model.provider,
                    format!(
                        "model kept requesting functions after {} rounds",
                        runtime.max_tool_rounds
                    ),
                ));
            }
            let results = calls
                .into_iter()
                .map(|(id, name, args)| dispatch(&runtime.functions, id, name, &args))
                .collect();
            state.conversation.push(Message::new(Role::Tool, results));
        }

        let reply = state
            .conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text_content())
            .unwrap_or_default();
        state.variables.set(LAST_RESPONSE_VAR, Value::String(reply))
    }

    fn model_params(&self, model: &ModelInfo) -> Result<ModelParams> {
        let vars = &self.state.variables;
        let max_tokens = match vars.get(MAX_TOKENS_VAR) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        RuntimeError::InvalidArgument(format!("max_tokens must be a positive integer, got {}", v))
                    })?,
            ),
        };
        Ok(ModelParams {
            model: model.wire_name.clone(),
            api_key: self.runtime.credentials.api_key(&model.provider),
            base_url: self.runtime.base_urls.get(&model.provider).cloned(),
            temperature: vars.get(TEMPERATURE_VAR).and_then(Value::as_f64),
            max_tokens,
        })
    }

    fn debug_dump(&mut self, payload: &str) -> Result<()> {
        const SECTIONS: [&str; 4] = ["statements", "messages", "variables", "vm"];
        let payload = payload.trim();
        let requested: Vec<String> = if payload.is_empty() {
            vec!["all".to_string()]
        } else if payload.starts_with('[') {
            serde_json::from_str(payload)
                .map_err(|e| RuntimeError::InvalidArgument(format!("bad .debug list: {}", e)))?
        } else {
            payload
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut dump = Map::new();
        for section in requested {
            let names: Vec<&str> = match section.as_str() {
                "all" => SECTIONS.to_vec(),
                name if SECTIONS.contains(&name) => vec![name],
                other => {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "unknown .debug section '{}'; expected one of {}, all",
                        other,
                        SECTIONS.join(", ")
                    )))
                }
            };
            for name in names {
                let value = match name {
                    "statements" => serde_json::to_value(&self.state.statements)?,
                    "messages" => serde_json::to_value(&self.state.conversation)?,
                    "variables" => serde_json::to_value(&self.state.variables)?,
                    _ => serde_json::to_value(self.state.vm_namespace())?,
                };
                dump.insert(name.to_string(), value);
            }
        }
        let text = serde_json::to_string_pretty(&Value::Object(dump))?;
        (self.diagnostic_handler)(&text);
        Ok(())
    }

    /// Delete files matching the payload's patterns. Failures are logged and
    /// never stop the script.
    fn delete_files(&mut self, payload: &str) -> Result<()> {
        let text = self.substitute(payload)?;
        let text = text.trim();
        let patterns: Vec<String> = if text.starts_with('[') {
            serde_json::from_str(text)
                .map_err(|e| RuntimeError::InvalidArgument(format!("bad .clear list: {}", e)))?
        } else if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };

        for pattern in patterns {
            for path in glob::expand(&pattern, &self.runtime.work_dir) {
                if path.is_dir() {
                    warn!(path = %path.display(), "not deleting directory");
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "deleted"),
                    Err(e) => warn!(path = %path.display(), error = %e, "delete failed"),
                }
            }
        }
        Ok(())
    }
}

/// Run one model-requested call. Failures become error results the model
/// can see rather than stopping the script.
fn dispatch(functions: &FunctionRegistry, id: String, name: String, args: &Value) -> ContentBlock {
    match functions.invoke(&name, args) {
        Ok(output) => ContentBlock::result(id, name, output),
        Err(e) => {
            warn!(function = %name, error = %e, "model-requested call failed");
            let message = format!("Error calling {}: {}", name, e);
            ContentBlock::failed_result(id, name, message)
        }
    }
}

fn call_ids(conversation: &Conversation) -> HashSet<String> {
    conversation
        .iter()
        .flat_map(|m| m.function_calls())
        .map(|(id, _, _)| id.to_string())
        .collect()
}

/// `<name>-<n>`, with `n` the first number past the calls already taken.
fn fresh_call_id(taken: &HashSet<String>, name: &str) -> String {
    (taken.len() + 1..)
        .map(|n| format!("{}-{}", name, n))
        .find(|id| !taken.contains(id))
        .unwrap_or_else(|| name.to_string())
}

/// Give decoded calls without an id, or with one the conversation already
/// uses, a fresh `<name>-<n>` id.
fn assign_call_ids(conversation: &Conversation, messages: &mut [Message]) {
    let mut taken = call_ids(conversation);
    for block in messages.iter_mut().flat_map(|m| m.content.iter_mut()) {
        if let ContentBlock::FunctionCall { id, name, .. } = block {
            if id.is_empty() || taken.contains(id.as_str()) {
                *id = fresh_call_id(&taken, name);
            }
            taken.insert(id.clone());
        }
    }
}

fn split_id_name<'a>(text: &'a str, keyword: &str) -> Result<(&'a str, &'a str, &'a str)> {
    let mut parts = text.trim().splitn(3, char::is_whitespace);
    let id = parts.next().filter(|s| !s.is_empty());
    let name = parts.next().filter(|s| !s.is_empty());
    match (id, name) {
        (Some(id), Some(name)) => Ok((id, name, parts.next().unwrap_or("").trim())),
        _ => Err(RuntimeError::InvalidArgument(format!(
            "{} expects <id> <name> ...",
            keyword
        ))),
    }
}

// ============================================================================
// .cmd parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct CallSpec {
    name: String,
    arguments: Value,
    target: Option<String>,
}

/// Parse `name(key=value, ...)` with an optional `-> variable`. The argument
/// list may instead be a single JSON object.
fn parse_call(text: &str) -> Result<CallSpec> {
    let bad = |msg: &str| RuntimeError::InvalidArgument(format!("bad .cmd '{}': {}", text.trim(), msg));
    let text = text.trim();
    let open = text.find('(').ok_or_else(|| bad("expected name(...)"))?;
    let close = text.rfind(')').filter(|&c| c > open).ok_or_else(|| bad("missing ')'"))?;

    let name = text[..open].trim();
    if name.is_empty() {
        return Err(bad("missing function name"));
    }
    let inner = text[open + 1..close].trim();
    let tail = text[close + 1..].trim();
    let target = if tail.is_empty() {
        None
    } else {
        let var = tail
            .strip_prefix("->")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| bad("expected '-> variable' after the argument list"))?;
        Some(var.to_string())
    };

    let arguments = if inner.starts_with('{') {
        let value: Value = serde_json::from_str(inner).map_err(|e| bad(&e.to_string()))?;
        if !value.is_object() {
            return Err(bad("arguments must be an object"));
        }
        value
    } else {
        let mut args = Map::new();
        for pair in split_top_level(inner) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad("arguments must be key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(bad("empty argument name"));
            }
            args.insert(key.to_string(), Value::String(unquote(value.trim()).to_string()));
        }
        Value::Object(args)
    };

    Ok(CallSpec {
        name: name.to_string(),
        arguments,
        target,
    })
}

/// Split on commas that are not inside quotes.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, ',') => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.state.session_id)
            .field("status", &self.status)
            .field("ip", &self.state.ip)
            .field("messages", &self.state.conversation.len())
            .finish()
    }
}

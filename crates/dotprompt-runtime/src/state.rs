use std::collections::BTreeMap;

use dotprompt_common::{Conversation, Statement};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::TokenUsage;
use crate::variables::VariableStore;

/// Lifecycle of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineStatus::Running => "running",
            EngineStatus::Suspended => "suspended",
            EngineStatus::Completed => "completed",
            EngineStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cumulative usage across every provider call of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_in: f64,
    pub cost_out: f64,
    pub call_count: u64,
}

impl Counters {
    pub fn record(&mut self, usage: TokenUsage, cost_in: f64, cost_out: f64) {
        self.tokens_in += usage.tokens_in;
        self.tokens_out += usage.tokens_out;
        self.cost_in += cost_in;
        self.cost_out += cost_out;
        self.call_count += 1;
    }

    pub fn total_cost(&self) -> f64 {
        self.cost_in + self.cost_out
    }
}

/// Everything one interpreter run owns. Serializable as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub session_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(rename = "instructionPointer")]
    pub ip: usize,
    pub statements: Vec<Statement>,
    pub conversation: Conversation,
    pub variables: VariableStore,
    pub active_model: Option<String>,
    pub active_provider: Option<String>,
    #[serde(rename = "cumulativeCounters")]
    pub counters: Counters,
}

impl ExecutionState {
    pub fn new(session_id: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            session_id: session_id.into(),
            filename: None,
            ip: 0,
            statements,
            conversation: Conversation::new(),
            variables: VariableStore::new(),
            active_model: None,
            active_provider: None,
            counters: Counters::default(),
        }
    }

    pub fn current(&self) -> Option<&Statement> {
        self.statements.get(self.ip)
    }

    pub fn is_finished(&self) -> bool {
        self.ip >= self.statements.len()
    }

    /// Values readable as `<<VM.field>>`.
    pub fn vm_namespace(&self) -> BTreeMap<String, Value> {
        let mut vm = BTreeMap::new();
        vm.insert("session_id".to_string(), json!(self.session_id));
        vm.insert(
            "filename".to_string(),
            json!(self.filename.clone().unwrap_or_default()),
        );
        vm.insert("ip".to_string(), json!(self.ip));
        vm.insert(
            "model_name".to_string(),
            json!(self.active_model.clone().unwrap_or_default()),
        );
        vm.insert(
            "provider".to_string(),
            json!(self.active_provider.clone().unwrap_or_default()),
        );
        vm.insert("tokens_in".to_string(), json!(self.counters.tokens_in));
        vm.insert("tokens_out".to_string(), json!(self.counters.tokens_out));
        vm.insert("cost_in".to_string(), json!(self.counters.cost_in));
        vm.insert("cost_out".to_string(), json!(self.counters.cost_out));
        vm.insert("total_cost".to_string(), json!(self.counters.total_cost()));
        vm.insert("call_count".to_string(), json!(self.counters.call_count));
        vm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotprompt_common::StatementKind;

    #[test]
    fn counters_accumulate() {
        let mut c = Counters::default();
        c.record(TokenUsage { tokens_in: 10, tokens_out: 2 }, 0.5, 0.25);
        c.record(TokenUsage { tokens_in: 5, tokens_out: 1 }, 0.25, 0.25);
        assert_eq!(c.tokens_in, 15);
        assert_eq!(c.tokens_out, 3);
        assert_eq!(c.call_count, 2);
        assert_eq!(c.total_cost(), 1.25);
    }

    #[test]
    fn serialized_field_names() {
        let state = ExecutionState::new("s1", vec![Statement::new(1, StatementKind::Exec, "")]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["instructionPointer"], 0);
        assert!(json.get("cumulativeCounters").is_some());
        assert!(json["activeModel"].is_null());
        assert_eq!(json["variables"]["Prefix"], "<<");
    }

    #[test]
    fn vm_namespace_reads_counters() {
        let mut state = ExecutionState::new("abc", Vec::new());
        state.counters.call_count = 3;
        state.active_model = Some("gpt-4o".to_string());
        let vm = state.vm_namespace();
        assert_eq!(vm["call_count"], 3);
        assert_eq!(vm["model_name"], "gpt-4o");
        assert_eq!(vm["session_id"], "abc");
    }
}

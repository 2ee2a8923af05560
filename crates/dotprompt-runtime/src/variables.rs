use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};

pub const PREFIX_VAR: &str = "Prefix";
pub const POSTFIX_VAR: &str = "Postfix";
pub const LAST_RESPONSE_VAR: &str = "last_response";
pub const MODEL_VAR: &str = "model";
/// Tokens under this namespace read engine state and cannot be assigned.
pub const VM_NAMESPACE: &str = "VM";

const DEFAULT_PREFIX: &str = "<<";
const DEFAULT_POSTFIX: &str = ">>";

/// Named values visible to substitution. Keys are ordered so serialized
/// sessions are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    vars: BTreeMap<String, Value>,
}

impl Default for VariableStore {
    fn default() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(PREFIX_VAR.to_string(), Value::from(DEFAULT_PREFIX));
        vars.insert(POSTFIX_VAR.to_string(), Value::from(DEFAULT_POSTFIX));
        Self { vars }
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.vars.get(name).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        if is_vm_name(name) {
            return Err(RuntimeError::ReadOnlyVariable(name.to_string()));
        }
        if name.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "variable name must not be empty".to_string(),
            ));
        }
        self.vars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace every `<prefix>token<postfix>` span in `text`.
    ///
    /// Tokens are resolved against this store, or against `vm` when they
    /// start with `VM.`. `a.b` reads field `b` of variable `a`. Substituted
    /// text is never scanned again. A prefix without a matching postfix is
    /// kept literally.
    pub fn substitute(&self, text: &str, vm: &BTreeMap<String, Value>) -> Result<String> {
        let prefix = self.delimiter(PREFIX_VAR, DEFAULT_PREFIX);
        let postfix = self.delimiter(POSTFIX_VAR, DEFAULT_POSTFIX);

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(prefix) {
            let after_prefix = &rest[start + prefix.len()..];
            let Some(end) = after_prefix.find(postfix) else {
                break;
            };
            out.push_str(&rest[..start]);
            let token = after_prefix[..end].trim();
            out.push_str(&self.resolve(token, vm)?);
            rest = &after_prefix[end + postfix.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn delimiter<'a>(&'a self, name: &str, fallback: &'a str) -> &'a str {
        match self.get_str(name) {
            Some(d) if !d.is_empty() => d,
            _ => fallback,
        }
    }

    fn resolve(&self, token: &str, vm: &BTreeMap<String, Value>) -> Result<String> {
        let undefined = || RuntimeError::UndefinedVariable(token.to_string());
        let value = match token.split_once('.') {
            Some((VM_NAMESPACE, field)) => vm.get(field).ok_or_else(undefined)?,
            Some((name, field)) => self
                .vars
                .get(name)
                .and_then(|v| v.get(field))
                .ok_or_else(undefined)?,
            None => self.vars.get(token).ok_or_else(undefined)?,
        };
        Ok(display_value(value))
    }
}

/// Text form of a variable: strings verbatim, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a `.set` value: JSON when it parses, a plain string otherwise.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn is_vm_name(name: &str) -> bool {
    name == VM_NAMESPACE
        || name
            .strip_prefix(VM_NAMESPACE)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_vm() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    #[test]
    fn defaults_include_delimiters() {
        let store = VariableStore::new();
        assert_eq!(store.get_str(PREFIX_VAR), Some("<<"));
        assert_eq!(store.get_str(POSTFIX_VAR), Some(">>"));
    }

    #[test]
    fn substitute_plain_and_nested() {
        let mut store = VariableStore::new();
        store.set("name", json!("Ada")).unwrap();
        store.set("user", json!({"city": "Paris", "age": 36})).unwrap();
        let out = store
            .substitute("Hi <<name>> from <<user.city>> (<< user.age >>)", &no_vm())
            .unwrap();
        assert_eq!(out, "Hi Ada from Paris (36)");
    }

    #[test]
    fn undefined_variable_errors() {
        let store = VariableStore::new();
        let err = store.substitute("x <<missing>> y", &no_vm()).unwrap_err();
        assert!(matches!(err, RuntimeError::UndefinedVariable(ref n) if n == "missing"));
    }

    #[test]
    fn missing_field_is_undefined() {
        let mut store = VariableStore::new();
        store.set("user", json!({"city": "Paris"})).unwrap();
        let err = store.substitute("<<user.zip>>", &no_vm()).unwrap_err();
        assert!(matches!(err, RuntimeError::UndefinedVariable(ref n) if n == "user.zip"));
    }

    #[test]
    fn substitution_is_single_pass() {
        let mut store = VariableStore::new();
        store.set("a", json!("<<b>>")).unwrap();
        store.set("b", json!("deep")).unwrap();
        assert_eq!(store.substitute("<<a>>", &no_vm()).unwrap(), "<<b>>");
    }

    #[test]
    fn unterminated_span_is_literal() {
        let mut store = VariableStore::new();
        store.set("a", json!(1)).unwrap();
        assert_eq!(store.substitute("<<a>> and <<b", &no_vm()).unwrap(), "1 and <<b");
    }

    #[test]
    fn custom_delimiters() {
        let mut store = VariableStore::new();
        store.set(PREFIX_VAR, json!("{{")).unwrap();
        store.set(POSTFIX_VAR, json!("}}")).unwrap();
        store.set("x", json!("y")).unwrap();
        assert_eq!(store.substitute("{{x}} <<x>>", &no_vm()).unwrap(), "y <<x>>");
    }

    #[test]
    fn vm_namespace_is_read_only() {
        let mut store = VariableStore::new();
        let mut vm = BTreeMap::new();
        vm.insert("call_count".to_string(), json!(2));
        assert_eq!(store.substitute("<<VM.call_count>>", &vm).unwrap(), "2");
        assert!(store.substitute("<<VM.nope>>", &vm).is_err());
        assert!(matches!(
            store.set("VM.call_count", json!(5)),
            Err(RuntimeError::ReadOnlyVariable(_))
        ));
        assert!(store.set("VMware", json!(1)).is_ok());
    }

    #[test]
    fn parse_value_prefers_json() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("{\"a\": true}"), json!({"a": true}));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }
}

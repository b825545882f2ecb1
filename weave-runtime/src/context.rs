//! Variable storage for workflow runs
//!
//! An [`ExecutionContext`] is created once per run and holds the globals
//! assigned by the `on start` handler. Every flow invocation gets its own
//! [`Scope`]: locals shadow globals, writes always land in the scope, and
//! nothing in a scope outlives the invocation.

use crate::error::ValueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

// =============================================================================
// ExecutionContext
// =============================================================================

/// Run-wide state: identity and the globals set by `on start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique execution identifier
    pub execution_id: String,

    /// Globals visible to every flow in the run
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    #[serde(default)]
    pub metadata: ContextMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Entry point of the run (`flow main`, `agent reviewer`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            variables: HashMap::new(),
            metadata: ContextMetadata {
                created_at: Some(Utc::now()),
                entry: None,
            },
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.metadata.entry = Some(entry.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Shared, read-only view of the globals for flow scopes.
    pub fn globals(&self) -> Arc<HashMap<String, Value>> {
        Arc::new(self.variables.clone())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Variables of one flow or handler invocation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    locals: HashMap<String, Value>,
    globals: Arc<HashMap<String, Value>>,
}

impl Scope {
    pub fn new(globals: Arc<HashMap<String, Value>>) -> Self {
        Self {
            locals: HashMap::new(),
            globals,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locals.contains_key(name) || self.globals.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Value, ValueError> {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .ok_or_else(|| ValueError::Undefined(name.to_string()))
    }

    /// Read `$name.a.b`.
    #[instrument(level = "trace", skip(self))]
    pub fn get_path(&self, name: &str, path: &[String]) -> Result<&Value, ValueError> {
        let root = self.get(name)?;
        lookup(root, &format!("${}", name), path)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.locals.remove(name)
    }

    /// Assign through a property path. Every intermediate key must already
    /// exist and hold a mapping; only the final key may be new.
    pub fn set_path(&mut self, name: &str, path: &[String], value: Value) -> Result<(), ValueError> {
        let Some((last, parents)) = path.split_last() else {
            self.set(name, value);
            return Ok(());
        };

        let root = self.local_mut(name)?;
        let mut display = format!("${}", name);
        let mut current = root;
        for key in parents {
            let map = as_object_mut(current, &display)?;
            current = map.get_mut(key).ok_or_else(|| ValueError::MissingKey {
                path: display.clone(),
                key: key.clone(),
            })?;
            display.push('.');
            display.push_str(key);
        }
        as_object_mut(current, &display)?.insert(last.clone(), value);
        debug!(variable = %name, path = %path.join("."), "property assigned");
        Ok(())
    }

    /// Append to a list variable, creating the list if the variable is unset.
    pub fn push(&mut self, name: &str, value: Value) -> Result<(), ValueError> {
        if !self.contains(name) {
            self.set(name, Value::Array(vec![value]));
            return Ok(());
        }
        match self.local_mut(name)? {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(ValueError::TypeMismatch {
                path: format!("${}", name),
                expected: "a list",
                found: type_name(other),
            }),
        }
    }

    /// All visible variables, locals taking precedence.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut all: HashMap<String, Value> = (*self.globals).clone();
        all.extend(self.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }

    /// Variables assigned in this scope, globals excluded.
    pub fn into_locals(self) -> HashMap<String, Value> {
        self.locals
    }

    /// Local slot for `name`, copying a global in on first write.
    fn local_mut(&mut self, name: &str) -> Result<&mut Value, ValueError> {
        if !self.locals.contains_key(name) {
            let global = self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| ValueError::Undefined(name.to_string()))?;
            self.locals.insert(name.to_string(), global);
        }
        self.locals
            .get_mut(name)
            .ok_or_else(|| ValueError::Undefined(name.to_string()))
    }
}

// =============================================================================
// Value helpers
// =============================================================================

/// Follow `path` from `root`. `length` reads the size of strings and lists.
pub fn lookup<'v>(root: &'v Value, display: &str, path: &[String]) -> Result<&'v Value, ValueError> {
    let mut current = root;
    let mut at = display.to_string();
    for key in path {
        current = match current {
            Value::Object(map) => map.get(key).ok_or_else(|| ValueError::MissingKey {
                path: at.clone(),
                key: key.clone(),
            })?,
            other => {
                return Err(ValueError::TypeMismatch {
                    path: at,
                    expected: "a mapping",
                    found: type_name(other),
                })
            }
        };
        at.push('.');
        at.push_str(key);
    }
    Ok(current)
}

/// Like [`lookup`], but owned, and with `.length` on strings and lists.
pub fn lookup_field(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root.clone();
    for key in path {
        current = match current {
            Value::Object(mut map) => map.remove(key)?,
            Value::String(s) if key == "length" => Value::from(s.chars().count()),
            Value::Array(items) if key == "length" => Value::from(items.len()),
            _ => return None,
        };
    }
    Some(current)
}

fn as_object_mut<'v>(
    value: &'v mut Value,
    display: &str,
) -> Result<&'v mut serde_json::Map<String, Value>, ValueError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValueError::TypeMismatch {
            path: display.to_string(),
            expected: "a mapping",
            found: type_name(other),
        }),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Text form used for messages and templates: strings verbatim, the rest as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_execution_context_ids_are_unique() {
        let a = ExecutionContext::default();
        let b = ExecutionContext::default();
        assert_ne!(a.execution_id, b.execution_id);
        assert!(a.metadata.created_at.is_some());
    }

    #[test]
    fn test_locals_shadow_globals() {
        let mut ctx = ExecutionContext::new("run-1");
        ctx.set("limit", 3);
        let mut scope = Scope::new(ctx.globals());
        assert_eq!(scope.get("limit").unwrap(), &json!(3));
        scope.set("limit", json!(5));
        assert_eq!(scope.get("limit").unwrap(), &json!(5));
        assert_eq!(ctx.get("limit"), Some(&json!(3)));
    }

    #[test]
    fn test_undefined_variable() {
        let scope = Scope::default();
        assert_eq!(scope.get("nope"), Err(ValueError::Undefined("nope".to_string())));
    }

    #[test]
    fn test_set_path_updates_nested_value() {
        let mut scope = Scope::default();
        scope.set("obj", json!({"a": {"b": 1}}));
        scope.set_path("obj", &path(&["a", "b"]), json!(5)).unwrap();
        assert_eq!(scope.get("obj").unwrap(), &json!({"a": {"b": 5}}));
    }

    #[test]
    fn test_set_path_through_scalar_is_type_error() {
        let mut scope = Scope::default();
        scope.set("obj", json!({"a": 1}));
        let err = scope.set_path("obj", &path(&["a", "b"]), json!(5)).unwrap_err();
        assert_eq!(
            err,
            ValueError::TypeMismatch {
                path: "$obj.a".to_string(),
                expected: "a mapping",
                found: "a number",
            }
        );
    }

    #[test]
    fn test_set_path_never_creates_intermediates() {
        let mut scope = Scope::default();
        scope.set("obj", json!({}));
        let err = scope.set_path("obj", &path(&["a", "b"]), json!(5)).unwrap_err();
        assert_eq!(
            err,
            ValueError::MissingKey {
                path: "$obj".to_string(),
                key: "a".to_string(),
            }
        );
        assert_eq!(scope.get("obj").unwrap(), &json!({}));
    }

    #[test]
    fn test_set_path_copies_global_on_write() {
        let mut ctx = ExecutionContext::default();
        ctx.set("cfg", json!({"max": 1}));
        let mut scope = Scope::new(ctx.globals());
        scope.set_path("cfg", &path(&["max"]), json!(2)).unwrap();
        assert_eq!(scope.get("cfg").unwrap(), &json!({"max": 2}));
        assert_eq!(ctx.get("cfg"), Some(&json!({"max": 1})));
    }

    #[test]
    fn test_push_creates_and_appends() {
        let mut scope = Scope::default();
        scope.push("notes", json!("a")).unwrap();
        scope.push("notes", json!("b")).unwrap();
        assert_eq!(scope.get("notes").unwrap(), &json!(["a", "b"]));

        scope.set("count", json!(1));
        assert!(matches!(
            scope.push("count", json!(2)),
            Err(ValueError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_get_path_errors() {
        let mut scope = Scope::default();
        scope.set("user", json!({"name": "ada", "age": 36}));
        assert_eq!(scope.get_path("user", &path(&["name"])).unwrap(), &json!("ada"));
        assert!(matches!(
            scope.get_path("user", &path(&["email"])),
            Err(ValueError::MissingKey { .. })
        ));
        assert!(matches!(
            scope.get_path("user", &path(&["age", "years"])),
            Err(ValueError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_lookup_field_length() {
        let item = json!({"title": "hello", "tags": [1, 2, 3]});
        assert_eq!(lookup_field(&item, &path(&["title", "length"])), Some(json!(5)));
        assert_eq!(lookup_field(&item, &path(&["tags", "length"])), Some(json!(3)));
        assert_eq!(lookup_field(&item, &path(&["missing"])), None);
    }

    #[test]
    fn test_snapshot_merges_scopes() {
        let mut ctx = ExecutionContext::default();
        ctx.set("a", 1);
        ctx.set("b", 2);
        let mut scope = Scope::new(ctx.globals());
        scope.set("b", json!(20));
        let all = scope.snapshot();
        assert_eq!(all["a"], json!(1));
        assert_eq!(all["b"], json!(20));
    }
}

//! Registration entries for top-level workflow definitions.
//!
//! The code generator turns every model, schema, tool, policy, guardrail,
//! prompt and agent definition into one of these entries. They are plain data:
//! agent references (`delegate`, `use`) stay as names and are only resolved
//! to live instances by the runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Name under which the unnamed `agent:` definition is registered.
pub const DEFAULT_AGENT: &str = "default";

/// Model that prompts fall back to when they declare none.
pub const FALLBACK_MODEL: &str = "main";

// =============================================================================
// Models
// =============================================================================

/// `model NAME = "provider/model"` with optional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Provider-qualified identifier, e.g. `anthropic/claude-sonnet`
    pub model: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn temperature(&self) -> Option<f64> {
        self.params.get("temperature").and_then(Value::as_f64)
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

// =============================================================================
// Schemas
// =============================================================================

/// Field types allowed inside a schema. Schemas never reference other schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    List(Box<FieldType>),
}

impl FieldType {
    /// Parse a primitive type name (`string`, `int`, `float`, `bool`).
    pub fn primitive(name: &str) -> Option<FieldType> {
        match name {
            "string" => Some(FieldType::String),
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "bool" => Some(FieldType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::List(inner) => write!(f, "list[{}]", inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub ty: FieldType,
    #[serde(default)]
    pub optional: bool,
}

impl fmt::Display for SchemaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.name, self.ty, if self.optional { "?" } else { "" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

// =============================================================================
// Tools and policies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Builtin,
    Mcp,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Builtin => write!(f, "builtin"),
            ToolKind::Mcp => write!(f, "mcp"),
        }
    }
}

/// External tool registration. Invocation lives behind the runtime's tool boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub kind: ToolKind,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed => write!(f, "fixed"),
            Backoff::Linear => write!(f, "linear"),
            Backoff::Exponential => write!(f, "exponential"),
        }
    }
}

/// `retry NAME = N times[, KIND backoff]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub name: String,
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32, base: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(retry.max(1)),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor)
            }
        }
    }
}

/// `timeout NAME = N seconds|minutes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub name: String,
    pub seconds: u64,
}

impl TimeoutPolicy {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

/// `guardrail NAME = regex "PATTERN"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailSpec {
    pub name: String,
    pub pattern: String,
}

// =============================================================================
// Prompts and agents
// =============================================================================

/// Operator of an `escalate if` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOp {
    Equals,
    /// `~`: equality after normalization
    Similar,
    NotEquals,
    Contains,
}

impl EscalationOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            EscalationOp::Equals => "==",
            EscalationOp::Similar => "~",
            EscalationOp::NotEquals => "!=",
            EscalationOp::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationCondition {
    pub op: EscalationOp,
    pub literal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub name: String,
    pub template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expecting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalate: Option<EscalationCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Sub-agents the model may hand the conversation to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegate: Vec<String>,
    /// Agents wrapped as callable tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            tools: Vec::new(),
            description: None,
            retry: None,
            timeout: None,
            delegate: Vec::new(),
            uses: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            name: "default".into(),
            attempts: 3,
            backoff: Backoff::Exponential,
        };
        let base = Duration::from_millis(100);
        assert_eq!(policy.delay(1, base), Duration::from_millis(100));
        assert_eq!(policy.delay(2, base), Duration::from_millis(200));
        assert_eq!(policy.delay(3, base), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_scales() {
        let policy = RetryPolicy {
            name: "slow".into(),
            attempts: 5,
            backoff: Backoff::Linear,
        };
        assert_eq!(policy.delay(3, Duration::from_secs(1)), Duration::from_secs(3));
    }

    #[test]
    fn model_params() {
        let model = ModelSpec::new("fast", "openai/gpt-4o-mini")
            .with_param("temperature", serde_json::json!(0.2))
            .with_param("max_tokens", serde_json::json!(512));
        assert_eq!(model.temperature(), Some(0.2));
        assert_eq!(model.max_tokens(), Some(512));
    }

    #[test]
    fn field_type_display() {
        let ty = FieldType::List(Box::new(FieldType::String));
        assert_eq!(ty.to_string(), "list[string]");
        assert_eq!(FieldType::primitive("bool"), Some(FieldType::Bool));
        assert_eq!(FieldType::primitive("Review"), None);
    }
}

//! Error types for the weave runtime.

use crate::guardrail::GuardrailError;
use crate::llm::LlmError;
use crate::schema::SchemaError;
use std::time::Duration;
use thiserror::Error;
use weave_core::{HandlerEvent, SourcePosition};

/// Errors raised while reading or updating workflow values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValueError {
    #[error("variable '${0}' is not defined")]
    Undefined(String),

    #[error("'{path}' has no key '{key}'")]
    MissingKey { path: String, key: String },

    #[error("'{path}' is {found}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot apply '{op}' to {left} and {right}")]
    Operands {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("model request failed: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("undefined {kind} '{name}'")]
    Undefined { kind: &'static str, name: String },

    #[error("flow '{flow}' takes {expected} argument(s) but {given} were given")]
    Arity {
        flow: String,
        expected: usize,
        given: usize,
    },

    #[error("prompt '{prompt}' did not produce a valid {schema} after {attempts} attempt(s): {reason}")]
    SchemaValidation {
        prompt: String,
        schema: String,
        attempts: u32,
        reason: String,
    },

    #[error("guardrail '{guardrail}' blocked the {event}")]
    Blocked {
        event: HandlerEvent,
        guardrail: String,
    },

    #[error("aborted: {message}")]
    Aborted { message: String },

    #[error("'{name}' escalated and the run was aborted")]
    EscalationAbort { name: String },

    #[error("agent '{agent}' timed out after {limit:?}")]
    Timeout { agent: String, limit: Duration },

    #[error("agent '{agent}' gave no final answer within {turns} turn(s)")]
    TurnLimit { agent: String, turns: u32 },

    #[error("'{action}' is not valid in this context")]
    Misplaced { action: &'static str },

    #[error("task failed: {0}")]
    Join(String),

    #[error("{source} (at {location})")]
    Located {
        line: usize,
        location: String,
        position: Option<SourcePosition>,
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    pub fn undefined(kind: &'static str, name: impl Into<String>) -> Self {
        RuntimeError::Undefined {
            kind,
            name: name.into(),
        }
    }

    /// Fatal errors end the run; `on failure` blocks never see them.
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::Aborted { .. } | RuntimeError::EscalationAbort { .. } => true,
            RuntimeError::Located { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The error with any location wrapper removed.
    pub fn root(&self) -> &RuntimeError {
        match self {
            RuntimeError::Located { source, .. } => source.root(),
            other => other,
        }
    }

    /// Workflow source position, when the error was raised by a statement.
    pub fn position(&self) -> Option<&SourcePosition> {
        match self {
            RuntimeError::Located { position, .. } => position.as_ref(),
            _ => None,
        }
    }

    /// Generated-listing line of the statement that raised the error.
    pub fn generated_line(&self) -> Option<usize> {
        match self {
            RuntimeError::Located { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// Short machine-readable category, bound into `$error.kind`.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            RuntimeError::Value(_) => "value",
            RuntimeError::Llm(_) => "model",
            RuntimeError::Guardrail(_) => "guardrail",
            RuntimeError::Undefined { .. } => "undefined",
            RuntimeError::Arity { .. } => "arity",
            RuntimeError::Schema(_) | RuntimeError::SchemaValidation { .. } => "schema",
            RuntimeError::Blocked { .. } => "blocked",
            RuntimeError::Aborted { .. } => "aborted",
            RuntimeError::EscalationAbort { .. } => "escalated",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::TurnLimit { .. } => "turn_limit",
            RuntimeError::Misplaced { .. } => "misplaced",
            RuntimeError::Join(_) => "task",
            RuntimeError::Located { .. } => "located",
        }
    }

    /// Attach the generated line (and its source position) unless already located.
    pub fn at(self, line: usize, position: Option<SourcePosition>) -> Self {
        if matches!(self, RuntimeError::Located { .. }) {
            return self;
        }
        let location = match &position {
            Some(pos) => pos.to_string(),
            None => format!("generated line {}", line),
        };
        RuntimeError::Located {
            line,
            location,
            position,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_located_keeps_innermost_position() {
        let pos = SourcePosition {
            file: "main.wv".to_string(),
            line: 7,
            column: 5,
        };
        let err = RuntimeError::undefined("agent", "ghost")
            .at(12, Some(pos))
            .at(3, None);
        assert_eq!(err.generated_line(), Some(12));
        assert_eq!(err.to_string(), "undefined agent 'ghost' (at main.wv:7:5)");
        assert_eq!(err.kind(), "undefined");
    }

    #[test]
    fn test_fatal_errors() {
        let abort = RuntimeError::Aborted {
            message: "stop".to_string(),
        };
        assert!(abort.at(1, None).is_fatal());
        assert!(!RuntimeError::Join("boom".to_string()).is_fatal());
    }

    #[test]
    fn test_missing_location_falls_back_to_generated_line() {
        let err = RuntimeError::from(ValueError::Undefined("x".to_string())).at(4, None);
        assert_eq!(err.to_string(), "variable '$x' is not defined (at generated line 4)");
        assert!(err.position().is_none());
    }
}

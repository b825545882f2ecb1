//! Error types for weave core.

use thiserror::Error;

/// Errors raised while assembling a listing into an executable unit.
///
/// These indicate a malformed listing and therefore a code generation bug,
/// never a problem in user source.
#[derive(Debug, Error, PartialEq)]
pub enum AssemblyError {
    #[error("line {line}: unexpected indentation")]
    UnexpectedIndent { line: usize },

    #[error("line {line}: '{op}' opens a block but has no body")]
    EmptyBlock { line: usize, op: &'static str },

    #[error("line {line}: '{op}' cannot own a nested block")]
    UnexpectedBody { line: usize, op: &'static str },

    #[error("line {line}: '{op}' is not allowed {context}")]
    Misplaced {
        line: usize,
        op: &'static str,
        context: &'static str,
    },

    #[error("line {line}: duplicate {kind} '{name}'")]
    Duplicate {
        line: usize,
        kind: &'static str,
        name: String,
    },
}

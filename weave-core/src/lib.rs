//! Weave Core
//!
//! Shared types for the weave workflow-language compiler and runtime:
//! the executable IR emitted by the code generator, registration entries
//! for top-level definitions, compiled units, source maps and diagnostics.

pub mod defs;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod source_map;
pub mod unit;

pub use defs::*;
pub use diagnostic::*;
pub use error::*;
pub use ir::*;
pub use source_map::*;
pub use unit::*;

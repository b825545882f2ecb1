//! weave Compiler
//!
//! A compiler for the weave workflow language: models, tools, prompts,
//! agents, guardrails and flows compiled into an executable unit for
//! `weave-runtime`.
//!
//! # Architecture
//!
//! The compiler follows a traditional pipeline:
//! 1. **Lexer** (`lexer.rs`): Tokenizes weave source
//! 2. **Indenter** (`indenter.rs`): Turns leading whitespace into block markers
//! 3. **Parser** (`grammar.rs`, `parser.rs`): Earley chart parser producing a positioned parse tree
//! 4. **Transformer** (`transform.rs`): Parse tree to typed AST (`ast.rs`)
//! 5. **Semantic Analysis** (`semantic.rs`): Symbol table, reference, scope and cycle checks
//! 6. **Code Generation** (`codegen.rs`): Listing emission with source mapping
//! 7. **Orchestration** (`compile.rs`): Imports, assembly and the compile cache
//!
//! # Example
//!
//! ```rust,ignore
//! use weave_compiler::Compiler;
//!
//! let source = r#"
//! model main = "anthropic/claude-sonnet"
//! prompt greet: "Say hello to $input"
//! agent:
//!     instruction greet
//! flow main:
//!     $reply = run agent default with $input
//!     return $reply
//! "#;
//!
//! let compiler = Compiler::default();
//! let unit = compiler.compile(source, "hello.wv")?;
//! println!("{}", unit.generated_source(true));
//! ```

pub mod ast;
pub mod codegen;
pub mod compile;
pub mod grammar;
pub mod indenter;
pub mod lexer;
pub mod parser;
pub mod semantic;
pub mod transform;

// Re-export main types
pub use ast::{SourceUnit, Span};
pub use codegen::{CodegenConfig, GeneratedCode};
pub use compile::{
    file_stats, parse_unit, CacheStats, CompileError, Compiler, CompilerConfig, FsResolver,
    MemoryResolver, SourceResolver,
};
pub use lexer::{LexError, Lexer, Token, TokenKind};
pub use parser::{parse, ParseError};
pub use semantic::{analyze, Analysis, SemanticError, SymbolKind, SymbolTable};

// Re-export core types
pub use weave_core::{CompiledWorkflow, Diagnostic, DiagnosticCode, Severity, UnitStats};

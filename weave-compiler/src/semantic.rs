//! Semantic Analysis for weave
//!
//! Two passes over one or more source units (the root file plus its imports):
//! - Pass 1 collects every top-level definition into a [`SymbolTable`].
//!   A second definition of the same kind and name is reported and ignored.
//! - Pass 2 resolves every reference, checks variable scopes and guardrail
//!   actions, validates schemas, policies and regex patterns.
//!
//! Finally the `delegate`/`use` relation between agents is checked for
//! cycles. Problems are collected, never short-circuited, so one call
//! reports everything it finds.

use crate::ast::*;
use petgraph::graphmap::DiGraphMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use weave_core::{sort_diagnostics, Diagnostic, DiagnosticCode, FieldType, DEFAULT_AGENT};

/// Guardrails every handler may name without defining them.
pub const BUILTIN_GUARDRAILS: &[&str] = &["jailbreak", "pii"];

// =============================================================================
// Semantic Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SemanticError {
    #[error("undefined {kind} '{name}'")]
    Undefined {
        kind: SymbolKind,
        name: String,
        candidates: Vec<String>,
        span: Span,
    },

    #[error("variable '${name}' is used before it is defined")]
    UndefinedVariable { name: String, span: Span },

    #[error("duplicate {kind} '{name}'")]
    Duplicate {
        kind: &'static str,
        name: String,
        first: Option<String>,
        span: Span,
    },

    #[error("{message}")]
    TypeMismatch { message: String, span: Span },

    #[error("imported file '{path}' not found")]
    ImportNotFound { path: String, span: Span },

    #[error("circular import: {}", chain.join(" -> "))]
    CircularImport { chain: Vec<String>, span: Span },

    #[error("{message}")]
    InvalidGuardAction { message: String, span: Span },

    #[error("{owner} is missing required property '{property}'")]
    MissingProperty {
        owner: String,
        property: &'static str,
        span: Span,
    },

    #[error("circular agent reference: {}", cycle.join(" -> "))]
    CircularAgent { cycle: Vec<String>, span: Span },

    #[error("guardrail '{name}' has an invalid pattern: {reason}")]
    InvalidPattern {
        name: String,
        reason: String,
        span: Span,
    },

    #[error("{message}")]
    Misplaced { message: String, span: Span },

    #[error("agent '{agent}' defines both 'delegate' and 'use'")]
    MixedComposition { agent: String, span: Span },
}

impl SemanticError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            SemanticError::Undefined { .. } => DiagnosticCode::E0001,
            SemanticError::UndefinedVariable { .. } => DiagnosticCode::E0002,
            SemanticError::Duplicate { .. } => DiagnosticCode::E0003,
            SemanticError::TypeMismatch { .. } => DiagnosticCode::E0004,
            SemanticError::ImportNotFound { .. } => DiagnosticCode::E0005,
            SemanticError::CircularImport { .. } => DiagnosticCode::E0006,
            SemanticError::InvalidGuardAction { .. } => DiagnosticCode::E0009,
            SemanticError::MissingProperty { .. } => DiagnosticCode::E0010,
            SemanticError::CircularAgent { .. } => DiagnosticCode::E0011,
            SemanticError::InvalidPattern { .. } => DiagnosticCode::E0012,
            SemanticError::Misplaced { .. } => DiagnosticCode::E0013,
            SemanticError::MixedComposition { .. } => DiagnosticCode::W0002,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            SemanticError::Undefined { span, .. }
            | SemanticError::UndefinedVariable { span, .. }
            | SemanticError::Duplicate { span, .. }
            | SemanticError::TypeMismatch { span, .. }
            | SemanticError::ImportNotFound { span, .. }
            | SemanticError::CircularImport { span, .. }
            | SemanticError::InvalidGuardAction { span, .. }
            | SemanticError::MissingProperty { span, .. }
            | SemanticError::CircularAgent { span, .. }
            | SemanticError::InvalidPattern { span, .. }
            | SemanticError::Misplaced { span, .. }
            | SemanticError::MixedComposition { span, .. } => *span,
        }
    }

    pub fn help(&self) -> Option<String> {
        match self {
            SemanticError::Undefined {
                kind,
                name,
                candidates,
                ..
            } => {
                let defined = if candidates.is_empty() {
                    format!("no {} are defined", kind.plural())
                } else {
                    format!("defined {} are: {}", kind.plural(), candidates.join(", "))
                };
                match suggest(name, candidates) {
                    Some(best) => Some(format!("did you mean '{}'? {}", best, defined)),
                    None => Some(defined),
                }
            }
            SemanticError::Duplicate { first: Some(first), .. } => {
                Some(format!("first defined at {}", first))
            }
            SemanticError::MixedComposition { .. } => Some(
                "'delegate' hands the conversation over while 'use' calls agents as tools; pick one"
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn to_diagnostic(&self, file: &str) -> Diagnostic {
        let span = self.span();
        let diagnostic = Diagnostic::new(self.code(), file, span.line, span.column, self.to_string())
            .with_length(span.len().max(1));
        match self.help() {
            Some(help) => diagnostic.with_help(help),
            None => diagnostic,
        }
    }
}

/// Closest candidate by edit distance, if it is close enough to be a typo.
fn suggest<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    let threshold = (name.chars().count() / 3).max(2);
    candidates
        .iter()
        .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
        .filter(|(distance, _)| *distance <= threshold)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.as_str())
}

// =============================================================================
// Symbol Table
// =============================================================================

/// Kind of a top-level definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Model,
    Schema,
    Tool,
    Retry,
    Timeout,
    Guardrail,
    Prompt,
    Agent,
    Flow,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Model => "model",
            SymbolKind::Schema => "schema",
            SymbolKind::Tool => "tool",
            SymbolKind::Retry => "retry policy",
            SymbolKind::Timeout => "timeout policy",
            SymbolKind::Guardrail => "guardrail",
            SymbolKind::Prompt => "prompt",
            SymbolKind::Agent => "agent",
            SymbolKind::Flow => "flow",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            SymbolKind::Model => "models",
            SymbolKind::Schema => "schemas",
            SymbolKind::Tool => "tools",
            SymbolKind::Retry => "retry policies",
            SymbolKind::Timeout => "timeout policies",
            SymbolKind::Guardrail => "guardrails",
            SymbolKind::Prompt => "prompts",
            SymbolKind::Agent => "agents",
            SymbolKind::Flow => "flows",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The AST node a symbol was defined by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Definition<'ast> {
    Model(&'ast ModelDef),
    Schema(&'ast SchemaDef),
    Tool(&'ast ToolDef),
    Retry(&'ast RetryPolicyDef),
    Timeout(&'ast TimeoutPolicyDef),
    Guardrail(&'ast GuardrailDef),
    Prompt(&'ast PromptDef),
    Agent(&'ast AgentDef),
    Flow(&'ast FlowDef),
}

impl<'ast> Definition<'ast> {
    pub fn kind(&self) -> SymbolKind {
        match self {
            Definition::Model(_) => SymbolKind::Model,
            Definition::Schema(_) => SymbolKind::Schema,
            Definition::Tool(_) => SymbolKind::Tool,
            Definition::Retry(_) => SymbolKind::Retry,
            Definition::Timeout(_) => SymbolKind::Timeout,
            Definition::Guardrail(_) => SymbolKind::Guardrail,
            Definition::Prompt(_) => SymbolKind::Prompt,
            Definition::Agent(_) => SymbolKind::Agent,
            Definition::Flow(_) => SymbolKind::Flow,
        }
    }

    /// Span of the definition's name, or of the whole definition when unnamed.
    pub fn name_span(&self) -> Span {
        match self {
            Definition::Model(d) => d.name.span,
            Definition::Schema(d) => d.name.span,
            Definition::Tool(d) => d.name.span,
            Definition::Retry(d) => d.name.span,
            Definition::Timeout(d) => d.name.span,
            Definition::Guardrail(d) => d.name.span,
            Definition::Prompt(d) => d.name.span,
            Definition::Agent(d) => d.name.as_ref().map_or(d.span, |name| name.span),
            Definition::Flow(d) => d.name.span,
        }
    }
}

/// A symbol table entry.
#[derive(Debug, Clone)]
pub struct Symbol<'ast> {
    pub name: String,
    /// Source unit the definition lives in
    pub file: String,
    pub def: Definition<'ast>,
}

impl<'ast> Symbol<'ast> {
    pub fn kind(&self) -> SymbolKind {
        self.def.kind()
    }
}

/// Top-level definitions by kind and name, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable<'ast> {
    symbols: Vec<Symbol<'ast>>,
    index: HashMap<(SymbolKind, String), usize>,
}

impl<'ast> SymbolTable<'ast> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a symbol. On a name collision the existing entry is kept and returned.
    pub fn define(&mut self, symbol: Symbol<'ast>) -> Result<(), &Symbol<'ast>> {
        let key = (symbol.kind(), symbol.name.clone());
        if let Some(&existing) = self.index.get(&key) {
            return Err(&self.symbols[existing]);
        }
        self.index.insert(key, self.symbols.len());
        self.symbols.push(symbol);
        Ok(())
    }

    pub fn lookup(&self, kind: SymbolKind, name: &str) -> Option<&Symbol<'ast>> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|&idx| &self.symbols[idx])
    }

    pub fn contains(&self, kind: SymbolKind, name: &str) -> bool {
        self.lookup(kind, name).is_some()
    }

    /// Sorted names of every symbol of `kind`.
    pub fn names(&self, kind: SymbolKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .iter()
            .filter(|symbol| symbol.kind() == kind)
            .map(|symbol| symbol.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every symbol in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol<'ast>> {
        self.symbols.iter()
    }

    pub fn agents(&self) -> impl Iterator<Item = (&str, &'ast AgentDef)> {
        self.symbols.iter().filter_map(|symbol| match symbol.def {
            Definition::Agent(agent) => Some((symbol.name.as_str(), agent)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// =============================================================================
// Analysis result
// =============================================================================

/// Symbols plus every diagnostic found, sorted by position.
#[derive(Debug, Clone)]
pub struct Analysis<'ast> {
    pub symbols: SymbolTable<'ast>,
    pub diagnostics: Vec<Diagnostic>,
    /// `Valid` or `Invalid`
    pub phase: Phase,
}

impl<'ast> Analysis<'ast> {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }
}

/// Analyze `root` together with the units it imports.
pub fn analyze<'ast>(root: &'ast SourceUnit, imports: &'ast [SourceUnit]) -> Analysis<'ast> {
    let units: Vec<&'ast SourceUnit> = std::iter::once(root).chain(imports.iter()).collect();
    SemanticAnalyzer::new().analyze(&units)
}

// =============================================================================
// Semantic Analyzer
// =============================================================================

/// Where a statement sits, for placement rules.
#[derive(Debug, Clone, Copy, Default)]
struct Ctx {
    /// Directly in a flow body
    flow_top: bool,
    in_loop: bool,
    handler: Option<HandlerKind>,
}

type Scope = HashSet<String>;

/// Analyzer states, in order. Analysis ends in `Valid` or `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    CollectingSymbols,
    ValidatingReferences,
    Valid,
    Invalid,
}

pub struct SemanticAnalyzer<'ast> {
    symbols: SymbolTable<'ast>,
    globals: Scope,
    diagnostics: Vec<Diagnostic>,
    file: String,
    failure_seen: bool,
    phase: Phase,
}

impl<'ast> Default for SemanticAnalyzer<'ast> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'ast> SemanticAnalyzer<'ast> {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            globals: Scope::new(),
            diagnostics: Vec::new(),
            file: String::new(),
            failure_seen: false,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Analyze units; the first is the root, the rest are its imports.
    pub fn analyze(mut self, units: &[&'ast SourceUnit]) -> Analysis<'ast> {
        self.phase = Phase::CollectingSymbols;
        for unit in units {
            self.file = unit.name.clone();
            for item in &unit.items {
                self.collect_item(item);
            }
        }

        for unit in units {
            for item in &unit.items {
                if let Item::Handler(handler) = item {
                    if handler.event.node == HandlerKind::Start {
                        self.globals.extend(assigned_variables(&handler.body));
                    }
                }
            }
        }

        self.phase = Phase::ValidatingReferences;
        for unit in units {
            self.file = unit.name.clone();
            for item in &unit.items {
                self.check_item(item);
            }
        }
        self.check_agent_cycles();

        self.phase = if self.diagnostics.iter().any(Diagnostic::is_error) {
            Phase::Invalid
        } else {
            Phase::Valid
        };
        sort_diagnostics(&mut self.diagnostics);
        tracing::debug!(
            symbols = self.symbols.len(),
            diagnostics = self.diagnostics.len(),
            "semantic analysis finished"
        );
        Analysis {
            symbols: self.symbols,
            diagnostics: self.diagnostics,
            phase: self.phase,
        }
    }

    fn report(&mut self, error: SemanticError) {
        self.diagnostics.push(error.to_diagnostic(&self.file));
    }

    fn report_in(&mut self, file: &str, error: SemanticError) {
        self.diagnostics.push(error.to_diagnostic(file));
    }

    // =========================================================================
    // Pass 1: collection
    // =========================================================================

    fn collect_item(&mut self, item: &'ast Item) {
        let (name, def) = match item {
            Item::Import(_) | Item::Handler(_) => return,
            Item::Model(d) => (d.name.node.clone(), Definition::Model(d)),
            Item::Schema(d) => (d.name.node.clone(), Definition::Schema(d)),
            Item::Tool(d) => (d.name.node.clone(), Definition::Tool(d)),
            Item::Retry(d) => (d.name.node.clone(), Definition::Retry(d)),
            Item::Timeout(d) => (d.name.node.clone(), Definition::Timeout(d)),
            Item::Guardrail(d) => (d.name.node.clone(), Definition::Guardrail(d)),
            Item::Prompt(d) => (d.name.node.clone(), Definition::Prompt(d)),
            Item::Agent(d) => (
                d.name
                    .as_ref()
                    .map_or_else(|| DEFAULT_AGENT.to_string(), |n| n.node.clone()),
                Definition::Agent(d),
            ),
            Item::Flow(d) => (d.name.node.clone(), Definition::Flow(d)),
        };

        let span = def.name_span();
        let kind = def.kind();
        let symbol = Symbol {
            name: name.clone(),
            file: self.file.clone(),
            def,
        };
        if let Err(existing) = self.symbols.define(symbol) {
            let first = format!("{}:{}", existing.file, existing.def.name_span().line);
            self.report(SemanticError::Duplicate {
                kind: kind.as_str(),
                name,
                first: Some(first),
                span,
            });
        }
    }

    // =========================================================================
    // Pass 2: validation
    // =========================================================================

    fn resolve(&mut self, kind: SymbolKind, name: &Spanned<String>) -> bool {
        if self.symbols.contains(kind, &name.node) {
            return true;
        }
        self.report(SemanticError::Undefined {
            kind,
            name: name.node.clone(),
            candidates: self.symbols.names(kind),
            span: name.span,
        });
        false
    }

    fn check_item(&mut self, item: &'ast Item) {
        match item {
            Item::Import(_) | Item::Tool(_) => {}
            Item::Model(model) => self.check_model(model),
            Item::Schema(schema) => self.check_schema(schema),
            Item::Retry(retry) => {
                if retry.attempts.node == 0 {
                    self.report(SemanticError::TypeMismatch {
                        message: format!("retry policy '{}' must allow at least 1 attempt", retry.name.node),
                        span: retry.attempts.span,
                    });
                }
            }
            Item::Timeout(timeout) => {
                if timeout.seconds.node == 0 {
                    self.report(SemanticError::TypeMismatch {
                        message: format!("timeout policy '{}' must be longer than 0 seconds", timeout.name.node),
                        span: timeout.seconds.span,
                    });
                }
            }
            Item::Guardrail(guardrail) => {
                if let Err(err) = regex::Regex::new(&guardrail.pattern.node) {
                    self.report(SemanticError::InvalidPattern {
                        name: guardrail.name.node.clone(),
                        reason: err.to_string().lines().last().unwrap_or_default().trim().to_string(),
                        span: guardrail.pattern.span,
                    });
                }
            }
            Item::Prompt(prompt) => {
                if let Some(model) = &prompt.model {
                    self.resolve(SymbolKind::Model, model);
                }
                if let Some(schema) = &prompt.expecting {
                    self.resolve(SymbolKind::Schema, schema);
                }
            }
            Item::Agent(agent) => self.check_agent(agent),
            Item::Flow(flow) => self.check_flow(flow),
            Item::Handler(handler) => {
                let mut scope: Scope = self.globals.clone();
                scope.insert("input".to_string());
                if handler.event.node == HandlerKind::Start {
                    scope.retain(|name| name == "input");
                }
                let ctx = Ctx {
                    handler: Some(handler.event.node),
                    ..Ctx::default()
                };
                self.check_block(&handler.body, &mut scope, ctx);
            }
        }
    }

    fn check_model(&mut self, model: &ModelDef) {
        for prop in &model.properties {
            let valid = match (prop.key.node.as_str(), &prop.value.node) {
                ("temperature", Literal::Int(_) | Literal::Float(_)) => true,
                ("temperature", _) => false,
                ("max_tokens", Literal::Int(n)) => *n > 0,
                ("max_tokens", _) => false,
                _ => true,
            };
            if !valid {
                self.report(SemanticError::TypeMismatch {
                    message: format!(
                        "model property '{}' expects {}",
                        prop.key.node,
                        if prop.key.node == "temperature" { "a number" } else { "a positive integer" }
                    ),
                    span: prop.value.span,
                });
            }
        }
    }

    fn check_schema(&mut self, schema: &SchemaDef) {
        let mut seen = HashSet::new();
        for field in &schema.fields {
            if !seen.insert(field.name.node.as_str()) {
                self.report(SemanticError::Duplicate {
                    kind: "field",
                    name: field.name.node.clone(),
                    first: None,
                    span: field.name.span,
                });
            }
            if let Err((name, span)) = field_type(&field.ty) {
                let message = if self.symbols.contains(SymbolKind::Schema, &name) {
                    format!("field '{}' cannot reference schema '{}'", field.name.node, name)
                } else {
                    format!(
                        "field '{}' has unknown type '{}' (expected string, int, float, bool or list[T])",
                        field.name.node, name
                    )
                };
                self.report(SemanticError::TypeMismatch { message, span });
            }
        }
    }

    fn check_agent(&mut self, agent: &'ast AgentDef) {
        let label = match &agent.name {
            Some(name) => format!("agent '{}'", name.node),
            None => "default agent".to_string(),
        };
        match &agent.instruction {
            Some(instruction) => {
                self.resolve(SymbolKind::Prompt, instruction);
            }
            None => self.report(SemanticError::MissingProperty {
                owner: label.clone(),
                property: "instruction",
                span: agent.name.as_ref().map_or(agent.span, |n| n.span),
            }),
        }
        for tool in &agent.tools {
            self.resolve(SymbolKind::Tool, tool);
        }
        if let Some(retry) = &agent.retry {
            self.resolve(SymbolKind::Retry, retry);
        }
        if let Some(timeout) = &agent.timeout {
            self.resolve(SymbolKind::Timeout, timeout);
        }
        for name in agent.delegate.iter().chain(agent.uses.iter()).flatten() {
            self.resolve(SymbolKind::Agent, name);
        }

        let delegates = agent.delegate.as_ref().is_some_and(|list| !list.is_empty());
        let uses = agent.uses.as_ref().is_some_and(|list| !list.is_empty());
        if delegates && uses {
            self.report(SemanticError::MixedComposition {
                agent: agent
                    .name
                    .as_ref()
                    .map_or_else(|| DEFAULT_AGENT.to_string(), |n| n.node.clone()),
                span: agent.name.as_ref().map_or(agent.span, |n| n.span),
            });
        }
    }

    fn check_flow(&mut self, flow: &'ast FlowDef) {
        let mut scope: Scope = self.globals.clone();
        scope.insert("input".to_string());
        for param in &flow.params {
            if !scope.insert(param.node.clone()) && !self.globals.contains(&param.node) {
                self.report(SemanticError::Duplicate {
                    kind: "parameter",
                    name: param.node.clone(),
                    first: None,
                    span: param.span,
                });
            }
        }
        self.failure_seen = false;
        let ctx = Ctx {
            flow_top: true,
            ..Ctx::default()
        };
        self.check_block(&flow.body, &mut scope, ctx);
    }

    fn check_block(&mut self, body: &'ast [Stmt], scope: &mut Scope, ctx: Ctx) {
        for stmt in body {
            self.check_stmt(stmt, scope, ctx);
        }
    }

    fn check_stmt(&mut self, stmt: &'ast Stmt, scope: &mut Scope, ctx: Ctx) {
        let nested = Ctx {
            flow_top: false,
            ..ctx
        };
        match stmt {
            Stmt::Assignment { target, value, .. } => {
                self.check_expr(value, scope);
                scope.insert(target.node.clone());
            }
            Stmt::PropertyAssignment { target, value, .. } => {
                self.read(&target.node, target.span, scope);
                self.check_expr(value, scope);
            }
            Stmt::Run(run) => {
                self.check_run(run, scope, ctx);
                if let Some(target) = &run.target {
                    scope.insert(target.node.clone());
                }
            }
            Stmt::Parallel(block) => {
                let mut targets = Vec::new();
                for inner in &block.body {
                    match inner {
                        Stmt::Run(run @ RunStatement {
                            invocation: Invocation::Agent { .. },
                            on_escalate: None,
                            ..
                        }) => {
                            self.check_run(run, scope, nested);
                            targets.extend(run.target.as_ref().map(|t| t.node.clone()));
                        }
                        other => self.report(SemanticError::Misplaced {
                            message: "only 'run agent' statements without escalation handlers are allowed in a parallel block".to_string(),
                            span: other.span(),
                        }),
                    }
                }
                scope.extend(targets);
            }
            Stmt::Loop(block) => {
                let inner = Ctx {
                    in_loop: true,
                    ..nested
                };
                self.check_block(&block.body, &mut scope.clone(), inner);
            }
            Stmt::For {
                var,
                iterable,
                body,
                ..
            } => {
                self.check_expr(iterable, scope);
                let mut body_scope = scope.clone();
                body_scope.insert(var.node.clone());
                let inner = Ctx {
                    in_loop: true,
                    ..nested
                };
                self.check_block(body, &mut body_scope, inner);
            }
            Stmt::If {
                condition,
                then_body,
                else_body,
                ..
            } => {
                self.check_expr(condition, scope);
                let mut then_scope = scope.clone();
                self.check_block(then_body, &mut then_scope, nested);
                let mut else_scope = scope.clone();
                self.check_block(else_body, &mut else_scope, nested);
                // only names assigned on both branches survive the block
                if !else_body.is_empty() {
                    scope.extend(then_scope.intersection(&else_scope).cloned());
                }
            }
            Stmt::Match(block) => {
                self.check_expr(&block.subject, scope);
                for arm in &block.arms {
                    self.check_stmt(&arm.body, &mut scope.clone(), nested);
                }
            }
            Stmt::Failure(block) => {
                if !ctx.flow_top {
                    self.report(SemanticError::Misplaced {
                        message: "'on failure' is only allowed at the top level of a flow".to_string(),
                        span: block.span,
                    });
                } else if self.failure_seen {
                    self.report(SemanticError::Duplicate {
                        kind: "failure block",
                        name: "on failure".to_string(),
                        first: None,
                        span: block.span,
                    });
                }
                self.failure_seen = true;
                let mut failure_scope = scope.clone();
                failure_scope.insert("error".to_string());
                self.check_block(&block.body, &mut failure_scope, nested);
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.check_expr(value, scope);
                }
            }
            Stmt::Continue { span } => {
                if !ctx.in_loop {
                    self.report(SemanticError::Misplaced {
                        message: "'continue' is only allowed inside a loop".to_string(),
                        span: *span,
                    });
                }
            }
            Stmt::Abort { message, .. } => {
                if let Some(message) = message {
                    self.check_expr(message, scope);
                }
            }
            Stmt::Push { value, target, .. } => {
                self.check_expr(value, scope);
                scope.insert(target.node.clone());
            }
            Stmt::Log { message, .. } => self.check_expr(message, scope),
            Stmt::Guard(action) => self.check_guard(action, ctx),
        }
    }

    fn check_run(&mut self, run: &'ast RunStatement, scope: &Scope, ctx: Ctx) {
        for arg in run.invocation.args() {
            self.check_expr(arg, scope);
        }
        match &run.invocation {
            Invocation::Agent { name, .. } => {
                self.resolve(SymbolKind::Agent, name);
            }
            Invocation::Llm { prompt, model, .. } => {
                self.resolve(SymbolKind::Prompt, prompt);
                if let Some(model) = model {
                    self.resolve(SymbolKind::Model, model);
                }
            }
            Invocation::Flow { name, args } => {
                if self.resolve(SymbolKind::Flow, name) {
                    let expected = match self.symbols.lookup(SymbolKind::Flow, &name.node) {
                        Some(Symbol {
                            def: Definition::Flow(flow),
                            ..
                        }) => flow.params.len(),
                        _ => args.len(),
                    };
                    if expected != args.len() && !(expected == 0 && args.len() == 1) {
                        self.report(SemanticError::TypeMismatch {
                            message: format!(
                                "flow '{}' takes {} argument(s) but {} were given",
                                name.node,
                                expected,
                                args.len()
                            ),
                            span: run.span,
                        });
                    }
                }
            }
        }
        match &run.on_escalate {
            Some(EscalationHandler::Return { value }) => self.check_expr(value, scope),
            Some(EscalationHandler::Continue) if !ctx.in_loop => self.report(SemanticError::Misplaced {
                message: "'on escalate continue' is only allowed inside a loop".to_string(),
                span: run.span,
            }),
            _ => {}
        }
    }

    fn check_guard(&mut self, action: &GuardAction, ctx: Ctx) {
        let verb = match action.kind {
            GuardActionKind::Retry => "retry with",
            other => other.as_str(),
        };
        match ctx.handler {
            None | Some(HandlerKind::Start) => self.report(SemanticError::InvalidGuardAction {
                message: format!("'{}' is only allowed inside guardrail handlers", verb),
                span: action.span,
            }),
            Some(event) if action.kind == GuardActionKind::Retry && event != HandlerKind::Output => {
                self.report(SemanticError::InvalidGuardAction {
                    message: format!("'retry with' is only allowed in 'on output', not 'on {}'", event.as_str()),
                    span: action.span,
                })
            }
            Some(HandlerKind::ToolCall) if action.kind == GuardActionKind::Mask => {
                self.report(SemanticError::InvalidGuardAction {
                    message: "'mask' is not allowed in 'on tool-call'; tool arguments cannot be rewritten".to_string(),
                    span: action.span,
                })
            }
            _ => {}
        }

        let name = &action.guardrail;
        if !BUILTIN_GUARDRAILS.contains(&name.node.as_str())
            && !self.symbols.contains(SymbolKind::Guardrail, &name.node)
        {
            let mut candidates = self.symbols.names(SymbolKind::Guardrail);
            candidates.extend(BUILTIN_GUARDRAILS.iter().map(|s| s.to_string()));
            candidates.sort();
            self.report(SemanticError::Undefined {
                kind: SymbolKind::Guardrail,
                name: name.node.clone(),
                candidates,
                span: name.span,
            });
        }
    }

    fn read(&mut self, name: &str, span: Span, scope: &Scope) {
        if !scope.contains(name) {
            self.report(SemanticError::UndefinedVariable {
                name: name.to_string(),
                span,
            });
        }
    }

    fn check_expr(&mut self, expr: &Expr, scope: &Scope) {
        match expr {
            Expr::Literal { .. } => {}
            Expr::Variable { name, span } => self.read(name, *span, scope),
            Expr::Property { base, .. } => self.read(&base.node, base.span, scope),
            Expr::List { items, .. } => {
                for item in items {
                    self.check_expr(item, scope);
                }
            }
            Expr::Map { entries, .. } => {
                for (_, value) in entries {
                    self.check_expr(value, scope);
                }
            }
            Expr::Binary { left, right, .. } => {
                self.check_expr(left, scope);
                self.check_expr(right, scope);
            }
            Expr::Not { operand, .. } => self.check_expr(operand, scope),
            Expr::Filter(filter) => {
                self.check_expr(&filter.list, scope);
                self.check_expr(&filter.value, scope);
            }
        }
    }

    // =========================================================================
    // Cycle detection
    // =========================================================================

    fn check_agent_cycles(&mut self) {
        let reports: Vec<(String, SemanticError)> = {
            let agents: Vec<(&str, &'ast AgentDef)> = self.symbols.agents().collect();
            let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
            for &(name, _) in &agents {
                graph.add_node(name);
            }
            for &(name, agent) in &agents {
                for target in agent.delegate.iter().chain(agent.uses.iter()).flatten() {
                    if graph.contains_node(target.node.as_str()) {
                        graph.add_edge(name, target.node.as_str(), ());
                    }
                }
            }

            find_cycles(&graph, agents.iter().map(|&(name, _)| name))
                .into_iter()
                .filter_map(|cycle| {
                    let symbol = self.symbols.lookup(SymbolKind::Agent, cycle.first()?)?;
                    Some((
                        symbol.file.clone(),
                        SemanticError::CircularAgent {
                            span: symbol.def.name_span(),
                            cycle: cycle.iter().map(|s| s.to_string()).collect(),
                        },
                    ))
                })
                .collect()
        };
        for (file, error) in reports {
            self.report_in(&file, error);
        }
    }
}

/// Depth-first search with an explicit recursion stack. Every back edge to a
/// node still on the stack yields the cycle from that node, closed with it
/// again (`a -> b -> a`).
pub fn find_cycles<'g>(
    graph: &DiGraphMap<&'g str, ()>,
    roots: impl IntoIterator<Item = &'g str>,
) -> Vec<Vec<&'g str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }

    fn visit<'g>(
        graph: &DiGraphMap<&'g str, ()>,
        node: &'g str,
        marks: &mut HashMap<&'g str, Mark>,
        stack: &mut Vec<&'g str>,
        cycles: &mut Vec<Vec<&'g str>>,
    ) {
        marks.insert(node, Mark::OnStack);
        stack.push(node);
        for next in graph.neighbors(node) {
            match marks.get(next) {
                Some(Mark::OnStack) => {
                    if let Some(pos) = stack.iter().position(|n| *n == next) {
                        let mut cycle = stack[pos..].to_vec();
                        cycle.push(next);
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(graph, next, marks, stack, cycles),
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
    }

    let mut marks = HashMap::new();
    let mut cycles = Vec::new();
    for root in roots {
        if !marks.contains_key(root) {
            let mut stack = Vec::new();
            visit(graph, root, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

/// Validate a schema field type. On failure returns the offending type name.
pub fn field_type(tag: &TypeTag) -> Result<(FieldType, bool), (String, Span)> {
    match tag {
        TypeTag::Optional { inner, .. } => field_type(inner).map(|(ty, _)| (ty, true)),
        TypeTag::List { element, .. } => {
            field_type(element).map(|(ty, _)| (FieldType::List(Box::new(ty)), false))
        }
        TypeTag::Named { name, span } => FieldType::primitive(name)
            .map(|ty| (ty, false))
            .ok_or_else(|| (name.clone(), *span)),
    }
}

/// Every variable a block writes, including nested blocks.
/// Variables certainly assigned once `body` completes: direct assignments,
/// parallel targets, and names assigned on both branches of an `if`/`else`.
fn assigned_variables(body: &[Stmt]) -> Scope {
    let mut out = Scope::new();
    for stmt in body {
        match stmt {
            Stmt::Assignment { target, .. } | Stmt::Push { target, .. } => {
                out.insert(target.node.clone());
            }
            Stmt::Run(run) => out.extend(run.target.as_ref().map(|t| t.node.clone())),
            Stmt::Parallel(ParallelBlock { body, .. }) => out.extend(assigned_variables(body)),
            Stmt::If {
                then_body,
                else_body,
                ..
            } if !else_body.is_empty() => {
                let then_names = assigned_variables(then_body);
                let else_names = assigned_variables(else_body);
                out.extend(then_names.intersection(&else_names).cloned());
            }
            _ => {}
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::transform::transform;

    fn unit(source: &str) -> SourceUnit {
        let tree = parse(source).unwrap();
        transform(&tree, source, "test.wv").unwrap()
    }

    fn codes(source: &str) -> Vec<DiagnosticCode> {
        let unit = unit(source);
        analyze(&unit, &[]).diagnostics.iter().map(|d| d.code).collect()
    }

    fn messages(source: &str) -> Vec<Diagnostic> {
        let unit = unit(source);
        analyze(&unit, &[]).diagnostics
    }

    const BASE: &str = "model main = \"anthropic/claude\"\nprompt p: \"hi $input\"\n";

    #[test]
    fn collects_symbols_by_kind() {
        let source = format!("{BASE}agent:\n    instruction p\nagent reviewer:\n    instruction p\n");
        let unit = unit(&source);
        let analysis = analyze(&unit, &[]);
        assert!(!analysis.has_errors());
        assert!(analysis.symbols.contains(SymbolKind::Agent, DEFAULT_AGENT));
        assert!(analysis.symbols.contains(SymbolKind::Agent, "reviewer"));
        assert!(analysis.symbols.contains(SymbolKind::Model, "main"));
        assert!(!analysis.symbols.contains(SymbolKind::Agent, "main"));
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let source = format!("{BASE}agent p:\n    instruction p\n");
        assert!(codes(&source).is_empty());
    }

    #[test]
    fn duplicate_definition_first_wins() {
        let source = format!("{BASE}model main = \"openai/gpt\"\n");
        let unit = unit(&source);
        let analysis = analyze(&unit, &[]);
        let diags = &analysis.diagnostics;
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::E0003);
        assert_eq!(diags[0].line, 3);
        assert_eq!(diags[0].help.as_deref(), Some("first defined at test.wv:1"));
        match analysis.symbols.lookup(SymbolKind::Model, "main").map(|s| s.def) {
            Some(Definition::Model(model)) => assert_eq!(model.model.node, "anthropic/claude"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undefined_reference_lists_candidates() {
        let source = "model main = \"a\"\nmodel compact = \"b\"\nprompt p using model mian: \"x\"\n";
        let diags = messages(source);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::E0001);
        assert_eq!(diags[0].message, "undefined model 'mian'");
        assert_eq!(
            diags[0].help.as_deref(),
            Some("did you mean 'main'? defined models are: compact, main")
        );
    }

    #[test]
    fn missing_instruction() {
        let diags = messages("agent helper:\n    description \"no prompt\"\n");
        assert_eq!(diags[0].code, DiagnosticCode::E0010);
        assert_eq!(diags[0].message, "agent 'helper' is missing required property 'instruction'");
    }

    #[test]
    fn delegate_cycle_reports_full_path() {
        let source = format!(
            "{BASE}agent a:\n    instruction p\n    delegate b\nagent b:\n    instruction p\n    delegate c\nagent c:\n    instruction p\n    delegate a\n"
        );
        let diags = messages(&source);
        let cycles: Vec<_> = diags.iter().filter(|d| d.code == DiagnosticCode::E0011).collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].message, "circular agent reference: a -> b -> c -> a");
    }

    #[test]
    fn use_edges_participate_in_cycles() {
        let source = format!("{BASE}agent a:\n    instruction p\n    use a\n");
        let diags = messages(&source);
        assert!(diags
            .iter()
            .any(|d| d.code == DiagnosticCode::E0011 && d.message.ends_with("a -> a")));
    }

    #[test]
    fn mixed_delegate_and_use_warns() {
        let source = format!(
            "{BASE}agent a:\n    instruction p\n    delegate b\n    use c\nagent b:\n    instruction p\nagent c:\n    instruction p\n"
        );
        let unit = unit(&source);
        let analysis = analyze(&unit, &[]);
        assert!(!analysis.has_errors());
        assert_eq!(analysis.warnings().map(|d| d.code).collect::<Vec<_>>(), vec![DiagnosticCode::W0002]);
    }

    #[test]
    fn variable_read_before_write() {
        let source = format!("{BASE}flow main:\n    log $later\n    $later = 1\n    return $later\n");
        let diags = messages(&source);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::E0002);
        assert_eq!((diags[0].line, diags[0].column), (4, 9));
    }

    #[test]
    fn start_handler_defines_globals() {
        let source = format!(
            "{BASE}flow main:\n    return $limit\non start do\n    $limit = 3\nend\nflow other:\n    return $other_local\n"
        );
        let codes: Vec<_> = messages(&source).iter().map(|d| (d.code, d.line)).collect();
        assert_eq!(codes, vec![(DiagnosticCode::E0002, 9)]);
    }

    #[test]
    fn flow_locals_do_not_leak() {
        let source = format!("{BASE}flow a:\n    $x = 1\n    return $x\nflow b:\n    return $x\n");
        assert_eq!(codes(&source), vec![DiagnosticCode::E0002]);
    }

    #[test]
    fn failure_block_binds_error() {
        let source = format!(
            "{BASE}flow main:\n    on failure do\n        return $error\n    end\n    return $input\n"
        );
        assert!(codes(&source).is_empty());
    }

    #[test]
    fn guard_actions_respect_handler_context() {
        let source = "on input do\n    retry with \"x\" if pii\nend\non tool-call do\n    mask pii\nend\non output do\n    retry with \"again\" if pii\n    block if secrets\nend\n";
        let codes: Vec<_> = messages(source).iter().map(|d| (d.code, d.line)).collect();
        assert_eq!(
            codes,
            vec![
                (DiagnosticCode::E0009, 2),
                (DiagnosticCode::E0009, 5),
                (DiagnosticCode::E0001, 9)
            ]
        );
    }

    #[test]
    fn guard_outside_handler() {
        let source = format!("{BASE}flow main:\n    mask pii\n");
        assert_eq!(codes(&source), vec![DiagnosticCode::E0009]);
    }

    #[test]
    fn schema_field_rules() {
        let source = "schema Inner:\n    a: int\nschema Outer:\n    inner: Inner\n    ok: list[string]?\n    ok: bool\n    bad: list[date]\n";
        let diags = messages(source);
        let codes: Vec<_> = diags.iter().map(|d| (d.code, d.line)).collect();
        assert_eq!(
            codes,
            vec![
                (DiagnosticCode::E0004, 4),
                (DiagnosticCode::E0003, 6),
                (DiagnosticCode::E0004, 7)
            ]
        );
        assert_eq!(diags[0].message, "field 'inner' cannot reference schema 'Inner'");
    }

    #[test]
    fn invalid_guardrail_regex() {
        let diags = messages("guardrail broken = regex \"(unclosed\"\n");
        assert_eq!(diags[0].code, DiagnosticCode::E0012);
    }

    #[test]
    fn parallel_accepts_only_agent_runs() {
        let source = format!(
            "{BASE}agent x:\n    instruction p\nflow main:\n    parallel do\n        $a = run agent x with $input\n        $b = call llm p\n    end\n    return $a\n"
        );
        let codes: Vec<_> = messages(&source).iter().map(|d| (d.code, d.line)).collect();
        assert_eq!(codes, vec![(DiagnosticCode::E0013, 8)]);
    }

    #[test]
    fn continue_needs_a_loop() {
        let source = format!(
            "{BASE}agent x:\n    instruction p\nflow main:\n    run agent x on escalate continue\n    loop max 2 do\n        run agent x on escalate continue\n    end\n"
        );
        let codes: Vec<_> = messages(&source).iter().map(|d| (d.code, d.line)).collect();
        assert_eq!(codes, vec![(DiagnosticCode::E0013, 6)]);
    }

    #[test]
    fn analyzer_starts_in_init() {
        assert_eq!(SemanticAnalyzer::new().phase(), Phase::Init);
    }

    #[test]
    fn analysis_ends_valid_or_invalid() {
        let valid = unit(&format!("{BASE}flow main:\n    return $input\n"));
        assert_eq!(analyze(&valid, &[]).phase, Phase::Valid);

        let warned = unit(&format!(
            "{BASE}agent a:\n    instruction p\n    delegate b\n    use c\nagent b:\n    instruction p\nagent c:\n    instruction p\n"
        ));
        let analysis = analyze(&warned, &[]);
        assert_eq!(analysis.warnings().count(), 1);
        assert_eq!(analysis.phase, Phase::Valid);

        let invalid = unit(&format!("{BASE}flow main:\n    return $missing\n"));
        assert_eq!(analyze(&invalid, &[]).phase, Phase::Invalid);
    }

    #[test]
    fn start_globals_need_certain_assignment() {
        let source = format!(
            "{BASE}on start do\n    $a = 1\n    if $input do\n        $b = 1\n        $c = 1\n    else\n        $c = 2\n    end\nend\nflow main:\n    return [$a, $c, $b]\n"
        );
        let diags = messages(&source);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::E0002);
        assert!(diags[0].message.contains("'$b'"));
    }

    #[test]
    fn finds_every_cycle_start() {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        graph.add_edge("a", "b", ());
        graph.add_edge("b", "a", ());
        graph.add_edge("c", "c", ());
        let cycles = find_cycles(&graph, ["a", "b", "c"]);
        assert_eq!(cycles, vec![vec!["a", "b", "a"], vec!["c", "c"]]);
    }
}

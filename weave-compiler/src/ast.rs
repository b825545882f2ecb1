//! Abstract Syntax Tree (AST) for the weave language
//!
//! This module defines all node types that represent weave source units after
//! transformation from the parse tree. The AST is:
//! - Serializable (via serde) for tooling integration
//! - Span-aware: every node carries its byte range plus 1-based line/column
//! - Immutable once built by the transformer

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Source location information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    /// 1-based line of `start`
    pub line: usize,
    /// 1-based column of `start`, in characters
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// Merge two spans into one that covers both
    pub fn merge(&self, other: &Span) -> Span {
        let first = if other.start < self.start { other } else { self };
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: first.line,
            column: first.column,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Maps byte offsets to 1-based line/column positions.
#[derive(Debug, Clone)]
pub struct LineIndex<'src> {
    source: &'src str,
    line_starts: Vec<usize>,
}

impl<'src> LineIndex<'src> {
    pub fn new(source: &'src str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    /// 1-based (line, column) for a byte offset.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.source.len());
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let start = self.line_starts[line.saturating_sub(1)];
        let column = self
            .source
            .get(start..offset)
            .map_or(0, |prefix| prefix.chars().count());
        (line.max(1), column + 1)
    }

    pub fn span(&self, range: Range<usize>) -> Span {
        let (line, column) = self.position(range.start);
        Span::new(range.start, range.end, line, column)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

/// A node with attached span information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

// =============================================================================
// Source Unit
// =============================================================================

/// One parsed workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub name: String,
    pub version: Option<Spanned<String>>,
    pub items: Vec<Item>,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, version: Option<Spanned<String>>, items: Vec<Item>) -> Self {
        Self {
            name: name.into(),
            version,
            items,
        }
    }
}

/// Top-level items in a source unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Item {
    /// `import "path.wv"`
    Import(ImportDecl),

    /// `model NAME = "provider/model"`
    Model(ModelDef),

    /// `schema NAME:` with typed fields
    Schema(SchemaDef),

    /// `tool NAME = builtin|mcp "target"`
    Tool(ToolDef),

    /// `retry NAME = N times, KIND backoff`
    Retry(RetryPolicyDef),

    /// `timeout NAME = N seconds|minutes`
    Timeout(TimeoutPolicyDef),

    /// `guardrail NAME = regex "pattern"`
    Guardrail(GuardrailDef),

    /// `prompt NAME [expecting S] [using model M]: "body"`
    Prompt(PromptDef),

    /// `agent [NAME]:` with properties
    Agent(AgentDef),

    /// `flow NAME [$params]:` with a statement block
    Flow(FlowDef),

    /// `on EVENT do ... end`
    Handler(GuardrailHandlerDef),
}

impl Item {
    pub fn span(&self) -> Span {
        match self {
            Item::Import(i) => i.span,
            Item::Model(m) => m.span,
            Item::Schema(s) => s.span,
            Item::Tool(t) => t.span,
            Item::Retry(r) => r.span,
            Item::Timeout(t) => t.span,
            Item::Guardrail(g) => g.span,
            Item::Prompt(p) => p.span,
            Item::Agent(a) => a.span,
            Item::Flow(f) => f.span,
            Item::Handler(h) => h.span,
        }
    }
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub path: Spanned<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: Spanned<String>,
    pub model: Spanned<String>,
    pub properties: Vec<ModelProperty>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProperty {
    pub key: Spanned<String>,
    pub value: Spanned<Literal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: Spanned<String>,
    pub fields: Vec<SchemaFieldDef>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFieldDef {
    pub name: Spanned<String>,
    pub ty: TypeTag,
    pub span: Span,
}

/// Field type as written; validated by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypeTag {
    Named { name: String, span: Span },
    List { element: Box<TypeTag>, span: Span },
    Optional { inner: Box<TypeTag>, span: Span },
}

impl TypeTag {
    pub fn span(&self) -> Span {
        match self {
            TypeTag::Named { span, .. } | TypeTag::List { span, .. } | TypeTag::Optional { span, .. } => {
                *span
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKindTag {
    Builtin,
    Mcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: Spanned<String>,
    pub kind: ToolKindTag,
    pub target: Spanned<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffTag {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyDef {
    pub name: Spanned<String>,
    pub attempts: Spanned<u32>,
    pub backoff: BackoffTag,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicyDef {
    pub name: Spanned<String>,
    pub seconds: Spanned<u64>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailDef {
    pub name: Spanned<String>,
    pub pattern: Spanned<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationOperator {
    Equals,
    Similar,
    NotEquals,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationClause {
    pub op: EscalationOperator,
    pub literal: Spanned<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: Spanned<String>,
    pub body: Spanned<String>,
    pub model: Option<Spanned<String>>,
    pub expecting: Option<Spanned<String>>,
    pub escalate: Option<EscalationClause>,
    pub span: Span,
}

/// `agent [NAME]:` definition. An unnamed agent is the default entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    pub name: Option<Spanned<String>>,
    pub instruction: Option<Spanned<String>>,
    pub tools: Vec<Spanned<String>>,
    pub retry: Option<Spanned<String>>,
    pub timeout: Option<Spanned<String>>,
    pub description: Option<Spanned<String>>,
    pub delegate: Option<Vec<Spanned<String>>>,
    pub uses: Option<Vec<Spanned<String>>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
    pub name: Spanned<String>,
    pub params: Vec<Spanned<String>>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    Start,
    Input,
    Output,
    ToolCall,
    ToolResult,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Start => "start",
            HandlerKind::Input => "input",
            HandlerKind::Output => "output",
            HandlerKind::ToolCall => "tool-call",
            HandlerKind::ToolResult => "tool-result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailHandlerDef {
    pub event: Spanned<HandlerKind>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

// =============================================================================
// Statements
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Stmt {
    /// `$x = expr`
    Assignment {
        target: Spanned<String>,
        value: Expr,
        span: Span,
    },
    /// `$x.a.b = expr`
    PropertyAssignment {
        target: Spanned<String>,
        path: Vec<Spanned<String>>,
        value: Expr,
        span: Span,
    },
    Run(RunStatement),
    Parallel(ParallelBlock),
    Loop(LoopBlock),
    For {
        var: Spanned<String>,
        iterable: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    Match(MatchBlock),
    Failure(FailureBlock),
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Continue {
        span: Span,
    },
    Abort {
        message: Option<Expr>,
        span: Span,
    },
    Push {
        value: Expr,
        target: Spanned<String>,
        span: Span,
    },
    Log {
        message: Expr,
        span: Span,
    },
    Guard(GuardAction),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assignment { span, .. }
            | Stmt::PropertyAssignment { span, .. }
            | Stmt::For { span, .. }
            | Stmt::If { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Continue { span }
            | Stmt::Abort { span, .. }
            | Stmt::Push { span, .. }
            | Stmt::Log { span, .. } => *span,
            Stmt::Run(r) => r.span,
            Stmt::Parallel(p) => p.span,
            Stmt::Loop(l) => l.span,
            Stmt::Match(m) => m.span,
            Stmt::Failure(f) => f.span,
            Stmt::Guard(g) => g.span,
        }
    }
}

/// What a `run`/`call` statement invokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Invocation {
    Agent {
        name: Spanned<String>,
        args: Vec<Expr>,
    },
    Llm {
        prompt: Spanned<String>,
        args: Vec<Expr>,
        model: Option<Spanned<String>>,
    },
    Flow {
        name: Spanned<String>,
        args: Vec<Expr>,
    },
}

impl Invocation {
    pub fn args(&self) -> &[Expr] {
        match self {
            Invocation::Agent { args, .. }
            | Invocation::Llm { args, .. }
            | Invocation::Flow { args, .. } => args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum EscalationHandler {
    Return { value: Expr },
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatement {
    pub target: Option<Spanned<String>>,
    pub invocation: Invocation,
    pub on_escalate: Option<EscalationHandler>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBlock {
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopBlock {
    pub max: Option<Spanned<u32>>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchBlock {
    pub subject: Expr,
    pub arms: Vec<MatchArm>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    /// `None` for the `else` arm
    pub pattern: Option<Spanned<Literal>>,
    pub body: Box<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureBlock {
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardActionKind {
    Mask,
    Block,
    Warn,
    Retry,
}

impl GuardActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardActionKind::Mask => "mask",
            GuardActionKind::Block => "block",
            GuardActionKind::Warn => "warn",
            GuardActionKind::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardAction {
    pub kind: GuardActionKind,
    pub guardrail: Spanned<String>,
    /// Message for `retry with "..."`
    pub message: Option<Spanned<String>>,
    pub span: Span,
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    Literal {
        value: Literal,
        span: Span,
    },
    Variable {
        name: String,
        span: Span,
    },
    /// `$name.a.b`
    Property {
        base: Spanned<String>,
        path: Vec<Spanned<String>>,
        span: Span,
    },
    List {
        items: Vec<Expr>,
        span: Span,
    },
    Map {
        entries: Vec<(Spanned<String>, Expr)>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Not {
        operand: Box<Expr>,
        span: Span,
    },
    Filter(FilterExpr),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Variable { span, .. }
            | Expr::Property { span, .. }
            | Expr::List { span, .. }
            | Expr::Map { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Not { span, .. } => *span,
            Expr::Filter(f) => f.span,
        }
    }
}

/// `.a.b` inside a filter condition, relative to the current element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitPropertyAccess {
    pub path: Vec<Spanned<String>>,
    pub span: Span,
}

/// `filter LIST where .prop OP VALUE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    pub list: Box<Expr>,
    pub property: ImplicitPropertyAccess,
    pub op: BinaryOp,
    pub value: Box<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Literal {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Similar,
    Contains,
    And,
    Or,
    Add,
    Sub,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        !matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Add | BinaryOp::Sub)
    }
}

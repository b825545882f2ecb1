//! Executable IR: the listing emitted by the code generator.
//!
//! A listing is a flat sequence of lines, each holding one typed [`Op`] (or a
//! source comment) at an indentation depth. Header ops own the deeper lines
//! that follow them; [`crate::unit::CompiledWorkflow::assemble`] folds the
//! depth back into nested blocks. The `Display` impls define the textual
//! form printed by `dump-generated-code`.

use crate::defs::{
    AgentSpec, EscalationCondition, GuardrailSpec, ModelSpec, PromptSpec, RetryPolicy,
    SchemaSpec, TimeoutPolicy, ToolSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Spaces per depth level in the rendered listing.
pub const LISTING_INDENT: usize = 2;

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// `~` normalized equality
    Similar,
    Contains,
    And,
    Or,
    Add,
    Sub,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::Similar => "~",
            BinOp::Contains => "contains",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Add => "+",
            BinOp::Sub => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IrExpr {
    Literal { value: Value },
    Var { name: String },
    /// `$name.a.b`
    Path { name: String, path: Vec<String> },
    List { items: Vec<IrExpr> },
    Map { entries: Vec<(String, IrExpr)> },
    Binary { op: BinOp, left: Box<IrExpr>, right: Box<IrExpr> },
    Not { operand: Box<IrExpr> },
    /// Linear scan keeping elements whose `path` compares true against `value`
    Filter {
        list: Box<IrExpr>,
        path: Vec<String>,
        op: BinOp,
        value: Box<IrExpr>,
    },
}

impl IrExpr {
    pub fn literal(value: impl Into<Value>) -> Self {
        IrExpr::Literal { value: value.into() }
    }

    pub fn var(name: impl Into<String>) -> Self {
        IrExpr::Var { name: name.into() }
    }
}

impl fmt::Display for IrExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrExpr::Literal { value } => write!(f, "{}", value),
            IrExpr::Var { name } => write!(f, "${}", name),
            IrExpr::Path { name, path } => write!(f, "${}.{}", name, path.join(".")),
            IrExpr::List { items } => {
                write!(f, "[")?;
                write_joined(f, items, ", ")?;
                write!(f, "]")
            }
            IrExpr::Map { entries } => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            IrExpr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            IrExpr::Not { operand } => write!(f, "(not {})", operand),
            IrExpr::Filter { list, path, op, value } => write!(
                f,
                "filter({}, .{} {} {})",
                list,
                path.join("."),
                op.symbol(),
                value
            ),
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

// =============================================================================
// Ops
// =============================================================================

/// Event a handler block is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerEvent {
    Start,
    Input,
    Output,
    ToolCall,
    ToolResult,
}

impl HandlerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerEvent::Start => "start",
            HandlerEvent::Input => "input",
            HandlerEvent::Output => "output",
            HandlerEvent::ToolCall => "tool-call",
            HandlerEvent::ToolResult => "tool-result",
        }
    }

    /// Guardrail handlers are every event except `start`.
    pub fn is_guardrail(&self) -> bool {
        !matches!(self, HandlerEvent::Start)
    }
}

impl fmt::Display for HandlerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    Mask,
    Block,
    Warn,
    Retry,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardKind::Mask => write!(f, "mask"),
            GuardKind::Block => write!(f, "block"),
            GuardKind::Warn => write!(f, "warn"),
            GuardKind::Retry => write!(f, "retry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EscalateAction {
    Return { value: IrExpr },
    Continue,
    Abort,
}

impl fmt::Display for EscalateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalateAction::Return { value } => write!(f, "return {}", value),
            EscalateAction::Continue => write!(f, "continue"),
            EscalateAction::Abort => write!(f, "abort"),
        }
    }
}

/// One `(agent, args, result variable)` entry of a parallel dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelCall {
    pub agent: String,
    pub args: Vec<IrExpr>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // Registrations
    Model(ModelSpec),
    Schema(SchemaSpec),
    Tool(ToolSpec),
    Retry(RetryPolicy),
    Timeout(TimeoutPolicy),
    Guardrail(GuardrailSpec),
    Prompt(PromptSpec),
    Agent(AgentSpec),

    // Block headers
    Flow { name: String, params: Vec<String> },
    Handler { event: HandlerEvent },
    Loop { max: Option<u32> },
    ForEach { var: String, iterable: IrExpr },
    If { condition: IrExpr },
    Else,
    Match { subject: IrExpr },
    /// `None` pattern is the `else` arm
    Arm { pattern: Option<Value> },
    OnFailure,

    // Statements
    Assign { target: String, value: IrExpr },
    SetPath { target: String, path: Vec<String>, value: IrExpr },
    RunAgent {
        target: Option<String>,
        agent: String,
        args: Vec<IrExpr>,
        on_escalate: Option<EscalateAction>,
    },
    CallLlm {
        target: Option<String>,
        prompt: String,
        args: Vec<IrExpr>,
        model: Option<String>,
        on_escalate: Option<EscalateAction>,
    },
    RunFlow { target: Option<String>, flow: String, args: Vec<IrExpr> },
    Parallel { calls: Vec<ParallelCall> },
    Return { value: IrExpr },
    Continue,
    Abort { message: Option<IrExpr> },
    Push { value: IrExpr, target: String },
    Log { message: IrExpr },
    Guard { kind: GuardKind, guardrail: String, message: Option<String> },
}

impl Op {
    /// Header ops own a nested block.
    pub fn is_header(&self) -> bool {
        matches!(
            self,
            Op::Flow { .. }
                | Op::Handler { .. }
                | Op::Loop { .. }
                | Op::ForEach { .. }
                | Op::If { .. }
                | Op::Else
                | Op::Match { .. }
                | Op::Arm { .. }
                | Op::OnFailure
        )
    }

    /// Registration ops are only legal at the top level.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Op::Model(_)
                | Op::Schema(_)
                | Op::Tool(_)
                | Op::Retry(_)
                | Op::Timeout(_)
                | Op::Guardrail(_)
                | Op::Prompt(_)
                | Op::Agent(_)
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Model(_) => "model",
            Op::Schema(_) => "schema",
            Op::Tool(_) => "tool",
            Op::Retry(_) => "retry",
            Op::Timeout(_) => "timeout",
            Op::Guardrail(_) => "guardrail",
            Op::Prompt(_) => "prompt",
            Op::Agent(_) => "agent",
            Op::Flow { .. } => "flow",
            Op::Handler { .. } => "handler",
            Op::Loop { .. } => "loop",
            Op::ForEach { .. } => "for",
            Op::If { .. } => "if",
            Op::Else => "else",
            Op::Match { .. } => "match",
            Op::Arm { .. } => "arm",
            Op::OnFailure => "on_failure",
            Op::Assign { .. } => "set",
            Op::SetPath { .. } => "set_path",
            Op::RunAgent { .. } => "run_agent",
            Op::CallLlm { .. } => "call_llm",
            Op::RunFlow { .. } => "run_flow",
            Op::Parallel { .. } => "parallel",
            Op::Return { .. } => "return",
            Op::Continue => "continue",
            Op::Abort { .. } => "abort",
            Op::Push { .. } => "push",
            Op::Log { .. } => "log",
            Op::Guard { .. } => "guard",
        }
    }
}

fn target_prefix(target: &Option<String>) -> String {
    match target {
        Some(name) => format!("${} = ", name),
        None => String::new(),
    }
}

fn quoted(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Model(m) => {
                write!(f, "model {} {}", m.name, quoted(&m.model))?;
                for (key, value) in &m.params {
                    write!(f, " {}={}", key, value)?;
                }
                Ok(())
            }
            Op::Schema(s) => {
                write!(f, "schema {} {{", s.name)?;
                write_joined(f, &s.fields, ", ")?;
                write!(f, "}}")
            }
            Op::Tool(t) => write!(f, "tool {} {} {}", t.name, t.kind, quoted(&t.target)),
            Op::Retry(r) => write!(f, "retry {} attempts={} backoff={}", r.name, r.attempts, r.backoff),
            Op::Timeout(t) => write!(f, "timeout {} seconds={}", t.name, t.seconds),
            Op::Guardrail(g) => write!(f, "guardrail {} regex {}", g.name, quoted(&g.pattern)),
            Op::Prompt(p) => {
                write!(f, "prompt {}", p.name)?;
                if let Some(model) = &p.model {
                    write!(f, " model={}", model)?;
                }
                if let Some(schema) = &p.expecting {
                    write!(f, " expecting={}", schema)?;
                }
                if let Some(EscalationCondition { op, literal }) = &p.escalate {
                    write!(f, " escalate=({} {})", op.symbol(), quoted(literal))?;
                }
                write!(f, " template={}", quoted(&p.template))
            }
            Op::Agent(a) => {
                write!(f, "agent {} instruction={}", a.name, a.instruction)?;
                if !a.tools.is_empty() {
                    write!(f, " tools=[{}]", a.tools.join(", "))?;
                }
                if !a.delegate.is_empty() {
                    write!(f, " delegate=[{}]", a.delegate.join(", "))?;
                }
                if !a.uses.is_empty() {
                    write!(f, " use=[{}]", a.uses.join(", "))?;
                }
                if let Some(retry) = &a.retry {
                    write!(f, " retry={}", retry)?;
                }
                if let Some(timeout) = &a.timeout {
                    write!(f, " timeout={}", timeout)?;
                }
                if let Some(description) = &a.description {
                    write!(f, " description={}", quoted(description))?;
                }
                Ok(())
            }
            Op::Flow { name, params } => {
                write!(f, "flow {}(", name)?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "${}", param)?;
                }
                write!(f, "):")
            }
            Op::Handler { event } => write!(f, "handler {}:", event),
            Op::Loop { max: Some(max) } => write!(f, "loop max={}:", max),
            Op::Loop { max: None } => write!(f, "loop:"),
            Op::ForEach { var, iterable } => write!(f, "for ${} in {}:", var, iterable),
            Op::If { condition } => write!(f, "if {}:", condition),
            Op::Else => write!(f, "else:"),
            Op::Match { subject } => write!(f, "match {}:", subject),
            Op::Arm { pattern: Some(pattern) } => write!(f, "when {}:", pattern),
            Op::Arm { pattern: None } => write!(f, "otherwise:"),
            Op::OnFailure => write!(f, "on_failure:"),
            Op::Assign { target, value } => write!(f, "${} = {}", target, value),
            Op::SetPath { target, path, value } => {
                write!(f, "set_path ${} [{}] = {}", target, path.join(", "), value)
            }
            Op::RunAgent { target, agent, args, on_escalate } => {
                write!(f, "{}run_agent({}", target_prefix(target), quoted(agent))?;
                for arg in args {
                    write!(f, ", {}", arg)?;
                }
                write!(f, ")")?;
                if let Some(action) = on_escalate {
                    write!(f, " on_escalate {}", action)?;
                }
                Ok(())
            }
            Op::CallLlm { target, prompt, args, model, on_escalate } => {
                write!(f, "{}call_llm({}", target_prefix(target), quoted(prompt))?;
                for arg in args {
                    write!(f, ", {}", arg)?;
                }
                if let Some(model) = model {
                    write!(f, ", model={}", quoted(model))?;
                }
                write!(f, ")")?;
                if let Some(action) = on_escalate {
                    write!(f, " on_escalate {}", action)?;
                }
                Ok(())
            }
            Op::RunFlow { target, flow, args } => {
                write!(f, "{}run_flow({}", target_prefix(target), quoted(flow))?;
                for arg in args {
                    write!(f, ", {}", arg)?;
                }
                write!(f, ")")
            }
            Op::Parallel { calls } => {
                write!(f, "parallel [")?;
                for (i, call) in calls.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({}, [", quoted(&call.agent))?;
                    write_joined(f, &call.args, ", ")?;
                    match &call.target {
                        Some(target) => write!(f, "], ${})", target)?,
                        None => write!(f, "], _)")?,
                    }
                }
                write!(f, "]")
            }
            Op::Return { value } => write!(f, "return {}", value),
            Op::Continue => write!(f, "continue"),
            Op::Abort { message: Some(message) } => write!(f, "abort {}", message),
            Op::Abort { message: None } => write!(f, "abort"),
            Op::Push { value, target } => write!(f, "push {} -> ${}", value, target),
            Op::Log { message } => write!(f, "log {}", message),
            Op::Guard { kind, guardrail, message } => {
                write!(f, "guard {} {}", kind, guardrail)?;
                if let Some(message) = message {
                    write!(f, " {}", quoted(message))?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Listing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineContent {
    Op { op: Op },
    Comment { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingLine {
    pub depth: usize,
    pub content: LineContent,
}

/// Generated source: numbered lines of ops and comments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub lines: Vec<ListingLine>,
}

impl Listing {
    /// Render the listing. Line `n` of the full rendering is `lines[n - 1]`;
    /// stripping comments renumbers lines and is for display only.
    pub fn render(&self, include_comments: bool) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let text = match &line.content {
                LineContent::Op { op } => op.to_string(),
                LineContent::Comment { text } if include_comments => format!("# {}", text),
                LineContent::Comment { .. } => continue,
            };
            out.push_str(&" ".repeat(line.depth * LISTING_INDENT));
            out.push_str(&text);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

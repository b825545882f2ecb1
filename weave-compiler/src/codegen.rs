//! Code Generation for weave
//!
//! Turns an analyzed set of source units into a [`Listing`] plus a
//! [`SourceMap`]. Key responsibilities:
//! - Emit one registration op per top-level definition, in declaration order
//! - Emit flow and handler bodies as nested blocks
//! - Record a (generated line, source line, column) mapping for every op
//!
//! Agent `delegate`/`use` lists are emitted as plain names. They are resolved
//! to live agents by the runtime, so agents may reference each other in any
//! order.

use crate::ast::*;
use crate::semantic::{field_type, Analysis, Definition};
use serde_json::Value;
use weave_core::{
    AgentSpec, Backoff, BinOp, EscalateAction, EscalationCondition, EscalationOp, GuardKind,
    GuardrailSpec, HandlerEvent, IrExpr, LineContent, Listing, ListingLine, ModelSpec, Op,
    ParallelCall, PromptSpec, RetryPolicy, SchemaField, SchemaSpec, SourceMap, TimeoutPolicy,
    ToolKind, ToolSpec,
};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Emit a `# file:line` comment before every top-level definition
    pub source_comments: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            source_comments: true,
        }
    }
}

/// Output of code generation.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub listing: Listing,
    pub source_map: SourceMap,
}

// =============================================================================
// Emitter
// =============================================================================

/// Appends listing lines at the current depth and records where each came from.
#[derive(Debug)]
pub struct Emitter {
    listing: Listing,
    source_map: SourceMap,
    depth: usize,
}

impl Emitter {
    pub fn new(generated_file: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            listing: Listing::default(),
            source_map: SourceMap::new(generated_file, source_file),
            depth: 0,
        }
    }

    /// Line number the next emitted line will get.
    pub fn next_line(&self) -> usize {
        self.listing.lines.len() + 1
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.listing.lines.push(ListingLine {
            depth: self.depth,
            content: LineContent::Comment { text: text.into() },
        });
    }

    /// Emit an op produced from `span` of `file`; returns its generated line.
    pub fn emit(&mut self, file: &str, span: Span, op: Op) -> usize {
        let line = self.next_line();
        self.listing.lines.push(ListingLine {
            depth: self.depth,
            content: LineContent::Op { op },
        });
        self.source_map.push_from(file, line, span.line, span.column);
        line
    }

    pub fn finish(self) -> GeneratedCode {
        GeneratedCode {
            listing: self.listing,
            source_map: self.source_map,
        }
    }
}

// =============================================================================
// Code Generator
// =============================================================================

/// Generate code for `units` (root first, then imports) using the analysis of
/// those same units. The analysis must be free of errors.
pub fn generate(
    analysis: &Analysis<'_>,
    units: &[&SourceUnit],
    generated_file: &str,
    config: &CodegenConfig,
) -> GeneratedCode {
    let root = units.first().map(|unit| unit.name.as_str()).unwrap_or_default();
    let mut codegen = Codegen {
        emitter: Emitter::new(generated_file, root),
        config,
        file: root,
    };

    for symbol in analysis.symbols.iter() {
        codegen.file = &symbol.file;
        codegen.visit_definition(&symbol.name, symbol.def);
    }
    for unit in units {
        codegen.file = &unit.name;
        for item in &unit.items {
            if let Item::Handler(handler) = item {
                codegen.visit_handler(handler);
            }
        }
    }

    let generated = codegen.emitter.finish();
    tracing::debug!(
        lines = generated.listing.len(),
        mappings = generated.source_map.len(),
        "generated listing"
    );
    generated
}

struct Codegen<'a> {
    emitter: Emitter,
    config: &'a CodegenConfig,
    /// Source file of the definition being generated
    file: &'a str,
}

impl<'a> Codegen<'a> {
    fn source_comment(&mut self, span: Span) {
        if self.config.source_comments {
            self.emitter.comment(format!("{}:{}", self.file, span.line));
        }
    }

    fn emit(&mut self, span: Span, op: Op) -> usize {
        self.emitter.emit(self.file, span, op)
    }

    fn visit_definition(&mut self, name: &str, def: Definition<'_>) {
        let span = match def {
            Definition::Model(d) => d.span,
            Definition::Schema(d) => d.span,
            Definition::Tool(d) => d.span,
            Definition::Retry(d) => d.span,
            Definition::Timeout(d) => d.span,
            Definition::Guardrail(d) => d.span,
            Definition::Prompt(d) => d.span,
            Definition::Agent(d) => d.span,
            Definition::Flow(d) => d.span,
        };
        self.source_comment(span);

        let op = match def {
            Definition::Model(model) => Op::Model(model_spec(model)),
            Definition::Schema(schema) => Op::Schema(schema_spec(schema)),
            Definition::Tool(tool) => Op::Tool(ToolSpec {
                name: tool.name.node.clone(),
                kind: match tool.kind {
                    ToolKindTag::Builtin => ToolKind::Builtin,
                    ToolKindTag::Mcp => ToolKind::Mcp,
                },
                target: tool.target.node.clone(),
            }),
            Definition::Retry(retry) => Op::Retry(RetryPolicy {
                name: retry.name.node.clone(),
                attempts: retry.attempts.node,
                backoff: match retry.backoff {
                    BackoffTag::Fixed => Backoff::Fixed,
                    BackoffTag::Linear => Backoff::Linear,
                    BackoffTag::Exponential => Backoff::Exponential,
                },
            }),
            Definition::Timeout(timeout) => Op::Timeout(TimeoutPolicy {
                name: timeout.name.node.clone(),
                seconds: timeout.seconds.node,
            }),
            Definition::Guardrail(guardrail) => Op::Guardrail(GuardrailSpec {
                name: guardrail.name.node.clone(),
                pattern: guardrail.pattern.node.clone(),
            }),
            Definition::Prompt(prompt) => Op::Prompt(prompt_spec(prompt)),
            Definition::Agent(agent) => Op::Agent(agent_spec(name, agent)),
            Definition::Flow(flow) => {
                return self.visit_flow(flow);
            }
        };
        self.emit(span, op);
    }

    fn visit_flow(&mut self, flow: &FlowDef) {
        let params = flow.params.iter().map(|p| p.node.clone()).collect();
        self.emit(
            flow.span,
            Op::Flow {
                name: flow.name.node.clone(),
                params,
            },
        );
        self.block(&flow.body);
    }

    fn visit_handler(&mut self, handler: &GuardrailHandlerDef) {
        self.source_comment(handler.span);
        let event = match handler.event.node {
            HandlerKind::Start => HandlerEvent::Start,
            HandlerKind::Input => HandlerEvent::Input,
            HandlerKind::Output => HandlerEvent::Output,
            HandlerKind::ToolCall => HandlerEvent::ToolCall,
            HandlerKind::ToolResult => HandlerEvent::ToolResult,
        };
        self.emit(handler.span, Op::Handler { event });
        self.block(&handler.body);
    }

    fn block(&mut self, body: &[Stmt]) {
        self.emitter.depth += 1;
        for stmt in body {
            self.visit_stmt(stmt);
        }
        self.emitter.depth -= 1;
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        let span = stmt.span();
        match stmt {
            Stmt::Assignment { target, value, .. } => {
                self.emit(
                    span,
                    Op::Assign {
                        target: target.node.clone(),
                        value: expr(value),
                    },
                );
            }
            Stmt::PropertyAssignment {
                target, path, value, ..
            } => {
                self.emit(
                    span,
                    Op::SetPath {
                        target: target.node.clone(),
                        path: names(path),
                        value: expr(value),
                    },
                );
            }
            Stmt::Run(run) => {
                let op = run_op(run);
                self.emit(span, op);
            }
            Stmt::Parallel(block) => {
                let calls = block
                    .body
                    .iter()
                    .filter_map(|inner| match inner {
                        Stmt::Run(RunStatement {
                            target,
                            invocation: Invocation::Agent { name, args },
                            ..
                        }) => Some(ParallelCall {
                            agent: name.node.clone(),
                            args: args.iter().map(expr).collect(),
                            target: target.as_ref().map(|t| t.node.clone()),
                        }),
                        _ => None,
                    })
                    .collect();
                self.emit(span, Op::Parallel { calls });
            }
            Stmt::Loop(block) => {
                self.emit(
                    span,
                    Op::Loop {
                        max: block.max.as_ref().map(|m| m.node),
                    },
                );
                self.block(&block.body);
            }
            Stmt::For {
                var,
                iterable,
                body,
                ..
            } => {
                self.emit(
                    span,
                    Op::ForEach {
                        var: var.node.clone(),
                        iterable: expr(iterable),
                    },
                );
                self.block(body);
            }
            Stmt::If {
                condition,
                then_body,
                else_body,
                ..
            } => {
                self.emit(
                    span,
                    Op::If {
                        condition: expr(condition),
                    },
                );
                self.block(then_body);
                if let Some(first) = else_body.first() {
                    self.emit(first.span(), Op::Else);
                    self.block(else_body);
                }
            }
            Stmt::Match(block) => {
                self.emit(
                    span,
                    Op::Match {
                        subject: expr(&block.subject),
                    },
                );
                self.emitter.depth += 1;
                for arm in &block.arms {
                    let pattern = arm.pattern.as_ref().map(|p| literal(&p.node));
                    self.emit(arm.span, Op::Arm { pattern });
                    self.block(std::slice::from_ref(arm.body.as_ref()));
                }
                self.emitter.depth -= 1;
            }
            Stmt::Failure(block) => {
                self.emit(span, Op::OnFailure);
                self.block(&block.body);
            }
            Stmt::Return { value, .. } => {
                let value = value
                    .as_ref()
                    .map_or_else(|| IrExpr::literal(Value::Null), expr);
                self.emit(span, Op::Return { value });
            }
            Stmt::Continue { .. } => {
                self.emit(span, Op::Continue);
            }
            Stmt::Abort { message, .. } => {
                self.emit(
                    span,
                    Op::Abort {
                        message: message.as_ref().map(expr),
                    },
                );
            }
            Stmt::Push { value, target, .. } => {
                self.emit(
                    span,
                    Op::Push {
                        value: expr(value),
                        target: target.node.clone(),
                    },
                );
            }
            Stmt::Log { message, .. } => {
                self.emit(span, Op::Log { message: expr(message) });
            }
            Stmt::Guard(action) => {
                let kind = match action.kind {
                    GuardActionKind::Mask => GuardKind::Mask,
                    GuardActionKind::Block => GuardKind::Block,
                    GuardActionKind::Warn => GuardKind::Warn,
                    GuardActionKind::Retry => GuardKind::Retry,
                };
                self.emit(
                    span,
                    Op::Guard {
                        kind,
                        guardrail: action.guardrail.node.clone(),
                        message: action.message.as_ref().map(|m| m.node.clone()),
                    },
                );
            }
        }
    }
}

// =============================================================================
// Definitions
// =============================================================================

fn model_spec(model: &ModelDef) -> ModelSpec {
    model
        .properties
        .iter()
        .fold(ModelSpec::new(&model.name.node, &model.model.node), |spec, prop| {
            spec.with_param(&prop.key.node, literal(&prop.value.node))
        })
}

fn schema_spec(schema: &SchemaDef) -> SchemaSpec {
    let fields = schema
        .fields
        .iter()
        .filter_map(|field| {
            let (ty, optional) = field_type(&field.ty).ok()?;
            Some(SchemaField {
                name: field.name.node.clone(),
                ty,
                optional,
            })
        })
        .collect();
    SchemaSpec {
        name: schema.name.node.clone(),
        fields,
    }
}

fn prompt_spec(prompt: &PromptDef) -> PromptSpec {
    PromptSpec {
        name: prompt.name.node.clone(),
        template: prompt.body.node.clone(),
        model: prompt.model.as_ref().map(|m| m.node.clone()),
        expecting: prompt.expecting.as_ref().map(|s| s.node.clone()),
        escalate: prompt.escalate.as_ref().map(|clause| EscalationCondition {
            op: match clause.op {
                EscalationOperator::Equals => EscalationOp::Equals,
                EscalationOperator::Similar => EscalationOp::Similar,
                EscalationOperator::NotEquals => EscalationOp::NotEquals,
                EscalationOperator::Contains => EscalationOp::Contains,
            },
            literal: clause.literal.node.clone(),
        }),
    }
}

fn agent_spec(name: &str, agent: &AgentDef) -> AgentSpec {
    let instruction = agent
        .instruction
        .as_ref()
        .map(|i| i.node.clone())
        .unwrap_or_default();
    AgentSpec {
        tools: names(&agent.tools),
        description: agent.description.as_ref().map(|d| d.node.clone()),
        retry: agent.retry.as_ref().map(|r| r.node.clone()),
        timeout: agent.timeout.as_ref().map(|t| t.node.clone()),
        delegate: agent.delegate.as_deref().map(names).unwrap_or_default(),
        uses: agent.uses.as_deref().map(names).unwrap_or_default(),
        ..AgentSpec::new(name, instruction)
    }
}

// =============================================================================
// Statements and expressions
// =============================================================================

fn names(list: &[Spanned<String>]) -> Vec<String> {
    list.iter().map(|n| n.node.clone()).collect()
}

fn run_op(run: &RunStatement) -> Op {
    let target = run.target.as_ref().map(|t| t.node.clone());
    let on_escalate = run.on_escalate.as_ref().map(|handler| match handler {
        EscalationHandler::Return { value } => EscalateAction::Return { value: expr(value) },
        EscalationHandler::Continue => EscalateAction::Continue,
        EscalationHandler::Abort => EscalateAction::Abort,
    });
    match &run.invocation {
        Invocation::Agent { name, args } => Op::RunAgent {
            target,
            agent: name.node.clone(),
            args: args.iter().map(expr).collect(),
            on_escalate,
        },
        Invocation::Llm {
            prompt,
            args,
            model,
        } => Op::CallLlm {
            target,
            prompt: prompt.node.clone(),
            args: args.iter().map(expr).collect(),
            model: model.as_ref().map(|m| m.node.clone()),
            on_escalate,
        },
        Invocation::Flow { name, args } => Op::RunFlow {
            target,
            flow: name.node.clone(),
            args: args.iter().map(expr).collect(),
        },
    }
}

pub fn literal(value: &Literal) -> Value {
    match value {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Int(n) => Value::from(*n),
        Literal::Float(f) => Value::from(*f),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn bin_op(op: BinaryOp) -> BinOp {
    match op {
        BinaryOp::Eq => BinOp::Eq,
        BinaryOp::NotEq => BinOp::NotEq,
        BinaryOp::Lt => BinOp::Lt,
        BinaryOp::LtEq => BinOp::LtEq,
        BinaryOp::Gt => BinOp::Gt,
        BinaryOp::GtEq => BinOp::GtEq,
        BinaryOp::Similar => BinOp::Similar,
        BinaryOp::Contains => BinOp::Contains,
        BinaryOp::And => BinOp::And,
        BinaryOp::Or => BinOp::Or,
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
    }
}

pub fn expr(e: &Expr) -> IrExpr {
    match e {
        Expr::Literal { value, .. } => IrExpr::Literal {
            value: literal(value),
        },
        Expr::Variable { name, .. } => IrExpr::var(name),
        Expr::Property { base, path, .. } => IrExpr::Path {
            name: base.node.clone(),
            path: names(path),
        },
        Expr::List { items, .. } => IrExpr::List {
            items: items.iter().map(expr).collect(),
        },
        Expr::Map { entries, .. } => IrExpr::Map {
            entries: entries
                .iter()
                .map(|(key, value)| (key.node.clone(), expr(value)))
                .collect(),
        },
        Expr::Binary {
            op, left, right, ..
        } => IrExpr::Binary {
            op: bin_op(*op),
            left: Box::new(expr(left)),
            right: Box::new(expr(right)),
        },
        Expr::Not { operand, .. } => IrExpr::Not {
            operand: Box::new(expr(operand)),
        },
        Expr::Filter(filter) => IrExpr::Filter {
            list: Box::new(expr(&filter.list)),
            path: names(&filter.property.path),
            op: bin_op(filter.op),
            value: Box::new(expr(&filter.value)),
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

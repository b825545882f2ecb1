//! Parse tree to AST transformation.
//!
//! One conversion per grammar production. Conversions read payload tokens
//! through [`Node::leaves`], which drops punctuation and layout markers, and
//! keywords through [`Node::keywords`], so separators never reach a name list.

use crate::ast::*;
use crate::grammar::Nt;
use crate::lexer::{Token, TokenKind};
use crate::parser::{Node, ParseTree};
use thiserror::Error;
use weave_core::{Diagnostic, DiagnosticCode};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("invalid {what} literal '{text}'")]
    InvalidLiteral {
        what: &'static str,
        text: String,
        span: Span,
    },

    /// The tree does not have the shape its production promises.
    #[error("malformed {kind:?} node")]
    Malformed { kind: Nt, span: Span },
}

impl TransformError {
    pub fn span(&self) -> Span {
        match self {
            TransformError::InvalidLiteral { span, .. } | TransformError::Malformed { span, .. } => *span,
        }
    }

    pub fn to_diagnostic(&self, file: &str) -> Diagnostic {
        let span = self.span();
        Diagnostic::new(DiagnosticCode::E0007, file, span.line, span.column, self.to_string())
            .with_length(span.len())
    }
}

type Result<T> = std::result::Result<T, TransformError>;

/// Convert a parse tree into a [`SourceUnit`] named `name`.
pub fn transform(tree: &ParseTree<'_>, source: &str, name: &str) -> Result<SourceUnit> {
    Transformer::new(source).unit(&tree.root, name)
}

pub struct Transformer<'src> {
    lines: LineIndex<'src>,
}

fn malformed(node: &Node<'_>) -> TransformError {
    TransformError::Malformed {
        kind: node.kind,
        span: node.span,
    }
}

/// Elements of a left-recursive list production, in source order.
fn flatten<'a, 'src>(node: &'a Node<'src>, element: Nt) -> Vec<&'a Node<'src>> {
    let mut out = Vec::new();
    collect(node, element, &mut out);
    out
}

fn collect<'a, 'src>(node: &'a Node<'src>, element: Nt, out: &mut Vec<&'a Node<'src>>) {
    for child in node.nodes() {
        if child.kind == node.kind {
            collect(child, element, out);
        } else if child.kind == element {
            out.push(child);
        }
    }
}

/// Unescape the body of a double-quoted string token.
pub fn unescape(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Body of a triple-quoted string with the common indentation removed.
///
/// A line break right after the opening quotes and a whitespace-only last
/// line are dropped.
pub fn dedent_block(raw: &str) -> String {
    let inner = raw
        .strip_prefix("\"\"\"")
        .and_then(|s| s.strip_suffix("\"\"\""))
        .unwrap_or(raw);
    let inner = inner.strip_prefix("\r\n").or_else(|| inner.strip_prefix('\n')).unwrap_or(inner);

    let mut lines: Vec<&str> = inner.lines().collect();
    if inner.ends_with('\n') {
        lines.push("");
    }
    if lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let margin = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| line.get(margin..).unwrap_or("").trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
}

impl<'src> Transformer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            lines: LineIndex::new(source),
        }
    }

    fn span(&self, token: &Token<'_>) -> Span {
        self.lines.span(token.span.clone())
    }

    fn text(&self, token: &Token<'_>) -> Spanned<String> {
        Spanned::new(token.text.to_string(), self.span(token))
    }

    fn var(&self, token: &Token<'_>) -> Spanned<String> {
        Spanned::new(token.text.trim_start_matches('$').to_string(), self.span(token))
    }

    fn string(&self, token: &Token<'_>) -> Spanned<String> {
        let value = match token.kind {
            TokenKind::TripleString => dedent_block(token.text),
            _ => unescape(token.text),
        };
        Spanned::new(value, self.span(token))
    }

    fn leaf<'a>(&self, node: &'a Node<'src>, kind: TokenKind) -> Result<&'a Token<'src>> {
        node.leaves()
            .find(|token| token.kind == kind)
            .ok_or_else(|| malformed(node))
    }

    fn opt_leaf<'a>(&self, node: &'a Node<'src>, kind: TokenKind) -> Option<&'a Token<'src>> {
        node.leaves().find(|token| token.kind == kind)
    }

    fn ident(&self, node: &Node<'src>) -> Result<Spanned<String>> {
        Ok(self.text(self.leaf(node, TokenKind::Ident)?))
    }

    fn child<'a>(&self, node: &'a Node<'src>, kind: Nt) -> Result<&'a Node<'src>> {
        node.child(kind).ok_or_else(|| malformed(node))
    }

    fn single<'a>(&self, node: &'a Node<'src>) -> Result<&'a Node<'src>> {
        node.single().ok_or_else(|| malformed(node))
    }

    /// Token payloads of a left-recursive list such as `NameList` or `PropPath`.
    fn leaf_list(&self, node: &Node<'src>, kind: TokenKind) -> Vec<Spanned<String>> {
        let mut out = match node.child(node.kind) {
            Some(inner) => self.leaf_list(inner, kind),
            None => Vec::new(),
        };
        out.extend(
            node.leaves()
                .filter(|token| token.kind == kind)
                .map(|token| match kind {
                    TokenKind::Var => self.var(token),
                    _ => self.text(token),
                }),
        );
        out
    }

    fn int<T: std::str::FromStr>(&self, token: &Token<'_>) -> Result<Spanned<T>> {
        token
            .text
            .parse()
            .map(|value| Spanned::new(value, self.span(token)))
            .map_err(|_| TransformError::InvalidLiteral {
                what: "integer",
                text: token.text.to_string(),
                span: self.span(token),
            })
    }

    // =========================================================================
    // Source unit
    // =========================================================================

    pub fn unit(&self, root: &Node<'src>, name: &str) -> Result<SourceUnit> {
        let version = match root.child(Nt::Version) {
            Some(version) => Some(self.ident(version)?),
            None => None,
        };
        let items = match root.child(Nt::Items) {
            Some(items) => flatten(items, Nt::Item)
                .into_iter()
                .map(|item| self.item(item))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(SourceUnit::new(name, version, items))
    }

    fn item(&self, node: &Node<'src>) -> Result<Item> {
        let def = self.single(node)?;
        let span = def.span;
        Ok(match def.kind {
            Nt::Import => Item::Import(ImportDecl {
                path: self.string(self.leaf(def, TokenKind::StringLiteral)?),
                span,
            }),
            Nt::ModelDef => Item::Model(self.model(def)?),
            Nt::SchemaDef => Item::Schema(self.schema(def)?),
            Nt::ToolDef => {
                let kind = match self.child(def, Nt::ToolKind)?.first_keyword() {
                    Some("mcp") => ToolKindTag::Mcp,
                    _ => ToolKindTag::Builtin,
                };
                Item::Tool(ToolDef {
                    name: self.ident(def)?,
                    kind,
                    target: self.string(self.leaf(def, TokenKind::StringLiteral)?),
                    span,
                })
            }
            Nt::RetryDef => {
                let backoff = match def.child(Nt::Backoff).and_then(Node::first_keyword) {
                    Some("linear") => BackoffTag::Linear,
                    Some("exponential") => BackoffTag::Exponential,
                    _ => BackoffTag::Fixed,
                };
                Item::Retry(RetryPolicyDef {
                    name: self.ident(def)?,
                    attempts: self.int(self.leaf(def, TokenKind::IntLiteral)?)?,
                    backoff,
                    span,
                })
            }
            Nt::TimeoutDef => {
                let amount: Spanned<u64> = self.int(self.leaf(def, TokenKind::IntLiteral)?)?;
                let factor = match self.child(def, Nt::TimeUnit)?.first_keyword() {
                    Some("minutes" | "minute") => 60,
                    _ => 1,
                };
                Item::Timeout(TimeoutPolicyDef {
                    name: self.ident(def)?,
                    seconds: Spanned::new(amount.node.saturating_mul(factor), amount.span),
                    span,
                })
            }
            Nt::GuardrailDef => Item::Guardrail(GuardrailDef {
                name: self.ident(def)?,
                pattern: self.string(self.leaf(def, TokenKind::StringLiteral)?),
                span,
            }),
            Nt::PromptDef => Item::Prompt(self.prompt(def)?),
            Nt::AgentDef => Item::Agent(self.agent(def)?),
            Nt::FlowDef => Item::Flow(FlowDef {
                name: self.ident(def)?,
                params: def
                    .child(Nt::Params)
                    .map(|params| self.leaf_list(params, TokenKind::Var))
                    .unwrap_or_default(),
                body: self.block(self.child(def, Nt::Block)?)?,
                span,
            }),
            Nt::HandlerDef => {
                let event_node = self.child(def, Nt::HandlerEvent)?;
                let words: Vec<&str> = event_node.keywords().collect();
                let event = match words.as_slice() {
                    ["start"] => HandlerKind::Start,
                    ["input"] => HandlerKind::Input,
                    ["output"] => HandlerKind::Output,
                    ["tool", "call"] => HandlerKind::ToolCall,
                    ["tool", "result"] => HandlerKind::ToolResult,
                    _ => return Err(malformed(event_node)),
                };
                Item::Handler(GuardrailHandlerDef {
                    event: Spanned::new(event, event_node.span),
                    body: self.block(self.child(def, Nt::DoBlock)?)?,
                    span,
                })
            }
            _ => return Err(malformed(def)),
        })
    }

    fn model(&self, def: &Node<'src>) -> Result<ModelDef> {
        let properties = match def.child(Nt::ModelProps) {
            Some(props) => flatten(props, Nt::ModelProp)
                .into_iter()
                .map(|prop| {
                    Ok(ModelProperty {
                        key: self.ident(prop)?,
                        value: self.literal(self.child(prop, Nt::Literal)?)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(ModelDef {
            name: self.ident(def)?,
            model: self.string(self.leaf(def, TokenKind::StringLiteral)?),
            properties,
            span: def.span,
        })
    }

    fn schema(&self, def: &Node<'src>) -> Result<SchemaDef> {
        let fields = flatten(self.child(def, Nt::Fields)?, Nt::Field)
            .into_iter()
            .map(|field| {
                Ok(SchemaFieldDef {
                    name: self.ident(field)?,
                    ty: self.type_tag(self.child(field, Nt::TypeTag)?)?,
                    span: field.span,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SchemaDef {
            name: self.ident(def)?,
            fields,
            span: def.span,
        })
    }

    fn type_tag(&self, node: &Node<'src>) -> Result<TypeTag> {
        let base = self.base_type(self.child(node, Nt::BaseType)?)?;
        if self.opt_leaf(node, TokenKind::Question).is_some() {
            Ok(TypeTag::Optional {
                inner: Box::new(base),
                span: node.span,
            })
        } else {
            Ok(base)
        }
    }

    fn base_type(&self, node: &Node<'src>) -> Result<TypeTag> {
        if node.has_keyword("list") {
            let element = self.base_type(self.child(node, Nt::BaseType)?)?;
            return Ok(TypeTag::List {
                element: Box::new(element),
                span: node.span,
            });
        }
        let name = self.ident(node)?;
        Ok(TypeTag::Named {
            name: name.node,
            span: name.span,
        })
    }

    fn prompt(&self, def: &Node<'src>) -> Result<PromptDef> {
        let head = self.child(def, Nt::PromptHead)?;
        let mut model = None;
        let mut expecting = None;
        if let Some(mods) = head.child(Nt::PromptMods) {
            for modifier in flatten(mods, Nt::PromptMod) {
                let name = self.ident(modifier)?;
                if modifier.has_keyword("expecting") {
                    expecting = Some(name);
                } else {
                    model = Some(name);
                }
            }
        }

        let body_node = self.child(def, Nt::PromptBody)?;
        let body_token = body_node.leaves().next().ok_or_else(|| malformed(body_node))?;

        let escalate = match def.child(Nt::EscalateClause) {
            Some(clause) => {
                let op_node = self.child(clause, Nt::EscalateOp)?;
                let op = match op_node.leaves().next().map(|t| t.kind) {
                    Some(TokenKind::EqEq) => EscalationOperator::Equals,
                    Some(TokenKind::Tilde) => EscalationOperator::Similar,
                    Some(TokenKind::NotEq) => EscalationOperator::NotEquals,
                    _ if op_node.has_keyword("contains") => EscalationOperator::Contains,
                    _ => return Err(malformed(op_node)),
                };
                Some(EscalationClause {
                    op,
                    literal: self.string(self.leaf(clause, TokenKind::StringLiteral)?),
                    span: clause.span,
                })
            }
            None => None,
        };

        Ok(PromptDef {
            name: self.ident(head)?,
            body: self.string(body_token),
            model,
            expecting,
            escalate,
            span: def.span,
        })
    }

    fn agent(&self, def: &Node<'src>) -> Result<AgentDef> {
        let mut agent = AgentDef {
            name: self.opt_leaf(def, TokenKind::Ident).map(|t| self.text(t)),
            instruction: None,
            tools: Vec::new(),
            retry: None,
            timeout: None,
            description: None,
            delegate: None,
            uses: None,
            span: def.span,
        };
        for prop in flatten(self.child(def, Nt::AgentProps)?, Nt::AgentProp) {
            let names = || {
                prop.child(Nt::NameList)
                    .map(|list| self.leaf_list(list, TokenKind::Ident))
                    .unwrap_or_default()
            };
            match prop.first_keyword() {
                Some("instruction") => agent.instruction = Some(self.ident(prop)?),
                Some("tools") => agent.tools.extend(names()),
                Some("retry") => agent.retry = Some(self.ident(prop)?),
                Some("timeout") => agent.timeout = Some(self.ident(prop)?),
                Some("description") => {
                    agent.description =
                        Some(self.string(self.leaf(prop, TokenKind::StringLiteral)?))
                }
                Some("delegate") => agent.delegate.get_or_insert_with(Vec::new).extend(names()),
                Some("use") => agent.uses.get_or_insert_with(Vec::new).extend(names()),
                _ => return Err(malformed(prop)),
            }
        }
        Ok(agent)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Statements of a `Block`, `DoBlock` or `ElseBranch`.
    fn block(&self, node: &Node<'src>) -> Result<Vec<Stmt>> {
        self.stmts(self.child(node, Nt::Stmts)?)
    }

    fn stmts(&self, node: &Node<'src>) -> Result<Vec<Stmt>> {
        flatten(node, Nt::Stmt)
            .into_iter()
            .map(|stmt| self.stmt(stmt))
            .collect()
    }

    fn stmt(&self, node: &Node<'src>) -> Result<Stmt> {
        let span = node.span;
        Ok(match node.kind {
            Nt::Stmt | Nt::SimpleStmt => return self.stmt(self.single(node)?),
            Nt::Assignment => Stmt::Assignment {
                target: self.var(self.leaf(node, TokenKind::Var)?),
                value: self.expr(self.child(node, Nt::Expr)?)?,
                span,
            },
            Nt::PropertyAssignment => Stmt::PropertyAssignment {
                target: self.var(self.leaf(node, TokenKind::Var)?),
                path: self.leaf_list(self.child(node, Nt::PropPath)?, TokenKind::Ident),
                value: self.expr(self.child(node, Nt::Expr)?)?,
                span,
            },
            Nt::RunStmt => Stmt::Run(RunStatement {
                target: self.opt_leaf(node, TokenKind::Var).map(|t| self.var(t)),
                invocation: self.invocation(self.child(node, Nt::Invocation)?)?,
                on_escalate: match node.child(Nt::EscalateHandler) {
                    Some(handler) => Some(self.escalation_handler(handler)?),
                    None => None,
                },
                span,
            }),
            Nt::ParallelBlock => Stmt::Parallel(ParallelBlock {
                body: self.block(self.child(node, Nt::DoBlock)?)?,
                span,
            }),
            Nt::LoopBlock => Stmt::Loop(LoopBlock {
                max: match self.opt_leaf(node, TokenKind::IntLiteral) {
                    Some(token) => Some(self.int(token)?),
                    None => None,
                },
                body: self.block(self.child(node, Nt::DoBlock)?)?,
                span,
            }),
            Nt::ForBlock => Stmt::For {
                var: self.var(self.leaf(node, TokenKind::Var)?),
                iterable: self.expr(self.child(node, Nt::Expr)?)?,
                body: self.block(self.child(node, Nt::DoBlock)?)?,
                span,
            },
            Nt::IfBlock => Stmt::If {
                condition: self.expr(self.child(node, Nt::Expr)?)?,
                then_body: self.stmts(self.child(node, Nt::Stmts)?)?,
                else_body: match node.child(Nt::ElseBranch) {
                    Some(branch) => self.block(branch)?,
                    None => Vec::new(),
                },
                span,
            },
            Nt::MatchBlock => Stmt::Match(MatchBlock {
                subject: self.expr(self.child(node, Nt::Expr)?)?,
                arms: flatten(self.child(node, Nt::Arms)?, Nt::Arm)
                    .into_iter()
                    .map(|arm| self.arm(arm))
                    .collect::<Result<Vec<_>>>()?,
                span,
            }),
            Nt::FailureBlock => Stmt::Failure(FailureBlock {
                body: self.block(self.child(node, Nt::DoBlock)?)?,
                span,
            }),
            Nt::ReturnStmt => Stmt::Return {
                value: self.opt_expr(node)?,
                span,
            },
            Nt::ContinueStmt => Stmt::Continue { span },
            Nt::AbortStmt => Stmt::Abort {
                message: self.opt_expr(node)?,
                span,
            },
            Nt::PushStmt => Stmt::Push {
                value: self.expr(self.child(node, Nt::Expr)?)?,
                target: self.var(self.leaf(node, TokenKind::Var)?),
                span,
            },
            Nt::LogStmt => Stmt::Log {
                message: self.expr(self.child(node, Nt::Expr)?)?,
                span,
            },
            Nt::GuardStmt => {
                let kind = match node.first_keyword() {
                    Some("mask") => GuardActionKind::Mask,
                    Some("block") => GuardActionKind::Block,
                    Some("warn") => GuardActionKind::Warn,
                    Some("retry") => GuardActionKind::Retry,
                    _ => return Err(malformed(node)),
                };
                Stmt::Guard(GuardAction {
                    kind,
                    guardrail: self.ident(node)?,
                    message: self.opt_leaf(node, TokenKind::StringLiteral).map(|t| self.string(t)),
                    span,
                })
            }
            _ => return Err(malformed(node)),
        })
    }

    fn opt_expr(&self, node: &Node<'src>) -> Result<Option<Expr>> {
        node.child(Nt::Expr).map(|expr| self.expr(expr)).transpose()
    }

    fn arm(&self, node: &Node<'src>) -> Result<MatchArm> {
        let pattern = if node.has_keyword("when") {
            Some(self.literal(self.child(node, Nt::Literal)?)?)
        } else {
            None
        };
        Ok(MatchArm {
            pattern,
            body: Box::new(self.stmt(self.child(node, Nt::SimpleStmt)?)?),
            span: node.span,
        })
    }

    fn invocation(&self, node: &Node<'src>) -> Result<Invocation> {
        let name = self.ident(node)?;
        let args = match node.child(Nt::Args) {
            Some(args) => flatten(args, Nt::Expr)
                .into_iter()
                .map(|expr| self.expr(expr))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let words: Vec<&str> = node.keywords().take(2).collect();
        match words.as_slice() {
            ["run", "agent"] => Ok(Invocation::Agent { name, args }),
            ["run", "flow"] => Ok(Invocation::Flow { name, args }),
            ["call", "llm"] => Ok(Invocation::Llm {
                prompt: name,
                args,
                model: match node.child(Nt::ModelOverride) {
                    Some(model) => Some(self.ident(model)?),
                    None => None,
                },
            }),
            _ => Err(malformed(node)),
        }
    }

    fn escalation_handler(&self, node: &Node<'src>) -> Result<EscalationHandler> {
        let action = self.child(node, Nt::EscalateAction)?;
        match action.first_keyword() {
            Some("return") => Ok(EscalationHandler::Return {
                value: self.expr(self.child(action, Nt::Expr)?)?,
            }),
            Some("continue") => Ok(EscalationHandler::Continue),
            Some("abort") => Ok(EscalationHandler::Abort),
            _ => Err(malformed(action)),
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expr(&self, node: &Node<'src>) -> Result<Expr> {
        let span = node.span;
        match node.kind {
            Nt::Expr | Nt::Atom => self.expr(self.single(node)?),
            Nt::OrExpr | Nt::AndExpr => match node.child(node.kind) {
                Some(left) => {
                    let right_kind = if node.kind == Nt::OrExpr { Nt::AndExpr } else { Nt::NotExpr };
                    Ok(Expr::Binary {
                        op: if node.kind == Nt::OrExpr { BinaryOp::Or } else { BinaryOp::And },
                        left: Box::new(self.expr(left)?),
                        right: Box::new(self.expr(self.child(node, right_kind)?)?),
                        span,
                    })
                }
                None => self.expr(self.single(node)?),
            },
            Nt::NotExpr if node.has_keyword("not") => Ok(Expr::Not {
                operand: Box::new(self.expr(self.child(node, Nt::NotExpr)?)?),
                span,
            }),
            Nt::NotExpr => self.expr(self.single(node)?),
            Nt::CmpExpr => {
                let parts: Vec<&Node<'src>> = node.nodes().collect();
                match parts.as_slice() {
                    [single] => self.expr(single),
                    [left, op, right] => Ok(Expr::Binary {
                        op: self.cmp_op(op)?,
                        left: Box::new(self.expr(left)?),
                        right: Box::new(self.expr(right)?),
                        span,
                    }),
                    _ => Err(malformed(node)),
                }
            }
            Nt::AddExpr => match node.child(Nt::AddExpr) {
                Some(left) => {
                    let op = if self.opt_leaf(node, TokenKind::Minus).is_some() {
                        BinaryOp::Sub
                    } else {
                        BinaryOp::Add
                    };
                    Ok(Expr::Binary {
                        op,
                        left: Box::new(self.expr(left)?),
                        right: Box::new(self.expr(self.child(node, Nt::Atom)?)?),
                        span,
                    })
                }
                None => self.expr(self.single(node)?),
            },
            Nt::Literal => {
                let literal = self.literal(node)?;
                Ok(Expr::Literal {
                    value: literal.node,
                    span,
                })
            }
            Nt::VarRef => {
                let base = self.var(self.leaf(node, TokenKind::Var)?);
                match node.child(Nt::PropPath) {
                    Some(path) => Ok(Expr::Property {
                        base,
                        path: self.leaf_list(path, TokenKind::Ident),
                        span,
                    }),
                    None => Ok(Expr::Variable {
                        name: base.node,
                        span,
                    }),
                }
            }
            Nt::ListExpr => Ok(Expr::List {
                items: match node.child(Nt::Elems) {
                    Some(elems) => flatten(elems, Nt::Expr)
                        .into_iter()
                        .map(|item| self.expr(item))
                        .collect::<Result<Vec<_>>>()?,
                    None => Vec::new(),
                },
                span,
            }),
            Nt::MapExpr => Ok(Expr::Map {
                entries: match node.child(Nt::Entries) {
                    Some(entries) => flatten(entries, Nt::Entry)
                        .into_iter()
                        .map(|entry| self.map_entry(entry))
                        .collect::<Result<Vec<_>>>()?,
                    None => Vec::new(),
                },
                span,
            }),
            Nt::FilterExpr => {
                let parts: Vec<&Node<'src>> = node.nodes().collect();
                let [list, prop, op, value] = parts.as_slice() else {
                    return Err(malformed(node));
                };
                let path_node = self.child(prop, Nt::PropPath)?;
                Ok(Expr::Filter(FilterExpr {
                    list: Box::new(self.expr(list)?),
                    property: ImplicitPropertyAccess {
                        path: self.leaf_list(path_node, TokenKind::Ident),
                        span: prop.span,
                    },
                    op: self.cmp_op(op)?,
                    value: Box::new(self.expr(value)?),
                    span,
                }))
            }
            _ => Err(malformed(node)),
        }
    }

    fn cmp_op(&self, node: &Node<'src>) -> Result<BinaryOp> {
        if node.has_keyword("contains") {
            return Ok(BinaryOp::Contains);
        }
        match node.leaves().next().map(|token| token.kind) {
            Some(TokenKind::EqEq) => Ok(BinaryOp::Eq),
            Some(TokenKind::NotEq) => Ok(BinaryOp::NotEq),
            Some(TokenKind::Lt) => Ok(BinaryOp::Lt),
            Some(TokenKind::LtEq) => Ok(BinaryOp::LtEq),
            Some(TokenKind::Gt) => Ok(BinaryOp::Gt),
            Some(TokenKind::GtEq) => Ok(BinaryOp::GtEq),
            Some(TokenKind::Tilde) => Ok(BinaryOp::Similar),
            _ => Err(malformed(node)),
        }
    }

    fn map_entry(&self, node: &Node<'src>) -> Result<(Spanned<String>, Expr)> {
        let key_node = self.child(node, Nt::MapKey)?;
        let key_token = key_node.leaves().next().ok_or_else(|| malformed(key_node))?;
        let key = match key_token.kind {
            TokenKind::StringLiteral => self.string(key_token),
            _ => self.text(key_token),
        };
        Ok((key, self.expr(self.child(node, Nt::Expr)?)?))
    }

    fn literal(&self, node: &Node<'src>) -> Result<Spanned<Literal>> {
        let span = node.span;
        match node.first_keyword() {
            Some("true") => return Ok(Spanned::new(Literal::Bool(true), span)),
            Some("false") => return Ok(Spanned::new(Literal::Bool(false), span)),
            Some("null") => return Ok(Spanned::new(Literal::Null, span)),
            _ => {}
        }

        let tokens: Vec<&Token<'src>> = node.leaves().collect();
        let (negative, token) = match tokens.as_slice() {
            [minus, token] if minus.kind == TokenKind::Minus => (true, *token),
            [token] => (false, *token),
            _ => return Err(malformed(node)),
        };
        let invalid = |what| TransformError::InvalidLiteral {
            what,
            text: token.text.to_string(),
            span,
        };

        let literal = match token.kind {
            TokenKind::StringLiteral | TokenKind::TripleString => {
                Literal::String(self.string(token).node)
            }
            TokenKind::IntLiteral => {
                let value: i64 = token.text.parse().map_err(|_| invalid("integer"))?;
                Literal::Int(if negative { -value } else { value })
            }
            TokenKind::FloatLiteral => {
                let value: f64 = token.text.parse().map_err(|_| invalid("float"))?;
                Literal::Float(if negative { -value } else { value })
            }
            _ => return Err(malformed(node)),
        };
        Ok(Spanned::new(literal, span))
    }
}

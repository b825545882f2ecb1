//! The weave grammar, as data.
//!
//! Productions are plain [`Rule`] values consumed by the chart parser in
//! [`crate::parser`]. Keywords are contextual, so most of them appear as
//! [`Terminal::Word`] entries matching an identifier token with a given text.
//!
//! The grammar has no empty productions and no cycles of unit rules. The
//! parser relies on both: every symbol covers at least one token.
//!
//! Rules are tried in declaration order when a span has more than one
//! derivation, so the order within a nonterminal is significant.

use crate::lexer::{Token, TokenKind};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Nonterminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nt {
    Start,
    Unit,
    Version,
    Items,
    Item,

    // Definitions
    Import,
    ModelDef,
    ModelProps,
    ModelProp,
    SchemaDef,
    Fields,
    Field,
    TypeTag,
    BaseType,
    ToolDef,
    ToolKind,
    RetryDef,
    Backoff,
    TimeoutDef,
    TimeUnit,
    GuardrailDef,
    PromptDef,
    PromptHead,
    PromptMods,
    PromptMod,
    PromptBody,
    EscalateClause,
    EscalateOp,
    AgentDef,
    AgentProps,
    AgentProp,
    NameList,
    FlowDef,
    Params,
    HandlerDef,
    HandlerEvent,

    // Statements
    Block,
    DoBlock,
    Stmts,
    Stmt,
    SimpleStmt,
    Assignment,
    PropertyAssignment,
    PropPath,
    RunStmt,
    Invocation,
    ModelOverride,
    Args,
    EscalateHandler,
    EscalateAction,
    ParallelBlock,
    LoopBlock,
    ForBlock,
    IfBlock,
    ElseBranch,
    MatchBlock,
    Arms,
    Arm,
    FailureBlock,
    ReturnStmt,
    ContinueStmt,
    AbortStmt,
    PushStmt,
    LogStmt,
    GuardStmt,

    // Expressions
    Expr,
    OrExpr,
    AndExpr,
    NotExpr,
    CmpExpr,
    CmpOp,
    AddExpr,
    Atom,
    VarRef,
    Literal,
    ListExpr,
    Elems,
    MapExpr,
    Entries,
    Entry,
    MapKey,
    FilterExpr,
    ImplicitProp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    /// Any token of this kind
    Kind(TokenKind),
    /// An identifier spelled exactly like this keyword
    Word(&'static str),
}

impl Terminal {
    pub fn matches(&self, token: &Token<'_>) -> bool {
        match self {
            Terminal::Kind(kind) => token.kind == *kind,
            Terminal::Word(word) => token.kind == TokenKind::Ident && token.text == *word,
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Kind(kind) => write!(f, "{}", kind),
            Terminal::Word(word) => write!(f, "'{}'", word),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    T(Terminal),
    N(Nt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub lhs: Nt,
    pub rhs: Vec<Symbol>,
}

#[derive(Debug)]
pub struct Grammar {
    pub rules: Vec<Rule>,
    by_lhs: HashMap<Nt, Vec<usize>>,
}

impl Grammar {
    /// Rule ids for a nonterminal, in declaration order.
    pub fn rules_for(&self, nt: Nt) -> &[usize] {
        self.by_lhs.get(&nt).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rule(&self, id: usize) -> &Rule {
        &self.rules[id]
    }
}

/// The grammar, built once per process.
pub static GRAMMAR: Lazy<Grammar> = Lazy::new(build);

fn k(kind: TokenKind) -> Symbol {
    Symbol::T(Terminal::Kind(kind))
}

fn w(word: &'static str) -> Symbol {
    Symbol::T(Terminal::Word(word))
}

fn n(nt: Nt) -> Symbol {
    Symbol::N(nt)
}

#[derive(Default)]
struct Builder {
    rules: Vec<Rule>,
}

impl Builder {
    fn add(&mut self, lhs: Nt, rhs: Vec<Symbol>) {
        debug_assert!(!rhs.is_empty(), "empty production for {:?}", lhs);
        self.rules.push(Rule { lhs, rhs });
    }

    /// One single-symbol production per alternative.
    fn alts(&mut self, lhs: Nt, alternatives: &[Symbol]) {
        for symbol in alternatives {
            self.add(lhs, vec![*symbol]);
        }
    }

    fn finish(self) -> Grammar {
        let mut by_lhs: HashMap<Nt, Vec<usize>> = HashMap::new();
        for (id, rule) in self.rules.iter().enumerate() {
            by_lhs.entry(rule.lhs).or_default().push(id);
        }
        Grammar {
            rules: self.rules,
            by_lhs,
        }
    }
}

fn build() -> Grammar {
    use Nt::*;
    use TokenKind as K;

    let nl = k(K::Newline);
    let ind = k(K::Indent);
    let ded = k(K::Dedent);
    let ident = k(K::Ident);
    let var = k(K::Var);
    let string = k(K::StringLiteral);
    let int = k(K::IntLiteral);

    let mut g = Builder::default();

    // Source unit
    g.add(Start, vec![n(Unit)]);
    g.add(Unit, vec![n(Items)]);
    g.add(Unit, vec![n(Version), n(Items)]);
    g.add(Unit, vec![n(Version)]);
    g.add(Version, vec![w("weave"), ident, nl]);
    g.add(Items, vec![n(Items), n(Item)]);
    g.add(Items, vec![n(Item)]);
    g.alts(
        Item,
        &[
            n(Import),
            n(ModelDef),
            n(SchemaDef),
            n(ToolDef),
            n(RetryDef),
            n(TimeoutDef),
            n(GuardrailDef),
            n(PromptDef),
            n(AgentDef),
            n(FlowDef),
            n(HandlerDef),
        ],
    );

    // Definitions
    g.add(Import, vec![w("import"), string, nl]);

    g.add(ModelDef, vec![w("model"), ident, k(K::Eq), string, nl]);
    g.add(
        ModelDef,
        vec![w("model"), ident, k(K::Eq), string, k(K::Colon), nl, ind, n(ModelProps), ded],
    );
    g.add(ModelProps, vec![n(ModelProps), n(ModelProp)]);
    g.add(ModelProps, vec![n(ModelProp)]);
    g.add(ModelProp, vec![ident, k(K::Colon), n(Literal), nl]);

    g.add(SchemaDef, vec![w("schema"), ident, k(K::Colon), nl, ind, n(Fields), ded]);
    g.add(Fields, vec![n(Fields), n(Field)]);
    g.add(Fields, vec![n(Field)]);
    g.add(Field, vec![ident, k(K::Colon), n(TypeTag), nl]);
    g.add(TypeTag, vec![n(BaseType)]);
    g.add(TypeTag, vec![n(BaseType), k(K::Question)]);
    g.add(BaseType, vec![ident]);
    g.add(BaseType, vec![w("list"), k(K::LBracket), n(BaseType), k(K::RBracket)]);

    g.add(ToolDef, vec![w("tool"), ident, k(K::Eq), n(ToolKind), string, nl]);
    g.alts(ToolKind, &[w("builtin"), w("mcp")]);

    g.add(RetryDef, vec![w("retry"), ident, k(K::Eq), int, w("times"), nl]);
    g.add(
        RetryDef,
        vec![
            w("retry"),
            ident,
            k(K::Eq),
            int,
            w("times"),
            k(K::Comma),
            n(Backoff),
            w("backoff"),
            nl,
        ],
    );
    g.alts(Backoff, &[w("fixed"), w("linear"), w("exponential")]);

    g.add(TimeoutDef, vec![w("timeout"), ident, k(K::Eq), int, n(TimeUnit), nl]);
    g.alts(TimeUnit, &[w("seconds"), w("second"), w("minutes"), w("minute")]);

    g.add(GuardrailDef, vec![w("guardrail"), ident, k(K::Eq), w("regex"), string, nl]);

    g.add(PromptDef, vec![n(PromptHead), k(K::Colon), n(PromptBody), nl]);
    g.add(
        PromptDef,
        vec![n(PromptHead), k(K::Colon), n(PromptBody), nl, ind, n(EscalateClause), nl, ded],
    );
    g.add(PromptHead, vec![w("prompt"), ident]);
    g.add(PromptHead, vec![w("prompt"), ident, n(PromptMods)]);
    g.add(PromptMods, vec![n(PromptMods), n(PromptMod)]);
    g.add(PromptMods, vec![n(PromptMod)]);
    g.add(PromptMod, vec![w("expecting"), ident]);
    g.add(PromptMod, vec![w("using"), w("model"), ident]);
    g.alts(PromptBody, &[string, k(K::TripleString)]);
    g.add(EscalateClause, vec![w("escalate"), w("if"), n(EscalateOp), string]);
    g.alts(EscalateOp, &[k(K::EqEq), k(K::Tilde), k(K::NotEq), w("contains")]);

    g.add(AgentDef, vec![w("agent"), ident, k(K::Colon), nl, ind, n(AgentProps), ded]);
    g.add(AgentDef, vec![w("agent"), k(K::Colon), nl, ind, n(AgentProps), ded]);
    g.add(AgentProps, vec![n(AgentProps), n(AgentProp)]);
    g.add(AgentProps, vec![n(AgentProp)]);
    g.add(AgentProp, vec![w("instruction"), ident, nl]);
    g.add(AgentProp, vec![w("tools"), n(NameList), nl]);
    g.add(AgentProp, vec![w("retry"), ident, nl]);
    g.add(AgentProp, vec![w("timeout"), ident, nl]);
    g.add(AgentProp, vec![w("description"), string, nl]);
    g.add(AgentProp, vec![w("delegate"), n(NameList), nl]);
    g.add(AgentProp, vec![w("use"), n(NameList), nl]);
    g.add(NameList, vec![n(NameList), k(K::Comma), ident]);
    g.add(NameList, vec![ident]);

    g.add(FlowDef, vec![w("flow"), ident, k(K::Colon), n(Block)]);
    g.add(FlowDef, vec![w("flow"), ident, n(Params), k(K::Colon), n(Block)]);
    g.add(Params, vec![n(Params), var]);
    g.add(Params, vec![var]);

    g.add(HandlerDef, vec![w("on"), n(HandlerEvent), n(DoBlock)]);
    g.alts(HandlerEvent, &[w("start"), w("input"), w("output")]);
    g.add(HandlerEvent, vec![w("tool"), k(K::Minus), w("call")]);
    g.add(HandlerEvent, vec![w("tool"), k(K::Minus), w("result")]);

    // Statements
    g.add(Block, vec![nl, ind, n(Stmts), ded]);
    g.add(DoBlock, vec![w("do"), nl, ind, n(Stmts), ded, w("end"), nl]);
    g.add(Stmts, vec![n(Stmts), n(Stmt)]);
    g.add(Stmts, vec![n(Stmt)]);
    g.alts(
        Stmt,
        &[
            n(SimpleStmt),
            n(ParallelBlock),
            n(LoopBlock),
            n(ForBlock),
            n(IfBlock),
            n(MatchBlock),
            n(FailureBlock),
            n(GuardStmt),
        ],
    );
    g.alts(
        SimpleStmt,
        &[
            n(Assignment),
            n(PropertyAssignment),
            n(RunStmt),
            n(ReturnStmt),
            n(ContinueStmt),
            n(AbortStmt),
            n(PushStmt),
            n(LogStmt),
        ],
    );

    g.add(Assignment, vec![var, k(K::Eq), n(Expr), nl]);
    g.add(PropertyAssignment, vec![var, n(PropPath), k(K::Eq), n(Expr), nl]);
    g.add(PropPath, vec![n(PropPath), k(K::Dot), ident]);
    g.add(PropPath, vec![k(K::Dot), ident]);

    g.add(RunStmt, vec![n(Invocation), nl]);
    g.add(RunStmt, vec![n(Invocation), n(EscalateHandler), nl]);
    g.add(RunStmt, vec![var, k(K::Eq), n(Invocation), nl]);
    g.add(RunStmt, vec![var, k(K::Eq), n(Invocation), n(EscalateHandler), nl]);

    g.add(Invocation, vec![w("run"), w("agent"), ident]);
    g.add(Invocation, vec![w("run"), w("agent"), ident, w("with"), n(Args)]);
    g.add(Invocation, vec![w("call"), w("llm"), ident]);
    g.add(Invocation, vec![w("call"), w("llm"), ident, w("with"), n(Args)]);
    g.add(Invocation, vec![w("call"), w("llm"), ident, n(ModelOverride)]);
    g.add(Invocation, vec![w("call"), w("llm"), ident, w("with"), n(Args), n(ModelOverride)]);
    g.add(Invocation, vec![w("run"), w("flow"), ident]);
    g.add(Invocation, vec![w("run"), w("flow"), ident, w("with"), n(Args)]);
    g.add(ModelOverride, vec![w("using"), w("model"), ident]);
    g.add(Args, vec![n(Args), k(K::Comma), n(Expr)]);
    g.add(Args, vec![n(Expr)]);

    g.add(EscalateHandler, vec![w("on"), w("escalate"), n(EscalateAction)]);
    g.add(EscalateAction, vec![w("return"), n(Expr)]);
    g.add(EscalateAction, vec![w("continue")]);
    g.add(EscalateAction, vec![w("abort")]);

    g.add(ParallelBlock, vec![w("parallel"), n(DoBlock)]);
    g.add(LoopBlock, vec![w("loop"), n(DoBlock)]);
    g.add(LoopBlock, vec![w("loop"), w("max"), int, n(DoBlock)]);
    g.add(ForBlock, vec![w("for"), var, w("in"), n(Expr), n(DoBlock)]);
    g.add(
        IfBlock,
        vec![w("if"), n(Expr), w("do"), nl, ind, n(Stmts), ded, w("end"), nl],
    );
    g.add(
        IfBlock,
        vec![
            w("if"),
            n(Expr),
            w("do"),
            nl,
            ind,
            n(Stmts),
            ded,
            n(ElseBranch),
            w("end"),
            nl,
        ],
    );
    g.add(ElseBranch, vec![w("else"), nl, ind, n(Stmts), ded]);
    g.add(MatchBlock, vec![w("match"), n(Expr), w("do"), nl, ind, n(Arms), ded, w("end"), nl]);
    g.add(Arms, vec![n(Arms), n(Arm)]);
    g.add(Arms, vec![n(Arm)]);
    g.add(Arm, vec![w("when"), n(Literal), k(K::Arrow), n(SimpleStmt)]);
    g.add(Arm, vec![w("else"), k(K::Arrow), n(SimpleStmt)]);
    g.add(FailureBlock, vec![w("on"), w("failure"), n(DoBlock)]);

    g.add(ReturnStmt, vec![w("return"), n(Expr), nl]);
    g.add(ReturnStmt, vec![w("return"), nl]);
    g.add(ContinueStmt, vec![w("continue"), nl]);
    g.add(AbortStmt, vec![w("abort"), nl]);
    g.add(AbortStmt, vec![w("abort"), n(Expr), nl]);
    g.add(PushStmt, vec![w("push"), n(Expr), w("to"), var, nl]);
    g.add(LogStmt, vec![w("log"), n(Expr), nl]);

    g.add(GuardStmt, vec![w("mask"), ident, nl]);
    g.add(GuardStmt, vec![w("block"), w("if"), ident, nl]);
    g.add(GuardStmt, vec![w("warn"), w("if"), ident, nl]);
    g.add(GuardStmt, vec![w("retry"), w("with"), string, w("if"), ident, nl]);

    // Expressions
    g.add(Expr, vec![n(OrExpr)]);
    g.add(OrExpr, vec![n(OrExpr), w("or"), n(AndExpr)]);
    g.add(OrExpr, vec![n(AndExpr)]);
    g.add(AndExpr, vec![n(AndExpr), w("and"), n(NotExpr)]);
    g.add(AndExpr, vec![n(NotExpr)]);
    g.add(NotExpr, vec![w("not"), n(NotExpr)]);
    g.add(NotExpr, vec![n(CmpExpr)]);
    g.add(CmpExpr, vec![n(AddExpr), n(CmpOp), n(AddExpr)]);
    g.add(CmpExpr, vec![n(AddExpr)]);
    g.alts(
        CmpOp,
        &[
            k(K::EqEq),
            k(K::NotEq),
            k(K::Lt),
            k(K::LtEq),
            k(K::Gt),
            k(K::GtEq),
            k(K::Tilde),
            w("contains"),
        ],
    );
    g.add(AddExpr, vec![n(AddExpr), k(K::Plus), n(Atom)]);
    g.add(AddExpr, vec![n(AddExpr), k(K::Minus), n(Atom)]);
    g.add(AddExpr, vec![n(Atom)]);
    g.alts(
        Atom,
        &[n(Literal), n(VarRef), n(ListExpr), n(MapExpr), n(FilterExpr)],
    );
    g.add(Atom, vec![k(K::LParen), n(Expr), k(K::RParen)]);
    g.add(VarRef, vec![var, n(PropPath)]);
    g.add(VarRef, vec![var]);

    g.alts(
        Literal,
        &[
            string,
            k(K::TripleString),
            int,
            k(K::FloatLiteral),
            w("true"),
            w("false"),
            w("null"),
        ],
    );
    g.add(Literal, vec![k(K::Minus), int]);
    g.add(Literal, vec![k(K::Minus), k(K::FloatLiteral)]);

    g.add(ListExpr, vec![k(K::LBracket), k(K::RBracket)]);
    g.add(ListExpr, vec![k(K::LBracket), n(Elems), k(K::RBracket)]);
    g.add(ListExpr, vec![k(K::LBracket), n(Elems), k(K::Comma), k(K::RBracket)]);
    g.add(Elems, vec![n(Elems), k(K::Comma), n(Expr)]);
    g.add(Elems, vec![n(Expr)]);

    g.add(MapExpr, vec![k(K::LBrace), k(K::RBrace)]);
    g.add(MapExpr, vec![k(K::LBrace), n(Entries), k(K::RBrace)]);
    g.add(MapExpr, vec![k(K::LBrace), n(Entries), k(K::Comma), k(K::RBrace)]);
    g.add(Entries, vec![n(Entries), k(K::Comma), n(Entry)]);
    g.add(Entries, vec![n(Entry)]);
    g.add(Entry, vec![n(MapKey), k(K::Colon), n(Expr)]);
    g.alts(MapKey, &[ident, string]);

    g.add(
        FilterExpr,
        vec![w("filter"), n(Atom), w("where"), n(ImplicitProp), n(CmpOp), n(Atom)],
    );
    g.add(ImplicitProp, vec![n(PropPath)]);

    g.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn no_empty_productions() {
        assert!(GRAMMAR.rules.iter().all(|rule| !rule.rhs.is_empty()));
    }

    #[test]
    fn every_nonterminal_is_defined() {
        let defined: HashSet<Nt> = GRAMMAR.rules.iter().map(|rule| rule.lhs).collect();
        for rule in &GRAMMAR.rules {
            for symbol in &rule.rhs {
                if let Symbol::N(nt) = symbol {
                    assert!(defined.contains(nt), "{:?} is used but never defined", nt);
                }
            }
        }
    }

    #[test]
    fn rules_keep_declaration_order() {
        let ids = GRAMMAR.rules_for(Nt::Unit);
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(GRAMMAR.rule(ids[0]).rhs, vec![Symbol::N(Nt::Items)]);
    }

    #[test]
    fn word_terminal_matches_identifier_text() {
        let token = Token::new(TokenKind::Ident, 0..5, "agent");
        assert!(Terminal::Word("agent").matches(&token));
        assert!(!Terminal::Word("flow").matches(&token));
        assert!(Terminal::Kind(TokenKind::Ident).matches(&token));
    }
}

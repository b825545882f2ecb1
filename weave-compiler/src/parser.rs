//! Weave Parser
//!
//! Chart (Earley) parser over the rules in [`crate::grammar`]. Produces a
//! concrete [`ParseTree`] where every node carries its source span with
//! line and column.
//!
//! # Parsing Strategy
//!
//! - Lex with `logos`, then insert block markers with the [`crate::indenter`]
//! - Recognise with an Earley chart: predict, scan, complete
//! - Extract one derivation from the completed items
//!
//! A general algorithm accepts every sentence of the grammar, including the
//! locally ambiguous ones a predictive parser would reject. It costs more
//! than a deterministic parser; workflow files are small, so the chart stays
//! small too.
//!
//! # Ambiguity
//!
//! When a span has several derivations the first accepted one wins: rules
//! are tried in grammar declaration order, and within a rule each child takes
//! the shortest span that still lets the rest of the rule match.

use crate::ast::{LineIndex, Span};
use crate::grammar::{Grammar, Nt, Symbol, Terminal, GRAMMAR};
use crate::indenter::{self, IndentError};
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use thiserror::Error;
use weave_core::{Diagnostic, DiagnosticCode};

/// Parser error with location information
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("{0}")]
    Lex(#[from] LexError),

    #[error("{0}")]
    Indent(#[from] IndentError),

    #[error("unexpected {found}, {}", describe_expected(expected))]
    UnexpectedToken {
        found: String,
        expected: Vec<String>,
        span: Range<usize>,
    },

    #[error("unexpected end of input, {}", describe_expected(expected))]
    UnexpectedEof { expected: Vec<String>, at: usize },
}

fn describe_expected(expected: &[String]) -> String {
    match expected {
        [] => "expected nothing more".to_string(),
        [only] => format!("expected {}", only),
        many => format!("expected one of {}", many.join(", ")),
    }
}

impl ParseError {
    pub fn span(&self) -> Range<usize> {
        match self {
            ParseError::Lex(err) => err.span.clone(),
            ParseError::Indent(err) => err.span(),
            ParseError::UnexpectedToken { span, .. } => span.clone(),
            ParseError::UnexpectedEof { at, .. } => *at..*at,
        }
    }

    pub fn code(&self) -> DiagnosticCode {
        match self {
            ParseError::Indent(_) => DiagnosticCode::E0008,
            _ => DiagnosticCode::E0007,
        }
    }

    /// Convert to a positioned diagnostic for `file`.
    pub fn to_diagnostic(&self, file: &str, source: &str) -> Diagnostic {
        let span = LineIndex::new(source).span(self.span());
        Diagnostic::new(self.code(), file, span.line, span.column, self.to_string())
            .with_length(source.get(self.span()).map_or(1, |text| text.chars().count().max(1)))
    }
}

/// Result type for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;

// =============================================================================
// Parse tree
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ParseNode<'src> {
    Node(Node<'src>),
    /// Token matched by kind
    Leaf(Token<'src>),
    /// Identifier matched as a contextual keyword
    Keyword(Token<'src>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node<'src> {
    pub kind: Nt,
    pub children: Vec<ParseNode<'src>>,
    pub span: Span,
}

impl<'src> Node<'src> {
    /// First direct child node of the given kind.
    pub fn child(&self, kind: Nt) -> Option<&Node<'src>> {
        self.nodes().find(|node| node.kind == kind)
    }

    /// Direct child nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<'src>> {
        self.children.iter().filter_map(|child| match child {
            ParseNode::Node(node) => Some(node),
            _ => None,
        })
    }

    /// Direct token children that carry a payload (no punctuation or layout).
    pub fn leaves(&self) -> impl Iterator<Item = &Token<'src>> {
        self.children.iter().filter_map(|child| match child {
            ParseNode::Leaf(token) if !token.is_structural() => Some(token),
            _ => None,
        })
    }

    /// Direct keyword children, in order.
    pub fn keywords(&self) -> impl Iterator<Item = &'src str> + '_ {
        self.children.iter().filter_map(|child| match child {
            ParseNode::Keyword(token) => Some(token.text),
            _ => None,
        })
    }

    pub fn first_keyword(&self) -> Option<&'src str> {
        self.keywords().next()
    }

    pub fn has_keyword(&self, word: &str) -> bool {
        self.keywords().any(|kw| kw == word)
    }

    /// The only child node, for single-symbol productions.
    pub fn single(&self) -> Option<&Node<'src>> {
        let mut nodes = self.nodes();
        let first = nodes.next()?;
        nodes.next().is_none().then_some(first)
    }
}

/// A parsed source unit. The root is always a [`Nt::Unit`] node.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseTree<'src> {
    pub root: Node<'src>,
}

// =============================================================================
// Entry points
// =============================================================================

/// Lex, indent and parse `source`.
pub fn parse(source: &str) -> ParseResult<ParseTree<'_>> {
    let tokens = Lexer::new(source).tokenize()?;
    let tokens = indenter::indent(source, tokens)?;
    Parser::new(source, tokens).parse()
}

/// Earley parser over an indented token stream.
pub struct Parser<'src> {
    grammar: &'static Grammar,
    source: &'src str,
    tokens: Vec<Token<'src>>,
    lines: LineIndex<'src>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    rule: usize,
    dot: usize,
    origin: usize,
}

#[derive(Default)]
struct Chart {
    sets: Vec<Vec<Item>>,
    seen: Vec<HashSet<Item>>,
    /// Items in each set waiting on a nonterminal
    waiting: Vec<HashMap<Nt, Vec<Item>>>,
    /// `(nt, start, end)` -> rules that completed over that span
    completed: HashMap<(Nt, usize, usize), BTreeSet<usize>>,
}

impl Chart {
    fn new(len: usize) -> Self {
        Self {
            sets: vec![Vec::new(); len + 1],
            seen: vec![HashSet::new(); len + 1],
            waiting: vec![HashMap::new(); len + 1],
            completed: HashMap::new(),
        }
    }

    fn add(&mut self, set: usize, item: Item) {
        if self.seen[set].insert(item) {
            self.sets[set].push(item);
        }
    }
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str, tokens: Vec<Token<'src>>) -> Self {
        Self {
            grammar: &GRAMMAR,
            source,
            tokens,
            lines: LineIndex::new(source),
        }
    }

    pub fn parse(self) -> ParseResult<ParseTree<'src>> {
        if self.tokens.is_empty() {
            return Ok(ParseTree {
                root: Node {
                    kind: Nt::Unit,
                    children: Vec::new(),
                    span: self.lines.span(0..0),
                },
            });
        }

        let chart = self.recognise()?;
        let mut forest = Forest {
            parser: &self,
            completed: &chart.completed,
            failed: HashSet::new(),
        };
        let start = forest
            .build(Nt::Start, 0, self.tokens.len())
            .ok_or_else(|| self.error_at(&chart, self.tokens.len()))?;
        let root = start
            .children
            .into_iter()
            .find_map(|child| match child {
                ParseNode::Node(node) => Some(node),
                _ => None,
            })
            .ok_or_else(|| self.error_at(&chart, self.tokens.len()))?;
        Ok(ParseTree { root })
    }

    fn next_symbol(&self, item: &Item) -> Option<Symbol> {
        self.grammar.rule(item.rule).rhs.get(item.dot).copied()
    }

    fn recognise(&self) -> ParseResult<Chart> {
        let len = self.tokens.len();
        let mut chart = Chart::new(len);
        for &rule in self.grammar.rules_for(Nt::Start) {
            chart.add(0, Item { rule, dot: 0, origin: 0 });
        }

        for pos in 0..=len {
            if chart.sets[pos].is_empty() {
                return Err(self.error_at(&chart, pos.saturating_sub(1)));
            }
            let mut predicted = HashSet::new();
            let mut idx = 0;
            while idx < chart.sets[pos].len() {
                let item = chart.sets[pos][idx];
                idx += 1;
                match self.next_symbol(&item) {
                    None => {
                        let lhs = self.grammar.rule(item.rule).lhs;
                        chart
                            .completed
                            .entry((lhs, item.origin, pos))
                            .or_default()
                            .insert(item.rule);
                        let parents = chart.waiting[item.origin]
                            .get(&lhs)
                            .cloned()
                            .unwrap_or_default();
                        for parent in parents {
                            chart.add(pos, Item { dot: parent.dot + 1, ..parent });
                        }
                    }
                    Some(Symbol::N(nt)) => {
                        chart.waiting[pos].entry(nt).or_default().push(item);
                        if predicted.insert(nt) {
                            for &rule in self.grammar.rules_for(nt) {
                                chart.add(pos, Item { rule, dot: 0, origin: pos });
                            }
                        }
                    }
                    Some(Symbol::T(terminal)) => {
                        if pos < len && terminal.matches(&self.tokens[pos]) {
                            chart.add(pos + 1, Item { dot: item.dot + 1, ..item });
                        }
                    }
                }
            }
        }

        if chart.completed.contains_key(&(Nt::Start, 0, len)) {
            Ok(chart)
        } else {
            Err(self.error_at(&chart, len))
        }
    }

    /// Error for a parse that could not advance past set `pos`.
    fn error_at(&self, chart: &Chart, pos: usize) -> ParseError {
        let expected: BTreeSet<String> = chart
            .sets
            .get(pos)
            .into_iter()
            .flatten()
            .filter_map(|item| match self.next_symbol(item) {
                Some(Symbol::T(terminal)) => Some(terminal),
                _ => None,
            })
            .map(|terminal: Terminal| terminal.to_string())
            .collect();
        let expected: Vec<String> = expected.into_iter().collect();

        match self.tokens.get(pos) {
            Some(token) => ParseError::UnexpectedToken {
                found: describe_token(token),
                expected,
                span: token.span.clone(),
            },
            None => ParseError::UnexpectedEof {
                expected,
                at: self.source.len(),
            },
        }
    }

    fn span_of(&self, start: usize, end: usize) -> Span {
        let from = self.tokens[start].span.start;
        let to = self.tokens[end - 1].span.end.max(from);
        self.lines.span(from..to)
    }
}

fn describe_token(token: &Token<'_>) -> String {
    match token.kind {
        TokenKind::Ident => format!("'{}'", token.text),
        TokenKind::Var => format!("variable '{}'", token.text),
        kind => kind.to_string(),
    }
}

/// Derivation extraction over a recognised chart.
struct Forest<'p, 'src> {
    parser: &'p Parser<'src>,
    completed: &'p HashMap<(Nt, usize, usize), BTreeSet<usize>>,
    /// `(rule, symbol index, position, end)` suffixes known not to match
    failed: HashSet<(usize, usize, usize, usize)>,
}

impl<'p, 'src> Forest<'p, 'src> {
    fn build(&mut self, nt: Nt, start: usize, end: usize) -> Option<Node<'src>> {
        let rules: Vec<usize> = self.completed.get(&(nt, start, end))?.iter().copied().collect();
        for rule in rules {
            if let Some(children) = self.split(rule, 0, start, end) {
                return Some(Node {
                    kind: nt,
                    children,
                    span: self.parser.span_of(start, end),
                });
            }
        }
        None
    }

    /// Match `rhs[idx..]` of `rule` against tokens `pos..end`.
    fn split(&mut self, rule: usize, idx: usize, pos: usize, end: usize) -> Option<Vec<ParseNode<'src>>> {
        let parser: &'p Parser<'src> = self.parser;
        let rhs = &parser.grammar.rule(rule).rhs;
        if idx == rhs.len() {
            return (pos == end).then(Vec::new);
        }
        if pos >= end || self.failed.contains(&(rule, idx, pos, end)) {
            return None;
        }
        let remaining = rhs.len() - idx - 1;

        let found = match rhs[idx] {
            Symbol::T(terminal) => {
                let token = &parser.tokens[pos];
                if terminal.matches(token) {
                    self.split(rule, idx + 1, pos + 1, end).map(|mut rest| {
                        let leaf = match terminal {
                            Terminal::Word(_) => ParseNode::Keyword(token.clone()),
                            Terminal::Kind(_) => ParseNode::Leaf(token.clone()),
                        };
                        rest.insert(0, leaf);
                        rest
                    })
                } else {
                    None
                }
            }
            Symbol::N(nt) => {
                let mut found = None;
                let last = end.saturating_sub(remaining);
                for mid in pos + 1..=last {
                    if !self.completed.contains_key(&(nt, pos, mid)) {
                        continue;
                    }
                    let Some(mut rest) = self.split(rule, idx + 1, mid, end) else {
                        continue;
                    };
                    if let Some(child) = self.build(nt, pos, mid) {
                        rest.insert(0, ParseNode::Node(child));
                        found = Some(rest);
                        break;
                    }
                }
                found
            }
        };

        if found.is_none() {
            self.failed.insert((rule, idx, pos, end));
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(node: &Node<'_>) -> Vec<Nt> {
        node.nodes().map(|child| child.kind).collect()
    }

    fn items(tree: &ParseTree<'_>) -> Vec<Nt> {
        fn collect(node: &Node<'_>, out: &mut Vec<Nt>) {
            for child in node.nodes() {
                match child.kind {
                    Nt::Items => collect(child, out),
                    Nt::Item => out.extend(child.single().map(|n| n.kind)),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        collect(&tree.root, &mut out);
        out
    }

    #[test]
    fn empty_source_parses_to_empty_unit() {
        let tree = parse("# nothing here\n\n").unwrap();
        assert_eq!(tree.root.kind, Nt::Unit);
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn parses_top_level_items_in_order() {
        let source = r#"weave v1
model main = "anthropic/claude"
prompt greet: "Hello $input"
agent:
    instruction greet
flow main:
    $r = run agent default with $input
    return $r
"#;
        let tree = parse(source).unwrap();
        assert_eq!(kinds(&tree.root), vec![Nt::Version, Nt::Items]);
        assert_eq!(
            items(&tree),
            vec![Nt::ModelDef, Nt::PromptDef, Nt::AgentDef, Nt::FlowDef]
        );
    }

    #[test]
    fn nodes_carry_line_and_column() {
        let source = "model main = \"x\"\n\nagent a:\n    instruction p\n";
        let tree = parse(source).unwrap();
        let items = tree.root.child(Nt::Items).unwrap();
        let agent = items.child(Nt::Item).and_then(|item| item.single());
        // left-recursive list: the last item is the direct Item child
        assert_eq!(agent.map(|node| node.kind), Some(Nt::AgentDef));
        assert_eq!(agent.map(|node| (node.span.line, node.span.column)), Some((3, 1)));
    }

    #[test]
    fn keywords_remain_usable_as_names() {
        let source = "schema model:\n    description: string\n    list: list[int]?\n";
        assert!(parse(source).is_ok());
    }

    #[test]
    fn reports_unexpected_token_with_expectations() {
        let err = parse("agent a:\n    instruction\n").unwrap_err();
        match &err {
            ParseError::UnexpectedToken { found, expected, .. } => {
                assert_eq!(found, "newline");
                assert_eq!(expected, &vec!["identifier".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.code(), DiagnosticCode::E0007);
        let diag = err.to_diagnostic("a.wv", "agent a:\n    instruction\n");
        assert_eq!((diag.line, diag.column), (2, 16));
    }

    #[test]
    fn indentation_errors_map_to_e0008() {
        let source = "flow f:\n    loop do\n        continue\n      end\n";
        let err = parse(source).unwrap_err();
        assert_eq!(err.code(), DiagnosticCode::E0008);
        let diag = err.to_diagnostic("f.wv", source);
        assert_eq!((diag.line, diag.column), (4, 7));
    }

    #[test]
    fn invalid_character_is_e0007() {
        let err = parse("agent @a:\n").unwrap_err();
        assert!(matches!(err, ParseError::Lex(_)));
        assert_eq!(err.code(), DiagnosticCode::E0007);
    }

    #[test]
    fn unexpected_end_of_input() {
        let err = parse("flow main:\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn operator_precedence_binds_comparison_tighter_than_and() {
        let source = "flow f:\n    $x = $a == 1 and not $b\n";
        let tree = parse(source).unwrap();
        let text = format!("{:?}", tree.root);
        assert!(text.contains("AndExpr"));
        assert!(text.contains("CmpExpr"));
    }
}

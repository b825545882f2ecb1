//! Weave Lexer
//!
//! Tokenizes weave source using `logos`. Keywords are contextual: they are
//! produced as [`TokenKind::Ident`] and recognised by the grammar, so names
//! such as `description` or `model` stay usable as property and field names.
//!
//! Newlines are significant and emitted as [`TokenKind::Newline`]; leading
//! whitespace is skipped here and turned into [`TokenKind::Indent`] /
//! [`TokenKind::Dedent`] by the [`crate::indenter`].
//!
//! # Token Categories
//!
//! - **Names**: identifiers (including keywords) and `$variables`
//! - **Literals**: strings, triple-quoted strings, integers, floats
//! - **Operators**: `=`, `==`, `!=`, `<`, `<=`, `>`, `>=`, `~`, `->`, `+`, `-`, `?`
//! - **Delimiters**: `:`, `,`, `.`, `(`, `)`, `[`, `]`, `{`, `}`
//! - **Layout**: newline, plus synthetic indent/dedent

use logos::Logos;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// A token with its kind, span, and source slice
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub span: Range<usize>,
    pub text: &'src str,
}

impl<'src> Token<'src> {
    pub fn new(kind: TokenKind, span: Range<usize>, text: &'src str) -> Self {
        Self { kind, span, text }
    }

    /// Zero-width token inserted by the indenter.
    pub fn synthetic(kind: TokenKind, at: usize) -> Self {
        Self {
            kind,
            span: at..at,
            text: "",
        }
    }

    /// Punctuation and layout carry no payload for the AST.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Newline
                | TokenKind::Indent
                | TokenKind::Dedent
                | TokenKind::Colon
                | TokenKind::Comma
                | TokenKind::Dot
                | TokenKind::Eq
                | TokenKind::Arrow
                | TokenKind::LParen
                | TokenKind::RParen
                | TokenKind::LBracket
                | TokenKind::RBracket
                | TokenKind::LBrace
                | TokenKind::RBrace
        )
    }
}

/// All token types in the weave language
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\f]+")]
#[logos(skip r"#[^\n]*")]
pub enum TokenKind {
    // ==========================================================================
    // Names
    // ==========================================================================
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*")]
    Var,

    // ==========================================================================
    // Literals
    // ==========================================================================
    /// String literal: "..." (handles escape sequences, single line)
    #[regex(r#""([^"\\\n]|\\.)*""#)]
    StringLiteral,

    /// Triple-quoted string literal, may span lines
    #[regex(r#""""([^"]|"[^"]|""[^"])*""""#)]
    TripleString,

    #[regex(r"[0-9]+", priority = 3)]
    IntLiteral,

    #[regex(r"[0-9]+\.[0-9]+")]
    FloatLiteral,

    // ==========================================================================
    // Operators
    // ==========================================================================
    #[token("->")]
    Arrow,

    #[token("=")]
    Eq,

    #[token("==")]
    EqEq,

    #[token("!=")]
    NotEq,

    #[token("<")]
    Lt,

    #[token("<=")]
    LtEq,

    #[token(">")]
    Gt,

    #[token(">=")]
    GtEq,

    #[token("~")]
    Tilde,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("?")]
    Question,

    // ==========================================================================
    // Delimiters
    // ==========================================================================
    #[token(":")]
    Colon,

    #[token(",")]
    Comma,

    #[token(".")]
    Dot,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    // ==========================================================================
    // Layout
    // ==========================================================================
    #[regex(r"\r?\n")]
    Newline,

    /// Block start, produced by the indenter
    Indent,

    /// Block end, produced by the indenter
    Dedent,
}

impl TokenKind {
    /// Opening delimiters suspend layout until closed.
    pub fn opens_group(&self) -> bool {
        matches!(self, TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace)
    }

    pub fn closes_group(&self) -> bool {
        matches!(self, TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident => write!(f, "identifier"),
            TokenKind::Var => write!(f, "variable"),
            TokenKind::StringLiteral => write!(f, "string literal"),
            TokenKind::TripleString => write!(f, "triple-quoted string"),
            TokenKind::IntLiteral => write!(f, "integer"),
            TokenKind::FloatLiteral => write!(f, "float"),
            TokenKind::Arrow => write!(f, "'->'"),
            TokenKind::Eq => write!(f, "'='"),
            TokenKind::EqEq => write!(f, "'=='"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::LtEq => write!(f, "'<='"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::GtEq => write!(f, "'>='"),
            TokenKind::Tilde => write!(f, "'~'"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Question => write!(f, "'?'"),
            TokenKind::Colon => write!(f, "':'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBracket => write!(f, "'['"),
            TokenKind::RBracket => write!(f, "']'"),
            TokenKind::LBrace => write!(f, "'{{'"),
            TokenKind::RBrace => write!(f, "'}}'"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Indent => write!(f, "indented block"),
            TokenKind::Dedent => write!(f, "end of block"),
        }
    }
}

/// Lexer for weave source code
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, TokenKind>,
    source: &'src str,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'src str) -> Self {
        Self {
            inner: TokenKind::lexer(source),
            source,
        }
    }

    /// Get the original source code
    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Tokenize the entire source, stopping at the first invalid character.
    pub fn tokenize(self) -> Result<Vec<Token<'src>>, LexError> {
        self.collect()
    }
}

/// Error during lexical analysis
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unexpected character(s) '{text}'")]
pub struct LexError {
    pub span: Range<usize>,
    pub text: String,
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Result<Token<'src>, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kind = self.inner.next()?;
        let span = self.inner.span();
        let text = self.inner.slice();

        match kind {
            Ok(kind) => Some(Ok(Token::new(kind, span, text))),
            Err(_) => Some(Err(LexError {
                span,
                text: text.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .filter_map(|r| r.ok())
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_are_identifiers() {
        assert_eq!(
            tokenize("model agent flow description"),
            vec![TokenKind::Ident, TokenKind::Ident, TokenKind::Ident, TokenKind::Ident]
        );
    }

    #[test]
    fn test_variables() {
        let tokens: Vec<_> = Lexer::new("$input $review_2").filter_map(|r| r.ok()).collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[1].text, "$review_2");
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokenize("= == != < <= > >= ~ ->"),
            vec![
                TokenKind::Eq,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::LtEq,
                TokenKind::Gt,
                TokenKind::GtEq,
                TokenKind::Tilde,
                TokenKind::Arrow
            ]
        );
        assert_eq!(tokenize("+ - ?"), vec![TokenKind::Plus, TokenKind::Minus, TokenKind::Question]);
    }

    #[test]
    fn test_delimiters() {
        assert_eq!(
            tokenize(": , . ( ) [ ] { }"),
            vec![
                TokenKind::Colon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::LBrace,
                TokenKind::RBrace
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(tokenize("42"), vec![TokenKind::IntLiteral]);
        assert_eq!(tokenize("3.14"), vec![TokenKind::FloatLiteral]);
        assert_eq!(tokenize(r#""hello world""#), vec![TokenKind::StringLiteral]);
        assert_eq!(tokenize(r#""escaped \"quote\"""#), vec![TokenKind::StringLiteral]);
        assert_eq!(tokenize(r#""" """#), vec![TokenKind::StringLiteral, TokenKind::StringLiteral]);
    }

    #[test]
    fn test_triple_quoted_spans_lines() {
        let source = "\"\"\"\n  Review: $input\n  \"\"\"\n";
        let tokens: Vec<_> = Lexer::new(source).filter_map(|r| r.ok()).collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::TripleString);
        assert_eq!(tokens[1].kind, TokenKind::Newline);
    }

    #[test]
    fn test_comments_and_newlines() {
        assert_eq!(
            tokenize("model # trailing comment\n# full line\nflow"),
            vec![
                TokenKind::Ident,
                TokenKind::Newline,
                TokenKind::Newline,
                TokenKind::Ident
            ]
        );
    }

    #[test]
    fn test_invalid_character() {
        let err = Lexer::new("agent @x").tokenize().unwrap_err();
        assert_eq!(err.text, "@");
        assert_eq!(err.span, 6..7);
    }

    #[test]
    fn test_agent_header() {
        assert_eq!(
            tokenize("agent reviewer:\n    instruction review_code\n"),
            vec![
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Newline
            ]
        );
    }
}

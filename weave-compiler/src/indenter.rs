//! Block indenter
//!
//! Rewrites the raw token stream so that significant leading whitespace
//! becomes explicit [`TokenKind::Indent`] / [`TokenKind::Dedent`] markers.
//! The grammar can then treat indented blocks like bracketed ones.
//!
//! Rules:
//! - Blank and comment-only lines produce nothing.
//! - Inside `()`, `[]` and `{}` newlines and indentation are ignored.
//! - A dedent must land on the depth of an enclosing block.
//! - End of input closes the last line and every open block.

use crate::lexer::{Token, TokenKind};
use std::ops::Range;
use thiserror::Error;

/// Columns a tab advances to (next multiple of this width).
pub const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndentError {
    #[error("unexpected indentation")]
    UnexpectedIndent { span: Range<usize> },

    #[error("unindent to column {width} does not match any outer indentation level")]
    Mismatch { span: Range<usize>, width: usize },
}

impl IndentError {
    pub fn span(&self) -> Range<usize> {
        match self {
            IndentError::UnexpectedIndent { span } | IndentError::Mismatch { span, .. } => {
                span.clone()
            }
        }
    }
}

/// Width of a run of leading whitespace.
pub fn indent_width(prefix: &str) -> usize {
    prefix.chars().fold(0, |width, ch| match ch {
        '\t' => (width / TAB_WIDTH + 1) * TAB_WIDTH,
        ' ' => width + 1,
        _ => width,
    })
}

/// Insert block markers into `tokens`, measuring indentation in `source`.
pub fn indent<'src>(
    source: &'src str,
    tokens: Vec<Token<'src>>,
) -> Result<Vec<Token<'src>>, IndentError> {
    let mut out = Vec::with_capacity(tokens.len() + 8);
    let mut levels = vec![0usize];
    let mut groups = 0usize;
    let mut at_line_start = true;
    let mut line_start = 0usize;

    for token in tokens {
        if token.kind == TokenKind::Newline {
            if groups > 0 {
                continue;
            }
            if !at_line_start {
                out.push(token.clone());
                at_line_start = true;
            }
            line_start = token.span.end;
            continue;
        }

        if at_line_start && groups == 0 {
            let prefix = source.get(line_start..token.span.start).unwrap_or("");
            let width = indent_width(prefix);
            let current = levels.last().copied().unwrap_or(0);

            if width > current {
                if out.is_empty() {
                    return Err(IndentError::UnexpectedIndent {
                        span: token.span.clone(),
                    });
                }
                levels.push(width);
                out.push(Token::synthetic(TokenKind::Indent, token.span.start));
            } else if width < current {
                while levels.last().is_some_and(|&level| level > width) {
                    levels.pop();
                    out.push(Token::synthetic(TokenKind::Dedent, token.span.start));
                }
                if levels.last().copied().unwrap_or(0) != width {
                    return Err(IndentError::Mismatch {
                        span: token.span.clone(),
                        width,
                    });
                }
            }
            at_line_start = false;
        }

        if token.kind.opens_group() {
            groups += 1;
        } else if token.kind.closes_group() {
            groups = groups.saturating_sub(1);
        }
        out.push(token);
    }

    let end = source.len();
    if !at_line_start {
        out.push(Token::synthetic(TokenKind::Newline, end));
    }
    for _ in 1..levels.len() {
        out.push(Token::synthetic(TokenKind::Dedent, end));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use TokenKind::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let tokens = Lexer::new(source).tokenize().unwrap();
        indent(source, tokens).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn nested_blocks() {
        let source = "agent a:\n    instruction p\nflow f:\n    return 1\n";
        assert_eq!(
            kinds(source),
            vec![
                Ident, Ident, Colon, Newline, Indent, Ident, Ident, Newline, Dedent, Ident, Ident,
                Colon, Newline, Indent, Ident, IntLiteral, Newline, Dedent
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_collapse() {
        let source = "flow f:\n\n    # note\n    return 1\n\n";
        assert_eq!(
            kinds(source),
            vec![Ident, Ident, Colon, Newline, Indent, Ident, IntLiteral, Newline, Dedent]
        );
    }

    #[test]
    fn closes_blocks_at_eof_without_newline() {
        assert_eq!(
            kinds("flow f:\n    loop do\n        continue"),
            vec![
                Ident, Ident, Colon, Newline, Indent, Ident, Ident, Newline, Indent, Ident,
                Newline, Dedent, Dedent
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let source = "flow f:\n    $x = [\n  1,\n        2]\n";
        assert_eq!(
            kinds(source),
            vec![
                Ident, Ident, Colon, Newline, Indent, Var, Eq, LBracket, IntLiteral, Comma,
                IntLiteral, RBracket, Newline, Dedent
            ]
        );
    }

    #[test]
    fn tabs_expand_to_tab_width() {
        assert_eq!(indent_width("\t"), 4);
        assert_eq!(indent_width("  \t"), 4);
        assert_eq!(indent_width("    \t "), 9);
        let source = "flow f:\n\treturn 1\n";
        assert!(kinds(source).contains(&Indent));
    }

    #[test]
    fn mismatched_dedent_is_an_error() {
        let source = "flow f:\n    loop do\n        continue\n      end\n";
        let tokens = Lexer::new(source).tokenize().unwrap();
        let err = indent(source, tokens).unwrap_err();
        assert!(matches!(err, IndentError::Mismatch { width: 6, .. }));
        assert_eq!(&source[err.span()], "end");
    }

    #[test]
    fn indented_first_line_is_an_error() {
        let source = "  model main = \"x\"\n";
        let tokens = Lexer::new(source).tokenize().unwrap();
        assert!(matches!(
            indent(source, tokens),
            Err(IndentError::UnexpectedIndent { .. })
        ));
    }
}

//! Compiler diagnostics.
//!
//! Every problem the compiler reports is a [`Diagnostic`] carrying a stable
//! [`DiagnosticCode`], a 1-based line/column position and an optional help
//! line. [`Diagnostic::render`] produces the familiar compiler layout:
//!
//! ```text
//! error[E0001]: undefined agent 'helper'
//!   --> review.wv:12:20
//!    |
//! 12 |     $r = run agent helper with $input
//!    |                    ^^^^^^
//!    = help: defined agents are: fixer, reviewer
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Stable diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// Reference to an undefined model, tool, agent, prompt, flow, schema or policy.
    E0001,
    /// Variable read before any write in scope.
    E0002,
    /// Duplicate definition of the same kind.
    E0003,
    /// Type mismatch, including invalid schema field types.
    E0004,
    /// Imported file not found.
    E0005,
    /// Circular import.
    E0006,
    /// Invalid or unexpected token.
    E0007,
    /// Indentation does not match any enclosing block.
    E0008,
    /// Guardrail action not allowed in its handler.
    E0009,
    /// Missing required property.
    E0010,
    /// Circular agent reference through `delegate`/`use`.
    E0011,
    /// Guardrail pattern is not a valid regular expression.
    E0012,
    /// Statement not allowed in its enclosing block.
    E0013,
    /// Agent declares both `delegate` and `use`.
    W0002,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::E0001 => "E0001",
            DiagnosticCode::E0002 => "E0002",
            DiagnosticCode::E0003 => "E0003",
            DiagnosticCode::E0004 => "E0004",
            DiagnosticCode::E0005 => "E0005",
            DiagnosticCode::E0006 => "E0006",
            DiagnosticCode::E0007 => "E0007",
            DiagnosticCode::E0008 => "E0008",
            DiagnosticCode::E0009 => "E0009",
            DiagnosticCode::E0010 => "E0010",
            DiagnosticCode::E0011 => "E0011",
            DiagnosticCode::E0012 => "E0012",
            DiagnosticCode::E0013 => "E0013",
            DiagnosticCode::W0002 => "W0002",
        }
    }

    /// Default severity for the code.
    pub fn severity(&self) -> Severity {
        match self {
            DiagnosticCode::W0002 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Short human title, used by `--explain` style listings.
    pub fn title(&self) -> &'static str {
        match self {
            DiagnosticCode::E0001 => "undefined reference",
            DiagnosticCode::E0002 => "variable used before definition",
            DiagnosticCode::E0003 => "duplicate definition",
            DiagnosticCode::E0004 => "type mismatch",
            DiagnosticCode::E0005 => "import not found",
            DiagnosticCode::E0006 => "circular import",
            DiagnosticCode::E0007 => "invalid token",
            DiagnosticCode::E0008 => "indentation mismatch",
            DiagnosticCode::E0009 => "invalid guardrail action",
            DiagnosticCode::E0010 => "missing required property",
            DiagnosticCode::E0011 => "circular agent reference",
            DiagnosticCode::E0012 => "invalid guardrail pattern",
            DiagnosticCode::E0013 => "statement not allowed here",
            DiagnosticCode::W0002 => "agent has both delegate and use",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single compiler message tied to a source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub file: String,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    /// Width of the offending span in characters (at least 1 when rendered)
    #[serde(default)]
    pub length: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn new(
        code: DiagnosticCode,
        file: impl Into<String>,
        line: usize,
        column: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: code.severity(),
            code,
            file: file.into(),
            line,
            column,
            length: 1,
            message: message.into(),
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render with a source snippet and a caret line under the offending span.
    ///
    /// `source` is the full text of `self.file`. When the line is out of range
    /// the snippet is omitted and only the header and location are printed.
    pub fn render(&self, source: &str) -> String {
        let mut out = format!("{}[{}]: {}\n", self.severity, self.code, self.message);
        let gutter = self.line.to_string().len();
        out.push_str(&format!(
            "{:>width$}--> {}:{}:{}\n",
            "",
            self.file,
            self.line,
            self.column,
            width = gutter
        ));

        if let Some(text) = source.lines().nth(self.line.saturating_sub(1)) {
            let text = text.trim_end_matches('\r');
            let lead = self.column.saturating_sub(1);
            let available = text.chars().count().saturating_sub(lead);
            let carets = self.length.clamp(1, available.max(1));

            out.push_str(&format!("{:>width$} |\n", "", width = gutter));
            out.push_str(&format!("{} | {}\n", self.line, text));
            out.push_str(&format!(
                "{:>width$} | {}{}\n",
                "",
                " ".repeat(lead),
                "^".repeat(carets),
                width = gutter
            ));
        }

        if let Some(help) = &self.help {
            out.push_str(&format!("{:>width$} = help: {}\n", "", help, width = gutter));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}[{}]: {}",
            self.file, self.line, self.column, self.severity, self.code, self.message
        )
    }
}

/// Sort diagnostics by position, errors before warnings on the same spot.
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| {
        (a.line, a.column, a.severity).cmp(&(b.line, b.column, b.severity))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_snippet_with_caret() {
        let source = "agent a:\n    instruction missing\n";
        let diag = Diagnostic::new(DiagnosticCode::E0001, "a.wv", 2, 17, "undefined prompt 'missing'")
            .with_length(7)
            .with_help("defined prompts are: greet");

        insta::assert_snapshot!(diag.render(source).trim_end(), @r###"
        error[E0001]: undefined prompt 'missing'
         --> a.wv:2:17
          |
        2 |     instruction missing
          |                 ^^^^^^^
          = help: defined prompts are: greet
        "###);
    }

    #[test]
    fn warning_codes_default_to_warning_severity() {
        let diag = Diagnostic::new(DiagnosticCode::W0002, "a.wv", 1, 1, "mixed");
        assert!(!diag.is_error());
        assert_eq!(diag.to_string(), "a.wv:1:1: warning[W0002]: mixed");
    }

    #[test]
    fn out_of_range_line_skips_snippet() {
        let diag = Diagnostic::new(DiagnosticCode::E0007, "a.wv", 9, 1, "unexpected end of input");
        let rendered = diag.render("flow main:\n");
        assert_eq!(rendered.lines().count(), 2);
    }

    #[test]
    fn sorts_by_position() {
        let mut diags = vec![
            Diagnostic::new(DiagnosticCode::E0001, "a.wv", 5, 2, "b"),
            Diagnostic::new(DiagnosticCode::W0002, "a.wv", 1, 1, "w"),
            Diagnostic::new(DiagnosticCode::E0003, "a.wv", 1, 1, "a"),
        ];
        sort_diagnostics(&mut diags);
        let codes: Vec<_> = diags.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec![DiagnosticCode::E0003, DiagnosticCode::W0002, DiagnosticCode::E0001]);
    }
}

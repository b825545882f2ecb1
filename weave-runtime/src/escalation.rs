//! Escalation conditions on prompt output
//!
//! A prompt may declare `escalate if OP "literal"`. `==` and `!=` compare the
//! raw output, trailing newlines included. The `~` operator compares
//! normalized text: markdown emphasis and punctuation removed, lowercased,
//! whitespace collapsed. The same normalization backs the `~` expression
//! operator in flows.

use weave_core::{EscalationCondition, EscalationOp};

/// Normalized form of `text` used by `~`. Emphasis markers (`*`, `_`, `~`,
/// backticks) are punctuation, so one pass removes both.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `a ~ b`
pub fn similar(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Whether `output` triggers the condition.
pub fn matches(condition: &EscalationCondition, output: &str) -> bool {
    match condition.op {
        EscalationOp::Equals => output == condition.literal,
        EscalationOp::NotEquals => output != condition.literal,
        EscalationOp::Similar => similar(output, &condition.literal),
        EscalationOp::Contains => output.contains(&condition.literal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(op: EscalationOp, literal: &str) -> EscalationCondition {
        EscalationCondition {
            op,
            literal: literal.to_string(),
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("**Drifting.**\n"), "drifting");
        assert_eq!(normalize("  Needs   `human`\treview! "), "needs human review");
        assert_eq!(normalize("__STOP__"), "stop");
    }

    #[test]
    fn test_similar_ignores_markup_and_case() {
        assert!(similar("**Drifting.**\n", "DRIFTING"));
        assert!(!similar("I am drifting", "DRIFTING"));
    }

    #[test]
    fn test_condition_operators() {
        let output = "**Drifting.**\n";
        assert!(!matches(&cond(EscalationOp::Equals, "DRIFTING"), output));
        assert!(matches(&cond(EscalationOp::Similar, "DRIFTING"), output));
        assert!(matches(&cond(EscalationOp::NotEquals, "DRIFTING"), output));
        assert!(matches(&cond(EscalationOp::Contains, "Drift"), output));
        assert!(matches(&cond(EscalationOp::Equals, "done"), "done"));
        assert!(!matches(&cond(EscalationOp::Equals, "done"), "done\n"));
        assert!(matches(&cond(EscalationOp::NotEquals, "done"), " done"));
    }
}

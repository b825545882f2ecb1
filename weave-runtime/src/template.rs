//! Prompt template rendering
//!
//! Prompt text refers to workflow variables as `$name` or `$name.a.b`.
//! Rendering is deterministic: strings are inserted verbatim, other values as
//! compact JSON. Placeholders that cannot be resolved stay in the text and are
//! reported back to the caller.

use crate::context::{lookup_field, value_text};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
        .expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub rendered: String,
    pub substitutions: usize,
    /// Placeholders left in place because nothing was bound to them
    pub unresolved: Vec<String>,
}

/// Substitute `$var` placeholders from `bindings`.
pub fn render(template: &str, bindings: &HashMap<String, Value>) -> RenderResult {
    let mut substitutions = 0;
    let mut unresolved = Vec::new();

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let whole = caps[0].to_string();
        let path: Vec<String> = caps[2]
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let value = bindings
            .get(&caps[1])
            .and_then(|root| lookup_field(root, &path));
        match value {
            Some(value) => {
                substitutions += 1;
                value_text(&value)
            }
            None => {
                unresolved.push(whole.clone());
                whole
            }
        }
    });

    if unresolved.is_empty() {
        debug!(substitutions, "template rendered");
    } else {
        warn!(?unresolved, "template has unresolved placeholders");
    }

    RenderResult {
        rendered: rendered.into_owned(),
        substitutions,
        unresolved,
    }
}

/// Whether the template mentions `$name` (with or without a path).
pub fn references(template: &str, name: &str) -> bool {
    PLACEHOLDER
        .captures_iter(template)
        .any(|caps| &caps[1] == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_variables_and_paths() {
        let vars = bindings(&[
            ("input", json!("the diff")),
            ("user", json!({"name": "ada", "langs": ["rust", "ml"]})),
        ]);
        let result = render("Review $input for $user.name ($user.langs)", &vars);
        assert_eq!(result.rendered, "Review the diff for ada ([\"rust\",\"ml\"])");
        assert_eq!(result.substitutions, 3);
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn test_unresolved_placeholders_stay() {
        let vars = bindings(&[("input", json!(1))]);
        let result = render("Cost: $price, item $input.name", &vars);
        assert_eq!(result.rendered, "Cost: $price, item $input.name");
        assert_eq!(result.unresolved, vec!["$price", "$input.name"]);
    }

    #[test]
    fn test_trailing_dot_is_text() {
        let vars = bindings(&[("input", json!("x"))]);
        assert_eq!(render("Answer $input.", &vars).rendered, "Answer x.");
    }

    #[test]
    fn test_references() {
        assert!(references("Summarize $input.text", "input"));
        assert!(!references("Summarize $inputs", "input"));
    }
}

//! Pattern-based guardrails
//!
//! Two guardrails are always available: `pii` (emails, phone numbers, card and
//! social security numbers) and `jailbreak` (common prompt-injection phrases).
//! Workflows add their own with `guardrail NAME = regex "..."`.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};
use weave_core::GuardrailSpec;

pub const PII: &str = "pii";
pub const JAILBREAK: &str = "jailbreak";

const PII_PATTERNS: &[&str] = &[
    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
    r"\b\d{3}-\d{2}-\d{4}\b",
    r"\b(?:\d[ -]?){13,16}\b",
    r"(?:\+?\d{1,3}[ .-]?)?\(?\b\d{3}\)?[ .-]?\d{3}[ .-]?\d{4}\b",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Phrases matched case-insensitively by the `jailbreak` guardrail
    pub jailbreak_phrases: Vec<String>,
    /// Replacement text for `mask`; `{name}` is the guardrail name in upper case
    pub mask_template: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            jailbreak_phrases: vec![
                "ignore previous instructions".to_string(),
                "ignore all previous".to_string(),
                "forget everything above".to_string(),
                "reveal your system prompt".to_string(),
                "jailbreak".to_string(),
                "DAN mode".to_string(),
                "developer mode".to_string(),
                "pretend you are".to_string(),
                "roleplay as".to_string(),
            ],
            mask_template: "[{name}]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GuardrailError {
    #[error("undefined guardrail '{0}'")]
    Unknown(String),

    #[error("guardrail '{name}' has an invalid pattern: {message}")]
    InvalidPattern { name: String, message: String },
}

#[derive(Debug, Clone)]
struct Guardrail {
    patterns: Vec<Regex>,
    replacement: String,
}

/// Compiled guardrails of one workflow.
#[derive(Debug, Clone, Default)]
pub struct GuardrailSet {
    rules: HashMap<String, Guardrail>,
}

impl GuardrailSet {
    /// Builtins plus the workflow's own definitions. A definition may shadow a builtin.
    pub fn new(
        config: &GuardrailConfig,
        specs: &HashMap<String, GuardrailSpec>,
    ) -> Result<Self, GuardrailError> {
        let mut rules = HashMap::new();
        let pii = PII_PATTERNS
            .iter()
            .map(|p| compile(PII, p, false))
            .collect::<Result<Vec<_>, _>>()?;
        rules.insert(PII.to_string(), guardrail(config, PII, pii));

        let jailbreak = config
            .jailbreak_phrases
            .iter()
            .map(|phrase| compile(JAILBREAK, &regex::escape(phrase), true))
            .collect::<Result<Vec<_>, _>>()?;
        rules.insert(JAILBREAK.to_string(), guardrail(config, JAILBREAK, jailbreak));

        for spec in specs.values() {
            let pattern = compile(&spec.name, &spec.pattern, false)?;
            rules.insert(spec.name.clone(), guardrail(config, &spec.name, vec![pattern]));
        }
        debug!(guardrails = rules.len(), "guardrails compiled");
        Ok(Self { rules })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Whether `text` trips the guardrail.
    pub fn check(&self, name: &str, text: &str) -> Result<bool, GuardrailError> {
        let rule = self.rule(name)?;
        let hit = rule.patterns.iter().any(|p| p.is_match(text));
        if hit {
            warn!(
                guardrail = %name,
                preview = %preview(text),
                "guardrail matched"
            );
        }
        Ok(hit)
    }

    /// Replace every match with the guardrail's mask.
    pub fn mask(&self, name: &str, text: &str) -> Result<String, GuardrailError> {
        let rule = self.rule(name)?;
        let mut masked = text.to_string();
        for pattern in &rule.patterns {
            masked = pattern
                .replace_all(&masked, regex::NoExpand(&rule.replacement))
                .into_owned();
        }
        Ok(masked)
    }

    fn rule(&self, name: &str) -> Result<&Guardrail, GuardrailError> {
        self.rules
            .get(name)
            .ok_or_else(|| GuardrailError::Unknown(name.to_string()))
    }
}

fn compile(name: &str, pattern: &str, ignore_case: bool) -> Result<Regex, GuardrailError> {
    RegexBuilder::new(pattern)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| GuardrailError::InvalidPattern {
            name: name.to_string(),
            message: e.to_string(),
        })
}

fn guardrail(config: &GuardrailConfig, name: &str, patterns: Vec<Regex>) -> Guardrail {
    Guardrail {
        patterns,
        replacement: config.mask_template.replace("{name}", &name.to_uppercase()),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(60).collect()
}

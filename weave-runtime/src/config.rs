//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempts allowed for a structured (schema-expecting) model call.
pub const SCHEMA_ATTEMPTS: u32 = 3;

/// Model used when a workflow defines no model named `main`.
pub const DEFAULT_MODEL: &str = "mock/default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on model turns within one agent invocation
    pub max_turns: u32,
    /// Applied to agents that declare no timeout policy
    pub default_timeout: Option<Duration>,
    /// Attempts for schema-validated responses, including the first
    pub schema_attempts: u32,
    /// Base delay fed to retry policies
    pub retry_base_delay: Duration,
    /// Provider-qualified model for the implicit `main` model
    pub default_model: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            default_timeout: None,
            schema_attempts: SCHEMA_ATTEMPTS,
            retry_base_delay: Duration::from_millis(500),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `WEAVE_MAX_TURNS`, `WEAVE_DEFAULT_TIMEOUT_SECS`,
    /// `WEAVE_RETRY_BASE_MS` and `WEAVE_DEFAULT_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(turns) = env_parse::<u32>("WEAVE_MAX_TURNS") {
            config.max_turns = turns.max(1);
        }
        if let Some(secs) = env_parse::<u64>("WEAVE_DEFAULT_TIMEOUT_SECS") {
            config.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = env_parse::<u64>("WEAVE_RETRY_BASE_MS") {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Ok(model) = std::env::var("WEAVE_DEFAULT_MODEL") {
            if !model.trim().is_empty() {
                config.default_model = model.trim().to_string();
            }
        }
        config
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.schema_attempts, 3);
        assert_eq!(config.max_turns, 10);
        assert!(config.default_timeout.is_none());
    }

    #[test]
    fn test_builders_clamp_turns() {
        let config = RuntimeConfig::default()
            .with_max_turns(0)
            .with_default_timeout(Duration::from_secs(5));
        assert_eq!(config.max_turns, 1);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(5)));
    }
}

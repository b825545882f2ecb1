//! Tracing setup
//!
//! Runtime code logs through `tracing`; every run opens a `run` span carrying
//! its execution id, so agent turns, tool calls and model requests of one run
//! can be told apart. Embedding applications install their own subscriber or
//! call [`init_telemetry`].

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported once at startup
    pub service_name: String,
    pub service_version: String,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Whether to enable console output
    pub console_output: bool,
    /// Prefix console lines with a timestamp
    pub timestamps: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "weave-runtime".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            default_filter: std::env::var("WEAVE_LOG").unwrap_or_else(|_| "info".to_string()),
            console_output: true,
            timestamps: true,
        }
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let console = config.console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.timestamps {
        registry.with(console).try_init()?;
    } else {
        registry
            .with(console.map(|layer| layer.without_time()))
            .try_init()?;
    }

    info!(
        service = %config.service_name,
        version = %config.service_version,
        filter = %config.default_filter,
        "Telemetry initialized"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

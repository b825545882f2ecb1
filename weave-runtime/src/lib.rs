//! Weave Runtime Library
//!
//! Executes workflows compiled by `weave-compiler`. A [`WorkflowContext`]
//! pairs a [`CompiledWorkflow`](weave_core::CompiledWorkflow) with an
//! [`LlmClient`] and runs flows, agents and prompts against it:
//!
//! - flows are interpreted statement by statement, with per-invocation scopes
//!   over run-wide globals set by the `on start` handler
//! - agents are materialized with their `delegate` and `use` sub-agents and
//!   loop over model turns until they produce a final answer
//! - prompts expecting a schema are validated and retried with the error fed
//!   back to the model
//! - guardrail handlers screen agent input, output and tool traffic
//!
//! Progress is reported as [`Event`]s, optionally streamed to the caller.

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod escalation;
pub mod eval;
pub mod events;
pub mod executor;
pub mod guardrail;
pub mod llm;
pub mod schema;
pub mod telemetry;
pub mod template;

pub use config::RuntimeConfig;
pub use context::{ExecutionContext, Scope};
pub use error::{RuntimeError, ValueError};
pub use events::{Event, EventStream};
pub use executor::{Invocation, RunHandle, WorkflowContext, WorkflowContextBuilder};
pub use guardrail::{GuardrailConfig, GuardrailSet};
pub use llm::{LlmClient, LlmError, LlmRequest, LlmResponse, MockLlmClient, MockReply};
pub use telemetry::{init_telemetry, TelemetryConfig};

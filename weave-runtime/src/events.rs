//! Progress events
//!
//! Every agent turn, tool call and flow step reports an [`Event`] as it
//! happens. Producers share an [`EventSink`]; a streaming run hands the
//! receiving half to the caller as an [`EventStream`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FlowStarted { flow: String },
    FlowFinished { flow: String, result: Value },
    AgentStarted { agent: String, input: String },
    /// Intermediate model text inside an agent loop
    ModelOutput { agent: String, text: String },
    ToolCall { agent: String, tool: String, input: String },
    ToolResult { agent: String, tool: String, output: String },
    Transfer { from: String, to: String },
    AgentFinished { agent: String, output: String },
    AgentClosed { agent: String, as_tool: bool },
    LlmCall { prompt: String, model: String, attempt: u32 },
    Escalated { source: String, output: String },
    GuardrailWarning { event: String, guardrail: String },
    Log { message: String },
}

pub type EventStream = UnboundedReceiverStream<Event>;

/// Sending half shared by everything inside one run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, UnboundedReceiverStream::new(rx))
    }

    /// A sink that drops every event.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            // receiver gone: the caller stopped listening
            let _ = tx.send(event);
        }
    }
}

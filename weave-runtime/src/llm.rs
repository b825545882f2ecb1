//! Model invocation service
//!
//! The runtime talks to language models only through [`LlmClient`]. Concrete
//! provider clients live outside this crate; [`MockLlmClient`] is a scripted,
//! deterministic client for tests and dry runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

// =============================================================================
// Providers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
    Mock,
    Other,
}

impl LlmProvider {
    /// Provider named by a qualified model string such as `anthropic/claude-sonnet`.
    pub fn for_model(model: &str) -> Self {
        let prefix = model.split('/').next().unwrap_or(model).to_lowercase();
        match prefix.as_str() {
            "openai" => LlmProvider::OpenAI,
            "anthropic" => LlmProvider::Anthropic,
            "mock" => LlmProvider::Mock,
            _ if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") => {
                LlmProvider::OpenAI
            }
            _ if model.starts_with("claude") => LlmProvider::Anthropic,
            _ => LlmProvider::Other,
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool or agent the message came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    /// A `use`d agent, called with an input and returning its answer
    Agent,
    /// A `delegate`; calling it hands the conversation over
    Transfer,
    /// A declared external tool
    External,
}

/// A tool offered to the model for this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub role: ToolRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Provider-qualified model, e.g. `anthropic/claude-sonnet`
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// All message text, in order.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Something the model asked the runtime to do instead of answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelAction {
    Call { tool: String, input: String },
    Transfer { agent: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ModelAction>,
    pub model: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

// =============================================================================
// LLM Client Trait
// =============================================================================

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn provider(&self) -> LlmProvider;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    RequestFailed(String),
    #[error("Rate limited: retry after {0}s")]
    RateLimited(u64),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Timeout after {0}s")]
    Timeout(u64),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

// =============================================================================
// Mock Client
// =============================================================================

/// One scripted model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Text(String),
    Call { tool: String, input: String },
    Transfer(String),
    Fail(String),
}

impl MockReply {
    pub fn text(content: impl Into<String>) -> Self {
        MockReply::Text(content.into())
    }

    pub fn call(tool: impl Into<String>, input: impl Into<String>) -> Self {
        MockReply::Call {
            tool: tool.into(),
            input: input.into(),
        }
    }

    pub fn transfer(agent: impl Into<String>) -> Self {
        MockReply::Transfer(agent.into())
    }
}

#[derive(Debug)]
struct MockRule {
    needle: String,
    /// Played in order; the last reply repeats
    replies: Mutex<VecDeque<MockReply>>,
    delay: Duration,
}

/// Mock LLM client for testing without real API calls
///
/// Features:
/// - Replies scripted per rule: the first rule whose text occurs anywhere in
///   the conversation answers, playing its replies in order
/// - Per-rule latency, to reorder concurrent completions
/// - Failure injection, permanent or for the first N requests
/// - A record of every request, for assertions
/// - A deterministic default reply derived from the conversation hash
#[derive(Debug)]
pub struct MockLlmClient {
    latency: Duration,
    rules: Vec<MockRule>,
    should_fail: bool,
    fail_count: AtomicU32,
    fail_until: u32,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            rules: Vec::new(),
            should_fail: false,
            fail_count: AtomicU32::new(0),
            fail_until: 0,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            ..Self::new()
        }
    }

    /// Answer conversations mentioning `needle` with `response`.
    pub fn with_response(self, needle: &str, response: &str) -> Self {
        self.with_replies(needle, vec![MockReply::text(response)])
    }

    /// Answer conversations mentioning `needle` with `replies`, one per request.
    pub fn with_replies(mut self, needle: &str, replies: Vec<MockReply>) -> Self {
        match self.rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => lock(&rule.replies).extend(replies),
            None => self.rules.push(MockRule {
                needle: needle.to_string(),
                replies: Mutex::new(replies.into()),
                delay: Duration::ZERO,
            }),
        }
        self
    }

    /// Delay replies of the rule for `needle`.
    pub fn with_delay(mut self, needle: &str, delay: Duration) -> Self {
        match self.rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.delay = delay,
            None => self.rules.push(MockRule {
                needle: needle.to_string(),
                replies: Mutex::new(VecDeque::new()),
                delay,
            }),
        }
        self
    }

    /// Configure to fail all requests (for error testing)
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Configure to fail N times before succeeding (for retry testing)
    pub fn fail_n_times(mut self, n: u32) -> Self {
        self.fail_until = n;
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Hash a conversation for the default reply
    fn hash_transcript(transcript: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(transcript.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn scripted(&self, transcript: &str) -> Option<(Option<MockReply>, Duration)> {
        let rule = self.rules.iter().find(|r| transcript.contains(&r.needle))?;
        let mut replies = lock(&rule.replies);
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        Some((reply, rule.delay))
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = Instant::now();
        lock(&self.requests).push(request.clone());

        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock failure mode enabled".to_string()));
        }

        if self.fail_until > 0 {
            let count = self.fail_count.fetch_add(1, Ordering::SeqCst);
            if count < self.fail_until {
                return Err(LlmError::RequestFailed(format!(
                    "Mock failure {}/{}",
                    count + 1,
                    self.fail_until
                )));
            }
        }

        let transcript = request.transcript();
        let (reply, delay) = self.scripted(&transcript).unwrap_or((None, Duration::ZERO));

        let latency = self.latency + delay;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (content, action) = match reply {
            Some(MockReply::Text(text)) => (text, None),
            Some(MockReply::Call { tool, input }) => {
                (String::new(), Some(ModelAction::Call { tool, input }))
            }
            Some(MockReply::Transfer(agent)) => (String::new(), Some(ModelAction::Transfer { agent })),
            Some(MockReply::Fail(message)) => return Err(LlmError::RequestFailed(message)),
            None => {
                let hash = Self::hash_transcript(&transcript);
                let last = request.last_user_message().unwrap_or_default();
                (format!("[mock {}] {}", &hash[..12], last), None)
            }
        };

        let input_tokens = (transcript.len() / 4) as u32;
        let output_tokens = (content.len() / 4) as u32 + 1;

        info!(
            model = %request.model,
            input_tokens,
            output_tokens,
            action = action.is_some(),
            "Mock LLM completion"
        );

        Ok(LlmResponse {
            content,
            action,
            model: request.model,
            provider: "mock".to_string(),
            input_tokens,
            output_tokens,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Mock
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(system: &str, user: &str) -> LlmRequest {
        LlmRequest::new(
            "mock/test",
            vec![Message::system(system), Message::user(user)],
        )
    }

    #[tokio::test]
    async fn test_mock_default_reply_is_deterministic() {
        let client = MockLlmClient::new();
        let a = client.complete(request("sys", "hello")).await.unwrap();
        let b = client.complete(request("sys", "hello")).await.unwrap();
        assert_eq!(a.content, b.content);
        assert!(a.content.ends_with("] hello"));
        assert_eq!(a.provider, "mock");
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_replies_play_in_order_then_repeat() {
        let client = MockLlmClient::new().with_replies(
            "You are the lead",
            vec![MockReply::call("checker", "draft"), MockReply::text("done")],
        );
        let first = client.complete(request("You are the lead", "go")).await.unwrap();
        assert_eq!(
            first.action,
            Some(ModelAction::Call {
                tool: "checker".to_string(),
                input: "draft".to_string()
            })
        );
        let second = client.complete(request("You are the lead", "go")).await.unwrap();
        assert_eq!(second.content, "done");
        let third = client.complete(request("You are the lead", "go")).await.unwrap();
        assert_eq!(third.content, "done");
    }

    #[tokio::test]
    async fn test_fail_n_times() {
        let client = MockLlmClient::new().fail_n_times(2);
        assert!(client.complete(request("s", "u")).await.is_err());
        assert!(client.complete(request("s", "u")).await.is_err());
        assert!(client.complete(request("s", "u")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_mode() {
        let client = MockLlmClient::new().with_failure();
        let err = client.complete(request("s", "u")).await.unwrap_err();
        assert_eq!(err, LlmError::RequestFailed("Mock failure mode enabled".to_string()));
    }

    #[test]
    fn test_provider_detection() {
        assert_eq!(LlmProvider::for_model("anthropic/claude-sonnet"), LlmProvider::Anthropic);
        assert_eq!(LlmProvider::for_model("openai/gpt-4o-mini"), LlmProvider::OpenAI);
        assert_eq!(LlmProvider::for_model("gpt-4o"), LlmProvider::OpenAI);
        assert_eq!(LlmProvider::for_model("mock/default"), LlmProvider::Mock);
        assert_eq!(LlmProvider::for_model("local/llama"), LlmProvider::Other);
    }

    #[test]
    fn test_request_helpers() {
        let mut req = request("be brief", "first");
        req.messages.push(Message::assistant("ok"));
        req.messages.push(Message::user("second"));
        assert_eq!(req.system_prompt(), Some("be brief"));
        assert_eq!(req.last_user_message(), Some("second"));
        assert_eq!(req.transcript(), "be brief\nfirst\nok\nsecond");
    }
}

//! Workflow execution
//!
//! A [`WorkflowContext`] binds a compiled workflow to a model client and
//! exposes its entry points: run a flow, run an agent, call a prompt. Each
//! call is one run with its own globals (set by the `on start` handler), its
//! own agent hierarchies and its own event sink.
//!
//! Flow bodies are interpreted directly from the compiled instruction tree.
//! Errors raised by a statement carry the statement's generated line and,
//! through the source-map registry, the position in the workflow source.

use crate::agent::{AgentHierarchy, AgentId};
use crate::config::RuntimeConfig;
use crate::context::{type_name, value_text, ExecutionContext, Scope};
use crate::error::{RuntimeError, ValueError};
use crate::escalation;
use crate::eval::{evaluate, loosely_equal, truthy};
use crate::events::{Event, EventSink, EventStream};
use crate::guardrail::{GuardrailConfig, GuardrailSet};
use crate::llm::{LlmClient, LlmRequest, LlmResponse, Message, ModelAction, Role};
use crate::schema::{CompiledSchema, SchemaError};
use crate::template;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use weave_core::{
    CompiledWorkflow, EscalateAction, GuardKind, HandlerEvent, Instr, IrExpr, ModelSpec, Op,
    ParallelCall, PromptSpec, RetryPolicy, SourceMapRegistry, FALLBACK_MODEL,
};

// =============================================================================
// Public API
// =============================================================================

/// Result of running an agent or calling a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Parsed value: the JSON object for schema prompts, otherwise the text
    pub value: Value,
    /// Final model text
    pub text: String,
    /// Whether the prompt's escalation condition matched
    pub escalated: bool,
}

/// A run executing in the background, reporting progress as it goes.
pub struct RunHandle {
    pub events: EventStream,
    task: JoinHandle<Result<Value, RuntimeError>>,
}

impl RunHandle {
    /// Wait for the run to finish. Events not yet read stay in the stream.
    pub async fn result(self) -> Result<Value, RuntimeError> {
        self.task
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))?
    }

    pub fn into_parts(self) -> (EventStream, JoinHandle<Result<Value, RuntimeError>>) {
        (self.events, self.task)
    }
}

struct Shared {
    unit: Arc<CompiledWorkflow>,
    client: Arc<dyn LlmClient>,
    config: RuntimeConfig,
    guardrails: GuardrailSet,
    schemas: HashMap<String, CompiledSchema>,
    source_maps: Option<Arc<SourceMapRegistry>>,
}

/// Execution context for one compiled workflow. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Arc<Shared>,
}

pub struct WorkflowContextBuilder {
    unit: Arc<CompiledWorkflow>,
    client: Arc<dyn LlmClient>,
    config: RuntimeConfig,
    guardrails: GuardrailConfig,
    source_maps: Option<Arc<SourceMapRegistry>>,
}

impl WorkflowContextBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn guardrails(mut self, guardrails: GuardrailConfig) -> Self {
        self.guardrails = guardrails;
        self
    }

    /// Registry used to translate error positions back to workflow source.
    pub fn source_maps(mut self, registry: Arc<SourceMapRegistry>) -> Self {
        self.source_maps = Some(registry);
        self
    }

    pub fn build(self) -> Result<WorkflowContext, RuntimeError> {
        let guardrails = GuardrailSet::new(&self.guardrails, &self.unit.guardrails)?;
        let schemas = self
            .unit
            .schemas
            .values()
            .map(|spec| CompiledSchema::new(spec).map(|schema| (spec.name.clone(), schema)))
            .collect::<Result<HashMap<_, _>, SchemaError>>()?;

        let stats = self.unit.stats();
        info!(
            workflow = %self.unit.source_name,
            provider = ?self.client.provider(),
            agents = stats.agents,
            flows = stats.flows,
            "workflow context ready"
        );

        Ok(WorkflowContext {
            shared: Arc::new(Shared {
                unit: self.unit,
                client: self.client,
                config: self.config,
                guardrails,
                schemas,
                source_maps: self.source_maps,
            }),
        })
    }
}

impl WorkflowContext {
    pub fn new(
        unit: Arc<CompiledWorkflow>,
        client: Arc<dyn LlmClient>,
    ) -> Result<Self, RuntimeError> {
        Self::builder(unit, client).build()
    }

    pub fn builder(unit: Arc<CompiledWorkflow>, client: Arc<dyn LlmClient>) -> WorkflowContextBuilder {
        WorkflowContextBuilder {
            unit,
            client,
            config: RuntimeConfig::default(),
            guardrails: GuardrailConfig::default(),
            source_maps: None,
        }
    }

    pub fn unit(&self) -> &Arc<CompiledWorkflow> {
        &self.shared.unit
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Run flow `name`. Arguments bind to the flow's parameters in order.
    #[instrument(skip(self, args), fields(arg_count = args.len()))]
    pub async fn run_flow(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        self.execute(Entry::Flow(name.to_string()), args, EventSink::discard())
            .await
            .map(|invocation| invocation.value)
    }

    /// Run flow `name` on a background task, streaming its events.
    pub fn run_flow_stream(&self, name: &str, args: Vec<Value>) -> RunHandle {
        self.spawn(Entry::Flow(name.to_string()), args)
    }

    /// Run agent `name` on the joined arguments.
    #[instrument(skip(self, args), fields(arg_count = args.len()))]
    pub async fn run_agent(&self, name: &str, args: Vec<Value>) -> Result<Invocation, RuntimeError> {
        self.execute(Entry::Agent(name.to_string()), args, EventSink::discard())
            .await
    }

    pub fn run_agent_stream(&self, name: &str, args: Vec<Value>) -> RunHandle {
        self.spawn(Entry::Agent(name.to_string()), args)
    }

    /// One-shot model call with prompt `name`, optionally on another model.
    #[instrument(skip(self, args), fields(arg_count = args.len()))]
    pub async fn call_llm(
        &self,
        prompt: &str,
        args: Vec<Value>,
        model: Option<&str>,
    ) -> Result<Invocation, RuntimeError> {
        let entry = Entry::Prompt {
            name: prompt.to_string(),
            model: model.map(str::to_string),
        };
        self.execute(entry, args, EventSink::discard()).await
    }

    /// Apply guardrail `name` as a mask.
    pub fn mask(&self, guardrail: &str, text: &str) -> Result<String, RuntimeError> {
        Ok(self.shared.guardrails.mask(guardrail, text)?)
    }

    /// Whether `text` trips guardrail `name`.
    pub fn check(&self, guardrail: &str, text: &str) -> Result<bool, RuntimeError> {
        Ok(self.shared.guardrails.check(guardrail, text)?)
    }

    fn spawn(&self, entry: Entry, args: Vec<Value>) -> RunHandle {
        let (sink, events) = EventSink::channel();
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.execute(entry, args, sink)
                .await
                .map(|invocation| invocation.value)
        });
        RunHandle { events, task }
    }

    async fn execute(
        &self,
        entry: Entry,
        args: Vec<Value>,
        events: EventSink,
    ) -> Result<Invocation, RuntimeError> {
        let context = ExecutionContext::default().with_entry(entry.to_string());
        let span = info_span!("run", execution_id = %context.execution_id, entry = %entry);

        async move {
            let run = Run::start(self.shared.clone(), events, context, flow_input(&args)).await?;
            let result = match &entry {
                Entry::Flow(name) => run.call_flow(name, args).await.map(|value| Invocation {
                    text: value_text(&value),
                    value,
                    escalated: false,
                }),
                Entry::Agent(name) => run.run_agent(name, args, HashMap::new()).await,
                Entry::Prompt { name, model } => {
                    run.call_llm(name, args, model.as_deref(), HashMap::new())
                        .await
                }
            };
            run.finish();

            match &result {
                Ok(_) => info!("run finished"),
                Err(err) => warn!(error = %err, "run failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

enum Entry {
    Flow(String),
    Agent(String),
    Prompt { name: String, model: Option<String> },
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Flow(name) => write!(f, "flow {}", name),
            Entry::Agent(name) => write!(f, "agent {}", name),
            Entry::Prompt { name, .. } => write!(f, "prompt {}", name),
        }
    }
}

// =============================================================================
// Run state
// =============================================================================

enum Control {
    Next,
    Continue,
    Return(Value),
}

/// Text passing through a guardrail handler.
struct Guarded {
    event: HandlerEvent,
    text: String,
    /// Feedback for the model when an output guard asked for another answer
    retry: Option<String>,
}

struct Frame {
    scope: Scope,
    guard: Option<Guarded>,
}

impl Frame {
    fn new(scope: Scope) -> Self {
        Self { scope, guard: None }
    }
}

enum Start {
    Input(String),
    /// Conversation handed over by a parent agent
    Transfer(Vec<Message>),
}

#[derive(Clone)]
struct Run {
    shared: Arc<Shared>,
    events: EventSink,
    globals: Arc<HashMap<String, Value>>,
    hierarchies: Arc<Mutex<HashMap<String, Arc<AgentHierarchy>>>>,
}

impl Run {
    /// Set up a run, executing `on start` first. Its assignments become globals.
    async fn start(
        shared: Arc<Shared>,
        events: EventSink,
        mut context: ExecutionContext,
        input: Value,
    ) -> Result<Self, RuntimeError> {
        let mut run = Run {
            shared,
            events,
            globals: context.globals(),
            hierarchies: Arc::default(),
        };

        let unit = run.shared.unit.clone();
        if let Some(block) = unit.handler(HandlerEvent::Start) {
            let mut frame = Frame::new(Scope::new(run.globals.clone()));
            frame.scope.set("input", input);
            run.exec_block(block, &mut frame).await?;
            for (name, value) in frame.scope.into_locals() {
                if name != "input" {
                    context.set(name, value);
                }
            }
            debug!(globals = context.variables.len(), "start handler finished");
        }

        run.globals = context.globals();
        Ok(run)
    }

    /// Tear down every hierarchy built during the run.
    fn finish(&self) {
        let mut trees: Vec<(String, Arc<AgentHierarchy>)> = self
            .hierarchies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        trees.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, tree) in trees {
            for closed in tree.teardown() {
                self.events.emit(Event::AgentClosed {
                    agent: closed.agent,
                    as_tool: closed.as_tool,
                });
            }
        }
    }

    fn hierarchy(&self, agent: &str) -> Result<Arc<AgentHierarchy>, RuntimeError> {
        let mut cache = self
            .hierarchies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tree) = cache.get(agent) {
            return Ok(tree.clone());
        }
        let tree = Arc::new(AgentHierarchy::build(&self.shared.unit, agent)?);
        cache.insert(agent.to_string(), tree.clone());
        Ok(tree)
    }

    fn locate(&self, err: RuntimeError, line: usize) -> RuntimeError {
        let unit = &self.shared.unit;
        let position = self
            .shared
            .source_maps
            .as_ref()
            .and_then(|registry| registry.resolve(&unit.file_id, line))
            .or_else(|| unit.source_position(line));
        err.at(line, position)
    }

    // =========================================================================
    // Flows
    // =========================================================================

    async fn call_flow(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let unit = self.shared.unit.clone();
        let flow = unit
            .flows
            .get(name)
            .ok_or_else(|| RuntimeError::undefined("flow", name))?;
        if !flow.params.is_empty() && flow.params.len() != args.len() {
            return Err(RuntimeError::Arity {
                flow: name.to_string(),
                expected: flow.params.len(),
                given: args.len(),
            });
        }

        let mut frame = Frame::new(Scope::new(self.globals.clone()));
        frame.scope.set("input", flow_input(&args));
        for (param, arg) in flow.params.iter().zip(args) {
            frame.scope.set(param.clone(), arg);
        }

        info!(flow = %name, "flow started");
        self.events.emit(Event::FlowStarted {
            flow: name.to_string(),
        });

        let value = match self.exec_block(&flow.body, &mut frame).await {
            Ok(Control::Return(value)) => value,
            Ok(_) => Value::Null,
            Err(err) => match &flow.on_failure {
                Some(failure) if !err.is_fatal() => {
                    warn!(flow = %name, error = %err, "flow failed, running failure block");
                    frame.scope.set("error", error_value(&err));
                    match self.exec_block(failure, &mut frame).await? {
                        Control::Return(value) => value,
                        _ => Value::Null,
                    }
                }
                _ => return Err(err),
            },
        };

        self.events.emit(Event::FlowFinished {
            flow: name.to_string(),
            result: value.clone(),
        });
        Ok(value)
    }

    fn exec_block<'a>(
        &'a self,
        block: &'a [Instr],
        frame: &'a mut Frame,
    ) -> BoxFuture<'a, Result<Control, RuntimeError>> {
        async move {
            let mut index = 0;
            while index < block.len() {
                let instr = &block[index];
                let result = match &instr.op {
                    Op::If { condition } => {
                        let otherwise = block
                            .get(index + 1)
                            .filter(|next| matches!(next.op, Op::Else));
                        if otherwise.is_some() {
                            index += 1;
                        }
                        self.branch(instr, condition, otherwise, frame).await
                    }
                    _ => self.exec_instr(instr, frame).await,
                };
                let control = result.map_err(|err| self.locate(err, instr.line))?;
                if !matches!(control, Control::Next) {
                    return Ok(control);
                }
                index += 1;
            }
            Ok(Control::Next)
        }
        .boxed()
    }

    async fn branch(
        &self,
        instr: &Instr,
        condition: &IrExpr,
        otherwise: Option<&Instr>,
        frame: &mut Frame,
    ) -> Result<Control, RuntimeError> {
        if truthy(&evaluate(condition, &frame.scope)?) {
            self.exec_block(&instr.body, frame).await
        } else if let Some(otherwise) = otherwise {
            self.exec_block(&otherwise.body, frame).await
        } else {
            Ok(Control::Next)
        }
    }

    async fn exec_instr(&self, instr: &Instr, frame: &mut Frame) -> Result<Control, RuntimeError> {
        match &instr.op {
            Op::Loop { max } => {
                let mut iterations = 0u32;
                while max.map_or(true, |max| iterations < max) {
                    iterations += 1;
                    if let Control::Return(value) = self.exec_block(&instr.body, frame).await? {
                        return Ok(Control::Return(value));
                    }
                }
                Ok(Control::Next)
            }
            Op::ForEach { var, iterable } => self.for_each(instr, var, iterable, frame).await,
            Op::Match { subject } => {
                let value = evaluate(subject, &frame.scope)?;
                for arm in &instr.body {
                    if let Op::Arm { pattern } = &arm.op {
                        if pattern.as_ref().map_or(true, |p| loosely_equal(p, &value)) {
                            return self.exec_block(&arm.body, frame).await;
                        }
                    }
                }
                Ok(Control::Next)
            }
            Op::Assign { target, value } => {
                let value = evaluate(value, &frame.scope)?;
                frame.scope.set(target.clone(), value);
                Ok(Control::Next)
            }
            Op::SetPath {
                target,
                path,
                value,
            } => {
                let value = evaluate(value, &frame.scope)?;
                frame.scope.set_path(target, path, value)?;
                Ok(Control::Next)
            }
            Op::RunAgent {
                target,
                agent,
                args,
                on_escalate,
            } => {
                let args = arguments(args, &frame.scope)?;
                let outcome = self.run_agent(agent, args, frame.scope.snapshot()).await?;
                self.settle(agent, outcome, target.as_deref(), on_escalate.as_ref(), frame)
            }
            Op::CallLlm {
                target,
                prompt,
                args,
                model,
                on_escalate,
            } => {
                let args = arguments(args, &frame.scope)?;
                let outcome = self
                    .call_llm(prompt, args, model.as_deref(), frame.scope.snapshot())
                    .await?;
                self.settle(prompt, outcome, target.as_deref(), on_escalate.as_ref(), frame)
            }
            Op::RunFlow { target, flow, args } => {
                let args = arguments(args, &frame.scope)?;
                let value = self.call_flow(flow, args).await?;
                if let Some(target) = target {
                    frame.scope.set(target.clone(), value);
                }
                Ok(Control::Next)
            }
            Op::Parallel { calls } => {
                self.parallel(calls, frame).await?;
                Ok(Control::Next)
            }
            Op::Return { value } => Ok(Control::Return(evaluate(value, &frame.scope)?)),
            Op::Continue => Ok(Control::Continue),
            Op::Abort { message } => {
                let message = match message {
                    Some(message) => value_text(&evaluate(message, &frame.scope)?),
                    None => "workflow aborted".to_string(),
                };
                Err(RuntimeError::Aborted { message })
            }
            Op::Push { value, target } => {
                let value = evaluate(value, &frame.scope)?;
                frame.scope.push(target, value)?;
                Ok(Control::Next)
            }
            Op::Log { message } => {
                let message = value_text(&evaluate(message, &frame.scope)?);
                info!(message = %message, "workflow log");
                self.events.emit(Event::Log { message });
                Ok(Control::Next)
            }
            Op::Guard {
                kind,
                guardrail,
                message,
            } => self.guard(*kind, guardrail, message.as_deref(), frame),
            Op::OnFailure => Err(RuntimeError::Misplaced {
                action: "on failure",
            }),
            // `else` and `when` are consumed by their `if` and `match`
            _ => Ok(Control::Next),
        }
    }

    async fn for_each(
        &self,
        instr: &Instr,
        var: &str,
        iterable: &IrExpr,
        frame: &mut Frame,
    ) -> Result<Control, RuntimeError> {
        let items = match evaluate(iterable, &frame.scope)? {
            Value::Array(items) => items,
            other => {
                return Err(ValueError::TypeMismatch {
                    path: iterable.to_string(),
                    expected: "a list",
                    found: type_name(&other),
                }
                .into())
            }
        };

        let shadowed = frame.scope.remove(var);
        let mut outcome = Ok(Control::Next);
        for item in items {
            frame.scope.set(var, item);
            match self.exec_block(&instr.body, frame).await {
                Ok(Control::Return(value)) => {
                    outcome = Ok(Control::Return(value));
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        frame.scope.remove(var);
        if let Some(previous) = shadowed {
            frame.scope.set(var, previous);
        }
        outcome
    }

    /// Store a call's result, or follow its escalation handler.
    fn settle(
        &self,
        source: &str,
        outcome: Invocation,
        target: Option<&str>,
        on_escalate: Option<&EscalateAction>,
        frame: &mut Frame,
    ) -> Result<Control, RuntimeError> {
        if outcome.escalated {
            if let Some(action) = on_escalate {
                info!(source, action = %action, "escalation handled");
                return match action {
                    EscalateAction::Return { value } => {
                        Ok(Control::Return(evaluate(value, &frame.scope)?))
                    }
                    EscalateAction::Continue => Ok(Control::Continue),
                    EscalateAction::Abort => Err(RuntimeError::EscalationAbort {
                        name: source.to_string(),
                    }),
                };
            }
        }
        if let Some(target) = target {
            frame.scope.set(target, outcome.value);
        }
        Ok(Control::Next)
    }

    /// Run every call concurrently; the first failure cancels the rest.
    async fn parallel(&self, calls: &[ParallelCall], frame: &mut Frame) -> Result<(), RuntimeError> {
        let bindings = frame.scope.snapshot();
        let mut tasks = JoinSet::new();
        for (index, call) in calls.iter().enumerate() {
            let args = arguments(&call.args, &frame.scope)?;
            let run = self.clone();
            let agent = call.agent.clone();
            let bindings = bindings.clone();
            tasks.spawn(
                async move { (index, run.run_agent(&agent, args, bindings).await) }
                    .in_current_span(),
            );
        }
        debug!(branches = calls.len(), "parallel block started");

        let mut results: Vec<Option<Value>> = vec![None; calls.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| RuntimeError::Join(e.to_string()))?;
            match result {
                Ok(outcome) => results[index] = Some(outcome.value),
                Err(err) => {
                    warn!(agent = %calls[index].agent, error = %err, "parallel branch failed");
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        for (call, value) in calls.iter().zip(results) {
            if let (Some(target), Some(value)) = (&call.target, value) {
                frame.scope.set(target.clone(), value);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Guardrail handlers
    // =========================================================================

    /// Pass `text` through the handler for `event`, if the workflow has one.
    async fn guard_text(&self, event: HandlerEvent, text: String) -> Result<Guarded, RuntimeError> {
        let unit = self.shared.unit.clone();
        let Some(block) = unit.handler(event) else {
            return Ok(Guarded {
                event,
                text,
                retry: None,
            });
        };

        let mut frame = Frame::new(Scope::new(self.globals.clone()));
        frame.scope.set("input", Value::String(text.clone()));
        frame.guard = Some(Guarded {
            event,
            text,
            retry: None,
        });
        self.exec_block(block, &mut frame).await?;
        frame.guard.take().ok_or(RuntimeError::Misplaced {
            action: "guardrail handler",
        })
    }

    fn guard(
        &self,
        kind: GuardKind,
        guardrail: &str,
        message: Option<&str>,
        frame: &mut Frame,
    ) -> Result<Control, RuntimeError> {
        let Some(guarded) = frame.guard.as_mut() else {
            return Err(RuntimeError::Misplaced {
                action: "guardrail action",
            });
        };
        let guardrails = &self.shared.guardrails;

        match kind {
            GuardKind::Mask => {
                guarded.text = guardrails.mask(guardrail, &guarded.text)?;
                frame.scope.set("input", Value::String(guarded.text.clone()));
            }
            GuardKind::Block => {
                if guardrails.check(guardrail, &guarded.text)? {
                    return Err(RuntimeError::Blocked {
                        event: guarded.event,
                        guardrail: guardrail.to_string(),
                    });
                }
            }
            GuardKind::Warn => {
                if guardrails.check(guardrail, &guarded.text)? {
                    warn!(event = %guarded.event, guardrail, "guardrail warning");
                    self.events.emit(Event::GuardrailWarning {
                        event: guarded.event.to_string(),
                        guardrail: guardrail.to_string(),
                    });
                }
            }
            GuardKind::Retry => {
                if guardrails.check(guardrail, &guarded.text)? {
                    guarded.retry = Some(message.map(str::to_string).unwrap_or_else(|| {
                        format!(
                            "Your answer was rejected by the '{}' guardrail. Answer again.",
                            guardrail
                        )
                    }));
                }
            }
        }
        Ok(Control::Next)
    }

    // =========================================================================
    // Agents
    // =========================================================================

    async fn run_agent(
        &self,
        name: &str,
        args: Vec<Value>,
        bindings: HashMap<String, Value>,
    ) -> Result<Invocation, RuntimeError> {
        let tree = self.hierarchy(name)?;
        let input = join_args(&args);
        self.invoke(&tree, tree.root(), Start::Input(input), &bindings)
            .await
    }

    /// One agent invocation, bounded by its timeout policy.
    fn invoke<'a>(
        &'a self,
        tree: &'a AgentHierarchy,
        id: AgentId,
        start: Start,
        bindings: &'a HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<Invocation, RuntimeError>> {
        async move {
            let node = tree.node(id);
            let limit = self.timeout(node.spec.timeout.as_deref());
            let conversation = self.converse(tree, id, start, bindings);
            match limit {
                Some(limit) => tokio::time::timeout(limit, conversation)
                    .await
                    .map_err(|_| {
                        warn!(agent = %node.name, ?limit, "agent timed out");
                        RuntimeError::Timeout {
                            agent: node.name.clone(),
                            limit,
                        }
                    })?,
                None => conversation.await,
            }
        }
        .boxed()
    }

    /// The model loop of one agent: tool calls and transfers until a final answer.
    async fn converse(
        &self,
        tree: &AgentHierarchy,
        id: AgentId,
        start: Start,
        bindings: &HashMap<String, Value>,
    ) -> Result<Invocation, RuntimeError> {
        let node = tree.node(id);
        let agent = node.name.as_str();
        let prompt = self.prompt(&node.spec.instruction)?;
        let model = self.model(None, prompt.model.as_deref())?;
        let schema = self.schema(prompt)?;
        let retry = self.retry_policy(node.spec.retry.as_deref());
        let attempts = self.shared.config.schema_attempts.max(1);

        let (input, mut messages) = match start {
            Start::Input(input) => {
                let input = self.guard_text(HandlerEvent::Input, input).await?.text;
                (input.clone(), vec![Message::user(input)])
            }
            Start::Transfer(history) => {
                let input = history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                let history = history
                    .into_iter()
                    .filter(|m| m.role != Role::System)
                    .collect();
                (input, history)
            }
        };

        let mut vars = bindings.clone();
        vars.insert("input".to_string(), Value::String(input.clone()));
        let mut system = template::render(&prompt.template, &vars).rendered;
        if let Some(schema) = schema {
            system.push_str("\n\n");
            system.push_str(&schema.instruction());
        }
        messages.insert(0, Message::system(system));

        info!(agent, "agent started");
        self.events.emit(Event::AgentStarted {
            agent: agent.to_string(),
            input,
        });

        let tools = tree.descriptors(id, &self.shared.unit);
        let mut schema_failures = 0u32;
        let mut guard_retries = 0u32;

        for turn in 1..=self.shared.config.max_turns {
            let mut request = LlmRequest::new(model.model.clone(), messages.clone());
            request.temperature = model.temperature();
            request.max_tokens = model.max_tokens();
            request.tools = tools.clone();
            debug!(agent, turn, "agent turn");

            let response = self.complete(request, retry).await?;
            if !response.content.is_empty() && response.action.is_some() {
                self.events.emit(Event::ModelOutput {
                    agent: agent.to_string(),
                    text: response.content.clone(),
                });
            }

            match response.action {
                Some(ModelAction::Call { tool, input }) => {
                    let output = self
                        .call_tool(tree, id, &tool, input.clone(), bindings)
                        .await?;
                    messages.push(Message {
                        role: Role::Assistant,
                        content: input,
                        name: Some(tool.clone()),
                    });
                    messages.push(Message::tool(tool, output));
                }
                Some(ModelAction::Transfer { agent: to }) => match tree.delegate(id, &to) {
                    Some(delegate) => {
                        info!(from = agent, to = %to, "conversation transferred");
                        self.events.emit(Event::Transfer {
                            from: agent.to_string(),
                            to,
                        });
                        return self
                            .invoke(tree, delegate, Start::Transfer(messages), bindings)
                            .await;
                    }
                    None => {
                        warn!(agent, delegate = %to, "transfer to an unknown delegate");
                        let note = format!("'{}' is not a delegate of {}", to, agent);
                        messages.push(Message::tool(to, note));
                    }
                },
                None => {
                    let guarded = self
                        .guard_text(HandlerEvent::Output, response.content)
                        .await?;
                    if let Some(feedback) = guarded.retry {
                        if guard_retries + 1 < attempts {
                            guard_retries += 1;
                            messages.push(Message::assistant(guarded.text));
                            messages.push(Message::user(feedback));
                            continue;
                        }
                        warn!(agent, "output guard still failing, keeping the last answer");
                    }

                    let text = guarded.text;
                    let value = match schema {
                        None => Value::String(text.clone()),
                        Some(schema) => match schema.parse(&text) {
                            Ok(value) => value,
                            Err(err) => {
                                schema_failures += 1;
                                if schema_failures >= attempts {
                                    return Err(RuntimeError::SchemaValidation {
                                        prompt: prompt.name.clone(),
                                        schema: schema.name.clone(),
                                        attempts,
                                        reason: err.to_string(),
                                    });
                                }
                                warn!(agent, attempt = schema_failures, error = %err, "answer rejected by schema");
                                messages.push(Message::assistant(text));
                                messages.push(Message::user(correction(&err)));
                                continue;
                            }
                        },
                    };

                    let escalated = self.escalated(prompt, agent, &text);
                    self.events.emit(Event::AgentFinished {
                        agent: agent.to_string(),
                        output: text.clone(),
                    });
                    return Ok(Invocation {
                        value,
                        text,
                        escalated,
                    });
                }
            }
        }

        Err(RuntimeError::TurnLimit {
            agent: agent.to_string(),
            turns: self.shared.config.max_turns,
        })
    }

    /// Run a `use`d agent on behalf of agent `id`.
    async fn call_tool(
        &self,
        tree: &AgentHierarchy,
        id: AgentId,
        tool: &str,
        input: String,
        bindings: &HashMap<String, Value>,
    ) -> Result<String, RuntimeError> {
        let agent = tree.node(id).name.as_str();
        let Some(child) = tree.tool(id, tool) else {
            warn!(agent, tool, "model called a tool that is not available");
            return Ok(format!("tool '{}' is not available", tool));
        };

        let input = self.guard_text(HandlerEvent::ToolCall, input).await?.text;
        self.events.emit(Event::ToolCall {
            agent: agent.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
        });

        let outcome = self
            .invoke(tree, child, Start::Input(input), bindings)
            .await?;
        let output = self
            .guard_text(HandlerEvent::ToolResult, value_text(&outcome.value))
            .await?
            .text;

        self.events.emit(Event::ToolResult {
            agent: agent.to_string(),
            tool: tool.to_string(),
            output: output.clone(),
        });
        Ok(output)
    }

    // =========================================================================
    // Prompts
    // =========================================================================

    async fn call_llm(
        &self,
        name: &str,
        args: Vec<Value>,
        model: Option<&str>,
        mut bindings: HashMap<String, Value>,
    ) -> Result<Invocation, RuntimeError> {
        let prompt = self.prompt(name)?;
        let model = self.model(model, prompt.model.as_deref())?;
        let schema = self.schema(prompt)?;
        let attempts = self.shared.config.schema_attempts.max(1);

        let input = join_args(&args);
        if !args.is_empty() {
            bindings.insert("input".to_string(), Value::String(input.clone()));
        }
        let mut text = template::render(&prompt.template, &bindings).rendered;
        if !args.is_empty() && !template::references(&prompt.template, "input") {
            text.push_str("\n\n");
            text.push_str(&input);
        }
        if let Some(schema) = schema {
            text.push_str("\n\n");
            text.push_str(&schema.instruction());
        }

        let mut messages = vec![Message::user(text)];
        let mut last_error = None;
        for attempt in 1..=attempts {
            self.events.emit(Event::LlmCall {
                prompt: name.to_string(),
                model: model.model.clone(),
                attempt,
            });
            let mut request = LlmRequest::new(model.model.clone(), messages.clone());
            request.temperature = model.temperature();
            request.max_tokens = model.max_tokens();

            let response = self.complete(request, None).await?;
            let guarded = self
                .guard_text(HandlerEvent::Output, response.content)
                .await?;
            if let Some(feedback) = guarded.retry {
                if attempt < attempts {
                    messages.push(Message::assistant(guarded.text));
                    messages.push(Message::user(feedback));
                    continue;
                }
                warn!(prompt = %name, "output guard still failing, keeping the last answer");
            }

            let text = guarded.text;
            let value = match schema {
                None => Value::String(text.clone()),
                Some(schema) => match schema.parse(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(prompt = %name, attempt, error = %err, "answer rejected by schema");
                        messages.push(Message::assistant(text));
                        messages.push(Message::user(correction(&err)));
                        last_error = Some(err);
                        continue;
                    }
                },
            };

            let escalated = self.escalated(prompt, name, &text);
            return Ok(Invocation {
                value,
                text,
                escalated,
            });
        }

        Err(RuntimeError::SchemaValidation {
            prompt: name.to_string(),
            schema: schema.map(|s| s.name.clone()).unwrap_or_default(),
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn complete(
        &self,
        request: LlmRequest,
        retry: Option<&RetryPolicy>,
    ) -> Result<LlmResponse, RuntimeError> {
        let attempts = retry.map_or(1, |policy| policy.attempts.max(1));
        let mut attempt = 1;
        loop {
            match self.shared.client.complete(request.clone()).await {
                Ok(response) => {
                    debug!(
                        model = %response.model,
                        tokens = response.total_tokens(),
                        latency_ms = response.latency_ms,
                        "model responded"
                    );
                    return Ok(response);
                }
                Err(err) => match retry {
                    Some(policy) if attempt < attempts => {
                        let delay = policy.delay(attempt, self.shared.config.retry_base_delay);
                        warn!(attempt, ?delay, error = %err, "model request failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    _ => return Err(err.into()),
                },
            }
        }
    }

    fn escalated(&self, prompt: &PromptSpec, source: &str, text: &str) -> bool {
        let Some(condition) = &prompt.escalate else {
            return false;
        };
        if !escalation::matches(condition, text) {
            return false;
        }
        info!(source, "escalation condition met");
        self.events.emit(Event::Escalated {
            source: source.to_string(),
            output: text.to_string(),
        });
        true
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn prompt(&self, name: &str) -> Result<&PromptSpec, RuntimeError> {
        self.shared
            .unit
            .prompts
            .get(name)
            .ok_or_else(|| RuntimeError::undefined("prompt", name))
    }

    /// Explicit model, else the prompt's, else `main`; a workflow without a
    /// `main` model runs on the configured default.
    fn model(&self, requested: Option<&str>, declared: Option<&str>) -> Result<ModelSpec, RuntimeError> {
        let name = requested.or(declared).unwrap_or(FALLBACK_MODEL);
        match self.shared.unit.models.get(name) {
            Some(model) => Ok(model.clone()),
            None if name == FALLBACK_MODEL => Ok(ModelSpec::new(
                FALLBACK_MODEL,
                self.shared.config.default_model.clone(),
            )),
            None => Err(RuntimeError::undefined("model", name)),
        }
    }

    fn schema(&self, prompt: &PromptSpec) -> Result<Option<&CompiledSchema>, RuntimeError> {
        match &prompt.expecting {
            Some(name) => self
                .shared
                .schemas
                .get(name)
                .map(Some)
                .ok_or_else(|| RuntimeError::undefined("schema", name)),
            None => Ok(None),
        }
    }

    fn retry_policy(&self, name: Option<&str>) -> Option<&RetryPolicy> {
        let name = name?;
        let policy = self.shared.unit.retries.get(name);
        if policy.is_none() {
            warn!(policy = %name, "undefined retry policy ignored");
        }
        policy
    }

    fn timeout(&self, name: Option<&str>) -> Option<Duration> {
        match name {
            Some(name) => match self.shared.unit.timeouts.get(name) {
                Some(policy) => Some(policy.duration()),
                None => {
                    warn!(policy = %name, "undefined timeout policy ignored");
                    self.shared.config.default_timeout
                }
            },
            None => self.shared.config.default_timeout,
        }
    }
}

fn arguments(args: &[IrExpr], scope: &Scope) -> Result<Vec<Value>, RuntimeError> {
    args.iter()
        .map(|arg| evaluate(arg, scope).map_err(RuntimeError::from))
        .collect()
}

/// `$input` of a flow: the only argument, a list of several, or null.
fn flow_input(args: &[Value]) -> Value {
    match args {
        [] => Value::Null,
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

/// Agent and prompt input: arguments as text, one per line.
fn join_args(args: &[Value]) -> String {
    args.iter().map(value_text).collect::<Vec<_>>().join("\n")
}

fn correction(err: &SchemaError) -> String {
    format!(
        "Your previous reply was rejected: {}. Reply again with only the JSON object.",
        err
    )
}

/// `$error` inside an `on failure` block.
fn error_value(err: &RuntimeError) -> Value {
    let position = err.position();
    json!({
        "message": err.root().to_string(),
        "kind": err.kind(),
        "line": position.map(|p| p.line),
        "location": position.map(|p| p.to_string()),
    })
}

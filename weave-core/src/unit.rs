//! Compiled workflow units.
//!
//! A [`CompiledWorkflow`] is the executable form of one source unit: the
//! registration tables plus every flow and handler as a tree of [`Instr`].
//! It is built from a [`Listing`] by [`CompiledWorkflow::assemble`], which
//! folds indentation depth into nested blocks and checks block structure.

use crate::defs::{
    AgentSpec, GuardrailSpec, ModelSpec, PromptSpec, RetryPolicy, SchemaSpec, TimeoutPolicy,
    ToolSpec, DEFAULT_AGENT,
};
use crate::error::AssemblyError;
use crate::ir::{HandlerEvent, LineContent, Listing, Op};
use crate::source_map::{SourceMap, SourcePosition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::iter::Peekable;
use std::sync::Arc;

/// One executable instruction and the block it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    /// 1-based line in the generated listing
    pub line: usize,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<Instr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowUnit {
    pub name: String,
    pub params: Vec<String>,
    pub line: usize,
    pub body: Vec<Instr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Vec<Instr>>,
}

/// Counts of the main definition kinds in a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStats {
    pub models: usize,
    pub agents: usize,
    pub flows: usize,
    pub handlers: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Generated-file identity, the key of the source map registry
    pub file_id: String,
    pub source_name: String,
    pub source_hash: String,
    pub models: HashMap<String, ModelSpec>,
    pub schemas: HashMap<String, SchemaSpec>,
    pub tools: HashMap<String, ToolSpec>,
    pub retries: HashMap<String, RetryPolicy>,
    pub timeouts: HashMap<String, TimeoutPolicy>,
    pub guardrails: HashMap<String, GuardrailSpec>,
    pub prompts: HashMap<String, PromptSpec>,
    pub agents: HashMap<String, AgentSpec>,
    pub flows: HashMap<String, FlowUnit>,
    pub handlers: HashMap<HandlerEvent, Vec<Instr>>,
    pub listing: Listing,
    pub source_map: Arc<SourceMap>,
}

type FlatLines = Peekable<std::vec::IntoIter<(usize, usize, Op)>>;

impl CompiledWorkflow {
    /// Assemble a generated listing into an executable unit.
    pub fn assemble(
        source_hash: impl Into<String>,
        listing: Listing,
        source_map: Arc<SourceMap>,
    ) -> Result<Self, AssemblyError> {
        let flat: Vec<(usize, usize, Op)> = listing
            .lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| match &line.content {
                LineContent::Op { op } => Some((idx + 1, line.depth, op.clone())),
                LineContent::Comment { .. } => None,
            })
            .collect();
        let mut lines = flat.into_iter().peekable();
        let top = fold(&mut lines, 0)?;

        let mut unit = CompiledWorkflow {
            file_id: source_map.generated_file.clone(),
            source_name: source_map.source_file.clone(),
            source_hash: source_hash.into(),
            models: HashMap::new(),
            schemas: HashMap::new(),
            tools: HashMap::new(),
            retries: HashMap::new(),
            timeouts: HashMap::new(),
            guardrails: HashMap::new(),
            prompts: HashMap::new(),
            agents: HashMap::new(),
            flows: HashMap::new(),
            handlers: HashMap::new(),
            listing,
            source_map,
        };

        for instr in top {
            let line = instr.line;
            match instr.op {
                Op::Model(m) => register(&mut unit.models, m.name.clone(), m, "model", line)?,
                Op::Schema(s) => register(&mut unit.schemas, s.name.clone(), s, "schema", line)?,
                Op::Tool(t) => register(&mut unit.tools, t.name.clone(), t, "tool", line)?,
                Op::Retry(r) => register(&mut unit.retries, r.name.clone(), r, "retry policy", line)?,
                Op::Timeout(t) => {
                    register(&mut unit.timeouts, t.name.clone(), t, "timeout policy", line)?
                }
                Op::Guardrail(g) => {
                    register(&mut unit.guardrails, g.name.clone(), g, "guardrail", line)?
                }
                Op::Prompt(p) => register(&mut unit.prompts, p.name.clone(), p, "prompt", line)?,
                Op::Agent(a) => register(&mut unit.agents, a.name.clone(), a, "agent", line)?,
                Op::Flow { name, params } => {
                    let (body, on_failure) = split_failure(instr.body)?;
                    check_block(&body, false)?;
                    if let Some(failure) = &on_failure {
                        check_block(failure, false)?;
                    }
                    let flow = FlowUnit {
                        name: name.clone(),
                        params,
                        line,
                        body,
                        on_failure,
                    };
                    register(&mut unit.flows, name, flow, "flow", line)?;
                }
                Op::Handler { event } => {
                    check_block(&instr.body, false)?;
                    unit.handlers.entry(event).or_default().extend(instr.body);
                }
                other => {
                    return Err(AssemblyError::Misplaced {
                        line,
                        op: other.mnemonic(),
                        context: "at the top level",
                    })
                }
            }
        }

        Ok(unit)
    }

    /// The unnamed `agent:` definition, if any.
    pub fn default_agent(&self) -> Option<&AgentSpec> {
        self.agents.get(DEFAULT_AGENT)
    }

    pub fn handler(&self, event: HandlerEvent) -> Option<&[Instr]> {
        self.handlers.get(&event).map(Vec::as_slice)
    }

    /// The generated source text.
    pub fn generated_source(&self, include_comments: bool) -> String {
        self.listing.render(include_comments)
    }

    /// Map a generated line back to the workflow source.
    pub fn source_position(&self, generated_line: usize) -> Option<SourcePosition> {
        self.source_map.lookup(generated_line)
    }

    pub fn stats(&self) -> UnitStats {
        UnitStats {
            models: self.models.len(),
            agents: self.agents.len(),
            flows: self.flows.len(),
            handlers: self.handlers.len(),
        }
    }
}

fn register<T>(
    table: &mut HashMap<String, T>,
    name: String,
    entry: T,
    kind: &'static str,
    line: usize,
) -> Result<(), AssemblyError> {
    if table.contains_key(&name) {
        return Err(AssemblyError::Duplicate { line, kind, name });
    }
    table.insert(name, entry);
    Ok(())
}

fn fold(lines: &mut FlatLines, depth: usize) -> Result<Vec<Instr>, AssemblyError> {
    let mut block = Vec::new();
    while let Some(&(line, next_depth, _)) = lines.peek() {
        if next_depth < depth {
            break;
        }
        if next_depth > depth {
            return Err(AssemblyError::UnexpectedIndent { line });
        }
        let Some((line, _, op)) = lines.next() else {
            break;
        };
        let nested = lines.peek().is_some_and(|(_, d, _)| *d > depth);
        let body = if nested { fold(lines, depth + 1)? } else { Vec::new() };

        if op.is_header() && body.is_empty() {
            return Err(AssemblyError::EmptyBlock { line, op: op.mnemonic() });
        }
        if !op.is_header() && !body.is_empty() {
            return Err(AssemblyError::UnexpectedBody { line, op: op.mnemonic() });
        }
        block.push(Instr { line, op, body });
    }
    Ok(block)
}

fn split_failure(body: Vec<Instr>) -> Result<(Vec<Instr>, Option<Vec<Instr>>), AssemblyError> {
    let mut statements = Vec::with_capacity(body.len());
    let mut failure = None;
    for instr in body {
        if instr.op == Op::OnFailure {
            if failure.is_some() {
                return Err(AssemblyError::Duplicate {
                    line: instr.line,
                    kind: "failure block",
                    name: "on failure".to_string(),
                });
            }
            failure = Some(instr.body);
        } else {
            statements.push(instr);
        }
    }
    Ok((statements, failure))
}

/// Structural checks for a statement block.
fn check_block(block: &[Instr], in_match: bool) -> Result<(), AssemblyError> {
    let mut after_if = false;
    for instr in block {
        let line = instr.line;
        let misplaced = |context| AssemblyError::Misplaced {
            line,
            op: instr.op.mnemonic(),
            context,
        };
        match &instr.op {
            op if op.is_registration() => return Err(misplaced("inside a block")),
            Op::Flow { .. } | Op::Handler { .. } => return Err(misplaced("inside a block")),
            Op::OnFailure => return Err(misplaced("outside a flow body")),
            Op::Else if !after_if => return Err(misplaced("without a preceding if")),
            Op::Arm { .. } if !in_match => return Err(misplaced("outside a match")),
            op if in_match && !matches!(op, Op::Arm { .. }) => {
                return Err(misplaced("inside a match"))
            }
            _ => {}
        }
        after_if = matches!(instr.op, Op::If { .. });
        check_block(&instr.body, matches!(instr.op, Op::Match { .. }))?;
    }
    Ok(())
}

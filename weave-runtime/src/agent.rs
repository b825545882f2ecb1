//! Agent hierarchies
//!
//! Running an agent first materializes its tree: `delegate` children may take
//! over the conversation, `use` children are offered to the model as tools.
//! Nodes live in an arena owned by the [`AgentHierarchy`] and refer to each
//! other by [`AgentId`], so a tree has exactly one owner and is torn down
//! explicitly, depth-first, when the run that built it finishes.

use crate::error::RuntimeError;
use crate::llm::{ToolDescriptor, ToolRole};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use weave_core::{AgentSpec, CompiledWorkflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(usize);

#[derive(Debug)]
pub struct AgentNode {
    pub name: String,
    pub spec: AgentSpec,
    pub delegates: Vec<AgentId>,
    /// `use`d agents, each wrapped as a tool
    pub tools: Vec<AgentId>,
    closed: AtomicBool,
}

/// One entry of a teardown, in closing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    pub agent: String,
    /// The tool wrapper around `agent` rather than the agent itself
    pub as_tool: bool,
}

#[derive(Debug)]
pub struct AgentHierarchy {
    nodes: Vec<AgentNode>,
    root: AgentId,
}

impl AgentHierarchy {
    /// Build the tree rooted at `name`. References to agents that don't exist,
    /// or that would close a cycle, are logged and left out.
    pub fn build(unit: &CompiledWorkflow, name: &str) -> Result<Self, RuntimeError> {
        let spec = unit
            .agents
            .get(name)
            .ok_or_else(|| RuntimeError::undefined("agent", name))?;

        let mut tree = Self {
            nodes: Vec::new(),
            root: AgentId(0),
        };
        let mut path = Vec::new();
        tree.root = tree.add(unit, spec, &mut path);

        info!(agent = %name, size = tree.nodes.len(), "agent hierarchy built");
        Ok(tree)
    }

    fn add(&mut self, unit: &CompiledWorkflow, spec: &AgentSpec, path: &mut Vec<String>) -> AgentId {
        let id = AgentId(self.nodes.len());
        self.nodes.push(AgentNode {
            name: spec.name.clone(),
            spec: spec.clone(),
            delegates: Vec::new(),
            tools: Vec::new(),
            closed: AtomicBool::new(false),
        });

        path.push(spec.name.clone());
        let delegates = self.children(unit, &spec.delegate, "delegate", path);
        let tools = self.children(unit, &spec.uses, "use", path);
        path.pop();

        let node = &mut self.nodes[id.0];
        node.delegates = delegates;
        node.tools = tools;
        id
    }

    fn children(
        &mut self,
        unit: &CompiledWorkflow,
        names: &[String],
        relation: &'static str,
        path: &mut Vec<String>,
    ) -> Vec<AgentId> {
        let mut ids = Vec::new();
        for name in names {
            if path.contains(name) {
                warn!(agent = %name, relation, "circular agent reference skipped");
                continue;
            }
            match unit.agents.get(name) {
                Some(child) => ids.push(self.add(unit, child, path)),
                None => warn!(agent = %name, relation, "undefined agent skipped"),
            }
        }
        ids
    }

    pub fn root(&self) -> AgentId {
        self.root
    }

    pub fn node(&self, id: AgentId) -> &AgentNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn delegate(&self, id: AgentId, name: &str) -> Option<AgentId> {
        self.node(id)
            .delegates
            .iter()
            .copied()
            .find(|child| self.node(*child).name == name)
    }

    pub fn tool(&self, id: AgentId, name: &str) -> Option<AgentId> {
        self.node(id)
            .tools
            .iter()
            .copied()
            .find(|child| self.node(*child).name == name)
    }

    /// Tools offered to the model on behalf of agent `id`.
    pub fn descriptors(&self, id: AgentId, unit: &CompiledWorkflow) -> Vec<ToolDescriptor> {
        let node = self.node(id);
        let mut tools = Vec::new();
        for &child in &node.delegates {
            let child = self.node(child);
            tools.push(ToolDescriptor {
                name: child.name.clone(),
                description: describe(&child.spec),
                role: ToolRole::Transfer,
            });
        }
        for &child in &node.tools {
            let child = self.node(child);
            tools.push(ToolDescriptor {
                name: child.name.clone(),
                description: describe(&child.spec),
                role: ToolRole::Agent,
            });
        }
        for name in &node.spec.tools {
            let description = unit
                .tools
                .get(name)
                .map(|t| format!("{} tool {}", t.kind, t.target))
                .unwrap_or_default();
            tools.push(ToolDescriptor {
                name: name.clone(),
                description,
                role: ToolRole::External,
            });
        }
        tools
    }

    /// Close every node depth-first: delegates, then `use`d agents followed
    /// by their tool wrappers, then the node itself. A second call is a no-op.
    pub fn teardown(&self) -> Vec<Closed> {
        let mut closed = Vec::new();
        self.close(self.root, false, &mut closed);
        closed
    }

    fn close(&self, id: AgentId, as_tool: bool, out: &mut Vec<Closed>) {
        let node = self.node(id);
        if node.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for &child in &node.delegates {
            self.close(child, false, out);
        }
        for &tool in &node.tools {
            self.close(tool, true, out);
        }
        out.push(Closed {
            agent: node.name.clone(),
            as_tool: false,
        });
        if as_tool {
            out.push(Closed {
                agent: node.name.clone(),
                as_tool: true,
            });
        }
        debug!(agent = %node.name, "agent closed");
    }

    pub fn is_closed(&self) -> bool {
        self.node(self.root).closed.load(Ordering::SeqCst)
    }
}

fn describe(spec: &AgentSpec) -> String {
    spec.description
        .clone()
        .unwrap_or_else(|| format!("agent following prompt {}", spec.instruction))
}

//! Lookup from agent kind names to capabilities.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    Agent, AgentContext, AgentKind, ArchitectAgent, CodeGenAgent, DeploymentAgent, FixerAgent,
    SecurityAgent, TesterAgent,
};
use crate::error::{Error, Result};

/// Maps agent kind names to executable capabilities.
///
/// Built once before a run, then shared as `Arc<AgentRegistry>`; it has no
/// interior mutability, so concurrent `resolve` calls need no locking.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in agent kind.
    pub fn with_builtin(ctx: &AgentContext) -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            let agent: Arc<dyn Agent> = match kind {
                AgentKind::CodeGen => Arc::new(CodeGenAgent::new(ctx.clone())),
                AgentKind::Security => Arc::new(SecurityAgent::new(ctx.clone())),
                AgentKind::Tester => Arc::new(TesterAgent::new(ctx.clone())),
                AgentKind::Architect => Arc::new(ArchitectAgent::new()),
                AgentKind::Deployment => Arc::new(DeploymentAgent::new(ctx.clone())),
                AgentKind::Fixer => Arc::new(FixerAgent::new()),
            };
            registry.register(kind.as_str(), agent);
        }
        registry
    }

    /// Register (or replace) the capability for a kind.
    pub fn register(&mut self, kind: impl Into<String>, agent: Arc<dyn Agent>) -> &mut Self {
        self.agents.insert(kind.into(), agent);
        self
    }

    /// Resolve a kind to its capability.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownAgentKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.agents.contains_key(kind)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

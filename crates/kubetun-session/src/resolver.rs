//! Turning a requested context into an agent endpoint.

use std::collections::HashMap;

/// A fully resolved connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub context: String,
    pub namespace: String,
    /// `host:port` of the remote agent.
    pub agent_addr: String,
}

/// Resolves the caller's context and namespace. `None` means "the default".
/// Errors are configuration errors and are never retried.
pub trait ContextResolver: Send + Sync {
    fn resolve(&self, context: Option<&str>, namespace: Option<&str>) -> Result<ConnectTarget, String>;
}

/// Fixed context table, for tests and for running against a known agent.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    default_context: String,
    default_namespace: String,
    agents: HashMap<String, String>,
}

impl StaticResolver {
    /// A resolver with a single context, which is also the default.
    pub fn new(context: impl Into<String>, agent_addr: impl Into<String>) -> Self {
        let context = context.into();
        let mut agents = HashMap::new();
        agents.insert(context.clone(), agent_addr.into());
        Self {
            default_context: context,
            default_namespace: "default".to_string(),
            agents,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>, agent_addr: impl Into<String>) -> Self {
        self.agents.insert(context.into(), agent_addr.into());
        self
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }
}

impl ContextResolver for StaticResolver {
    fn resolve(&self, context: Option<&str>, namespace: Option<&str>) -> Result<ConnectTarget, String> {
        let context = context.unwrap_or(&self.default_context);
        let agent_addr = self
            .agents
            .get(context)
            .ok_or_else(|| format!("context {context:?} does not exist"))?;
        Ok(ConnectTarget {
            context: context.to_string(),
            namespace: namespace.unwrap_or(&self.default_namespace).to_string(),
            agent_addr: agent_addr.clone(),
        })
    }
}

//! Context resolution against the user's kubeconfig.

use std::collections::HashMap;
use std::path::PathBuf;

use kubetun_core::DaemonConfig;
use kubetun_core::kubeconfig::{Kubeconfig, kubeconfig_path};
use kubetun_session::{ConnectTarget, ContextResolver};

/// Environment variable naming the agent for contexts missing from `[agents]`.
pub const AGENT_ADDR_ENV: &str = "KUBETUN_AGENT_ADDR";

/// Reads the kubeconfig on every connect, so edits take effect without a
/// daemon restart.
#[derive(Debug, Clone)]
pub struct KubeconfigResolver {
    kubeconfig: Option<PathBuf>,
    agents: HashMap<String, String>,
    fallback_agent: Option<String>,
}

impl KubeconfigResolver {
    pub fn new(kubeconfig: Option<PathBuf>, agents: HashMap<String, String>) -> Self {
        Self {
            kubeconfig,
            agents,
            fallback_agent: None,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        let fallback = std::env::var(AGENT_ADDR_ENV).ok().filter(|a| !a.is_empty());
        Self::new(kubeconfig_path(config.kubeconfig.as_deref()), config.agents.clone()).with_fallback_agent(fallback)
    }

    pub fn with_fallback_agent(mut self, addr: Option<String>) -> Self {
        self.fallback_agent = addr;
        self
    }
}

impl ContextResolver for KubeconfigResolver {
    fn resolve(&self, context: Option<&str>, namespace: Option<&str>) -> Result<ConnectTarget, String> {
        let path = self
            .kubeconfig
            .as_ref()
            .ok_or("no kubeconfig found; set KUBECONFIG or `kubeconfig` in config.toml")?;
        let kubeconfig = Kubeconfig::from_file(path).map_err(|e| e.to_string())?;
        let resolved = kubeconfig.resolve(context).map_err(|e| e.to_string())?;
        let agent_addr = self
            .agents
            .get(&resolved.name)
            .or(self.fallback_agent.as_ref())
            .cloned()
            .ok_or_else(|| {
                format!(
                    "no agent address for context {:?}; add it to [agents] or set {AGENT_ADDR_ENV}",
                    resolved.name
                )
            })?;
        Ok(ConnectTarget {
            context: resolved.name,
            namespace: namespace.map_or(resolved.namespace, str::to_string),
            agent_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-dev
clusters:
  - name: kind
    cluster:
      server: https://127.0.0.1:6443
contexts:
  - name: kind-dev
    context:
      cluster: kind
      namespace: payments
  - name: broken
    context:
      cluster: missing
"#;

    fn resolver(dir: &tempfile::TempDir) -> KubeconfigResolver {
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG).unwrap();
        let mut agents = HashMap::new();
        agents.insert("kind-dev".to_string(), "127.0.0.1:8022".to_string());
        KubeconfigResolver::new(Some(path), agents)
    }

    #[test]
    fn current_context_and_its_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let target = resolver(&dir).resolve(None, None).unwrap();
        assert_eq!(target.context, "kind-dev");
        assert_eq!(target.namespace, "payments");
        assert_eq!(target.agent_addr, "127.0.0.1:8022");

        let target = resolver(&dir).resolve(Some("kind-dev"), Some("default")).unwrap();
        assert_eq!(target.namespace, "default");
    }

    #[test]
    fn unknown_context_names_it() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolver(&dir).resolve(Some("not-likely-to-exist"), None).unwrap_err();
        assert!(err.contains(r#""not-likely-to-exist" does not exist"#));
        assert!(resolver(&dir).resolve(Some("broken"), None).is_err());
    }

    #[test]
    fn empty_kubeconfig_has_no_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, "").unwrap();
        let err = KubeconfigResolver::new(Some(path), HashMap::new())
            .resolve(None, None)
            .unwrap_err();
        assert!(err.contains("kubectl config current-context"));
    }

    #[test]
    fn fallback_agent_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG).unwrap();
        let without = KubeconfigResolver::new(Some(path.clone()), HashMap::new());
        assert!(without.resolve(None, None).unwrap_err().contains(AGENT_ADDR_ENV));

        let with = without.with_fallback_agent(Some("10.0.0.7:8022".to_string()));
        assert_eq!(with.resolve(None, None).unwrap().agent_addr, "10.0.0.7:8022");
    }
}

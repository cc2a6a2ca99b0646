//! Context lookup in a kubeconfig file.
//!
//! Only the parts kubetun needs are modelled: the current context, each
//! context's cluster and default namespace, and each cluster's server URL.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("failed to read kubeconfig {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse kubeconfig {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("no current context is set (see `kubectl config current-context`)")]
    NoCurrentContext,

    #[error("context {0:?} does not exist")]
    ContextNotFound(String),

    #[error("cluster {cluster:?} referenced by context {context:?} does not exist")]
    ClusterNotFound { context: String, cluster: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextSpec {
    pub cluster: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub server: Option<String>,
}

/// A context resolved against its cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContext {
    pub name: String,
    pub cluster: String,
    pub server: Option<String>,
    /// The context's default namespace, `default` when unset.
    pub namespace: String,
}

impl Kubeconfig {
    pub fn from_file(path: &Path) -> Result<Self, KubeconfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| KubeconfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content).map_err(|message| KubeconfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, String> {
        // An empty file (e.g. KUBECONFIG=/dev/null) is a config with nothing in it.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Resolve `name`, or the current context when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<ResolvedContext, KubeconfigError> {
        let name = match name {
            Some(n) => n.to_string(),
            None => self
                .current_context
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or(KubeconfigError::NoCurrentContext)?,
        };

        let ctx = self
            .contexts
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| KubeconfigError::ContextNotFound(name.clone()))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster)
            .ok_or_else(|| KubeconfigError::ClusterNotFound {
                context: name.clone(),
                cluster: ctx.context.cluster.clone(),
            })?;

        Ok(ResolvedContext {
            name,
            cluster: cluster.name.clone(),
            server: cluster.cluster.server.clone(),
            namespace: ctx
                .context
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        })
    }
}

/// Kubeconfig location: explicit path, then the first entry of
/// `$KUBECONFIG`, then `~/.kube/config`.
pub fn kubeconfig_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(env) = std::env::var("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&env).next() {
            if !first.as_os_str().is_empty() {
                return Some(first);
            }
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-dev
clusters:
- name: kind-dev
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: kind-dev
  context:
    cluster: kind-dev
    user: kind-dev
- name: staging
  context:
    cluster: staging
    namespace: team-a
users: []
"#;

    #[test]
    fn resolves_current_context() {
        let kc = Kubeconfig::from_str(SAMPLE).unwrap();
        let ctx = kc.resolve(None).unwrap();
        assert_eq!(ctx.name, "kind-dev");
        assert_eq!(ctx.server.as_deref(), Some("https://127.0.0.1:6443"));
        assert_eq!(ctx.namespace, "default");
    }

    #[test]
    fn unknown_context_reports_name() {
        let kc = Kubeconfig::from_str(SAMPLE).unwrap();
        let err = kc.resolve(Some("not-likely-to-exist")).unwrap_err();
        assert_eq!(err.to_string(), r#"context "not-likely-to-exist" does not exist"#);
    }

    #[test]
    fn context_with_missing_cluster() {
        let kc = Kubeconfig::from_str(SAMPLE).unwrap();
        let err = kc.resolve(Some("staging")).unwrap_err();
        assert!(matches!(err, KubeconfigError::ClusterNotFound { .. }));
    }

    #[test]
    fn empty_kubeconfig_has_no_current_context() {
        let kc = Kubeconfig::from_str("").unwrap();
        let err = kc.resolve(None).unwrap_err();
        assert!(err.to_string().contains("kubectl config current-context"));
    }

    #[test]
    fn explicit_path_wins() {
        let p = kubeconfig_path(Some(Path::new("/tmp/kc"))).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/kc"));
    }
}

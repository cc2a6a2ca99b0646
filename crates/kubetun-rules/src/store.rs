//! The rule store: an ordered rule set and its evaluation.
//!
//! The most specific matching rule decides. An exact specificity tie
//! between a Divert and a Pass rule goes to Pass, and a destination no
//! rule matches is passed, so only explicitly matched traffic is ever
//! diverted.

use thiserror::Error;
use tracing::debug;

use crate::cidr::Cidr;
use crate::rule::{Action, Destination, OverrideRule, Pattern};

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("invalid CIDR {value:?}: {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("invalid DNS suffix {0:?}")]
    InvalidSuffix(String),
}

/// Everything the store is built from when a session connects.
#[derive(Debug, Clone, Default)]
pub struct RuleSource {
    /// Namespace the session is connected to.
    pub namespace: String,
    /// Other namespaces reachable through the tunnel.
    pub namespaces: Vec<String>,
    /// Cluster DNS domain (`cluster.local`).
    pub cluster_domain: String,
    pub service_subnets: Vec<String>,
    pub pod_subnets: Vec<String>,
    /// User-supplied CIDRs to divert.
    pub also_proxy: Vec<String>,
    /// User-supplied CIDRs never to divert.
    pub never_proxy: Vec<String>,
}

/// Result of evaluating a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    /// The winning rule, `None` when nothing matched.
    pub rule: Option<OverrideRule>,
}

/// Ordered set of override rules.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    rules: Vec<OverrideRule>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the rule set for a connected session.
    pub fn from_source(source: &RuleSource) -> Result<Self, RuleError> {
        let mut store = Self::new();

        store.insert(OverrideRule::divert(Pattern::ShortName));
        if !source.cluster_domain.is_empty() {
            store.insert(OverrideRule::divert(checked_suffix(&source.cluster_domain)?));
        }
        for ns in std::iter::once(&source.namespace).chain(source.namespaces.iter()) {
            if !ns.is_empty() {
                store.insert(OverrideRule::divert(checked_suffix(ns)?));
            }
        }

        for cidr in source
            .service_subnets
            .iter()
            .chain(source.pod_subnets.iter())
            .chain(source.also_proxy.iter())
        {
            store.insert(OverrideRule::divert(Pattern::Cidr(parse_cidr(cidr)?)));
        }
        for cidr in &source.never_proxy {
            store.insert(OverrideRule::pass(Pattern::Cidr(parse_cidr(cidr)?)));
        }

        debug!(
            rules = store.rules.len(),
            divert = store.divert_count(),
            namespace = %source.namespace,
            "built override rule set"
        );
        Ok(store)
    }

    /// Add a rule, keeping the set ordered by descending specificity.
    /// A rule identical to an existing one is ignored.
    pub fn insert(&mut self, rule: OverrideRule) {
        if self.rules.contains(&rule) {
            return;
        }
        let spec = rule.pattern.specificity();
        let idx = self
            .rules
            .iter()
            .position(|r| r.pattern.specificity() < spec)
            .unwrap_or(self.rules.len());
        self.rules.insert(idx, rule);
    }

    /// Evaluate `dest` against the rule set.
    pub fn evaluate(&self, dest: &Destination) -> Decision {
        let mut best: Option<&OverrideRule> = None;
        for rule in &self.rules {
            if let Some(b) = best {
                // Ordered by descending specificity: nothing further can beat `b`.
                if rule.pattern.specificity() < b.pattern.specificity() {
                    break;
                }
            }
            if !rule.pattern.matches(dest) {
                continue;
            }
            best = match best {
                None => Some(rule),
                Some(b) if b.action == Action::Divert && rule.action == Action::Pass => Some(rule),
                keep => keep,
            };
        }
        match best {
            Some(rule) => Decision {
                action: rule.action,
                rule: Some(rule.clone()),
            },
            None => Decision {
                action: Action::Pass,
                rule: None,
            },
        }
    }

    pub fn rules(&self) -> &[OverrideRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of Divert rules.
    pub fn divert_count(&self) -> usize {
        self.rules.iter().filter(|r| r.action == Action::Divert).count()
    }

    /// CIDR patterns of the Divert rules, for IP-level installers.
    pub fn divert_cidrs(&self) -> Vec<Cidr> {
        self.cidrs_with(Action::Divert)
    }

    /// CIDR patterns of the Pass rules.
    pub fn pass_cidrs(&self) -> Vec<Cidr> {
        self.cidrs_with(Action::Pass)
    }

    fn cidrs_with(&self, action: Action) -> Vec<Cidr> {
        self.rules
            .iter()
            .filter(|r| r.action == action)
            .filter_map(|r| match r.pattern {
                Pattern::Cidr(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

fn parse_cidr(s: &str) -> Result<Cidr, RuleError> {
    s.parse().map_err(|reason| RuleError::InvalidCidr {
        value: s.to_string(),
        reason,
    })
}

fn checked_suffix(s: &str) -> Result<Pattern, RuleError> {
    let valid = !s.trim_matches('.').is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(RuleError::InvalidSuffix(s.to_string()));
    }
    Ok(Pattern::suffix(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> RuleSource {
        RuleSource {
            namespace: "default".into(),
            namespaces: vec!["kube-system".into()],
            cluster_domain: "cluster.local".into(),
            service_subnets: vec!["10.96.0.0/12".into()],
            pod_subnets: vec!["10.244.0.0/16".into()],
            also_proxy: vec![],
            never_proxy: vec!["10.96.0.10/32".into()],
        }
    }

    fn eval(store: &RuleStore, dest: &str) -> Action {
        store.evaluate(&Destination::parse(dest)).action
    }

    #[test]
    fn diverts_cluster_names() {
        let store = RuleStore::from_source(&source()).unwrap();
        assert_eq!(eval(&store, "echo-easy"), Action::Divert);
        assert_eq!(eval(&store, "echo-easy.default"), Action::Divert);
        assert_eq!(eval(&store, "coredns.kube-system.svc.cluster.local"), Action::Divert);
    }

    #[test]
    fn passes_everything_else() {
        let store = RuleStore::from_source(&source()).unwrap();
        assert_eq!(eval(&store, "example.com"), Action::Pass);
        assert_eq!(eval(&store, "8.8.8.8"), Action::Pass);
        let decision = store.evaluate(&Destination::parse("example.com"));
        assert!(decision.rule.is_none());
    }

    #[test]
    fn most_specific_cidr_wins() {
        let store = RuleStore::from_source(&source()).unwrap();
        assert_eq!(eval(&store, "10.96.0.1"), Action::Divert);
        assert_eq!(eval(&store, "10.96.0.10"), Action::Pass);
        assert_eq!(eval(&store, "10.244.3.9"), Action::Divert);
    }

    #[test]
    fn less_specific_pass_does_not_override_divert() {
        let mut src = source();
        src.never_proxy = vec!["10.0.0.0/8".into()];
        let store = RuleStore::from_source(&src).unwrap();
        assert_eq!(eval(&store, "10.96.0.1"), Action::Divert);
        assert_eq!(eval(&store, "10.1.0.1"), Action::Pass);
    }

    #[test]
    fn tie_goes_to_pass() {
        let mut src = source();
        src.never_proxy = vec!["10.96.0.0/12".into()];
        let store = RuleStore::from_source(&src).unwrap();
        assert_eq!(eval(&store, "10.96.0.1"), Action::Pass);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let store = RuleStore::from_source(&source()).unwrap();
        let dests = ["echo-easy", "example.com", "10.96.0.10", "10.244.0.1", "::1"];
        for d in dests {
            let first = store.evaluate(&Destination::parse(d));
            for _ in 0..10 {
                assert_eq!(store.evaluate(&Destination::parse(d)), first);
            }
        }
    }

    #[test]
    fn empty_store_passes() {
        let store = RuleStore::new();
        assert_eq!(eval(&store, "echo-easy"), Action::Pass);
        assert_eq!(store.divert_count(), 0);
    }

    #[test]
    fn duplicate_rules_collapse() {
        let mut src = source();
        src.namespaces = vec!["default".into(), "default".into()];
        let store = RuleStore::from_source(&src).unwrap();
        let suffixes = store
            .rules()
            .iter()
            .filter(|r| r.pattern == Pattern::suffix("default"))
            .count();
        assert_eq!(suffixes, 1);
    }

    #[test]
    fn divert_cidrs_lists_subnets() {
        let store = RuleStore::from_source(&source()).unwrap();
        let cidrs: Vec<String> = store.divert_cidrs().iter().map(|c| c.to_string()).collect();
        assert!(cidrs.contains(&"10.96.0.0/12".to_string()));
        assert!(cidrs.contains(&"10.244.0.0/16".to_string()));
        assert_eq!(store.pass_cidrs().len(), 1);
    }

    #[test]
    fn rejects_bad_input() {
        let mut src = source();
        src.also_proxy = vec!["not-a-cidr".into()];
        assert!(matches!(
            RuleStore::from_source(&src),
            Err(RuleError::InvalidCidr { .. })
        ));

        let mut src = source();
        src.namespace = "bad namespace".into();
        assert!(matches!(
            RuleStore::from_source(&src),
            Err(RuleError::InvalidSuffix(_))
        ));
    }
}

//! Override rules and the destinations they are matched against.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::cidr::Cidr;

/// What to do with a matched destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Route through the tunnel into the cluster.
    Divert,
    /// Leave to the OS.
    Pass,
}

/// Pattern part of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Pattern {
    /// Matches the suffix itself and every name below it
    /// (`cluster.local` matches `a.svc.cluster.local`).
    DnsSuffix(String),
    /// Matches single-label names such as `echo-easy`.
    ShortName,
    Cidr(Cidr),
}

impl Pattern {
    /// Build a DNS suffix pattern, normalizing case and dots.
    pub fn suffix(s: &str) -> Self {
        Pattern::DnsSuffix(normalize_host(s))
    }

    /// How specific the pattern is. Higher wins.
    ///
    /// Suffixes count labels, CIDRs count prefix bits. A short-name rule
    /// sits below every suffix.
    pub fn specificity(&self) -> u32 {
        match self {
            Pattern::DnsSuffix(s) => s.split('.').filter(|l| !l.is_empty()).count() as u32,
            Pattern::ShortName => 0,
            Pattern::Cidr(c) => u32::from(c.prefix()),
        }
    }

    /// Whether this pattern matches `dest`. Never performs I/O.
    pub fn matches(&self, dest: &Destination) -> bool {
        match (self, dest) {
            (Pattern::DnsSuffix(suffix), Destination::Host(host)) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            (Pattern::ShortName, Destination::Host(host)) => !host.contains('.'),
            (Pattern::Cidr(cidr), Destination::Ip(ip)) => cidr.contains(ip),
            _ => false,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::DnsSuffix(s) => write!(f, "*.{s}"),
            Pattern::ShortName => write!(f, "<short name>"),
            Pattern::Cidr(c) => write!(f, "{c}"),
        }
    }
}

/// A pattern plus the action taken when it is the best match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverrideRule {
    pub pattern: Pattern,
    pub action: Action,
}

impl OverrideRule {
    pub fn divert(pattern: Pattern) -> Self {
        Self {
            pattern,
            action: Action::Divert,
        }
    }

    pub fn pass(pattern: Pattern) -> Self {
        Self {
            pattern,
            action: Action::Pass,
        }
    }
}

/// An outbound destination: a name or an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Lower-cased host name without a trailing dot.
    Host(String),
    Ip(IpAddr),
}

impl Destination {
    /// Classify `s`: literal addresses become `Ip`, everything else `Host`.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Destination::Ip(ip),
            Err(_) => Destination::Host(normalize_host(trimmed)),
        }
    }

    pub fn is_short_name(&self) -> bool {
        matches!(self, Destination::Host(h) if !h.contains('.'))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Host(h) => f.write_str(h),
            Destination::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

fn normalize_host(s: &str) -> String {
    s.trim().trim_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_matches_on_label_boundary() {
        let p = Pattern::suffix("cluster.local");
        assert!(p.matches(&Destination::parse("cluster.local")));
        assert!(p.matches(&Destination::parse("echo.default.svc.cluster.local.")));
        assert!(!p.matches(&Destination::parse("mycluster.local")));
        assert!(!p.matches(&Destination::parse("10.0.0.1")));
    }

    #[test]
    fn suffix_is_case_insensitive() {
        let p = Pattern::suffix("Default");
        assert!(p.matches(&Destination::parse("Echo-Easy.DEFAULT")));
    }

    #[test]
    fn short_name_matches_single_label() {
        assert!(Pattern::ShortName.matches(&Destination::parse("echo-easy")));
        assert!(!Pattern::ShortName.matches(&Destination::parse("example.com")));
    }

    #[test]
    fn destination_parses_bracketed_v6() {
        assert_eq!(
            Destination::parse("[::1]"),
            Destination::Ip("::1".parse().unwrap())
        );
    }

    #[test]
    fn specificity_ordering() {
        assert!(Pattern::suffix("svc.cluster.local").specificity() > Pattern::suffix("cluster.local").specificity());
        assert!(Pattern::suffix("default").specificity() > Pattern::ShortName.specificity());
        let wide = Pattern::Cidr("10.0.0.0/8".parse().unwrap());
        let narrow = Pattern::Cidr("10.0.5.0/24".parse().unwrap());
        assert!(narrow.specificity() > wide.specificity());
    }
}

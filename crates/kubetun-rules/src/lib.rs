//! kubetun-rules — the override rule store.
//!
//! Decides, for every outbound destination, whether it is diverted into
//! the cluster or left to the OS.
//!
//! # Components
//!
//! - **`cidr`** — IPv4/IPv6 prefix parsing and containment
//! - **`rule`** — patterns, actions, and destinations
//! - **`store`** — the ordered rule set and most-specific-match evaluation

pub mod cidr;
pub mod rule;
pub mod store;

pub use cidr::Cidr;
pub use rule::{Action, Destination, OverrideRule, Pattern};
pub use store::{Decision, RuleError, RuleSource, RuleStore};

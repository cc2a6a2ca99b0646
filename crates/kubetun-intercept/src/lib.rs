//! kubetun-intercept — inbound redirection of cluster workloads to local listeners.
//!
//! The [`InterceptManager`] owns the intercept table for one session. It
//! asks the remote agent to install and uninstall intercepts over the
//! tunnel's control channel, and its dispatcher hands every inbound stream
//! for an Active intercept to the matching local listener.

pub mod dispatch;
pub mod error;
pub mod manager;

pub use error::InterceptError;
pub use manager::{InterceptManager, InterceptSettings};

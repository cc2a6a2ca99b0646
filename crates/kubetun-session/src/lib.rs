//! kubetun-session — the daemon's single session.
//!
//! [`SessionManager`] owns the tunnel, the outbound override engine, and
//! the intercept manager of the current session, brings them up in order
//! on connect, and takes them down in reverse on disconnect or when the
//! tunnel fails.

pub mod error;
pub mod manager;
pub mod resolver;

pub use error::SessionError;
pub use manager::{SessionManager, SessionSettings};
pub use resolver::{ConnectTarget, ContextResolver, StaticResolver};

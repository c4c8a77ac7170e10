//! Owns the live link to the broker and re-establishes it when it breaks.
//!
//! A [`Connection`] is created by an explicit [`Connection::connect`], replaced (never mutated in
//! place) by [`Connection::reconnect`] and torn down by [`Connection::close`].
//!
//! Recovery is two-tiered: `reconnect` gives up after a bounded number of attempts,
//! while callers that must stay alive (e.g. the [`Consumer`](crate::consumers::Consumer) loop)
//! supervise it with their own outer retry.
mod error;
mod manager;
mod policy;

pub use error::{ConnectError, ReconnectError};
pub use manager::{Connection, ConnectionState, Generation};
pub use policy::ReconnectPolicy;

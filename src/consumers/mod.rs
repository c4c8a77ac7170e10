//! Consume messages from a queue, with a bounded number of concurrent workers.
//!
//! A [`Consumer`] subscribes to a queue on a shared [`Connection`](crate::connection::Connection)
//! and hands every delivery over to a [`Handler`]. Successfully processed messages are
//! acknowledged, failed ones are negatively acknowledged with requeue and passed to the
//! chain of error handlers.
mod builder;
mod consumer;
mod error;
mod handler;
mod incoming_message;
mod worker_pool;

pub use builder::ConsumerBuilder;
pub use consumer::{Consumer, Outcome, SupervisionPolicy};
pub use error::{ConfigurationError, ConsumerError, HandlerError};
pub use handler::{AsyncClosure, ClosureHandler, Handler};
pub use incoming_message::{Delivery, Incoming};
pub use worker_pool::{WorkerPool, WorkerSlot};

pub(crate) use consumer::sleep_unless_cancelled;

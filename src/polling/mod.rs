//! Consume messages from pull-based queues, such as SQS.
//!
//! [`PollingConsumer`] shares the worker pool discipline of [`Consumer`](crate::consumers::Consumer):
//! at most `worker_count` messages are processed at once. Processed messages are deleted from the
//! queue, failed ones are left there to become visible again once their visibility timeout elapses.
mod consumer;
mod error;
mod handler;
mod queue;
#[cfg(feature = "sqs")]
mod sqs;

pub use consumer::{PollingConsumer, PollingConsumerBuilder, MAX_POLLING_WORKERS};
pub use error::PollingError;
pub use handler::{PollingClosure, PollingClosureHandler, PollingHandler, Received};
pub use queue::{PollingQueue, QueueMessage};
#[cfg(feature = "sqs")]
pub use sqs::SqsQueue;

//! `warren` is a consume-and-publish engine for RabbitMQ (built on top of [`lapin`]) and for
//! pull-based queues such as SQS.
//!
//! It keeps a single logical [`Connection`](crate::connection::Connection) to the broker alive,
//! re-establishing it when it drops, and lets any number of
//! [`Consumer`](crate::consumers::Consumer)s and [`Publisher`](crate::publishers::Publisher)s
//! share it.
//!
//! Consumers process messages with a bounded pool of concurrent workers: messages are
//! acknowledged when the handler succeeds and requeued when it fails (at-least-once delivery).
//! [`PollingConsumer`](crate::polling::PollingConsumer) provides the same discipline for
//! queues that are polled rather than subscribed to.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use warren::amqp::configuration::RabbitMqSettings;
//! use warren::amqp::ConnectionFactory;
//! use warren::connection::Connection;
//! use warren::consumers::{Consumer, HandlerError, Incoming};
//!
//! async fn handle(incoming: Incoming<'_, ()>) -> Result<(), HandlerError> {
//!     let order: serde_json::Value = incoming.json()?;
//!     println!("{order}");
//!     Ok(())
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = RabbitMqSettings::default();
//! let factory = ConnectionFactory::new_from_config(&settings)?;
//! let connection = Arc::new(Connection::connect(factory, settings.reconnect_policy()).await?);
//!
//! let cancellation = CancellationToken::new();
//! connection.close_on_cancel(cancellation.clone());
//!
//! let consumer = Consumer::builder(Arc::clone(&connection), "orders", Arc::new(()))
//!     .worker_count(5)
//!     .handler(handle)?;
//! let outcome = consumer.run(cancellation).await;
//! assert!(outcome.unwrap_err().is_cancelled());
//! # Ok(())
//! # }
//! ```

pub mod amqp;
pub mod connection;
pub mod consumers;
pub mod polling;
pub mod publishers;
pub mod transport;

//! The seam between the engine and the broker client library.
//!
//! [`Dialer`] establishes [`Link`]s, a [`Link`] is one live connection plus one channel on top
//! of it, and every received [`Delivery`] carries an [`Acknowledger`] to settle it with the
//! broker. [`ConnectionFactory`] is the `lapin`-backed implementation; tests provide in-memory
//! ones so that reconnection and acknowledgement policies can be exercised without a broker.
//!
//! [`ConnectionFactory`]: crate::amqp::ConnectionFactory
//! [`Delivery`]: crate::consumers::Delivery
use crate::connection::ConnectError;
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;

/// A stream of messages pushed by the broker for a single subscription.
///
/// The stream ends (yields `None`) or errors when the broker drops the subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// `Dialer` defines an interface for types that are capable of opening a fresh [`Link`]
/// to the broker.
///
/// Each call must return a brand-new link: links are replaced, never repaired.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Link: Link;

    async fn dial(&self) -> Result<Self::Link, ConnectError>;
}

/// One logical link to the broker: a transport-level connection and a channel opened on it.
#[async_trait::async_trait]
pub trait Link: Send + Sync + 'static {
    /// Bound the number of unacknowledged messages the broker pushes to consumers of this link.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// Start a subscription on `queue_name`.
    async fn subscribe(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Send a message without waiting for a broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    /// Close the channel, then the connection.
    ///
    /// Closing an already closed link is a no-op.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

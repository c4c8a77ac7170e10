use crate::amqp::BasicPropertiesExt;
use crate::transport::Acknowledger;
use lapin::{
    types::{DeliveryTag, ShortString},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a [`Handler`](crate::consumers::Handler) receives for every message.
pub struct Incoming<'a, Context> {
    /// The shared context, provided to the consumer when it was built.
    pub context: Arc<Context>,
    pub message: &'a Delivery,
    pub queue_name: &'a str,
    /// Fires when the consumer is asked to stop.
    ///
    /// Long-running handlers can watch it to cut their work short.
    pub cancellation: &'a CancellationToken,
}

impl<'a, Context> Incoming<'a, Context> {
    /// How many times the broker claims it has delivered this message, 0 if unknown.
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count()
    }

    /// Deserialize the message body from JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.message.data)
    }
}

// A derived `Clone` would require `Context: Clone`.
impl<'a, Context> Clone for Incoming<'a, Context> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            message: self.message,
            queue_name: self.queue_name,
            cancellation: self.cancellation,
        }
    }
}

/// A message delivered by the broker, together with the means to settle it.
///
/// Settlement (ack/nack) is performed by the consumer according to the outcome of the
/// handler, it is not exposed to handlers.
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery from its parts.
    ///
    /// Useful to drive handlers (or a [`Link`](crate::transport::Link) implementation)
    /// without a broker.
    pub fn new(
        delivery_tag: DeliveryTag,
        data: Vec<u8>,
        properties: BasicProperties,
        acker: impl Acknowledger,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: ShortString::from(String::new()),
            routing_key: ShortString::from(String::new()),
            redelivered: false,
            properties,
            data,
            acker: Box::new(acker),
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Read the `x-delivery-count` header.
    ///
    /// Returns 0 if the header is absent or cannot be read as a non-negative integer.
    pub fn delivery_count(&self) -> u32 {
        self.properties.delivery_count()
    }

    pub(crate) async fn ack(&self) -> Result<(), anyhow::Error> {
        self.acker.ack().await
    }

    pub(crate) async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            acker: Box::new(delivery.acker),
        }
    }
}

use crate::connection::{Connection, ReconnectError};
use crate::publishers::MessageEnvelope;
use crate::transport::{Dialer, Link};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// # Fault tolerance
///
/// A failed send triggers a reconnection of the shared [`Connection`] followed by a single
/// retry. If the retry fails as well, the error is returned to the caller: `Publisher` never
/// blocks indefinitely waiting for the broker to come back.
///
/// Messages are sent without publisher confirms.
///
/// # How do I build a `Publisher`?
///
/// The starting point is [`Publisher::builder`].
pub struct Publisher<D: Dialer> {
    connection: Arc<Connection<D>>,
    /// Timeout on each send.
    timeout: Duration,
    /// Exchange used by [`Publisher::publish`].
    exchange_name: String,
}

impl<D: Dialer> Publisher<D> {
    /// Start building a [`Publisher`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use warren::amqp::configuration::RabbitMqSettings;
    /// use warren::amqp::ConnectionFactory;
    /// use warren::connection::Connection;
    /// use warren::publishers::Publisher;
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let settings = RabbitMqSettings::default();
    /// let factory = ConnectionFactory::new_from_config(&settings)?;
    /// let connection = Connection::connect(factory, settings.reconnect_policy()).await?;
    ///
    /// let publisher = Publisher::builder(Arc::new(connection))
    ///     .publish_timeout(std::time::Duration::from_secs(3))
    ///     .build();
    /// publisher.publish("invoices", &serde_json::json!({ "id": 1 })).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(connection: Arc<Connection<D>>) -> PublisherBuilder<D> {
        PublisherBuilder::new(connection)
    }

    /// Serialize `value` as JSON and publish it with `destination` as routing key.
    ///
    /// On the default exchange, `destination` is the name of the target queue.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        value: &T,
    ) -> Result<(), PublisherError> {
        let envelope = MessageEnvelope::json(value)?
            .with_exchange_name(self.exchange_name.as_str())
            .with_routing_key(destination);
        self.publish_envelope(envelope).await
    }

    /// Publish a pre-built message.
    ///
    /// A timestamp and a random `message_id` are added when missing.
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        let envelope = inject_amqp_properties(envelope);

        let (link, generation) = self.connection.link_with_generation().await;
        let first_error = match self.send(link, &envelope).await {
            Ok(()) => {
                debug!("Message published");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(error = ?first_error, "Failed to publish, reconnecting before retrying once");
        self.connection.reconnect_from(generation).await?;
        let link = self.connection.link().await;
        self.send(link, &envelope).await.map_err(|e| {
            error!(error = ?e, "Failed to publish after reconnecting");
            e
        })?;
        debug!("Message published after reconnecting");
        Ok(())
    }

    async fn send(
        &self,
        link: Option<Arc<D::Link>>,
        envelope: &MessageEnvelope,
    ) -> Result<(), PublisherError> {
        let link = link.ok_or_else(|| {
            PublisherError::GenericError(anyhow::anyhow!("There is no live link to the broker"))
        })?;
        let publish = link.publish(
            &envelope.exchange_name,
            &envelope.routing_key,
            &envelope.payload,
            envelope.properties.clone(),
        );
        tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| PublisherError::TimeoutError(self.timeout))?
            .map_err(PublisherError::GenericError)
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to serialize the message")]
    SerializationError(#[from] serde_json::Error),
    #[error("Generic error encountered when interacting with the broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold ({0:?}) was reached while trying to publish the message")]
    TimeoutError(Duration),
    #[error("Failed to reconnect to the broker after a failed publish")]
    ReconnectError(#[from] ReconnectError),
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<D: Dialer> {
    connection: Arc<Connection<D>>,
    timeout: Duration,
    exchange_name: String,
}

impl<D: Dialer> PublisherBuilder<D> {
    fn new(connection: Arc<Connection<D>>) -> Self {
        Self {
            connection,
            timeout: Duration::from_secs(3),
            exchange_name: String::new(),
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The exchange [`Publisher::publish`] sends messages to.
    /// Defaults to the default exchange (`""`), which routes messages by queue name.
    #[must_use]
    pub fn exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher<D> {
        Publisher {
            connection: self.connection,
            timeout: self.timeout,
            exchange_name: self.exchange_name,
        }
    }
}

fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    envelope
}

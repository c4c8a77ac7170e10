use crate::consumers::Delivery;
use crate::transport::{Acknowledger, DeliveryStream, Link};
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions,
    },
    types::FieldTable,
    BasicProperties,
};

const REPLY_SUCCESS: u16 = 200;

/// A `lapin` connection together with the channel opened on it.
pub struct AmqpLink {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

impl AmqpLink {
    pub(crate) fn new(connection: lapin::Connection, channel: lapin::Channel) -> Self {
        Self {
            connection,
            channel,
        }
    }

    /// Get access to the underlying raw channel, e.g. to declare queues and exchanges.
    pub fn raw_channel(&self) -> &lapin::Channel {
        &self.channel
    }
}

#[async_trait::async_trait]
impl Link for AmqpLink {
    #[tracing::instrument(name = "rabbitmq_set_prefetch", skip(self))]
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_subscribe", skip(self))]
    async fn subscribe(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|event| event.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let options = BasicPublishOptions {
            // Unroutable messages are silently dropped by the broker.
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0, `true` causes a not-supported error.
            immediate: false,
        };
        // No publisher confirms are enabled on this channel: the returned confirmation
        // resolves as soon as the frame has been handed over.
        let _ = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_close", skip(self))]
    async fn close(&self) -> Result<(), anyhow::Error> {
        // The channel must be released before the connection it lives on.
        let channel_closed = if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await
        } else {
            Ok(())
        };
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "closing").await?;
        }
        channel_closed.map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        Acker::ack(self, BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map(|_| ())
        .map_err(Into::into)
    }
}

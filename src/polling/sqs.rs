use crate::amqp::configuration::SqsSettings;
use crate::connection::ConnectError;
use crate::polling::{PollingQueue, QueueMessage};
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use aws_sdk_sqs::Client;
use std::time::Duration;
use tracing::warn;

/// An SQS queue, accessed through `aws-sdk-sqs`.
#[derive(Clone, Debug)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Build a client with static credentials.
    pub fn from_settings(settings: &SqsSettings) -> Result<Self, ConnectError> {
        settings.validate()?;
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.expose_secret().clone(),
            settings
                .session_token
                .as_ref()
                .map(|token| token.expose_secret().clone()),
            None,
            "warren",
        );
        let config = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .build();
        Ok(Self::new(Client::from_conf(config), settings.queue_url.clone()))
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait::async_trait]
impl PollingQueue for SqsQueue {
    #[tracing::instrument(name = "sqs_receive", level = "debug", skip(self), fields(queue_url = %self.queue_url))]
    async fn receive(
        &self,
        max_messages: u8,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, anyhow::Error> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(i32::from(max_messages))
            .wait_time_seconds(i32::try_from(wait.as_secs()).unwrap_or(i32::MAX))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await?;
        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_queue_message)
            .collect())
    }

    #[tracing::instrument(name = "sqs_delete", level = "debug", skip_all, fields(queue_url = %self.queue_url))]
    async fn delete(&self, receipt_handle: &str) -> Result<(), anyhow::Error> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await?;
        Ok(())
    }
}

fn into_queue_message(message: Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle else {
        warn!(message_id = ?message.message_id, "Skipping a message without receipt handle");
        return None;
    };
    let receive_count = message
        .attributes
        .as_ref()
        .and_then(|attributes| attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(0);
    Some(QueueMessage {
        message_id: message.message_id,
        receipt_handle,
        body: message.body.unwrap_or_default(),
        receive_count,
    })
}

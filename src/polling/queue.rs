use std::time::Duration;

/// A message fetched from a polling queue.
///
/// It stays on the queue, hidden from other consumers, until it is deleted or its visibility
/// timeout elapses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    /// Opaque token required to delete the message.
    pub receipt_handle: String,
    pub body: String,
    /// How many times the queue has handed this message out, including this time.
    ///
    /// Advisory: 0 if the queue did not report it.
    pub receive_count: u32,
}

/// A pull-based queue: messages are fetched in batches and deleted once processed.
///
/// There is no negative acknowledgement: a message that is not deleted becomes visible again
/// once the queue's visibility timeout elapses.
#[async_trait::async_trait]
pub trait PollingQueue: Send + Sync + 'static {
    /// Long-poll for up to `max_messages` messages, waiting at most `wait` for the first one.
    async fn receive(
        &self,
        max_messages: u8,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, anyhow::Error>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), anyhow::Error>;
}

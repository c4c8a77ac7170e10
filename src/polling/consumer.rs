use crate::consumers::{
    sleep_unless_cancelled, ConfigurationError, HandlerError, Outcome, WorkerPool,
};
use crate::polling::{
    PollingClosure, PollingClosureHandler, PollingError, PollingHandler, PollingQueue,
    QueueMessage, Received,
};
use futures_util::FutureExt;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The largest batch a polling queue hands out, and therefore the largest useful worker count.
pub const MAX_POLLING_WORKERS: usize = 10;
const BATCH_SIZE: u8 = 10;
const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);
const DEFAULT_RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(2);

/// Fetches messages from a [`PollingQueue`] in batches and processes them with a bounded number
/// of concurrent workers.
///
/// Use [`PollingConsumer::builder`] to build one, then drive it with [`PollingConsumer::run`].
pub struct PollingConsumer<Q, Context>
where
    Q: PollingQueue,
    Context: Send + Sync + 'static,
{
    queue: Arc<Q>,
    worker_count: NonZeroUsize,
    context: Arc<Context>,
    handler: Arc<dyn PollingHandler<Context>>,
    error_handlers: Arc<[Arc<dyn PollingHandler<Context>>]>,
    wait_time: Duration,
    receive_error_delay: Duration,
}

impl<Q, Context> PollingConsumer<Q, Context>
where
    Q: PollingQueue,
    Context: Send + Sync + 'static,
{
    pub fn builder(queue: Arc<Q>, context: Arc<Context>) -> PollingConsumerBuilder<Q, Context> {
        PollingConsumerBuilder {
            queue,
            worker_count: MAX_POLLING_WORKERS,
            context,
            error_handlers: Vec::new(),
            wait_time: DEFAULT_WAIT_TIME,
            receive_error_delay: DEFAULT_RECEIVE_ERROR_DELAY,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.get()
    }

    /// Poll the queue until `cancellation` fires or a fetch fails.
    ///
    /// A failed fetch is returned as [`PollingError::Receive`], after a short pause, once the
    /// in-flight workers have completed: restarting the consumer is up to the caller.
    /// Messages left undispatched on cancellation are not deleted, the queue hands them out
    /// again after their visibility timeout.
    #[tracing::instrument(name = "polling_consumer", skip_all)]
    pub async fn run(self, cancellation: CancellationToken) -> Result<(), PollingError> {
        let mut pool = WorkerPool::new(self.worker_count);

        let result = 'polling: loop {
            pool.reap();

            let received = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break Err(PollingError::Cancelled),
                received = self.queue.receive(BATCH_SIZE, self.wait_time) => received,
            };
            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = ?e, "Failed to receive messages from the queue");
                    if !sleep_unless_cancelled(self.receive_error_delay, &cancellation).await {
                        break Err(PollingError::Cancelled);
                    }
                    break Err(PollingError::Receive(e));
                }
            };
            if !messages.is_empty() {
                debug!(batch_size = messages.len(), "Received a batch of messages");
            }

            let mut messages = messages.into_iter();
            while let Some(message) = messages.next() {
                let slot = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        info!(
                            undispatched = messages.len() + 1,
                            "Received the cancellation signal, leaving the rest of the batch on the queue"
                        );
                        break 'polling Err(PollingError::Cancelled);
                    }
                    slot = pool.acquire() => slot,
                };
                let slot = match slot {
                    Ok(slot) => slot,
                    Err(e) => break 'polling Err(PollingError::WorkerPool(e)),
                };
                pool.spawn(
                    slot,
                    process(
                        Arc::clone(&self.queue),
                        message,
                        Arc::clone(&self.context),
                        Arc::clone(&self.handler),
                        Arc::clone(&self.error_handlers),
                        cancellation.clone(),
                    ),
                );
            }
        };

        pool.drain().await;
        info!("Polling consumer stopped");
        result
    }
}

#[tracing::instrument(
    name = "process_queue_message",
    level = "debug",
    skip_all,
    fields(message_id = ?message.message_id)
)]
async fn process<Q, Context>(
    queue: Arc<Q>,
    message: QueueMessage,
    context: Arc<Context>,
    handler: Arc<dyn PollingHandler<Context>>,
    error_handlers: Arc<[Arc<dyn PollingHandler<Context>>]>,
    cancellation: CancellationToken,
) -> Outcome
where
    Q: PollingQueue,
    Context: Send + Sync + 'static,
{
    let received = Received {
        context,
        message: &message,
        cancellation: &cancellation,
    };

    let result = AssertUnwindSafe(handler.handle(received.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(HandlerError::msg("The message handler panicked")));

    match result {
        Ok(()) => match queue.delete(&message.receipt_handle).await {
            Ok(()) => {
                debug!("Message processed");
                Outcome::Success
            }
            Err(e) => {
                error!(error = ?e, "Failed to delete a processed message");
                run_error_handlers(&error_handlers, received).await;
                Outcome::AckFailure
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                receive_count = message.receive_count,
                "Failed to process a message"
            );
            run_error_handlers(&error_handlers, received).await;
            Outcome::HandlerFailure
        }
    }
}

async fn run_error_handlers<Context>(
    error_handlers: &[Arc<dyn PollingHandler<Context>>],
    received: Received<'_, Context>,
) where
    Context: Send + Sync + 'static,
{
    for (position, error_handler) in error_handlers.iter().enumerate() {
        if let Err(e) = error_handler.handle(received.clone()).await {
            warn!(
                position,
                error = %e,
                "An error handler failed, skipping the rest of the chain"
            );
            break;
        }
    }
}

/// A builder for [`PollingConsumer`].
///
/// Use [`PollingConsumer::builder`] as entrypoint.
pub struct PollingConsumerBuilder<Q, Context>
where
    Q: PollingQueue,
    Context: Send + Sync + 'static,
{
    queue: Arc<Q>,
    worker_count: usize,
    context: Arc<Context>,
    error_handlers: Vec<Arc<dyn PollingHandler<Context>>>,
    wait_time: Duration,
    receive_error_delay: Duration,
}

impl<Q, Context> PollingConsumerBuilder<Q, Context>
where
    Q: PollingQueue,
    Context: Send + Sync + 'static,
{
    /// How many messages can be processed concurrently, between 1 and
    /// [`MAX_POLLING_WORKERS`]. Defaults to the maximum.
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// How long a single fetch waits for messages to show up. Defaults to 5 seconds.
    #[must_use]
    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Pause observed after a failed fetch, before [`PollingConsumer::run`] returns.
    /// Defaults to 2 seconds.
    #[must_use]
    pub fn receive_error_delay(mut self, delay: Duration) -> Self {
        self.receive_error_delay = delay;
        self
    }

    /// Add a handler to be invoked when the message handler fails, or when a processed
    /// message cannot be deleted.
    ///
    /// The first error handler that returns an error stops the chain.
    #[must_use]
    pub fn with_error_handler<H: PollingHandler<Context>>(self, error_handler: H) -> Self {
        self.with_dyn_error_handler(Arc::new(error_handler))
    }

    #[must_use]
    pub fn with_error_closure<H>(self, error_handler: H) -> Self
    where
        H: for<'a> PollingClosure<'a, Context>,
    {
        self.with_error_handler(PollingClosureHandler(error_handler))
    }

    #[must_use]
    pub fn with_dyn_error_handler(
        mut self,
        error_handler: Arc<dyn PollingHandler<Context>>,
    ) -> Self {
        self.error_handlers.push(error_handler);
        self
    }

    /// Specify the `async fn` in charge of processing messages and finalise the consumer.
    pub fn handler<H>(self, handler: H) -> Result<PollingConsumer<Q, Context>, ConfigurationError>
    where
        H: for<'a> PollingClosure<'a, Context>,
    {
        self.dyn_handler(Arc::new(PollingClosureHandler(handler)))
    }

    /// Specify the [`PollingHandler`] in charge of processing messages and finalise the consumer.
    pub fn dyn_handler(
        self,
        handler: Arc<dyn PollingHandler<Context>>,
    ) -> Result<PollingConsumer<Q, Context>, ConfigurationError> {
        let worker_count = NonZeroUsize::new(self.worker_count)
            .filter(|count| count.get() <= MAX_POLLING_WORKERS)
            .ok_or(ConfigurationError::InvalidWorkerCount {
                actual: self.worker_count,
                min: 1,
                max: MAX_POLLING_WORKERS,
            })?;

        Ok(PollingConsumer {
            queue: self.queue,
            worker_count,
            context: self.context,
            handler,
            error_handlers: self.error_handlers.into(),
            wait_time: self.wait_time,
            receive_error_delay: self.receive_error_delay,
        })
    }
}

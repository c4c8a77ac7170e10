use crate::connection::{Connection, Generation, ReconnectError};
use crate::consumers::{
    ConsumerBuilder, ConsumerError, Delivery, Handler, HandlerError, Incoming, WorkerPool,
};
use crate::transport::{DeliveryStream, Dialer, Link};
use futures_util::{FutureExt, StreamExt};
use std::num::{NonZeroU16, NonZeroUsize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to a single message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded and the message was acknowledged.
    Success,
    /// The handler failed (or panicked): the message was negatively acknowledged with requeue
    /// and the error-handler chain was invoked.
    HandlerFailure,
    /// The handler succeeded but the acknowledgement did not reach the broker.
    AckFailure,
}

/// How a consumer reacts when the connection cannot be re-established.
///
/// Every failed recovery (the connection reported its reconnect attempts as exhausted)
/// is followed by a `backoff` pause before trying again.
/// With `max_disruptions` set, the consumer gives up after that many consecutive failed
/// recoveries and returns [`ConsumerError::Disrupted`]. By default it never gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisionPolicy {
    pub backoff: Duration,
    pub max_disruptions: Option<u32>,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            max_disruptions: None,
        }
    }
}

/// Running count of message outcomes, reported when the consumer stops.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    succeeded: u64,
    failed: u64,
    unacknowledged: u64,
}

impl Tally {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::HandlerFailure => self.failed += 1,
            Outcome::AckFailure => {
                self.unacknowledged += 1;
                debug!(
                    unacknowledged = self.unacknowledged,
                    "A processed message could not be acknowledged"
                );
            }
        }
    }
}

/// Why the subscription stopped pumping messages.
enum Stopped {
    Cancelled,
    StreamClosed,
}

/// A long-lived subscription to a queue, processing messages with a bounded number of
/// concurrent workers.
///
/// Use [`Consumer::builder`] to build one, then drive it with [`Consumer::run`].
pub struct Consumer<D, Context>
where
    D: Dialer,
    Context: Send + Sync + 'static,
{
    pub(super) connection: Arc<Connection<D>>,
    pub(super) queue_name: Arc<str>,
    pub(super) consumer_tag: String,
    pub(super) worker_count: NonZeroU16,
    pub(super) context: Arc<Context>,
    pub(super) handler: Arc<dyn Handler<Context>>,
    pub(super) error_handlers: Arc<[Arc<dyn Handler<Context>>]>,
    pub(super) resubscribe_delay: Duration,
    pub(super) supervision: SupervisionPolicy,
}

impl<D, Context> Consumer<D, Context>
where
    D: Dialer,
    Context: Send + Sync + 'static,
{
    pub fn builder(
        connection: Arc<Connection<D>>,
        queue_name: impl Into<String>,
        context: Arc<Context>,
    ) -> ConsumerBuilder<D, Context> {
        ConsumerBuilder::new(connection, queue_name.into(), context)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn worker_count(&self) -> u16 {
        self.worker_count.get()
    }

    /// Consume messages until `cancellation` fires.
    ///
    /// The prefetch count is set to the worker count, so the broker never pushes more
    /// messages than there are workers to process them.
    ///
    /// When the subscription breaks, the consumer pauses, asks the shared [`Connection`] to
    /// reconnect and subscribes again. Failures to recover are handled according to the
    /// [`SupervisionPolicy`].
    ///
    /// On cancellation it stops taking new messages, waits for in-flight workers to complete
    /// and returns [`ConsumerError::Cancelled`].
    #[tracing::instrument(name = "consumer", skip_all, fields(queue_name = %self.queue_name, consumer_tag = %self.consumer_tag))]
    pub async fn run(self, cancellation: CancellationToken) -> Result<(), ConsumerError> {
        let capacity = NonZeroUsize::from(self.worker_count);
        let mut pool = WorkerPool::new(capacity);
        let mut disruptions = 0u32;
        let mut tally = Tally::default();

        let result = loop {
            if cancellation.is_cancelled() {
                break Err(ConsumerError::Cancelled);
            }

            let (link, generation) = self.connection.link_with_generation().await;
            match self.subscribe(link).await {
                Ok(stream) => {
                    info!(worker_count = self.worker_count.get(), "Subscribed");
                    match self.pump(stream, &mut pool, &mut tally, &cancellation).await {
                        Ok(Stopped::Cancelled) => break Err(ConsumerError::Cancelled),
                        Ok(Stopped::StreamClosed) => {}
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => warn!(error = ?e, "Failed to subscribe"),
            }

            if !sleep_unless_cancelled(self.resubscribe_delay, &cancellation).await {
                break Err(ConsumerError::Cancelled);
            }

            let reconnected = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break Err(ConsumerError::Cancelled),
                reconnected = self.recover(generation) => reconnected,
            };
            match reconnected {
                Ok(()) => disruptions = 0,
                Err(ReconnectError::Closed) => break Err(ConsumerError::ConnectionClosed),
                Err(e) => {
                    disruptions += 1;
                    error!(error = ?e, disruptions, "Could not recover the subscription");
                    if let Some(max_disruptions) = self.supervision.max_disruptions {
                        if disruptions >= max_disruptions {
                            break Err(ConsumerError::Disrupted { disruptions });
                        }
                    }
                    if !sleep_unless_cancelled(self.supervision.backoff, &cancellation).await {
                        break Err(ConsumerError::Cancelled);
                    }
                }
            }
        };

        for outcome in pool.drain().await {
            tally.record(outcome);
        }
        info!(
            succeeded = tally.succeeded,
            failed = tally.failed,
            unacknowledged = tally.unacknowledged,
            "Consumer stopped"
        );
        result
    }

    async fn subscribe(
        &self,
        link: Option<Arc<D::Link>>,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let link = link.ok_or_else(|| anyhow::anyhow!("There is no live link to the broker"))?;
        link.set_prefetch(self.worker_count.get()).await?;
        link.subscribe(&self.queue_name, &self.consumer_tag).await
    }

    /// Ask the connection to replace the link of `failed_generation`.
    ///
    /// The reconnection runs on its own task: if the consumer is cancelled while waiting,
    /// the episode still completes and leaves the shared connection in a settled state.
    async fn recover(&self, failed_generation: Generation) -> Result<(), ReconnectError> {
        let connection = Arc::clone(&self.connection);
        let episode =
            tokio::spawn(async move { connection.reconnect_from(failed_generation).await });
        match episode.await {
            Ok(reconnected) => reconnected,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Only happens when the runtime is shutting down.
            Err(_) => Err(ReconnectError::Closed),
        }
    }

    /// Hand every delivery of `stream` over to a worker, until the stream ends or
    /// `cancellation` fires.
    async fn pump(
        &self,
        mut stream: DeliveryStream,
        pool: &mut WorkerPool<Outcome>,
        tally: &mut Tally,
        cancellation: &CancellationToken,
    ) -> Result<Stopped, ConsumerError> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    info!("Received the cancellation signal");
                    return Ok(Stopped::Cancelled);
                }
                Some(joined) = pool.join_next(), if !pool.is_idle() => {
                    match joined {
                        Ok(outcome) => tally.record(outcome),
                        Err(e) => error!(error = ?e, "A worker task did not complete"),
                    }
                    continue;
                }
                event = stream.next() => match event {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(error = ?e, "The subscription failed");
                        return Ok(Stopped::StreamClosed);
                    }
                    None => {
                        warn!("The broker closed the subscription");
                        return Ok(Stopped::StreamClosed);
                    }
                },
            };

            let slot = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    // Nobody is going to process it: give it back to the broker right away.
                    if let Err(e) = delivery.nack(true).await {
                        warn!(error = ?e, delivery_tag = delivery.delivery_tag, "Failed to requeue an undispatched message");
                    }
                    info!("Received the cancellation signal");
                    return Ok(Stopped::Cancelled);
                }
                slot = pool.acquire() => slot?,
            };

            pool.spawn(
                slot,
                process(
                    delivery,
                    Arc::clone(&self.context),
                    Arc::clone(&self.queue_name),
                    Arc::clone(&self.handler),
                    Arc::clone(&self.error_handlers),
                    cancellation.clone(),
                ),
            );
        }
    }
}

/// Run the handler on a single delivery and settle it according to the result.
#[tracing::instrument(
    name = "process_message",
    level = "debug",
    skip_all,
    fields(delivery_tag = delivery.delivery_tag)
)]
async fn process<Context>(
    delivery: Delivery,
    context: Arc<Context>,
    queue_name: Arc<str>,
    handler: Arc<dyn Handler<Context>>,
    error_handlers: Arc<[Arc<dyn Handler<Context>>]>,
    cancellation: CancellationToken,
) -> Outcome
where
    Context: Send + Sync + 'static,
{
    let incoming = Incoming {
        context,
        message: &delivery,
        queue_name: &queue_name,
        cancellation: &cancellation,
    };

    let result = AssertUnwindSafe(handler.handle(incoming.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(HandlerError::msg("The message handler panicked")));

    match result {
        Ok(()) => match delivery.ack().await {
            Ok(()) => {
                debug!("Message processed");
                Outcome::Success
            }
            Err(e) => {
                error!(error = ?e, "Failed to acknowledge a processed message");
                Outcome::AckFailure
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                delivery_count = delivery.delivery_count(),
                "Failed to process a message"
            );
            if let Err(e) = delivery.nack(true).await {
                error!(error = ?e, "Failed to requeue a message");
            }
            run_error_handlers(&error_handlers, incoming).await;
            Outcome::HandlerFailure
        }
    }
}

/// Invoke the error handlers in order, stopping at the first one that fails.
async fn run_error_handlers<Context>(
    error_handlers: &[Arc<dyn Handler<Context>>],
    incoming: Incoming<'_, Context>,
) where
    Context: Send + Sync + 'static,
{
    for (position, error_handler) in error_handlers.iter().enumerate() {
        if let Err(e) = error_handler.handle(incoming.clone()).await {
            warn!(
                position,
                error = %e,
                "An error handler failed, skipping the rest of the chain"
            );
            break;
        }
    }
}

/// Returns `false` if `cancellation` fired before `duration` elapsed.
pub(crate) async fn sleep_unless_cancelled(
    duration: Duration,
    cancellation: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

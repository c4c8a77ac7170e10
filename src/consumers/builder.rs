use crate::connection::Connection;
use crate::consumers::{
    AsyncClosure, ClosureHandler, ConfigurationError, Consumer, Handler, SupervisionPolicy,
};
use crate::transport::Dialer;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_WORKER_COUNT: u16 = 10;
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// A builder for [`Consumer`].
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder<D, Context>
where
    D: Dialer,
    Context: Send + Sync + 'static,
{
    connection: Arc<Connection<D>>,
    queue_name: String,
    consumer_tag: Option<String>,
    worker_count: u16,
    context: Arc<Context>,
    error_handlers: Vec<Arc<dyn Handler<Context>>>,
    resubscribe_delay: Duration,
    supervision: SupervisionPolicy,
}

impl<D, Context> ConsumerBuilder<D, Context>
where
    D: Dialer,
    Context: Send + Sync + 'static,
{
    pub(super) fn new(
        connection: Arc<Connection<D>>,
        queue_name: String,
        context: Arc<Context>,
    ) -> Self {
        Self {
            connection,
            queue_name,
            consumer_tag: None,
            worker_count: DEFAULT_WORKER_COUNT,
            context,
            error_handlers: Vec::new(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            supervision: SupervisionPolicy::default(),
        }
    }

    /// How many messages can be processed concurrently.
    ///
    /// It is also used as prefetch count for the subscription.
    /// If not configured, it defaults to 10. It must be at least 1.
    #[must_use]
    pub fn worker_count(mut self, worker_count: u16) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// The label the broker shows for this subscription.
    ///
    /// If not configured, a random one is generated.
    #[must_use]
    pub fn consumer_tag<T: Into<String>>(mut self, consumer_tag: T) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Add a handler to be invoked when the message handler fails.
    ///
    /// Error handlers run in the order they are registered. The first one that returns an
    /// error stops the chain.
    #[must_use]
    pub fn with_error_handler<H: Handler<Context>>(self, error_handler: H) -> Self {
        self.with_dyn_error_handler(Arc::new(error_handler))
    }

    /// Add an `async fn` to be invoked when the message handler fails.
    ///
    /// See [`ConsumerBuilder::with_error_handler`].
    #[must_use]
    pub fn with_error_closure<H>(self, error_handler: H) -> Self
    where
        H: for<'a> AsyncClosure<'a, Context>,
    {
        self.with_error_handler(ClosureHandler(error_handler))
    }

    /// Append a dynamic error handler, see [`ConsumerBuilder::with_error_handler`].
    #[must_use]
    pub fn with_dyn_error_handler(mut self, error_handler: Arc<dyn Handler<Context>>) -> Self {
        self.error_handlers.push(error_handler);
        self
    }

    /// How long to wait, after the subscription broke, before trying to reconnect.
    ///
    /// If not configured, it defaults to 2 seconds.
    #[must_use]
    pub fn resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    #[must_use]
    pub fn supervision(mut self, supervision: SupervisionPolicy) -> Self {
        self.supervision = supervision;
        self
    }

    /// Specify the `async fn` in charge of processing messages and finalise the consumer.
    ///
    /// The handler must have the following signature:
    /// ```ignore
    /// async fn(incoming: Incoming<'_, Context>) -> Result<(), impl Into<HandlerError>>;
    /// ```
    pub fn handler<H>(self, handler: H) -> Result<Consumer<D, Context>, ConfigurationError>
    where
        H: for<'a> AsyncClosure<'a, Context>,
    {
        self.dyn_handler(Arc::new(ClosureHandler(handler)))
    }

    /// Specify the [`Handler`] in charge of processing messages and finalise the consumer.
    pub fn dyn_handler(
        self,
        handler: Arc<dyn Handler<Context>>,
    ) -> Result<Consumer<D, Context>, ConfigurationError> {
        let worker_count = NonZeroU16::new(self.worker_count).ok_or(
            ConfigurationError::InvalidWorkerCount {
                actual: 0,
                min: 1,
                max: u16::MAX as usize,
            },
        )?;
        if self.queue_name.trim().is_empty() {
            return Err(ConfigurationError::MissingQueueName);
        }
        let consumer_tag = self
            .consumer_tag
            .unwrap_or_else(|| format!("{}-{}", self.queue_name, uuid::Uuid::new_v4()));

        Ok(Consumer {
            connection: self.connection,
            queue_name: self.queue_name.into(),
            consumer_tag,
            worker_count,
            context: self.context,
            handler,
            error_handlers: self.error_handlers.into(),
            resubscribe_delay: self.resubscribe_delay,
            supervision: self.supervision,
        })
    }
}

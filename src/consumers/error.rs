use std::fmt;
use tokio::sync::AcquireError;

/// The error type returned by message handlers.
///
/// Any error that can be converted into an [`anyhow::Error`] converts into a `HandlerError`,
/// so handlers can use `?` freely.
///
/// Returning a `HandlerError` marks the message as failed: it is negatively acknowledged
/// (AMQP) or left on the queue (polling) and the error-handler chain is invoked.
pub struct HandlerError(anyhow::Error);

impl HandlerError {
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handling of a message failed: {:#}", self.0)
    }
}

/// Invalid settings, detected before any interaction with the broker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("The worker count must be between {min} and {max}, got {actual}")]
    InvalidWorkerCount {
        actual: usize,
        min: usize,
        max: usize,
    },
    #[error("A queue name is required")]
    MissingQueueName,
}

/// Error returned by [`Consumer::run`](super::Consumer::run).
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The cancellation token fired and all in-flight workers have completed.
    ///
    /// This is how a consumer stops under normal circumstances.
    #[error("The consumer was cancelled")]
    Cancelled,
    #[error("The connection to the broker has been closed")]
    ConnectionClosed,
    #[error("Gave up after {disruptions} consecutive failed attempts to recover the subscription")]
    Disrupted { disruptions: u32 },
    #[error("The worker pool has been shut down")]
    WorkerPool(#[from] AcquireError),
}

impl ConsumerError {
    /// `true` if the consumer stopped because it was asked to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

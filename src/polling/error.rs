use crate::consumers::ConfigurationError;
use tokio::sync::AcquireError;

/// Error returned by [`PollingConsumer::run`](super::PollingConsumer::run).
#[derive(thiserror::Error, Debug)]
pub enum PollingError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The cancellation token fired and all in-flight workers have completed.
    #[error("The polling consumer was cancelled")]
    Cancelled,
    #[error("Failed to receive messages from the queue")]
    Receive(#[source] anyhow::Error),
    #[error("The worker pool has been shut down")]
    WorkerPool(#[from] AcquireError),
}

impl PollingError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

use crate::consumers::HandlerError;
use crate::polling::QueueMessage;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a [`PollingHandler`] receives for every message.
pub struct Received<'a, Context> {
    pub context: Arc<Context>,
    pub message: &'a QueueMessage,
    pub cancellation: &'a CancellationToken,
}

impl<'a, Context> Received<'a, Context> {
    /// Deserialize the message body from JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.message.body)
    }
}

impl<'a, Context> Clone for Received<'a, Context> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            message: self.message,
            cancellation: self.cancellation,
        }
    }
}

/// Processes messages fetched from a [`PollingQueue`](crate::polling::PollingQueue).
///
/// `Ok(())` deletes the message from the queue. An error leaves it there (it will be
/// delivered again once its visibility timeout elapses) and triggers the error-handler chain.
///
/// Error handlers implement this same trait.
#[async_trait::async_trait]
pub trait PollingHandler<Context: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(&self, received: Received<'_, Context>) -> Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<Context, H> PollingHandler<Context> for Box<H>
where
    Context: Send + Sync + 'static,
    H: PollingHandler<Context> + ?Sized,
{
    async fn handle(&self, received: Received<'_, Context>) -> Result<(), HandlerError> {
        H::handle(self, received).await
    }
}

/// `PollingClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(received: Received<'_, Context>) -> Result<(), impl Into<HandlerError>>;
/// ```
pub trait PollingClosure<'a, Context>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<HandlerError> + 'static;
    fn call(&'a self, received: Received<'a, Context>) -> Self::Output;
}

impl<'a, F, Fut, Err, Context> PollingClosure<'a, Context> for F
where
    Context: 'static,
    F: Send + Sync + 'static,
    F: Fn(Received<'a, Context>) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<HandlerError> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&'a self, received: Received<'a, Context>) -> Self::Output {
        (self)(received)
    }
}

/// Wrapper type to turn a [`PollingClosure`] into a [`PollingHandler`].
pub struct PollingClosureHandler<H>(pub H);

#[async_trait::async_trait]
impl<Context, F> PollingHandler<Context> for PollingClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: for<'a> PollingClosure<'a, Context>,
{
    async fn handle(&self, received: Received<'_, Context>) -> Result<(), HandlerError> {
        self.0.call(received).await.map_err(|e| e.into())
    }
}

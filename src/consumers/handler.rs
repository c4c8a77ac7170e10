use crate::consumers::{HandlerError, Incoming};
use std::future::Future;

/// Implementers of the `Handler` trait process messages retrieved from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying channel.
/// The framework takes care of acking/nacking the message according to the outcome of
/// processing: `Ok(())` acknowledges the message, an error negatively acknowledges it
/// (with requeue) and triggers the error-handler chain.
///
/// Error handlers share this very same trait: they receive the failed message and
/// their own `Err` stops the chain.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on our implementation of `Handler` for async functions with a matching signature -
/// `async fn(Incoming<'_, Context>) -> Result<(), impl Into<HandlerError>>`.
#[async_trait::async_trait]
pub trait Handler<Context: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), HandlerError>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler<Context>>.
#[async_trait::async_trait]
impl<Context, H> Handler<Context> for Box<H>
where
    Context: Send + Sync + 'static,
    H: Handler<Context> + ?Sized,
{
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), HandlerError> {
        H::handle(self, incoming).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: Incoming<'_, Context>) -> Result<(), impl Into<HandlerError>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`].
/// [`ConsumerBuilder::handler`](crate::consumers::ConsumerBuilder::handler) performs this
/// wrapping for you.
pub trait AsyncClosure<'a, Context>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<HandlerError> + 'static;
    fn call(&'a self, incoming: Incoming<'a, Context>) -> Self::Output;
}

impl<'a, F, Fut, Err, Context> AsyncClosure<'a, Context> for F
where
    Context: 'static,
    F: Send + Sync + 'static,
    F: Fn(Incoming<'a, Context>) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<HandlerError> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&'a self, incoming: Incoming<'a, Context>) -> Self::Output {
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<H>(pub H);

#[async_trait::async_trait]
impl<Context, F> Handler<Context> for ClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: for<'a> AsyncClosure<'a, Context>,
{
    async fn handle(&self, incoming: Incoming<'_, Context>) -> Result<(), HandlerError> {
        self.0.call(incoming).await.map_err(|e| e.into())
    }
}

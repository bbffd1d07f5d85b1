//! Handler traits and the erased handler functions stored by the buses.
//!
//! Handlers can be written as async closures or as types implementing
//! [`CommandHandler`], [`QueryHandler`] or [`EventHandler`]. Either way the
//! bus captures the concrete payload type at registration and stores a
//! [`HandlerFn`] (or [`QueryHandlerFn`]) that restores it on every call.

use crate::context::Context;
use crate::errors::{BoxError, BusError, BusResult};
use crate::key::HandlerKey;
use crate::message::{Message, Payload, Reply};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// Future returned by an erased handler.
pub type HandlerFuture<T> = BoxFuture<'static, BusResult<T>>;

/// An erased handler producing a `T`.
pub type ErasedHandler<T> = Arc<dyn Fn(Context, Payload) -> HandlerFuture<T> + Send + Sync>;

/// Erased command or event handler; also the type command and event
/// middleware transform.
pub type HandlerFn = ErasedHandler<()>;

/// Erased query handler; also the type query middleware transforms.
pub type QueryHandlerFn = ErasedHandler<Reply>;

/// Handles one command type.
///
/// # Example
///
/// ```rust,ignore
/// struct OpenAccountHandler { accounts: AccountRepository }
///
/// #[async_trait]
/// impl CommandHandler<OpenAccount> for OpenAccountHandler {
///     async fn handle(&self, ctx: Context, command: Arc<OpenAccount>) -> Result<(), BoxError> {
///         let mut account = Account::open(&command.owner)?;
///         self.accounts.save(&ctx, &account).await?;
///         if let Some(events) = get_event_provider(&ctx) {
///             events.collect_from(&mut account);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait CommandHandler<C: Message>: Send + Sync + 'static {
    /// Processes `command`.
    async fn handle(&self, ctx: Context, command: Arc<C>) -> Result<(), BoxError>;
}

/// Handles one query type and produces its result.
#[async_trait]
pub trait QueryHandler<Q: Message>: Send + Sync + 'static {
    /// The result type; must be a struct or pointer to struct.
    type Output: Message;

    /// Answers `query`.
    async fn handle(&self, ctx: Context, query: Arc<Q>) -> Result<Self::Output, BoxError>;
}

/// Reacts to one event type. Any number may be registered per type.
#[async_trait]
pub trait EventHandler<E: Message>: Send + Sync + 'static {
    /// Reacts to `event`.
    async fn handle(&self, ctx: Context, event: Arc<E>) -> Result<(), BoxError>;
}

fn payload_mismatch<M: Message>(payload: &Payload) -> BusError {
    BusError::PayloadTypeMismatch {
        expected: HandlerKey::of::<M>(),
        actual: payload.key(),
    }
}

/// Erases an async closure handling payloads of type `M`.
///
/// Errors returned by the closure are wrapped in [`BusError::Handler`]
/// unless they already are a `BusError`.
pub fn handler_fn<M, F, Fut, E>(handler: F) -> HandlerFn
where
    M: Message,
    F: Fn(Context, Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<()> {
        match payload.downcast::<M>() {
            Some(message) => handler(ctx, message)
                .map(|result| result.map_err(BusError::from_handler))
                .boxed(),
            None => future::ready(Err(payload_mismatch::<M>(&payload))).boxed(),
        }
    })
}

/// Erases an async closure answering queries of type `Q` with an `R`.
pub fn query_handler_fn<Q, R, F, Fut, E>(handler: F) -> QueryHandlerFn
where
    Q: Message,
    R: Message,
    F: Fn(Context, Arc<Q>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<Reply> {
        match payload.downcast::<Q>() {
            Some(query) => handler(ctx, query)
                .map(|result| result.map(Reply::new).map_err(BusError::from_handler))
                .boxed(),
            None => future::ready(Err(payload_mismatch::<Q>(&payload))).boxed(),
        }
    })
}

pub(crate) fn command_handler_fn<C, H>(handler: H) -> HandlerFn
where
    C: Message,
    H: CommandHandler<C>,
{
    let handler = Arc::new(handler);
    handler_fn(move |ctx, command: Arc<C>| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(ctx, command).await }
    })
}

pub(crate) fn event_handler_fn<E, H>(handler: H) -> HandlerFn
where
    E: Message,
    H: EventHandler<E>,
{
    let handler = Arc::new(handler);
    handler_fn(move |ctx, event: Arc<E>| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(ctx, event).await }
    })
}

pub(crate) fn query_handler_object_fn<Q, H>(handler: H) -> QueryHandlerFn
where
    Q: Message,
    H: QueryHandler<Q>,
{
    let handler = Arc::new(handler);
    query_handler_fn(move |ctx, query: Arc<Q>| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(ctx, query).await }
    })
}

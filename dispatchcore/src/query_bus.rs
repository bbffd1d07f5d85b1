//! Unicast dispatch of queries.

use crate::context::Context;
use crate::errors::{BoxError, BusError, BusResult, RegistrationError};
use crate::handler::{query_handler_fn, query_handler_object_fn, QueryHandler, QueryHandlerFn};
use crate::key::HandlerKey;
use crate::message::{Message, Payload, Reply};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::HandlerRegistry;
use crate::signature::{HandlerKind, HandlerSignature};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Routes every query to the single handler registered for its type and
/// hands back the handler's result.
#[derive(Debug)]
pub struct QueryBus {
    registry: HandlerRegistry<QueryHandlerFn>,
    middleware: MiddlewareChain<QueryHandlerFn>,
}

impl QueryBus {
    /// Creates a bus with no handlers and no middleware.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(HandlerKind::Query),
            middleware: MiddlewareChain::new(),
        }
    }

    /// Appends `middleware`; it runs inside every middleware added before it.
    pub fn use_middleware(&self, middleware: impl Middleware<QueryHandlerFn>) {
        self.middleware.push(middleware);
        debug!(layers = self.middleware.len(), "Added query middleware");
    }

    /// Registers an async closure answering queries of type `Q` with an `R`.
    ///
    /// `R` must be a struct or pointer to struct.
    pub fn register<Q, R, F, Fut, E>(&self, handler: F) -> Result<HandlerKey, RegistrationError>
    where
        Q: Message,
        R: Message,
        F: Fn(Context, Arc<Q>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.registry.register(
            &HandlerSignature::query::<Q, R>(),
            Some(query_handler_fn(handler)),
        )
    }

    /// Registers a [`QueryHandler`] for queries of type `Q`.
    pub fn register_handler<Q, H>(&self, handler: H) -> Result<HandlerKey, RegistrationError>
    where
        Q: Message,
        H: QueryHandler<Q>,
    {
        self.registry.register(
            &HandlerSignature::query::<Q, H::Output>(),
            Some(query_handler_object_fn::<Q, H>(handler)),
        )
    }

    /// Registers an already erased handler described by `signature`.
    pub fn register_dynamic(
        &self,
        signature: &HandlerSignature,
        handler: Option<QueryHandlerFn>,
    ) -> Result<HandlerKey, RegistrationError> {
        self.registry.register(signature, handler)
    }

    /// Executes `query` and returns its result as an `R`.
    ///
    /// Fails with [`BusError::ReplyTypeMismatch`] if the handler chain
    /// produced something other than an `R`.
    pub async fn execute<Q: Message, R: Message>(&self, ctx: &Context, query: Q) -> BusResult<R> {
        let reply = self.execute_payload(ctx, Payload::new(query)).await?;
        let actual = reply.key();
        reply.downcast::<R>().map_err(|_| BusError::ReplyTypeMismatch {
            expected: HandlerKey::of::<R>(),
            actual,
        })
    }

    /// Executes an already erased query.
    #[instrument(
        name = "query",
        skip_all,
        fields(query = %payload.key(), correlation_id = %ctx.correlation_id())
    )]
    pub async fn execute_payload(&self, ctx: &Context, payload: Payload) -> BusResult<Reply> {
        payload.ensure_routable()?;
        let key = payload.key();
        let handler = self
            .registry
            .handler(&key)
            .ok_or(BusError::HandlerNotFound(key))?;

        debug!("Executing query");
        let chain = self.middleware.compose(handler);
        chain(ctx.clone(), payload).await
    }

    /// Whether a handler is registered for `Q`.
    pub fn is_registered<Q: Message>(&self) -> bool {
        self.registry.contains(&HandlerKey::of::<Q>())
    }

    /// Keys of every registered query type.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        self.registry.keys()
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Unicast dispatch of commands.

use crate::context::Context;
use crate::errors::{BoxError, BusError, BusResult, RegistrationError};
use crate::handler::{command_handler_fn, handler_fn, CommandHandler, HandlerFn};
use crate::key::HandlerKey;
use crate::message::{Message, Payload};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::HandlerRegistry;
use crate::signature::{HandlerKind, HandlerSignature};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Routes every command to the single handler registered for its type.
///
/// # Example
///
/// ```rust,ignore
/// let bus = CommandBus::new();
/// bus.use_middleware(TracingMiddleware::new());
/// bus.register(|ctx: Context, command: Arc<OpenAccount>| async move {
///     accounts.open(&ctx, &command.owner).await
/// })?;
///
/// bus.execute(&Context::background(), OpenAccount { owner: "ada".into() }).await?;
/// ```
#[derive(Debug)]
pub struct CommandBus {
    registry: HandlerRegistry<HandlerFn>,
    middleware: MiddlewareChain<HandlerFn>,
}

impl CommandBus {
    /// Creates a bus with no handlers and no middleware.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(HandlerKind::Command),
            middleware: MiddlewareChain::new(),
        }
    }

    /// Appends `middleware`; it runs inside every middleware added before it.
    pub fn use_middleware(&self, middleware: impl Middleware<HandlerFn>) {
        self.middleware.push(middleware);
        debug!(layers = self.middleware.len(), "Added command middleware");
    }

    /// Registers an async closure for commands of type `C`.
    pub fn register<C, F, Fut, E>(&self, handler: F) -> Result<HandlerKey, RegistrationError>
    where
        C: Message,
        F: Fn(Context, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.registry
            .register(&HandlerSignature::command::<C>(), Some(handler_fn(handler)))
    }

    /// Registers a [`CommandHandler`] for commands of type `C`.
    pub fn register_handler<C, H>(&self, handler: H) -> Result<HandlerKey, RegistrationError>
    where
        C: Message,
        H: CommandHandler<C>,
    {
        self.registry.register(
            &HandlerSignature::command::<C>(),
            Some(command_handler_fn::<C, H>(handler)),
        )
    }

    /// Registers an already erased handler described by `signature`.
    pub fn register_dynamic(
        &self,
        signature: &HandlerSignature,
        handler: Option<HandlerFn>,
    ) -> Result<HandlerKey, RegistrationError> {
        self.registry.register(signature, handler)
    }

    /// Executes `command` through the middleware chain and its handler.
    pub async fn execute<C: Message>(&self, ctx: &Context, command: C) -> BusResult<()> {
        self.execute_payload(ctx, Payload::new(command)).await
    }

    /// Executes an already erased command.
    #[instrument(
        name = "command",
        skip_all,
        fields(command = %payload.key(), correlation_id = %ctx.correlation_id())
    )]
    pub async fn execute_payload(&self, ctx: &Context, payload: Payload) -> BusResult<()> {
        payload.ensure_routable()?;
        let key = payload.key();
        let handler = self
            .registry
            .handler(&key)
            .ok_or(BusError::HandlerNotFound(key))?;

        debug!("Executing command");
        let chain = self.middleware.compose(handler);
        chain(ctx.clone(), payload).await
    }

    /// Whether a handler is registered for `C`.
    pub fn is_registered<C: Message>(&self) -> bool {
        self.registry.contains(&HandlerKey::of::<C>())
    }

    /// Keys of every registered command type.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        self.registry.keys()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

//! `dispatchcore` - In-process CQRS dispatch
//!
//! Routes commands to exactly one handler, queries to exactly one handler
//! that returns a result, and events to every handler registered for their
//! type. Handlers are keyed by the payload's type and checked for shape
//! when registered, so dispatch never has to guess.
//!
//! Each bus owns a middleware chain composed onion-style around the target
//! handler. The bundled middleware give commands a unit of work:
//!
//! 1. [`EventProviderMiddleware`] attaches a request-scoped event buffer
//! 2. [`EventDispatchMiddleware`] publishes the buffered events once the
//!    command succeeded
//! 3. [`TransactionMiddleware`] commits or rolls back around the handler
//!
//! Installed in that order, events reach the [`EventBus`] only after the
//! transaction committed.
//!
//! ```rust,ignore
//! use dispatchcore::prelude::*;
//!
//! let events = Arc::new(EventBus::new());
//! events.register(|_ctx, event: Arc<AccountOpened>| async move {
//!     tracing::info!(owner = %event.owner, "welcome mail queued");
//!     Ok::<_, BoxError>(())
//! })?;
//!
//! let commands = CommandBus::new();
//! install_unit_of_work(&commands, Arc::clone(&events), transactions);
//! commands.register(|ctx, command: Arc<OpenAccount>| async move {
//!     if let Some(provider) = get_event_provider(&ctx) {
//!         provider.collect_event(AccountOpened { owner: command.owner.clone() });
//!     }
//!     Ok::<_, BoxError>(())
//! })?;
//!
//! commands.execute(&Context::background(), OpenAccount { owner: "ada".into() }).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancellation;
pub mod command_bus;
pub mod config;
pub mod context;
pub mod errors;
pub mod event_bus;
pub mod event_provider;
pub mod handler;
pub mod key;
pub mod message;
pub mod middleware;
pub mod query_bus;
pub mod registry;
pub mod signature;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancellation::CancellationScope;
pub use command_bus::CommandBus;
pub use config::{ErrorPolicy, EventBusConfig, MaxConcurrentHandlers};
pub use context::{Context, CorrelationId};
pub use errors::{BoxError, BusError, BusResult, RegistrationError};
pub use event_bus::{EventBus, EventDispatcher};
pub use event_provider::{get_event_provider, with_event_provider, AggregateRoot, EventProvider};
pub use handler::{
    handler_fn, query_handler_fn, CommandHandler, ErasedHandler, EventHandler, HandlerFn,
    HandlerFuture, QueryHandler, QueryHandlerFn,
};
pub use key::HandlerKey;
pub use message::{Message, Payload, PayloadShape, Reply};
pub use middleware::{
    install_unit_of_work, Committer, EventDispatchMiddleware, EventProviderMiddleware, Middleware,
    MiddlewareChain, RuleValidator, TracingMiddleware, TransactionManager, TransactionMiddleware,
    ValidationMiddleware, Validator,
};
pub use query_bus::QueryBus;
pub use registry::HandlerRegistry;
pub use signature::{HandlerKind, HandlerSignature, Parameter, ReturnSlot};

/// The types most applications need.
///
/// ```rust,ignore
/// use dispatchcore::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        get_event_provider, install_unit_of_work, BoxError, BusError, BusResult, CommandBus,
        CommandHandler, Context, EventBus, EventBusConfig, EventDispatcher, EventHandler,
        EventProvider, Message, Middleware, QueryBus, QueryHandler, TransactionManager,
    };
    pub use std::sync::Arc;
}

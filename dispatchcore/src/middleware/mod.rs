//! Handler-transforming middleware and onion composition.
//!
//! A middleware takes the next handler and returns a handler of the same
//! type that runs code before and after delegating to it. A bus owns one
//! [`MiddlewareChain`] and composes it around the target handler on every
//! dispatch; the first middleware added is the outermost layer.
//!
//! ```rust,ignore
//! command_bus.use_middleware(|next: HandlerFn| -> HandlerFn {
//!     Arc::new(move |ctx, payload| {
//!         let next = Arc::clone(&next);
//!         Box::pin(async move {
//!             tracing::info!(payload = %payload.key(), "before");
//!             let result = next(ctx, payload).await;
//!             tracing::info!("after");
//!             result
//!         })
//!     })
//! });
//! ```

mod event_dispatch;
mod event_provider;
mod trace;
mod transaction;
mod validation;

pub use event_dispatch::EventDispatchMiddleware;
pub use event_provider::EventProviderMiddleware;
pub use trace::TracingMiddleware;
pub use transaction::{Committer, TransactionManager, TransactionMiddleware};
pub use validation::{RuleValidator, ValidationMiddleware, Validator};

use crate::command_bus::CommandBus;
use crate::event_bus::EventDispatcher;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Transforms a handler of type `H` into another handler of type `H`.
///
/// Implemented for every `Fn(H) -> H` closure.
pub trait Middleware<H>: Send + Sync + 'static {
    /// Wraps `next`.
    fn wrap(&self, next: H) -> H;
}

impl<H, F> Middleware<H> for F
where
    F: Fn(H) -> H + Send + Sync + 'static,
{
    fn wrap(&self, next: H) -> H {
        self(next)
    }
}

/// An ordered list of middleware.
pub struct MiddlewareChain<H> {
    layers: RwLock<Vec<Arc<dyn Middleware<H>>>>,
}

impl<H: 'static> MiddlewareChain<H> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            layers: RwLock::new(Vec::new()),
        }
    }

    /// Appends `middleware` as the innermost layer so far.
    pub fn push(&self, middleware: impl Middleware<H>) {
        self.layers.write().push(Arc::new(middleware));
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Whether the chain has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// Wraps `terminal` in every layer: `m0(m1(...m(n-1)(terminal)))`.
    ///
    /// Works on a snapshot, so layers added while a dispatch is composing do
    /// not affect that dispatch.
    pub fn compose(&self, terminal: H) -> H {
        let layers = self.layers.read().clone();
        layers
            .iter()
            .rev()
            .fold(terminal, |next, layer| layer.wrap(next))
    }
}

impl<H: 'static> Default for MiddlewareChain<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: 'static> fmt::Debug for MiddlewareChain<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("layers", &self.len())
            .finish()
    }
}

/// Installs the unit-of-work stack on `command_bus`.
///
/// Layers, outermost first: event provider injection, event dispatch,
/// transaction. Events collected by the handler are published only after the
/// transaction has committed, and are discarded if the handler or the commit
/// fails.
pub fn install_unit_of_work<D, T>(command_bus: &CommandBus, dispatcher: D, transactions: T)
where
    D: EventDispatcher + 'static,
    T: TransactionManager + 'static,
{
    command_bus.use_middleware(EventProviderMiddleware::new());
    command_bus.use_middleware(EventDispatchMiddleware::new(dispatcher));
    command_bus.use_middleware(TransactionMiddleware::new(transactions));
}

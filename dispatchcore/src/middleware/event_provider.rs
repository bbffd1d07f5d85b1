use super::Middleware;
use crate::context::Context;
use crate::event_provider::{with_event_provider, EventProvider};
use crate::handler::{HandlerFn, HandlerFuture};
use crate::message::Payload;
use std::sync::Arc;

/// Gives every command a fresh [`EventProvider`].
///
/// Install it outside [`EventDispatchMiddleware`](super::EventDispatchMiddleware)
/// so the dispatch layer finds the provider the handler wrote to.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventProviderMiddleware;

impl EventProviderMiddleware {
    /// Creates the middleware.
    pub const fn new() -> Self {
        Self
    }
}

impl Middleware<HandlerFn> for EventProviderMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<()> {
            let ctx = with_event_provider(&ctx, EventProvider::new());
            next(ctx, payload)
        })
    }
}

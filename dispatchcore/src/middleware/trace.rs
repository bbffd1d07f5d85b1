use super::Middleware;
use crate::context::Context;
use crate::handler::{ErasedHandler, HandlerFuture};
use crate::message::Payload;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{field, info, info_span, warn, Instrument};

/// Wraps each handler invocation in an `info` span carrying the payload
/// type and correlation id, and records duration and outcome when it ends.
///
/// Works for command, query and event chains alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl TracingMiddleware {
    /// Creates the middleware.
    pub const fn new() -> Self {
        Self
    }
}

impl<T: Send + 'static> Middleware<ErasedHandler<T>> for TracingMiddleware {
    fn wrap(&self, next: ErasedHandler<T>) -> ErasedHandler<T> {
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<T> {
            let next = Arc::clone(&next);
            let span = info_span!(
                "handle",
                payload = %payload.key(),
                correlation_id = %ctx.correlation_id(),
                elapsed_ms = field::Empty,
                outcome = field::Empty,
            );
            let recorder = span.clone();
            async move {
                let started = Instant::now();
                let result = next(ctx, payload).await;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                recorder.record("elapsed_ms", elapsed_ms);

                match &result {
                    Ok(_) => {
                        recorder.record("outcome", "ok");
                        info!(elapsed_ms, "Handler completed");
                    }
                    Err(error) => {
                        recorder.record("outcome", "error");
                        warn!(elapsed_ms, error = %error, "Handler failed");
                    }
                }
                result
            }
            .instrument(span)
            .boxed()
        })
    }
}

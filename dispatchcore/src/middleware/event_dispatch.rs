use super::Middleware;
use crate::context::Context;
use crate::errors::BusError;
use crate::event_bus::EventDispatcher;
use crate::event_provider::get_event_provider;
use crate::handler::{HandlerFn, HandlerFuture};
use crate::message::Payload;
use futures::FutureExt;
use std::sync::Arc;
use tracing::debug;

/// Publishes the events a command collected once the layers inside it
/// succeeded.
///
/// The provider is looked up in the context this layer received, so
/// [`EventProviderMiddleware`](super::EventProviderMiddleware) must be
/// installed outside it. A missing provider is reported as
/// [`BusError::EventProviderNotFound`]. When the inner layers fail, the
/// collected events are never published.
pub struct EventDispatchMiddleware<D> {
    dispatcher: Arc<D>,
}

impl<D> EventDispatchMiddleware<D> {
    /// Publishes through `dispatcher`.
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

impl<D> std::fmt::Debug for EventDispatchMiddleware<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatchMiddleware").finish_non_exhaustive()
    }
}

impl<D: EventDispatcher + 'static> Middleware<HandlerFn> for EventDispatchMiddleware<D> {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let dispatcher = Arc::clone(&self.dispatcher);
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<()> {
            let next = Arc::clone(&next);
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                next(ctx.clone(), payload).await?;

                let provider = get_event_provider(&ctx).ok_or(BusError::EventProviderNotFound)?;
                let events = provider.drain();
                if events.is_empty() {
                    return Ok(());
                }

                debug!(events = events.len(), "Publishing collected events");
                dispatcher.dispatch_events(&ctx, events).await
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::event_provider::{with_event_provider, EventProvider};
    use crate::handler::handler_fn;
    use crate::message::Message;
    use crate::testing::RecordingDispatcher;

    struct Checkout;
    impl Message for Checkout {}

    #[derive(Debug)]
    struct CheckedOut {
        total: u32,
    }
    impl Message for CheckedOut {}

    fn collecting(fail: bool) -> HandlerFn {
        handler_fn(move |ctx: Context, _command: Arc<Checkout>| async move {
            if let Some(provider) = get_event_provider(&ctx) {
                provider.collect_event(CheckedOut { total: 10 });
                provider.collect_event(CheckedOut { total: 20 });
            }
            if fail {
                return Err::<(), BoxError>("payment declined".into());
            }
            Ok(())
        })
    }

    fn scoped() -> Context {
        with_event_provider(&Context::background(), EventProvider::new())
    }

    #[tokio::test]
    async fn publishes_collected_events_in_order_after_success() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let handler = EventDispatchMiddleware::new(Arc::clone(&dispatcher)).wrap(collecting(false));

        handler(scoped(), Payload::new(Checkout))
            .await
            .expect("checkout succeeds");

        let batches = dispatcher.batches();
        assert_eq!(batches.len(), 1);
        let totals: Vec<u32> = batches[0]
            .iter()
            .filter_map(|event| event.downcast_ref::<CheckedOut>())
            .map(|event| event.total)
            .collect();
        assert_eq!(totals, vec![10, 20]);
    }

    #[tokio::test]
    async fn handler_failure_publishes_nothing() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let handler = EventDispatchMiddleware::new(Arc::clone(&dispatcher)).wrap(collecting(true));

        let result = handler(scoped(), Payload::new(Checkout)).await;

        assert!(matches!(result, Err(BusError::Handler(_))));
        assert!(dispatcher.batches().is_empty());
    }

    #[tokio::test]
    async fn missing_provider_is_a_wiring_error() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let handler = EventDispatchMiddleware::new(Arc::clone(&dispatcher)).wrap(collecting(false));

        let result = handler(Context::background(), Payload::new(Checkout)).await;

        assert!(matches!(result, Err(BusError::EventProviderNotFound)));
    }

    #[tokio::test]
    async fn empty_provider_skips_the_dispatcher() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let handler = EventDispatchMiddleware::new(Arc::clone(&dispatcher)).wrap(handler_fn(
            |_ctx: Context, _command: Arc<Checkout>| async { Ok::<_, BoxError>(()) },
        ));

        handler(scoped(), Payload::new(Checkout))
            .await
            .expect("handler succeeds");

        assert!(dispatcher.batches().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_errors_surface() {
        let dispatcher = Arc::new(RecordingDispatcher::failing_with(|| {
            BusError::from_handler("projection down")
        }));
        let handler = EventDispatchMiddleware::new(Arc::clone(&dispatcher)).wrap(collecting(false));

        let result = handler(scoped(), Payload::new(Checkout)).await;

        assert!(matches!(result, Err(BusError::Handler(_))));
        assert_eq!(dispatcher.batches().len(), 1);
    }
}

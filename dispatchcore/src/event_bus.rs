//! Concurrent fan-out of events to every registered handler.
//!
//! Each (event, handler) pair runs as its own tokio task, wrapped in its own
//! copy of the middleware chain. All tasks of one dispatch share a child
//! cancellation scope of the caller's context: the first failure cancels it
//! so cooperative siblings can stop early, while the caller's context is
//! left alone.

use crate::config::{ErrorPolicy, EventBusConfig};
use crate::context::Context;
use crate::errors::{BoxError, BusError, BusResult, RegistrationError};
use crate::handler::{event_handler_fn, handler_fn, EventHandler, HandlerFn};
use crate::key::HandlerKey;
use crate::message::{Message, Payload};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::HandlerRegistry;
use crate::signature::{HandlerKind, HandlerSignature};
use async_trait::async_trait;
use std::future::Future;
use std::panic;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn, Instrument};

/// Sink for batches of events; the seam the event dispatch middleware
/// publishes through.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Delivers `events` and reports the outcome.
    async fn dispatch_events(&self, ctx: &Context, events: Vec<Payload>) -> BusResult<()>;
}

#[async_trait]
impl<T: EventDispatcher + ?Sized> EventDispatcher for Arc<T> {
    async fn dispatch_events(&self, ctx: &Context, events: Vec<Payload>) -> BusResult<()> {
        (**self).dispatch_events(ctx, events).await
    }
}

/// Delivers each event to every handler registered for its type.
#[derive(Debug)]
pub struct EventBus {
    registry: HandlerRegistry<HandlerFn>,
    middleware: MiddlewareChain<HandlerFn>,
    config: EventBusConfig,
}

impl EventBus {
    /// Creates an unbounded bus that reports the first failure.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Creates a bus with `config`.
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            registry: HandlerRegistry::new(HandlerKind::Event),
            middleware: MiddlewareChain::new(),
            config,
        }
    }

    /// The configuration this bus was built with.
    pub const fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Appends `middleware`; it runs inside every middleware added before it.
    pub fn use_middleware(&self, middleware: impl Middleware<HandlerFn>) {
        self.middleware.push(middleware);
        debug!(layers = self.middleware.len(), "Added event middleware");
    }

    /// Adds an async closure to the handlers for events of type `E`.
    pub fn register<E, F, Fut, Err>(&self, handler: F) -> Result<HandlerKey, RegistrationError>
    where
        E: Message,
        F: Fn(Context, Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Err>> + Send + 'static,
        Err: Into<BoxError>,
    {
        self.registry
            .register(&HandlerSignature::event::<E>(), Some(handler_fn(handler)))
    }

    /// Adds an [`EventHandler`] to the handlers for events of type `E`.
    pub fn register_handler<E, H>(&self, handler: H) -> Result<HandlerKey, RegistrationError>
    where
        E: Message,
        H: EventHandler<E>,
    {
        self.registry.register(
            &HandlerSignature::event::<E>(),
            Some(event_handler_fn::<E, H>(handler)),
        )
    }

    /// Adds an already erased handler described by `signature`.
    pub fn register_dynamic(
        &self,
        signature: &HandlerSignature,
        handler: Option<HandlerFn>,
    ) -> Result<HandlerKey, RegistrationError> {
        self.registry.register(signature, handler)
    }

    /// Number of handlers registered for `E`.
    pub fn handler_count<E: Message>(&self) -> usize {
        self.registry.handlers(&HandlerKey::of::<E>()).len()
    }

    /// Keys of every event type with at least one handler.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        self.registry.keys()
    }

    /// Dispatches a single event.
    pub async fn publish<E: Message>(&self, ctx: &Context, event: E) -> BusResult<()> {
        self.dispatch(ctx, [Payload::new(event)]).await
    }

    /// Dispatches `events` to their handlers concurrently and waits for all
    /// of them.
    ///
    /// Every event is checked before anything runs; one invalid payload
    /// fails the whole batch. Events without handlers are skipped. Every
    /// handler runs to completion even after another one failed. A
    /// panicking handler does not stop its siblings; its panic is resumed
    /// here once all of them finished. The concurrency limit applies to
    /// this call only; nested and parallel dispatches get their own.
    #[instrument(name = "dispatch", skip_all, fields(correlation_id = %ctx.correlation_id()))]
    pub async fn dispatch(
        &self,
        ctx: &Context,
        events: impl IntoIterator<Item = Payload> + Send,
    ) -> BusResult<()> {
        let events: Vec<Payload> = events.into_iter().collect();
        for event in &events {
            event.ensure_routable()?;
        }

        let scope = ctx.child();
        let limiter = self
            .config
            .max_concurrent_handlers
            .map(|limit| Arc::new(Semaphore::new(limit.into_inner())));
        let mut tasks = JoinSet::new();
        for event in events {
            let key = event.key();
            let handlers = self.registry.handlers(&key);
            if handlers.is_empty() {
                debug!(event = %key, "No handlers registered for event");
                continue;
            }

            debug!(event = %key, handlers = handlers.len(), "Dispatching event");
            for handler in handlers {
                let chain = self.middleware.compose(handler);
                let ctx = scope.clone();
                let event = event.clone();
                let limiter = limiter.clone();
                tasks.spawn(
                    async move {
                        let _permit = match limiter {
                            Some(limiter) => Some(
                                limiter
                                    .acquire_owned()
                                    .await
                                    .map_err(|_| BusError::Cancelled)?,
                            ),
                            None => None,
                        };
                        chain(ctx, event).await
                    }
                    .in_current_span(),
                );
            }
        }

        self.join(tasks, &scope).await
    }

    async fn join(&self, mut tasks: JoinSet<BusResult<()>>, scope: &Context) -> BusResult<()> {
        let mut failures = Vec::new();
        let mut panicked = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    scope.cancel();
                    warn!(error = %error, "Event handler failed");
                    failures.push(error);
                }
                Err(join_error) => {
                    scope.cancel();
                    if join_error.is_panic() {
                        warn!("Event handler panicked");
                        if panicked.is_none() {
                            panicked = Some(join_error.into_panic());
                        }
                    } else {
                        failures.push(BusError::Cancelled);
                    }
                }
            }
        }

        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }

        match self.config.error_policy {
            ErrorPolicy::FirstError => failures.into_iter().next().map_or(Ok(()), Err),
            ErrorPolicy::CollectAll => {
                if failures.len() > 1 {
                    Err(BusError::Aggregate(failures))
                } else {
                    failures.pop().map_or(Ok(()), Err)
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventDispatcher for EventBus {
    async fn dispatch_events(&self, ctx: &Context, events: Vec<Payload>) -> BusResult<()> {
        self.dispatch(ctx, events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxConcurrentHandlers;
    use crate::testing::{CallLog, RecordingMiddleware};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[derive(Debug)]
    struct OrderPlaced {
        id: u32,
    }
    impl Message for OrderPlaced {}

    struct OrderShipped;
    impl Message for OrderShipped {}

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(Context, Arc<OrderPlaced>) -> futures::future::Ready<Result<(), BoxError>> {
        let counter = Arc::clone(counter);
        move |_ctx, _event| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    fn failing(
        counter: &Arc<AtomicUsize>,
        message: &'static str,
    ) -> impl Fn(Context, Arc<OrderPlaced>) -> futures::future::Ready<Result<(), BoxError>> {
        let counter = Arc::clone(counter);
        move |_ctx, _event| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(message.into()))
        }
    }

    #[tokio::test]
    async fn every_handler_receives_the_event() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("first handler");
        bus.register(counting(&counter)).expect("second handler");

        bus.publish(&Context::background(), OrderPlaced { id: 1 })
            .await
            .expect("dispatch succeeds");

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_count::<OrderPlaced>(), 2);
    }

    #[tokio::test]
    async fn events_without_handlers_are_a_no_op() {
        let bus = EventBus::new();

        bus.publish(&Context::background(), OrderShipped)
            .await
            .expect("no handlers is not an error");
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let bus = EventBus::new();

        bus.dispatch(&Context::background(), Vec::new())
            .await
            .expect("nothing to do");
    }

    #[tokio::test]
    async fn one_error_is_returned_and_all_handlers_run() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("registered");
        bus.register(failing(&counter, "first failure")).expect("registered");
        bus.register(counting(&counter)).expect("registered");
        bus.register(failing(&counter, "second failure")).expect("registered");

        let error = bus
            .publish(&Context::background(), OrderPlaced { id: 7 })
            .await
            .expect_err("two handlers fail");

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(matches!(error, BusError::Handler(_)));
        let message = error.to_string();
        assert!(message.contains("first failure") || message.contains("second failure"));
    }

    #[tokio::test]
    async fn collect_all_reports_every_failure() {
        let bus = EventBus::with_config(
            EventBusConfig::default().with_error_policy(ErrorPolicy::CollectAll),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(failing(&counter, "a")).expect("registered");
        bus.register(failing(&counter, "b")).expect("registered");
        bus.register(counting(&counter)).expect("registered");

        let error = bus
            .publish(&Context::background(), OrderPlaced { id: 1 })
            .await
            .expect_err("two handlers fail");

        match error {
            BusError::Aggregate(failures) => assert_eq!(failures.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn collect_all_with_one_failure_is_not_wrapped() {
        let bus = EventBus::with_config(
            EventBusConfig::default().with_error_policy(ErrorPolicy::CollectAll),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(failing(&counter, "only")).expect("registered");

        let error = bus
            .publish(&Context::background(), OrderPlaced { id: 1 })
            .await
            .expect_err("handler fails");

        assert!(matches!(error, BusError::Handler(_)));
    }

    #[tokio::test]
    async fn invalid_event_in_batch_schedules_nothing() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("registered");

        let result = bus
            .dispatch(
                &Context::background(),
                [Payload::new(OrderPlaced { id: 1 }), Payload::new("not an event")],
            )
            .await;

        assert!(matches!(result, Err(BusError::InvalidPayload { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nil_event_is_rejected_before_any_handler_runs() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("registered");

        let result = bus.publish(&Context::background(), None::<OrderPlaced>).await;

        assert!(matches!(result, Err(BusError::NilPayload(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_delivers_each_event_to_its_handlers() {
        let bus = EventBus::new();
        let ids = CallLog::new();
        let sink = ids.clone();
        bus.register(move |_ctx, event: Arc<OrderPlaced>| {
            let sink = sink.clone();
            async move {
                sink.record(format!("placed:{}", event.id));
                Ok::<_, BoxError>(())
            }
        })
        .expect("registered");

        bus.dispatch(
            &Context::background(),
            (1..=3).map(|id| Payload::new(OrderPlaced { id })),
        )
        .await
        .expect("dispatch succeeds");

        let mut entries = ids.entries();
        entries.sort();
        assert_eq!(entries, vec!["placed:1", "placed:2", "placed:3"]);
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings_but_not_the_caller() {
        let bus = EventBus::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        bus.register(move |ctx: Context, _event: Arc<OrderPlaced>| {
            let seen = Arc::clone(&seen);
            async move {
                if timeout(Duration::from_secs(5), ctx.cancelled()).await.is_ok() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, BoxError>(())
            }
        })
        .expect("registered");
        bus.register(|_ctx, _event: Arc<OrderPlaced>| async {
            Err::<(), _>("boom")
        })
        .expect("registered");

        let caller = Context::background();
        let result = bus.publish(&caller, OrderPlaced { id: 1 }).await;

        assert!(result.is_err());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!caller.is_cancelled());
    }

    #[tokio::test]
    async fn caller_cancellation_reaches_running_handlers() {
        let bus = Arc::new(EventBus::new());
        bus.register(|ctx: Context, _event: Arc<OrderPlaced>| async move {
            ctx.cancelled().await;
            ctx.ensure_active()
        })
        .expect("registered");

        let caller = Context::background();
        let dispatch = {
            let bus = Arc::clone(&bus);
            let caller = caller.clone();
            tokio::spawn(async move { bus.publish(&caller, OrderPlaced { id: 1 }).await })
        };
        sleep(Duration::from_millis(20)).await;
        caller.cancel();

        let result = timeout(Duration::from_secs(5), dispatch)
            .await
            .expect("dispatch finished")
            .expect("dispatch task completed");

        assert!(matches!(result, Err(BusError::Cancelled)));
    }

    #[tokio::test]
    async fn concurrency_limit_of_one_serializes_handlers() {
        let bus = limited_to_one();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            bus.register(move |_ctx, _event: Arc<OrderPlaced>| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
            .expect("registered");
        }

        bus.publish(&Context::background(), OrderPlaced { id: 1 })
            .await
            .expect("dispatch succeeds");

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    fn limited_to_one() -> EventBus {
        let limit = MaxConcurrentHandlers::try_new(1).expect("valid limit");
        EventBus::with_config(EventBusConfig::default().with_max_concurrent_handlers(limit))
    }

    #[tokio::test]
    async fn handler_can_publish_on_its_own_bus_under_limit_of_one() {
        let bus = Arc::new(limited_to_one());
        let shipped = Arc::new(AtomicUsize::new(0));
        let nested = Arc::clone(&bus);
        bus.register(move |ctx, _event: Arc<OrderPlaced>| {
            let bus = Arc::clone(&nested);
            async move { bus.publish(&ctx, OrderShipped).await }
        })
        .expect("registered");
        let counter = Arc::clone(&shipped);
        bus.register(move |_ctx, _event: Arc<OrderShipped>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>(()) }
        })
        .expect("registered");

        timeout(
            Duration::from_secs(2),
            bus.publish(&Context::background(), OrderPlaced { id: 1 }),
        )
        .await
        .expect("nested dispatch does not wait on the outer permit")
        .expect("dispatch succeeds");

        assert_eq!(shipped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_dispatches_do_not_share_the_limit() {
        let bus = limited_to_one();
        let rendezvous = Arc::new(tokio::sync::Barrier::new(2));
        bus.register(move |_ctx, _event: Arc<OrderPlaced>| {
            let rendezvous = Arc::clone(&rendezvous);
            async move {
                rendezvous.wait().await;
                Ok::<_, BoxError>(())
            }
        })
        .expect("registered");

        let ctx = Context::background();
        let both = async {
            tokio::join!(
                bus.publish(&ctx, OrderPlaced { id: 1 }),
                bus.publish(&ctx, OrderPlaced { id: 2 }),
            )
        };
        let (first, second) = timeout(Duration::from_secs(2), both)
            .await
            .expect("both handlers run at the same time");

        first.expect("first dispatch succeeds");
        second.expect("second dispatch succeeds");
    }

    async fn crash(_ctx: Context, _event: Arc<OrderPlaced>) -> Result<(), BoxError> {
        panic!("projection crashed")
    }

    #[tokio::test]
    async fn panics_resume_after_siblings_finish() {
        let bus = Arc::new(EventBus::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        bus.register(move |_ctx, _event: Arc<OrderPlaced>| {
            let done = Arc::clone(&done);
            async move {
                sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .expect("registered");
        bus.register(crash).expect("registered");

        let dispatch = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.publish(&Context::background(), OrderPlaced { id: 1 })
                    .await
            })
        };
        let outcome = dispatch.await;

        assert!(outcome.expect_err("panic resumed on the caller").is_panic());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_handler_gets_its_own_chain() {
        let bus = EventBus::new();
        let log = CallLog::new();
        bus.use_middleware(RecordingMiddleware::new("M", log.clone()));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("registered");
        bus.register(counting(&counter)).expect("registered");

        bus.publish(&Context::background(), OrderPlaced { id: 1 })
            .await
            .expect("dispatch succeeds");

        let entries = log.entries();
        assert_eq!(entries.iter().filter(|e| *e == "M-pre").count(), 2);
        assert_eq!(entries.iter().filter(|e| *e == "M-post").count(), 2);
    }

    #[tokio::test]
    async fn dispatches_through_the_dispatcher_seam() {
        let bus: Arc<EventBus> = Arc::new(EventBus::new());
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register(counting(&counter)).expect("registered");
        let dispatcher: Arc<dyn EventDispatcher> = bus;

        dispatcher
            .dispatch_events(&Context::background(), vec![Payload::new(OrderPlaced { id: 2 })])
            .await
            .expect("dispatch succeeds");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

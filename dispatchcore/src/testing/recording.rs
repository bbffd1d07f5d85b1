//! Recorders for observing call order.

use crate::context::Context;
use crate::errors::{BusError, BusResult};
use crate::event_bus::EventDispatcher;
use crate::handler::{ErasedHandler, HandlerFuture};
use crate::message::Payload;
use crate::middleware::Middleware;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;

/// An append-only list of labels shared between clones.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// A snapshot of the entries in the order they were recorded.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Records `"{label}-pre"` before and `"{label}-post"` after the wrapped
/// handler, whatever its outcome.
#[derive(Debug, Clone)]
pub struct RecordingMiddleware {
    label: Arc<str>,
    log: CallLog,
}

impl RecordingMiddleware {
    /// Records into `log` under `label`.
    pub fn new(label: impl Into<String>, log: CallLog) -> Self {
        Self {
            label: Arc::from(label.into()),
            log,
        }
    }
}

impl<T: Send + 'static> Middleware<ErasedHandler<T>> for RecordingMiddleware {
    fn wrap(&self, next: ErasedHandler<T>) -> ErasedHandler<T> {
        let label = Arc::clone(&self.label);
        let log = self.log.clone();
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<T> {
            let next = Arc::clone(&next);
            let label = Arc::clone(&label);
            let log = log.clone();
            async move {
                log.record(format!("{label}-pre"));
                let result = next(ctx, payload).await;
                log.record(format!("{label}-post"));
                result
            }
            .boxed()
        })
    }
}

type FailureFactory = Box<dyn Fn() -> BusError + Send + Sync>;

/// An [`EventDispatcher`] that keeps every batch it is handed.
///
/// Built with [`failing_with`](Self::failing_with) it still records the
/// batch and then reports the produced error.
#[derive(Default)]
pub struct RecordingDispatcher {
    batches: Mutex<Vec<Vec<Payload>>>,
    failure: Option<FailureFactory>,
}

impl RecordingDispatcher {
    /// A dispatcher that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that fails every dispatch with `failure()`.
    pub fn failing_with(failure: impl Fn() -> BusError + Send + Sync + 'static) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failure: Some(Box::new(failure)),
        }
    }

    /// Batches received so far, oldest first.
    pub fn batches(&self) -> Vec<Vec<Payload>> {
        self.batches.lock().clone()
    }

    /// Every event received, flattened across batches.
    pub fn events(&self) -> Vec<Payload> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl std::fmt::Debug for RecordingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDispatcher")
            .field("batches", &self.batches.lock().len())
            .field("failing", &self.failure.is_some())
            .finish()
    }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn dispatch_events(&self, _ctx: &Context, events: Vec<Payload>) -> BusResult<()> {
        self.batches.lock().push(events);
        self.failure.as_ref().map_or(Ok(()), |failure| Err(failure()))
    }
}

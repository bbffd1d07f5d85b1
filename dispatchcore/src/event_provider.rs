//! Request-scoped buffering of events until their unit of work commits.
//!
//! A command handler never publishes events itself. It appends them to the
//! [`EventProvider`] found in its context; the event dispatch middleware
//! drains the provider after the handler (and its transaction) succeeded.
//! If the handler fails, the buffered events are dropped with the provider.

use crate::context::Context;
use crate::message::{Message, Payload};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A domain object that records the events its state changes produced.
pub trait AggregateRoot {
    /// Removes and returns the pending events in the order they were raised.
    fn take_events(&mut self) -> Vec<Payload>;
}

/// An ordered, shareable buffer of events awaiting publication.
///
/// Clones share the same buffer, so any handler holding a clone appends to
/// the buffer the dispatch middleware will drain.
#[derive(Clone, Default)]
pub struct EventProvider {
    events: Arc<RwLock<Vec<Payload>>>,
}

impl EventProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `events` in iteration order.
    pub fn collect(&self, events: impl IntoIterator<Item = Payload>) {
        self.events.write().extend(events);
    }

    /// Appends a single event.
    pub fn collect_event<E: Message>(&self, event: E) {
        self.events.write().push(Payload::new(event));
    }

    /// Moves the pending events of `aggregate` into the buffer.
    pub fn collect_from<A: AggregateRoot + ?Sized>(&self, aggregate: &mut A) {
        self.collect(aggregate.take_events());
    }

    /// A snapshot of the buffered events in insertion order.
    pub fn events(&self) -> Vec<Payload> {
        self.events.read().clone()
    }

    /// Takes every buffered event, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.events.write())
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl fmt::Debug for EventProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProvider")
            .field("events", &self.len())
            .finish()
    }
}

// Private slot type: only this module can attach or replace the provider.
struct CurrentEventProvider(EventProvider);

/// Returns a copy of `ctx` carrying `provider`.
pub fn with_event_provider(ctx: &Context, provider: EventProvider) -> Context {
    ctx.with_value(CurrentEventProvider(provider))
}

/// The provider attached to `ctx`, if any.
pub fn get_event_provider(ctx: &Context) -> Option<EventProvider> {
    ctx.value::<CurrentEventProvider>()
        .map(|current| current.0.clone())
}

//! The request scope threaded through every middleware and handler.
//!
//! A [`Context`] carries a correlation id, a cancellation scope and a small
//! map of typed values. Values are keyed by type, so a module that keeps its
//! slot type private owns that slot: nothing else can read or overwrite it.
//! The event provider and the active transaction both travel this way.

use crate::cancellation::CancellationScope;
use crate::errors::{BusError, BusResult};
use nutype::nutype;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier linking everything done on behalf of one request.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Deref,
    Display,
    From,
    Serialize,
    Deserialize
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh time-ordered id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::generate()
    }
}

type Values = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Immutable, cheaply clonable request scope.
///
/// Every `with_*` method returns a new context and leaves the receiver
/// untouched, so a middleware that augments the context only affects the
/// layers inside it.
#[derive(Clone, Default)]
pub struct Context {
    correlation_id: CorrelationId,
    cancellation: CancellationScope,
    values: Arc<Values>,
}

impl Context {
    /// A root context with a fresh correlation id and no values.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a copy carrying `correlation_id`.
    #[must_use]
    pub fn with_correlation_id(&self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }

    /// The correlation id of this request.
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns a copy with `value` stored in the slot for `T`, replacing any
    /// previous value of that type.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut values = Values::clone(&self.values);
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    /// The value stored in the slot for `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns a copy whose cancellation scope is derived from this one.
    ///
    /// Cancelling the child does not cancel this context.
    #[must_use]
    pub fn child(&self) -> Self {
        self.with_cancellation(self.cancellation.child())
    }

    /// Returns a copy using `cancellation` as its scope.
    #[must_use]
    pub fn with_cancellation(&self, cancellation: CancellationScope) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    /// The cancellation scope of this context.
    pub const fn cancellation(&self) -> &CancellationScope {
        &self.cancellation
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Fails with [`BusError::Cancelled`] if this context has been cancelled.
    pub fn ensure_active(&self) -> BusResult<()> {
        if self.is_cancelled() {
            Err(BusError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("correlation_id", &self.correlation_id)
            .field("cancelled", &self.is_cancelled())
            .field("values", &self.values.len())
            .finish()
    }
}

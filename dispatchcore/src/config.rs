//! Event bus configuration with type-safe validation.
//!
//! Limits are `nutype` newtypes validated at construction, so an
//! `EventBusConfig` that exists is always usable. Configurations load from
//! any serde format.

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Maximum number of event handlers running at the same time within one
/// dispatch.
///
/// Validated to be between 1 and 10 000. A limit of 1 runs handlers one
/// after another.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxConcurrentHandlers(usize);

/// What an event dispatch returns when handlers fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Return the first failure in completion order and drop the rest.
    #[default]
    FirstError,
    /// Return every failure, wrapped in `BusError::Aggregate` when there is
    /// more than one.
    CollectAll,
}

/// Event bus settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Concurrency limit per dispatch; unbounded when absent.
    pub max_concurrent_handlers: Option<MaxConcurrentHandlers>,
    /// How handler failures are reported.
    pub error_policy: ErrorPolicy,
}

impl EventBusConfig {
    /// Bounds the number of concurrently running handlers.
    #[must_use]
    pub const fn with_max_concurrent_handlers(mut self, limit: MaxConcurrentHandlers) -> Self {
        self.max_concurrent_handlers = Some(limit);
        self
    }

    /// Sets how handler failures are reported.
    #[must_use]
    pub const fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}

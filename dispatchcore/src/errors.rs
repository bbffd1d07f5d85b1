//! Error types for dispatchcore.
//!
//! Errors fall into two families:
//!
//! - **RegistrationError**: a handler could not be registered because its
//!   declared shape is wrong or its payload type is already taken.
//! - **BusError**: anything that goes wrong while executing a command or
//!   query, or while dispatching events. Handler errors travel through the
//!   middleware chain inside `BusError::Handler` and are never rewritten.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use dispatchcore::errors::BusError;
//!
//! match command_bus.execute(&ctx, CreateAccount { owner }).await {
//!     Ok(()) => {}
//!     Err(BusError::HandlerNotFound(key)) => panic!("wiring bug: {key}"),
//!     Err(err) => return Err(err),
//! }
//! ```

use crate::key::HandlerKey;
use crate::message::PayloadShape;
use thiserror::Error;

/// Boxed error type accepted from handlers and collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by every bus operation.
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised while registering a handler.
///
/// Each variant corresponds to exactly one shape rule. Rules are checked in
/// declaration order and the first violation wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The candidate handler was absent.
    #[error("handler must be a non-nil callable")]
    InvalidHandler,

    /// The handler does not accept exactly `(context, payload)`.
    #[error("handler must accept exactly 2 arguments, got {0}")]
    Arity(usize),

    /// The first parameter is not the dispatch context.
    #[error("first argument of handler must be the dispatch context, got {type_name}")]
    ContextArgument {
        /// Declared type of the offending parameter
        type_name: &'static str,
    },

    /// The payload parameter is not a struct or pointer to struct.
    #[error("payload of handler must be a struct or pointer to struct, got {shape} `{type_name}`")]
    PayloadShape {
        /// Declared payload type
        type_name: &'static str,
        /// Shape reported by the payload type
        shape: PayloadShape,
    },

    /// The handler returns the wrong number of results.
    #[error("handler must return exactly {expected} result(s), got {actual}")]
    ResultArity {
        /// Number of results required by the bus flavor
        expected: usize,
        /// Number of results the handler declares
        actual: usize,
    },

    /// A result slot holds the wrong kind of value.
    #[error("invalid handler result: {0}")]
    ResultShape(String),

    /// A command or query handler is already registered for this payload type.
    #[error("handler for `{0}` is already registered")]
    AlreadyRegistered(HandlerKey),
}

/// Errors raised while executing commands and queries or dispatching events.
#[derive(Debug, Error)]
pub enum BusError {
    /// Registration failed; surfaced when registration happens through a
    /// `BusResult`-returning path.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The dispatched payload is not a struct or pointer to struct.
    #[error("payload must be a struct or pointer to struct, got {shape} `{type_name}`")]
    InvalidPayload {
        /// Runtime payload type
        type_name: &'static str,
        /// Shape reported by the payload type
        shape: PayloadShape,
    },

    /// The dispatched payload is a nil pointer.
    #[error("payload `{0}` must not be nil")]
    NilPayload(HandlerKey),

    /// No command or query handler is registered for the payload type.
    #[error("no handler registered for `{0}`")]
    HandlerNotFound(HandlerKey),

    /// A handler received a payload of a type it was not registered for.
    #[error("handler for `{expected}` received payload `{actual}`")]
    PayloadTypeMismatch {
        /// Type the handler was registered for
        expected: HandlerKey,
        /// Type that actually arrived
        actual: HandlerKey,
    },

    /// A query produced a result of a different type than the caller expects.
    #[error("query result is `{actual}`, caller expected `{expected}`")]
    ReplyTypeMismatch {
        /// Type requested by the caller
        expected: HandlerKey,
        /// Type produced by the handler chain
        actual: HandlerKey,
    },

    /// The event dispatch middleware ran without a provider in scope.
    ///
    /// This is a wiring bug: the event provider middleware must be installed
    /// outside the dispatch middleware.
    #[error("event provider not found in context")]
    EventProviderNotFound,

    /// The validation middleware rejected the payload.
    #[error("validation failed: {0}")]
    Validation(#[source] BoxError),

    /// Starting or committing a transaction failed.
    #[error("transaction failed: {0}")]
    Transaction(#[source] BoxError),

    /// The domain handler returned an error.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The operation observed a cancelled context.
    #[error("dispatch cancelled")]
    Cancelled,

    /// Several event handlers failed; only produced under
    /// [`ErrorPolicy::CollectAll`](crate::config::ErrorPolicy::CollectAll).
    #[error("{} event handlers failed", .0.len())]
    Aggregate(Vec<BusError>),
}

impl BusError {
    /// Wraps an error returned by a domain handler.
    ///
    /// A `BusError` coming back from a nested bus call is passed through
    /// unchanged instead of being wrapped a second time.
    pub fn from_handler(error: impl Into<BoxError>) -> Self {
        match error.into().downcast::<Self>() {
            Ok(bus_error) => *bus_error,
            Err(other) => Self::Handler(other),
        }
    }

    /// Returns the handler error downcast to `E`, if this is a handler
    /// failure of that type.
    pub fn handler_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Handler(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

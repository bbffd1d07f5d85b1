//! Declarative handler shapes and the rules a handler must satisfy to be
//! registered.
//!
//! Typed registration builds a [`HandlerSignature`] from generic parameters,
//! so the argument rules hold by construction and only the payload and
//! result shapes are checked at run time. Handlers described from the
//! outside (plugins, generated adapters) go through
//! [`HandlerSignature::new`] and are checked against every rule.

use crate::context::Context;
use crate::errors::RegistrationError;
use crate::key::HandlerKey;
use crate::message::{Message, PayloadShape};
use std::any::type_name;
use std::fmt;

/// The three bus flavors a handler can be registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Exactly one handler per payload type, no result value.
    Command,
    /// Exactly one handler per payload type, returns a result value.
    Query,
    /// Any number of handlers per payload type, no result value.
    Event,
}

impl HandlerKind {
    /// Number of results a handler of this kind declares, counting the error.
    pub const fn expected_results(self) -> usize {
        match self {
            Self::Command | Self::Event => 1,
            Self::Query => 2,
        }
    }

    /// Whether at most one handler may be registered per payload type.
    pub const fn is_unicast(self) -> bool {
        matches!(self, Self::Command | Self::Query)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Command => "command",
            Self::Query => "query",
            Self::Event => "event",
        })
    }
}

/// A declared handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// The dispatch [`Context`].
    Context,
    /// A value of a [`Message`] type.
    Value {
        /// Key of the declared type
        key: HandlerKey,
        /// Shape of the declared type
        shape: PayloadShape,
    },
    /// Any other type.
    Opaque {
        /// Name of the declared type
        type_name: &'static str,
    },
}

impl Parameter {
    /// A parameter of message type `M`.
    pub fn value<M: Message>() -> Self {
        Self::Value {
            key: HandlerKey::of::<M>(),
            shape: M::shape(),
        }
    }

    /// A parameter of a type that is neither the context nor a message.
    pub fn opaque<T: ?Sized + 'static>() -> Self {
        Self::Opaque {
            type_name: type_name::<T>(),
        }
    }

    /// Name of the declared type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Context => type_name::<Context>(),
            Self::Value { key, .. } => key.type_name(),
            Self::Opaque { type_name } => *type_name,
        }
    }

    fn shape(&self) -> PayloadShape {
        match self {
            Self::Value { shape, .. } => *shape,
            Self::Context | Self::Opaque { .. } => PayloadShape::Opaque,
        }
    }
}

/// A declared handler result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSlot {
    /// The error result.
    Error,
    /// A value of a [`Message`] type.
    Value {
        /// Key of the declared type
        key: HandlerKey,
        /// Shape of the declared type
        shape: PayloadShape,
    },
    /// Any other type.
    Opaque {
        /// Name of the declared type
        type_name: &'static str,
    },
}

impl ReturnSlot {
    /// A result of message type `R`.
    pub fn value<R: Message>() -> Self {
        Self::Value {
            key: HandlerKey::of::<R>(),
            shape: R::shape(),
        }
    }

    /// A result of a type that is neither an error nor a message.
    pub fn opaque<T: ?Sized + 'static>() -> Self {
        Self::Opaque {
            type_name: type_name::<T>(),
        }
    }
}

impl fmt::Display for ReturnSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Value { key, shape } => write!(f, "{shape} `{key}`"),
            Self::Opaque { type_name } => write!(f, "`{type_name}`"),
        }
    }
}

/// The declared shape of a handler: its parameters and its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSignature {
    parameters: Vec<Parameter>,
    results: Vec<ReturnSlot>,
}

impl HandlerSignature {
    /// Describes an arbitrary handler.
    pub fn new(
        parameters: impl IntoIterator<Item = Parameter>,
        results: impl IntoIterator<Item = ReturnSlot>,
    ) -> Self {
        Self {
            parameters: parameters.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// `(Context, C) -> error`
    pub fn command<C: Message>() -> Self {
        Self::new(
            [Parameter::Context, Parameter::value::<C>()],
            [ReturnSlot::Error],
        )
    }

    /// `(Context, E) -> error`
    pub fn event<E: Message>() -> Self {
        Self::new(
            [Parameter::Context, Parameter::value::<E>()],
            [ReturnSlot::Error],
        )
    }

    /// `(Context, Q) -> (R, error)`
    pub fn query<Q: Message, R: Message>() -> Self {
        Self::new(
            [Parameter::Context, Parameter::value::<Q>()],
            [ReturnSlot::value::<R>(), ReturnSlot::Error],
        )
    }

    /// Declared parameters.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Declared results.
    pub fn results(&self) -> &[ReturnSlot] {
        &self.results
    }

    /// Checks the signature against the rules for `kind` and returns the key
    /// derived from the declared payload type.
    ///
    /// Rules are checked in a fixed order and the first violation is
    /// returned:
    ///
    /// 1. exactly two parameters
    /// 2. the first parameter is the context
    /// 3. the second parameter is a struct or pointer to struct
    /// 4. the result count matches `kind`
    /// 5. the error is the last result and a query's value is a struct or
    ///    pointer to struct
    ///
    /// An absent handler is rejected by the registry before this runs.
    pub fn validate(&self, kind: HandlerKind) -> Result<HandlerKey, RegistrationError> {
        let [context, payload] = self.parameters.as_slice() else {
            return Err(RegistrationError::Arity(self.parameters.len()));
        };

        if *context != Parameter::Context {
            return Err(RegistrationError::ContextArgument {
                type_name: context.type_name(),
            });
        }

        let key = match payload {
            Parameter::Value { key, shape } if shape.is_routable() => *key,
            other => {
                return Err(RegistrationError::PayloadShape {
                    type_name: other.type_name(),
                    shape: other.shape(),
                })
            }
        };

        let expected = kind.expected_results();
        if self.results.len() != expected {
            return Err(RegistrationError::ResultArity {
                expected,
                actual: self.results.len(),
            });
        }

        self.validate_results()?;
        Ok(key)
    }

    fn validate_results(&self) -> Result<(), RegistrationError> {
        let Some((last, values)) = self.results.split_last() else {
            return Ok(());
        };

        if *last != ReturnSlot::Error {
            return Err(RegistrationError::ResultShape(format!(
                "last result must be an error, got {last}"
            )));
        }

        for slot in values {
            match slot {
                ReturnSlot::Value { shape, .. } if shape.is_routable() => {}
                other => {
                    return Err(RegistrationError::ResultShape(format!(
                        "result must be a struct or pointer to struct, got {other}"
                    )))
                }
            }
        }
        Ok(())
    }
}

//! Per-bus handler storage keyed by payload type.
//!
//! A registry is owned by exactly one bus. It validates every candidate
//! against the bus's [`HandlerKind`] and, for commands and queries, refuses a
//! second handler for the same key. Reads happen on every dispatch and take a
//! shared lock only.

use crate::errors::RegistrationError;
use crate::key::HandlerKey;
use crate::signature::{HandlerKind, HandlerSignature};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Maps payload keys to their handlers.
///
/// `H` is the erased handler type stored by the owning bus; cloning it must
/// be cheap (an `Arc`).
pub struct HandlerRegistry<H> {
    kind: HandlerKind,
    handlers: RwLock<HashMap<HandlerKey, Vec<H>>>,
}

impl<H: Clone> HandlerRegistry<H> {
    /// Creates an empty registry for handlers of `kind`.
    pub fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// The bus flavor this registry validates against.
    pub const fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Validates and stores `handler` under the key derived from `signature`.
    ///
    /// A failed registration leaves the registry untouched. The duplicate
    /// check and the insert happen under one write lock, so two concurrent
    /// registrations for the same command key cannot both succeed.
    pub fn register(
        &self,
        signature: &HandlerSignature,
        handler: Option<H>,
    ) -> Result<HandlerKey, RegistrationError> {
        let Some(handler) = handler else {
            return Err(RegistrationError::InvalidHandler);
        };
        let key = signature.validate(self.kind)?;

        let mut handlers = self.handlers.write();
        let entry = handlers.entry(key).or_default();
        if self.kind.is_unicast() && !entry.is_empty() {
            return Err(RegistrationError::AlreadyRegistered(key));
        }
        entry.push(handler);
        let count = entry.len();
        drop(handlers);

        debug!(kind = %self.kind, payload = %key, handlers = count, "Registered handler");
        Ok(key)
    }

    /// The single handler for `key`, for command and query dispatch.
    pub fn handler(&self, key: &HandlerKey) -> Option<H> {
        self.handlers.read().get(key).and_then(|list| list.first().cloned())
    }

    /// Every handler for `key` in registration order.
    pub fn handlers(&self, key: &HandlerKey) -> Vec<H> {
        self.handlers.read().get(key).cloned().unwrap_or_default()
    }

    /// Whether at least one handler is registered for `key`.
    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.read().contains_key(key)
    }

    /// Keys with at least one handler.
    pub fn keys(&self) -> Vec<HandlerKey> {
        self.handlers.read().keys().copied().collect()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<H> fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("HandlerRegistry")
            .field("kind", &self.kind)
            .field("keys", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

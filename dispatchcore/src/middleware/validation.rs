use super::Middleware;
use crate::context::Context;
use crate::errors::{BoxError, BusError};
use crate::handler::{ErasedHandler, HandlerFuture};
use crate::key::HandlerKey;
use crate::message::{Message, Payload};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// Checks a payload before its handler runs.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Returns an error describing why `payload` is unacceptable.
    async fn validate(&self, ctx: &Context, payload: &Payload) -> Result<(), BoxError>;
}

#[async_trait]
impl<V: Validator + ?Sized> Validator for Arc<V> {
    async fn validate(&self, ctx: &Context, payload: &Payload) -> Result<(), BoxError> {
        (**self).validate(ctx, payload).await
    }
}

type Rule = Box<dyn Fn(&Payload) -> Result<(), BoxError> + Send + Sync>;

/// A [`Validator`] built from per-type rule closures.
///
/// Payload types without rules always pass.
///
/// ```rust,ignore
/// let validator = RuleValidator::new()
///     .rule(|c: &OpenAccount| if c.owner.is_empty() { Err("owner is required") } else { Ok(()) })
///     .rule(|q: &GetStatement| if q.limit > 500 { Err("limit too large") } else { Ok(()) });
/// ```
#[derive(Default)]
pub struct RuleValidator {
    rules: HashMap<HandlerKey, Vec<Rule>>,
}

impl RuleValidator {
    /// Creates a validator without rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for payloads of type `M`. Rules run in the order added
    /// and the first failure wins.
    #[must_use]
    pub fn rule<M, F, E>(mut self, rule: F) -> Self
    where
        M: Message,
        F: Fn(&M) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.rules
            .entry(HandlerKey::of::<M>())
            .or_default()
            .push(Box::new(move |payload: &Payload| {
                payload
                    .downcast_ref::<M>()
                    .map_or(Ok(()), |message| rule(message).map_err(Into::into))
            }));
        self
    }
}

impl std::fmt::Debug for RuleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleValidator")
            .field("types", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(&self, _ctx: &Context, payload: &Payload) -> Result<(), BoxError> {
        self.rules
            .get(&payload.key())
            .into_iter()
            .flatten()
            .try_for_each(|rule| rule(payload))
    }
}

/// Rejects invalid commands and queries with [`BusError::Validation`]
/// before their handler runs.
pub struct ValidationMiddleware<V> {
    validator: Arc<V>,
}

impl<V> ValidationMiddleware<V> {
    /// Validates with `validator`.
    pub fn new(validator: V) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

impl<V> std::fmt::Debug for ValidationMiddleware<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationMiddleware").finish_non_exhaustive()
    }
}

impl<V, T> Middleware<ErasedHandler<T>> for ValidationMiddleware<V>
where
    V: Validator + 'static,
    T: Send + 'static,
{
    fn wrap(&self, next: ErasedHandler<T>) -> ErasedHandler<T> {
        let validator = Arc::clone(&self.validator);
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<T> {
            let next = Arc::clone(&next);
            let validator = Arc::clone(&validator);
            async move {
                validator
                    .validate(&ctx, &payload)
                    .await
                    .map_err(BusError::Validation)?;
                next(ctx, payload).await
            }
            .boxed()
        })
    }
}

use super::Middleware;
use crate::context::Context;
use crate::errors::{BoxError, BusError};
use crate::handler::{HandlerFn, HandlerFuture};
use crate::message::Payload;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Finishes a transaction started by a [`TransactionManager`].
#[async_trait]
pub trait Committer: Send + Sync {
    /// Makes the transaction's writes durable.
    async fn commit_transaction(&self, ctx: &Context) -> Result<(), BoxError>;

    /// Discards the transaction's writes.
    async fn rollback_transaction(&self, ctx: &Context) -> Result<(), BoxError>;
}

/// Starts transactions and exposes the active one to handlers.
///
/// Implementations store the transaction handle in the context returned by
/// [`start_transaction`](Self::start_transaction), under a slot type only
/// they can name.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Handle a handler uses to read and write inside the transaction.
    type Transaction: Clone + Send + Sync + 'static;

    /// Whether `ctx` already carries an active transaction.
    fn is_transaction_started(&self, ctx: &Context) -> bool;

    /// Starts a transaction and returns its committer together with a
    /// context carrying it.
    async fn start_transaction(
        &self,
        ctx: &Context,
    ) -> Result<(Box<dyn Committer>, Context), BoxError>;

    /// The transaction active in `ctx`.
    fn transaction(&self, ctx: &Context) -> Option<Self::Transaction>;
}

/// Runs each command inside a transaction.
///
/// - If the context already carries a transaction, the handler joins it and
///   nothing is started, committed or rolled back here.
/// - A handler error rolls back and is returned as is. A rollback failure
///   is logged, never returned in its place.
/// - A handler panic rolls back and the panic continues unwinding.
/// - Success commits; a failed commit becomes [`BusError::Transaction`].
pub struct TransactionMiddleware<T> {
    manager: Arc<T>,
}

impl<T> TransactionMiddleware<T> {
    /// Manages transactions with `manager`.
    pub fn new(manager: T) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }
}

impl<T> std::fmt::Debug for TransactionMiddleware<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMiddleware").finish_non_exhaustive()
    }
}

async fn rollback(committer: &dyn Committer, ctx: &Context) {
    if let Err(error) = committer.rollback_transaction(ctx).await {
        warn!(error = %error, "Transaction rollback failed");
    }
}

impl<T: TransactionManager + 'static> Middleware<HandlerFn> for TransactionMiddleware<T> {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let manager = Arc::clone(&self.manager);
        Arc::new(move |ctx: Context, payload: Payload| -> HandlerFuture<()> {
            let next = Arc::clone(&next);
            let manager = Arc::clone(&manager);
            async move {
                if manager.is_transaction_started(&ctx) {
                    debug!("Joining active transaction");
                    return next(ctx, payload).await;
                }

                let (committer, ctx) = manager
                    .start_transaction(&ctx)
                    .await
                    .map_err(BusError::Transaction)?;

                match AssertUnwindSafe(next(ctx.clone(), payload)).catch_unwind().await {
                    Err(panic) => {
                        rollback(committer.as_ref(), &ctx).await;
                        panic::resume_unwind(panic)
                    }
                    Ok(Err(error)) => {
                        debug!(error = %error, "Rolling back transaction");
                        rollback(committer.as_ref(), &ctx).await;
                        Err(error)
                    }
                    Ok(Ok(())) => committer
                        .commit_transaction(&ctx)
                        .await
                        .map_err(BusError::Transaction),
                }
            }
            .boxed()
        })
    }
}

//! A transaction manager that only records what happened to it.

use crate::context::Context;
use crate::errors::BoxError;
use crate::middleware::{Committer, TransactionManager};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::CallLog;

/// Handle of a transaction started by [`MockTransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTransaction {
    /// Sequence number, starting at 1.
    pub id: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveMockTransaction(MockTransaction);

#[derive(Debug, Default)]
struct Script {
    calls: CallLog,
    next_id: AtomicU64,
    fail_start: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

/// Records `"start"`, `"commit"` and `"rollback"` in call order.
///
/// Each `fail_next_*` switch makes exactly one later call of that kind
/// fail.
#[derive(Debug, Clone, Default)]
pub struct MockTransactionManager {
    script: Arc<Script>,
}

impl MockTransactionManager {
    /// Creates a manager where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<String> {
        self.script.calls.entries()
    }

    /// The next start fails.
    pub fn fail_next_start(&self) {
        self.script.fail_start.store(true, Ordering::SeqCst);
    }

    /// The next commit fails.
    pub fn fail_next_commit(&self) {
        self.script.fail_commit.store(true, Ordering::SeqCst);
    }

    /// The next rollback fails.
    pub fn fail_next_rollback(&self) {
        self.script.fail_rollback.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionManager for MockTransactionManager {
    type Transaction = MockTransaction;

    fn is_transaction_started(&self, ctx: &Context) -> bool {
        ctx.value::<ActiveMockTransaction>().is_some()
    }

    async fn start_transaction(
        &self,
        ctx: &Context,
    ) -> Result<(Box<dyn Committer>, Context), BoxError> {
        self.script.calls.record("start");
        if self.script.fail_start.swap(false, Ordering::SeqCst) {
            return Err("scripted start failure".into());
        }

        let transaction = MockTransaction {
            id: self.script.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let committer = MockCommitter {
            script: Arc::clone(&self.script),
            transaction,
        };
        Ok((Box::new(committer), ctx.with_value(ActiveMockTransaction(transaction))))
    }

    fn transaction(&self, ctx: &Context) -> Option<MockTransaction> {
        ctx.value::<ActiveMockTransaction>().map(|active| active.0)
    }
}

/// Committer handed out by [`MockTransactionManager`].
#[derive(Debug)]
pub struct MockCommitter {
    script: Arc<Script>,
    transaction: MockTransaction,
}

impl MockCommitter {
    /// The transaction this committer finishes.
    pub const fn transaction(&self) -> MockTransaction {
        self.transaction
    }
}

#[async_trait]
impl Committer for MockCommitter {
    async fn commit_transaction(&self, _ctx: &Context) -> Result<(), BoxError> {
        self.script.calls.record("commit");
        if self.script.fail_commit.swap(false, Ordering::SeqCst) {
            let id = self.transaction.id;
            return Err(format!("scripted commit failure in transaction {id}").into());
        }
        Ok(())
    }

    async fn rollback_transaction(&self, _ctx: &Context) -> Result<(), BoxError> {
        self.script.calls.record("rollback");
        if self.script.fail_rollback.swap(false, Ordering::SeqCst) {
            let id = self.transaction.id;
            return Err(format!("scripted rollback failure in transaction {id}").into());
        }
        Ok(())
    }
}

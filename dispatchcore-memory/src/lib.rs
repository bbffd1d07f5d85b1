//! In-memory transaction manager for `dispatchcore`
//!
//! This crate provides a key/value [`InMemoryStore`] and an
//! [`InMemoryTransactionManager`] implementing
//! [`dispatchcore::TransactionManager`]. Writes made through an
//! [`InMemoryTransaction`] are staged and become visible in the store only
//! when the transaction commits, which makes it useful for testing
//! command pipelines without a database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dispatchcore::{BoxError, Committer, Context, TransactionManager};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Errors raised by the in-memory store and its transactions.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The transaction was already committed or rolled back.
    #[error("transaction {0} is already finished")]
    Finished(Uuid),

    /// A commit failure requested with
    /// [`InMemoryTransactionManager::fail_next_commit`].
    #[error("injected commit failure in transaction {0}")]
    InjectedCommitFailure(Uuid),

    /// A value could not be converted to or from JSON.
    #[error("value for key {key} could not be converted: {source}")]
    Serialization {
        /// Key of the offending value.
        key: String,
        /// Underlying `serde_json` error.
        #[source]
        source: serde_json::Error,
    },
}

fn to_value<T: Serialize>(key: &str, value: &T) -> Result<Value, MemoryError> {
    serde_json::to_value(value).map_err(|source| MemoryError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn from_value<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, MemoryError> {
    serde_json::from_value(value).map_err(|source| MemoryError::Serialization {
        key: key.to_string(),
        source,
    })
}

/// Thread-safe key/value store holding committed JSON values
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` directly, outside any transaction. Meant for seeding
    /// test data.
    pub fn insert<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), MemoryError> {
        let key = key.into();
        let value = to_value(&key, value)?;
        self.entries.write().insert(key, value);
        Ok(())
    }

    /// Committed value under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MemoryError> {
        self.get_raw(key)
            .map(|value| from_value(key, value))
            .transpose()
    }

    /// Committed JSON value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Committed keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing was committed.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A copy of every committed entry.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }

    fn apply(&self, staged: BTreeMap<String, StagedWrite>) {
        let mut entries = self.entries.write();
        for (key, write) in staged {
            match write {
                StagedWrite::Put(value) => {
                    entries.insert(key, value);
                }
                StagedWrite::Delete => {
                    entries.remove(&key);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Put(Value),
    Delete,
}

#[derive(Debug, Default)]
struct TransactionState {
    staged: BTreeMap<String, StagedWrite>,
    finished: bool,
}

/// Handle to an open transaction.
///
/// Reads see the transaction's own staged writes first and fall back to
/// the committed store. Clones share the same staged writes.
#[derive(Clone)]
pub struct InMemoryTransaction {
    id: Uuid,
    store: InMemoryStore,
    state: Arc<Mutex<TransactionState>>,
}

impl InMemoryTransaction {
    fn begin(store: InMemoryStore) -> Self {
        Self {
            id: Uuid::now_v7(),
            store,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    /// Unique, time-ordered transaction id.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Stages `value` under `key`.
    pub fn put<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<(), MemoryError> {
        let key = key.into();
        let value = to_value(&key, value)?;
        self.stage(key, StagedWrite::Put(value))
    }

    /// Stages removal of `key`.
    pub fn delete(&self, key: impl Into<String>) -> Result<(), MemoryError> {
        self.stage(key.into(), StagedWrite::Delete)
    }

    /// Value under `key` as this transaction sees it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MemoryError> {
        let staged = self.state.lock().staged.get(key).cloned();
        let value = match staged {
            Some(StagedWrite::Put(value)) => Some(value),
            Some(StagedWrite::Delete) => None,
            None => self.store.get_raw(key),
        };
        value.map(|value| from_value(key, value)).transpose()
    }

    /// Number of keys written but not yet committed.
    pub fn staged_len(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// Whether the transaction was committed or rolled back.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn stage(&self, key: String, write: StagedWrite) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(MemoryError::Finished(self.id));
        }
        state.staged.insert(key, write);
        Ok(())
    }

    /// Marks the transaction finished and hands back its staged writes.
    fn finish(&self) -> Result<BTreeMap<String, StagedWrite>, MemoryError> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(MemoryError::Finished(self.id));
        }
        state.finished = true;
        Ok(std::mem::take(&mut state.staged))
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("id", &self.id)
            .field("staged", &self.staged_len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Counters describing what a manager did so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Transactions started.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back, including failed commits.
    pub rolled_back: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
    stats: Mutex<TransactionStats>,
    fail_next_commit: AtomicBool,
}

#[derive(Debug, Clone)]
struct ActiveTransaction(InMemoryTransaction);

/// [`TransactionManager`] backed by an [`InMemoryStore`]
///
/// Clones share the store, the statistics and the failure switch.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionManager {
    store: InMemoryStore,
    state: Arc<ManagerState>,
}

impl InMemoryTransactionManager {
    /// Create a manager over a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager committing into `store`
    pub fn with_store(store: InMemoryStore) -> Self {
        Self {
            store,
            state: Arc::default(),
        }
    }

    /// The store transactions commit into.
    pub const fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Counters so far.
    pub fn stats(&self) -> TransactionStats {
        *self.state.stats.lock()
    }

    /// Makes the next commit discard its writes and fail.
    pub fn fail_next_commit(&self) {
        self.state.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionManager for InMemoryTransactionManager {
    type Transaction = InMemoryTransaction;

    fn is_transaction_started(&self, ctx: &Context) -> bool {
        ctx.value::<ActiveTransaction>()
            .is_some_and(|active| !active.0.is_finished())
    }

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id()))]
    async fn start_transaction(
        &self,
        ctx: &Context,
    ) -> Result<(Box<dyn Committer>, Context), BoxError> {
        let transaction = InMemoryTransaction::begin(self.store.clone());
        self.state.stats.lock().started += 1;
        debug!(transaction_id = %transaction.id(), "Started transaction");

        let ctx = ctx.with_value(ActiveTransaction(transaction.clone()));
        let committer = InMemoryCommitter {
            transaction,
            state: Arc::clone(&self.state),
        };
        Ok((Box::new(committer), ctx))
    }

    fn transaction(&self, ctx: &Context) -> Option<InMemoryTransaction> {
        ctx.value::<ActiveTransaction>().map(|active| active.0.clone())
    }
}

/// Finishes an [`InMemoryTransaction`].
#[derive(Debug)]
pub struct InMemoryCommitter {
    transaction: InMemoryTransaction,
    state: Arc<ManagerState>,
}

#[async_trait]
impl Committer for InMemoryCommitter {
    async fn commit_transaction(&self, _ctx: &Context) -> Result<(), BoxError> {
        let id = self.transaction.id();
        let staged = self.transaction.finish()?;

        if self.state.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.state.stats.lock().rolled_back += 1;
            debug!(transaction_id = %id, "Discarding writes of failed commit");
            return Err(MemoryError::InjectedCommitFailure(id).into());
        }

        let writes = staged.len();
        self.transaction.store.apply(staged);
        self.state.stats.lock().committed += 1;
        debug!(transaction_id = %id, writes, "Committed transaction");
        Ok(())
    }

    async fn rollback_transaction(&self, _ctx: &Context) -> Result<(), BoxError> {
        let discarded = self.transaction.finish()?.len();
        self.state.stats.lock().rolled_back += 1;
        debug!(transaction_id = %self.transaction.id(), discarded, "Rolled back transaction");
        Ok(())
    }
}

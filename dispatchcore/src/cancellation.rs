//! Hierarchical cancellation for dispatch scopes.
//!
//! Cancelling a scope cancels every scope derived from it, never its parent.
//! The event bus derives one child per dispatch so that the first failing
//! handler can stop its siblings without touching the caller's scope.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Default)]
struct Node {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Node>>>,
}

impl Node {
    fn cancel(&self) {
        let children = {
            let mut children = self.children.lock();
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *children)
        };

        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A cancellation signal shared by everything running in one scope.
///
/// Clones observe the same signal.
#[derive(Clone, Default)]
pub struct CancellationScope {
    node: Arc<Node>,
}

impl CancellationScope {
    /// Creates a root scope that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a scope that is cancelled with this one, or on its own.
    ///
    /// A child of an already cancelled scope starts cancelled.
    pub fn child(&self) -> Self {
        let child = Arc::new(Node::default());

        let mut children = self.node.children.lock();
        if self.node.cancelled.load(Ordering::Acquire) {
            child.cancelled.store(true, Ordering::Release);
        } else {
            children.retain(|existing| existing.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        drop(children);

        Self { node: child }
    }

    /// Cancels this scope and every scope derived from it.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Whether this scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// Completes once this scope is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.node.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

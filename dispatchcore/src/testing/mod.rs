//! Test doubles for code built on the buses.
//!
//! - [`recording`]: a shared call log, a middleware that writes to it and
//!   an [`EventDispatcher`](crate::event_bus::EventDispatcher) that keeps
//!   every batch it receives
//! - [`transactions`]: a scripted [`TransactionManager`](crate::middleware::TransactionManager)
//!   with failure injection
//!
//! Available in unit tests and, for downstream crates, behind the
//! `testing` feature.
//!
//! ```rust,ignore
//! use dispatchcore::testing::prelude::*;
//!
//! let log = CallLog::new();
//! command_bus.use_middleware(RecordingMiddleware::new("audit", log.clone()));
//! command_bus.execute(&ctx, Rename { name: "ada".into() }).await?;
//! assert_eq!(log.entries(), vec!["audit-pre", "audit-post"]);
//! ```

pub mod recording;
pub mod transactions;

pub use recording::{CallLog, RecordingDispatcher, RecordingMiddleware};
pub use transactions::{MockCommitter, MockTransaction, MockTransactionManager};

/// Everything in this module in one import.
pub mod prelude {
    pub use super::recording::*;
    pub use super::transactions::*;
}

//! Transaction engine, retry classifier and refresh coordinator.
//!
//! - [`txn`] - Transactions, per-key statuses and reports
//! - [`engine`] - The [`Scheduler`]: staging, planning and execution
//! - [`queue`] - FIFO transaction queue with cancellation
//! - [`retry`] - Failure classification and the retry queue
//! - [`refresh`] - Dump/refresh drift correction
//! - [`history`] - Bounded log of executed transactions

pub mod engine;
pub mod history;
pub mod queue;
pub mod refresh;
pub mod retry;
pub mod txn;

pub use engine::{Scheduler, DERIVED_FROM};
pub use history::TxnHistory;
pub use queue::{TxnQueue, TxnTicket};
pub use refresh::{Drift, DriftKind, RefreshReport};
pub use retry::{RetryDecision, RetryEntry, RetryPolicy, RetryQueue};
pub use txn::{
    Change, ExecutedOp, KeyReport, KeyStatus, Transaction, TxnKind, TxnReport, TxnState,
};

//! FIFO transaction queue with cancellation.
//!
//! Submitters get a [`TxnTicket`]; the scheduler pops transactions one at a
//! time. A ticket can cancel its transaction only while it is still queued.

use super::txn::{Transaction, TxnReport};
use crate::core::error::{SchedulerError, SchedulerResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug)]
struct TicketState {
    state: AtomicU8,
}

/// Handle to a submitted transaction.
#[derive(Debug)]
pub struct TxnTicket {
    seq: u64,
    state: Arc<TicketState>,
    rx: oneshot::Receiver<TxnReport>,
}

impl TxnTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Cancel the transaction if it has not started applying.
    pub fn cancel(&self) -> bool {
        self.state
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Wait for the report.
    pub async fn wait(self) -> SchedulerResult<TxnReport> {
        self.rx.await.map_err(|_| SchedulerError::QueueClosed)
    }

    /// Take the report if it is ready.
    pub fn try_result(&mut self) -> Option<TxnReport> {
        self.rx.try_recv().ok()
    }
}

/// A transaction waiting in the queue.
#[derive(Debug)]
pub(crate) struct QueuedTxn {
    pub seq: u64,
    pub txn: Transaction,
    state: Arc<TicketState>,
    tx: oneshot::Sender<TxnReport>,
}

impl QueuedTxn {
    pub fn new(seq: u64, txn: Transaction) -> (Self, TxnTicket) {
        let state = Arc::new(TicketState {
            state: AtomicU8::new(QUEUED),
        });
        let (tx, rx) = oneshot::channel();
        let queued = Self {
            seq,
            txn,
            state: Arc::clone(&state),
            tx,
        };
        (queued, TxnTicket { seq, state, rx })
    }

    /// Claim the transaction for execution. Fails if it was cancelled.
    pub fn start(&self) -> bool {
        self.state
            .state
            .compare_exchange(QUEUED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Deliver the report. A dropped ticket is not an error.
    pub fn complete(self, report: TxnReport) {
        let _ = self.tx.send(report);
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<QueuedTxn>,
    closed: bool,
}

/// Transactions waiting for the writer role.
#[derive(Debug, Default)]
pub struct TxnQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TxnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, queued: QueuedTxn) -> SchedulerResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SchedulerError::QueueClosed);
            }
            inner.pending.push_back(queued);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<QueuedTxn> {
        self.inner.lock().pending.pop_front()
    }

    /// Reject further submissions. Queued transactions stay drainable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a transaction is pushed.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

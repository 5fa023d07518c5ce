//! Transactions and transaction reports.

use crate::core::error::SchedulerError;
use crate::core::time::Tick;
use crate::descriptor::value::{Key, Value};
use crate::graph::plan::{OpKind, OpReason};

/// One requested change of a key.
#[derive(Debug, Clone)]
pub enum Change {
    /// Declare the desired value.
    Set(Value),
    /// Remove the desired value.
    Delete,
    /// Re-evaluate the key against its recorded desired value.
    Reconcile,
}

/// Origin of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnKind {
    /// Caller-submitted changes.
    Northbound,
    /// Caller-submitted replacement of the whole desired state.
    Resync,
    /// Re-attempt of a single failed key.
    Retry,
    /// Drift correction after a dump.
    Refresh,
}

impl TxnKind {
    /// Check if the transaction carries caller intent.
    pub fn is_northbound(&self) -> bool {
        matches!(self, Self::Northbound | Self::Resync)
    }
}

impl std::fmt::Display for TxnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Northbound => write!(f, "northbound"),
            Self::Resync => write!(f, "resync"),
            Self::Retry => write!(f, "retry"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// A batch of changes.
///
/// When a key appears more than once, the last change wins.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: TxnKind,
    pub changes: Vec<(Key, Change)>,
    pub description: Option<String>,
}

impl Transaction {
    /// Start an empty northbound transaction.
    pub fn new() -> Self {
        Self {
            kind: TxnKind::Northbound,
            changes: Vec::new(),
            description: None,
        }
    }

    /// Replace the entire northbound desired state with `items`.
    ///
    /// Northbound keys missing from `items` are deleted.
    pub fn resync(items: impl IntoIterator<Item = (Key, Value)>) -> Self {
        Self {
            kind: TxnKind::Resync,
            changes: items
                .into_iter()
                .map(|(key, value)| (key, Change::Set(value)))
                .collect(),
            description: None,
        }
    }

    pub(crate) fn internal(kind: TxnKind, changes: Vec<(Key, Change)>) -> Self {
        Self {
            kind,
            changes,
            description: None,
        }
    }

    pub fn set(mut self, key: impl Into<Key>, value: Value) -> Self {
        self.changes.push((key.into(), Change::Set(value)));
        self
    }

    pub fn delete(mut self, key: impl Into<Key>) -> Self {
        self.changes.push((key.into(), Change::Delete));
        self
    }

    pub fn reconcile(mut self, key: impl Into<Key>) -> Self {
        self.changes.push((key.into(), Change::Reconcile));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction state machine.
///
/// ```text
/// Planned -> Applying -> { Committed, PartiallyFailed }
/// Planned -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Planned,
    Applying,
    Committed,
    PartiallyFailed,
    Cancelled,
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::Applying => write!(f, "applying"),
            Self::Committed => write!(f, "committed"),
            Self::PartiallyFailed => write!(f, "partially-failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    /// The dataplane matches the desired state for this key.
    Committed,
    /// Stored, waiting for a dependency to be applied.
    PendingDependency,
    /// A retriable failure occurred; `attempt` failed attempts so far.
    PendingRetry { attempt: u32, retry_at: Tick },
    /// Terminal failure.
    Failed(SchedulerError),
    /// The transaction was cancelled before it started.
    Cancelled,
}

impl KeyStatus {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingDependency | Self::PendingRetry { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The error of a failed key.
    pub fn error(&self) -> Option<&SchedulerError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::PendingDependency => write!(f, "pending-dependency"),
            Self::PendingRetry { attempt, retry_at } => {
                write!(f, "pending-retry (attempt {}, at {})", attempt, retry_at)
            }
            Self::Failed(err) => write!(f, "failed [{}]: {}", err.kind(), err),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReport {
    pub key: Key,
    pub status: KeyStatus,
}

/// A descriptor operation that was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedOp {
    pub key: Key,
    pub descriptor: String,
    pub op: OpKind,
    pub reason: OpReason,
    pub elapsed_ms: u64,
    pub error: Option<SchedulerError>,
}

impl ExecutedOp {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of one transaction.
#[derive(Debug, Clone)]
pub struct TxnReport {
    pub seq: u64,
    pub kind: TxnKind,
    pub state: TxnState,
    pub description: Option<String>,
    /// Every submitted key exactly once, in submission order.
    pub keys: Vec<KeyReport>,
    /// Keys affected without being submitted (derived values, cascades,
    /// unblocked pending values, cycle members).
    pub side_effects: Vec<KeyReport>,
    /// Dispatched operations in execution order.
    pub executed: Vec<ExecutedOp>,
    pub started_at: Tick,
    pub finished_at: Tick,
}

impl TxnReport {
    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    /// Status of a submitted or side-effect key.
    pub fn status(&self, key: &str) -> Option<&KeyStatus> {
        self.keys
            .iter()
            .chain(self.side_effects.iter())
            .find(|r| r.key == key)
            .map(|r| &r.status)
    }

    pub fn committed_keys(&self) -> Vec<&str> {
        self.keys_where(KeyStatus::is_committed)
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.keys_where(KeyStatus::is_failed)
    }

    pub fn pending_keys(&self) -> Vec<&str> {
        self.keys_where(KeyStatus::is_pending)
    }

    /// Dispatched operations for one key.
    pub fn ops_for(&self, key: &str) -> Vec<OpKind> {
        self.executed
            .iter()
            .filter(|o| o.key == key)
            .map(|o| o.op)
            .collect()
    }

    fn keys_where(&self, pred: impl Fn(&KeyStatus) -> bool) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|r| pred(&r.status))
            .map(|r| r.key.as_str())
            .collect()
    }
}

impl std::fmt::Display for TxnReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "txn #{} ({}) {}", self.seq, self.kind, self.state)?;
        for report in &self.keys {
            writeln!(f, "  {} {}", report.key, report.status)?;
        }
        for report in &self.side_effects {
            writeln!(f, "  ({}) {}", report.key, report.status)?;
        }
        Ok(())
    }
}

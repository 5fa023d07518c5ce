//! Graph nodes and their state machine.

use crate::core::error::{ErrorKind, SchedulerError};
use crate::descriptor::value::{Dependency, Key, Metadata, Origin, Value};

/// Lifecycle state of a node.
///
/// ```text
/// Planned -> InFlight -> { Applied, Failed, PendingRetry, Pending }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Touched by the running transaction, not yet dispatched.
    Planned,
    /// An operation is running in the dataplane.
    InFlight,
    /// The desired value is in the dataplane.
    Applied,
    /// Waiting for a dependency to be applied.
    Pending,
    /// A retriable failure occurred and a retry is queued.
    PendingRetry,
    /// Terminal failure.
    Failed(ErrorKind),
}

impl NodeState {
    /// Check if the node failed terminally.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Failed nodes that a later transaction may pick up again once the
    /// blocking condition clears.
    pub fn is_recoverable_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed(ErrorKind::DependencyFailed) | Self::Failed(ErrorKind::CyclicDependency)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Applied => write!(f, "applied"),
            Self::Pending => write!(f, "pending"),
            Self::PendingRetry => write!(f, "pending-retry"),
            Self::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

/// One configuration item.
///
/// `desired` is the northbound intent, `applied` is what the engine believes
/// is in the dataplane. Southbound-only nodes have no desired value.
#[derive(Debug, Clone)]
pub struct Node {
    pub key: Key,
    /// Name of the owning descriptor.
    pub descriptor: String,
    pub desired: Option<Value>,
    pub applied: Option<Value>,
    /// Present only while `applied` results from a successful Add/Update.
    pub metadata: Option<Metadata>,
    pub origin: Origin,
    pub state: NodeState,
    /// Dependencies of the desired value, including the parent of a derived value.
    pub dependencies: Vec<Dependency>,
    /// Parent of a derived value.
    pub derived_from: Option<Key>,
    /// Derived values currently produced by this node.
    pub derived: Vec<Key>,
    /// Consecutive failed attempts since the last success or northbound change.
    pub failures: u32,
    pub last_error: Option<SchedulerError>,
    /// Insertion order, used to break planning ties.
    pub seq: u64,
}

impl Node {
    pub fn new(key: impl Into<Key>, descriptor: impl Into<String>, seq: u64) -> Self {
        Self {
            key: key.into(),
            descriptor: descriptor.into(),
            desired: None,
            applied: None,
            metadata: None,
            origin: Origin::FromNorthbound,
            state: NodeState::Planned,
            dependencies: Vec::new(),
            derived_from: None,
            derived: Vec::new(),
            failures: 0,
            last_error: None,
            seq,
        }
    }

    /// Check if this node is a derived value.
    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Check if dependents of this node may be applied.
    ///
    /// Southbound-origin nodes count as long as they are in the dataplane.
    pub fn satisfies_dependents(&self) -> bool {
        self.applied.is_some() && !self.state.is_failed()
    }

    /// Check if the node carries neither intent nor dataplane state.
    pub fn is_vacant(&self) -> bool {
        self.desired.is_none() && self.applied.is_none()
    }

    /// Record a successful Add or Update of `value`.
    pub fn mark_applied(&mut self, value: Value, metadata: Option<Metadata>) {
        self.applied = Some(value);
        self.metadata = metadata;
        self.state = NodeState::Applied;
        self.failures = 0;
        self.last_error = None;
    }

    /// Record a successful Delete.
    pub fn mark_removed(&mut self) {
        self.applied = None;
        self.metadata = None;
        self.failures = 0;
        self.last_error = None;
        self.state = if self.desired.is_some() {
            NodeState::Pending
        } else {
            NodeState::Planned
        };
    }

    /// Record a failure with its error.
    pub fn mark_failed(&mut self, err: SchedulerError) {
        self.state = NodeState::Failed(err.kind());
        self.last_error = Some(err);
    }
}

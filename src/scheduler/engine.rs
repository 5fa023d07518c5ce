//! The transaction engine.
//!
//! One transaction holds the writer role (`gate`) at a time. Within it the
//! graph lock is taken to stage changes and plan, then released around every
//! descriptor call: the node is marked `InFlight`, the lock is dropped, the
//! descriptor runs, and the lock is re-acquired to record the outcome.
//! Readers therefore never observe a half-recorded node.

use super::history::TxnHistory;
use super::queue::{QueuedTxn, TxnQueue, TxnTicket};
use super::retry::{RetryDecision, RetryEntry, RetryPolicy, RetryQueue};
use super::txn::{
    Change, ExecutedOp, KeyReport, KeyStatus, Transaction, TxnKind, TxnReport, TxnState,
};
use crate::core::config::SchedulerConfig;
use crate::core::error::{DescriptorError, SchedulerError, SchedulerResult};
use crate::core::time::{Clock, SystemClock, Tick};
use crate::descriptor::{Dependency, Descriptor, DescriptorRegistry, Key, Metadata, Origin, Value};
use crate::graph::{topological_plan, Graph, Node, NodeState, OpKind, PlannedOp};
use crate::ops::observability::SchedulerMetrics;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Label of the implicit dependency of a derived value on its parent.
pub const DERIVED_FROM: &str = "derived-from";

/// Declarative reconciliation engine.
pub struct Scheduler {
    pub(super) registry: Arc<DescriptorRegistry>,
    pub(super) config: SchedulerConfig,
    retry_policy: RetryPolicy,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) graph: RwLock<Graph>,
    queue: TxnQueue,
    /// Writer role; held for a whole transaction or refresh.
    pub(super) gate: Mutex<()>,
    pub(super) retries: Mutex<RetryQueue>,
    history: Mutex<TxnHistory>,
    active: Mutex<Option<(u64, TxnState)>>,
    pub(super) metrics: Arc<SchedulerMetrics>,
    next_seq: AtomicU64,
}

/// Intermediate result of staging a transaction.
#[derive(Debug, Default)]
struct Staging {
    /// Submitted keys, unique, in submission order.
    submitted: Vec<Key>,
    /// Keys whose desired state changed or that must be re-evaluated.
    touched: Vec<Key>,
    touched_set: HashSet<Key>,
    /// Keys rejected before reaching the graph.
    rejected: HashMap<Key, SchedulerError>,
}

impl Staging {
    fn touch(&mut self, key: &str) {
        if self.touched_set.insert(key.to_string()) {
            self.touched.push(key.to_string());
        }
    }

    fn reject(&mut self, key: Key, err: SchedulerError) {
        tracing::warn!(key = %key, error = %err, "change rejected");
        self.rejected.insert(key, err);
    }
}

/// A derived value with its own derived values, computed before staging.
struct DerivedTree {
    key: Key,
    value: Value,
    descriptor: String,
    dependencies: Vec<Dependency>,
    children: Vec<DerivedTree>,
}

enum Call {
    Add(Value),
    Update(Value, Value, Option<Metadata>),
    Delete(Value, Option<Metadata>),
}

enum Prepared {
    Skip,
    Blocked(Blocker),
    Dispatch(Arc<dyn Descriptor>, Call),
}

/// Why a node cannot be applied right now.
enum Blocker {
    /// A dependency failed terminally.
    Failed(Key),
    /// A dependency is absent or not yet applied.
    Pending,
}

enum Resolution {
    Done(KeyStatus),
    Remove,
    Set(NodeState, KeyStatus),
    Fail(SchedulerError),
}

impl Scheduler {
    /// Create a scheduler using the system clock.
    pub fn new(registry: impl Into<Arc<DescriptorRegistry>>, config: SchedulerConfig) -> Self {
        Self::with_clock(registry, config, Arc::new(SystemClock::new()))
    }

    /// Create a scheduler with an explicit clock.
    pub fn with_clock(
        registry: impl Into<Arc<DescriptorRegistry>>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_policy = RetryPolicy::from(&config);
        let history = TxnHistory::new(config.history_size);
        Self {
            registry: registry.into(),
            config,
            retry_policy,
            clock,
            graph: RwLock::new(Graph::new()),
            queue: TxnQueue::new(),
            gate: Mutex::new(()),
            retries: Mutex::new(RetryQueue::new()),
            history: Mutex::new(history),
            active: Mutex::new(None),
            metrics: Arc::new(SchedulerMetrics::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub(super) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    // === Submission ===

    /// Queue a transaction.
    pub fn submit(&self, txn: Transaction) -> SchedulerResult<TxnTicket> {
        let seq = self.next_seq();
        let (queued, ticket) = QueuedTxn::new(seq, txn);
        self.queue.push(queued)?;
        tracing::debug!(seq, "transaction queued");
        Ok(ticket)
    }

    /// Queue a transaction and process the queue until it is done.
    pub fn commit(&self, txn: Transaction) -> SchedulerResult<TxnReport> {
        let mut ticket = self.submit(txn)?;
        self.drain_queue();
        ticket.try_result().ok_or(SchedulerError::QueueClosed)
    }

    /// Apply queued transactions one at a time, in submission order.
    ///
    /// Returns the number of transactions taken off the queue.
    pub fn drain_queue(&self) -> usize {
        let _gate = self.gate.lock();
        let mut processed = 0;
        while let Some(mut queued) = self.queue.pop() {
            processed += 1;
            if !queued.start() {
                let report = self.cancelled_report(queued.seq, &queued.txn);
                queued.complete(report);
                continue;
            }
            let txn = std::mem::take(&mut queued.txn);
            let report = self.execute(queued.seq, txn);
            queued.complete(report);
        }
        processed
    }

    /// Re-run every retry whose deadline has passed, each as its own
    /// single-key transaction.
    pub fn process_retries(&self) -> Vec<TxnReport> {
        let _gate = self.gate.lock();
        let due = self.retries.lock().take_due(self.clock.now());
        let mut reports = Vec::with_capacity(due.len());
        for entry in due {
            tracing::debug!(
                key = %entry.key,
                op = %entry.op,
                attempt = entry.attempt + 1,
                "retrying operation"
            );
            let seq = self.next_seq();
            let txn = Transaction::internal(TxnKind::Retry, vec![(entry.key, Change::Reconcile)]);
            reports.push(self.execute(seq, txn));
        }
        reports
    }

    /// Reject further submissions.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queue(&self) -> &TxnQueue {
        &self.queue
    }

    // === Queries ===

    /// Snapshot of one node.
    pub fn node(&self, key: &str) -> Option<Node> {
        self.graph.read().get(key).cloned()
    }

    /// Snapshot of all nodes in insertion order.
    pub fn nodes(&self) -> Vec<Node> {
        self.graph.read().nodes().into_iter().cloned().collect()
    }

    pub fn state(&self, key: &str) -> Option<NodeState> {
        self.graph.read().get(key).map(|n| n.state)
    }

    /// Value currently believed to be in the dataplane.
    pub fn applied_value(&self, key: &str) -> Option<Value> {
        self.graph.read().get(key).and_then(|n| n.applied.clone())
    }

    pub fn desired_value(&self, key: &str) -> Option<Value> {
        self.graph.read().get(key).and_then(|n| n.desired.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<Metadata> {
        self.graph.read().get(key).and_then(|n| n.metadata.clone())
    }

    /// Metadata of every applied item of a descriptor, by key.
    pub fn metadata_map(&self, descriptor: &str) -> BTreeMap<Key, Metadata> {
        self.graph
            .read()
            .nodes_by_descriptor(descriptor)
            .into_iter()
            .filter(|n| n.applied.is_some())
            .filter_map(|n| n.metadata.clone().map(|m| (n.key.clone(), m)))
            .collect()
    }

    pub fn retry_entry(&self, key: &str) -> Option<RetryEntry> {
        self.retries.lock().get(key).cloned()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retries.lock().len()
    }

    pub fn next_retry_deadline(&self) -> Option<Tick> {
        self.retries.lock().next_deadline()
    }

    /// Executed transactions, oldest first.
    pub fn history(&self) -> Vec<TxnReport> {
        self.history.lock().reports()
    }

    /// The transaction currently holding the writer role, with its state.
    pub fn active_txn(&self) -> Option<(u64, TxnState)> {
        *self.active.lock()
    }

    // === Execution ===

    /// Stage, plan and apply one transaction. The caller holds the gate.
    pub(super) fn execute(&self, seq: u64, txn: Transaction) -> TxnReport {
        let started_at = self.clock.now();
        let started = Instant::now();
        let kind = txn.kind;
        let description = txn.description;
        *self.active.lock() = Some((seq, TxnState::Planned));

        let mut staging = Staging::default();
        let plan = {
            let mut graph = self.graph.write();
            let mut changes = dedup(txn.changes);
            if kind == TxnKind::Resync {
                extend_resync(&graph, &mut changes);
            }
            for (key, change) in changes {
                staging.submitted.push(key.clone());
                self.stage(&mut graph, kind, key, change, &mut staging);
            }

            let plan = topological_plan(&graph, &self.registry, &staging.touched);
            for cycle in &plan.cycles {
                tracing::error!(seq, cycle = ?cycle, "dependency cycle rejected");
                for key in cycle {
                    if let Some(node) = graph.get_mut(key) {
                        node.mark_failed(SchedulerError::CyclicDependency {
                            key: key.clone(),
                            cycle: cycle.clone(),
                        });
                    }
                }
            }
            for op in &plan.ops {
                if let Some(node) = graph.get_mut(&op.key) {
                    node.state = NodeState::Planned;
                }
            }
            plan
        };
        tracing::debug!(
            seq,
            kind = %kind,
            keys = staging.submitted.len(),
            ops = plan.ops.len(),
            "transaction planned"
        );

        *self.active.lock() = Some((seq, TxnState::Applying));
        let mut executed = Vec::new();
        for op in &plan.ops {
            if let Some(done) = self.run_op(seq, op) {
                executed.push(done);
            }
        }

        let mut affected: Vec<Key> = Vec::new();
        let mut seen: HashSet<Key> = staging.submitted.iter().cloned().collect();
        let extra = staging
            .touched
            .iter()
            .chain(plan.ops.iter().map(|o| &o.key))
            .chain(plan.cycles.iter().flatten());
        for key in extra {
            if seen.insert(key.clone()) {
                affected.push(key.clone());
            }
        }

        let report = self.finalize(
            seq,
            kind,
            description,
            staging,
            affected,
            executed,
            started_at,
            started,
        );
        *self.active.lock() = None;
        report
    }

    fn stage(
        &self,
        graph: &mut Graph,
        kind: TxnKind,
        key: Key,
        change: Change,
        staging: &mut Staging,
    ) {
        let northbound = kind.is_northbound();
        if northbound && !matches!(change, Change::Reconcile) {
            if let Some(parent) = graph.get(&key).and_then(|n| n.derived_from.clone()) {
                let err = SchedulerError::DerivedValueImmutable {
                    key: key.clone(),
                    parent,
                };
                staging.reject(key, err);
                return;
            }
        }

        match change {
            Change::Set(value) => {
                let descriptor = match self.registry.lookup(&key) {
                    Ok(descriptor) => Arc::clone(descriptor),
                    Err(err) => {
                        staging.reject(key, err);
                        return;
                    }
                };
                if let Err(source) = descriptor.validate(&key, &value) {
                    let err = SchedulerError::ValidationFailed {
                        key: key.clone(),
                        source,
                    };
                    staging.reject(key, err);
                    return;
                }
                let children = match self.derive(&key, &key, &value, descriptor.as_ref(), 1) {
                    Ok(children) => children,
                    Err(err) => {
                        staging.reject(key, err);
                        return;
                    }
                };
                let dependencies = descriptor.dependencies(&key, &value);
                self.apply_desired(
                    graph,
                    &key,
                    value,
                    descriptor.name(),
                    dependencies,
                    None,
                    children,
                    northbound,
                    staging,
                );
            }
            Change::Delete => self.clear_desired(graph, &key, northbound, staging),
            Change::Reconcile => {
                if let Some(node) = graph.get_mut(&key) {
                    node.state = NodeState::Planned;
                    staging.touch(&key);
                }
            }
        }
    }

    /// Compute the full derivation tree of a value without touching the graph.
    fn derive(
        &self,
        root: &str,
        key: &str,
        value: &Value,
        descriptor: &dyn Descriptor,
        depth: usize,
    ) -> SchedulerResult<Vec<DerivedTree>> {
        let mut trees = Vec::new();
        for kv in descriptor.derived_values(key, value) {
            if depth > self.config.max_derivation_depth {
                return Err(SchedulerError::DerivationTooDeep {
                    key: root.to_string(),
                    max_depth: self.config.max_derivation_depth,
                });
            }
            let child = self.registry.lookup(&kv.key)?;
            child
                .validate(&kv.key, &kv.value)
                .map_err(|source| SchedulerError::ValidationFailed {
                    key: kv.key.clone(),
                    source,
                })?;
            let mut dependencies = child.dependencies(&kv.key, &kv.value);
            dependencies.push(Dependency::new(DERIVED_FROM, key));
            let children = self.derive(root, &kv.key, &kv.value, child.as_ref(), depth + 1)?;
            trees.push(DerivedTree {
                descriptor: child.name().to_string(),
                key: kv.key,
                value: kv.value,
                dependencies,
                children,
            });
        }
        Ok(trees)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_desired(
        &self,
        graph: &mut Graph,
        key: &str,
        value: Value,
        descriptor: &str,
        dependencies: Vec<Dependency>,
        parent: Option<&str>,
        children: Vec<DerivedTree>,
        northbound: bool,
        staging: &mut Staging,
    ) {
        let old_children = {
            let node = graph.entry(key, descriptor);
            node.descriptor = descriptor.to_string();
            node.desired = Some(value);
            node.origin = Origin::FromNorthbound;
            node.derived_from = parent.map(str::to_string);
            node.state = NodeState::Planned;
            if northbound {
                node.failures = 0;
                node.last_error = None;
            }
            let new_children = children.iter().map(|c| c.key.clone()).collect();
            std::mem::replace(&mut node.derived, new_children)
        };
        if northbound {
            self.retries.lock().cancel(key);
        }
        graph.set_dependencies(key, dependencies);
        staging.touch(key);

        for old in old_children {
            if !children.iter().any(|c| c.key == old) {
                self.clear_desired(graph, &old, northbound, staging);
            }
        }
        for child in children {
            self.apply_desired(
                graph,
                &child.key,
                child.value,
                &child.descriptor,
                child.dependencies,
                Some(key),
                child.children,
                northbound,
                staging,
            );
        }
    }

    /// Drop the desired value of a key and, recursively, of its derived values.
    fn clear_desired(&self, graph: &mut Graph, key: &str, northbound: bool, staging: &mut Staging) {
        let children = match graph.get_mut(key) {
            Some(node) => {
                node.desired = None;
                node.state = NodeState::Planned;
                if northbound {
                    node.failures = 0;
                    node.last_error = None;
                }
                std::mem::take(&mut node.derived)
            }
            None => return,
        };
        if northbound {
            self.retries.lock().cancel(key);
        }
        staging.touch(key);
        for child in children {
            self.clear_desired(graph, &child, northbound, staging);
        }
    }

    fn run_op(&self, seq: u64, op: &PlannedOp) -> Option<ExecutedOp> {
        let (descriptor, call) = {
            let mut graph = self.graph.write();
            match self.prepare(&graph, op) {
                Prepared::Skip => return None,
                Prepared::Blocked(blocker) => {
                    if let Some(node) = graph.get_mut(&op.key) {
                        match blocker {
                            Blocker::Failed(dependency) => {
                                tracing::error!(
                                    seq,
                                    key = %op.key,
                                    dependency = %dependency,
                                    "dependency failed, skipping"
                                );
                                node.mark_failed(SchedulerError::DependencyFailed {
                                    key: op.key.clone(),
                                    dependency,
                                });
                            }
                            Blocker::Pending => node.state = NodeState::Pending,
                        }
                    }
                    return None;
                }
                Prepared::Dispatch(descriptor, call) => {
                    if let Some(node) = graph.get_mut(&op.key) {
                        node.state = NodeState::InFlight;
                    }
                    (descriptor, call)
                }
            }
        };

        let name = descriptor.name().to_string();
        tracing::debug!(
            seq,
            key = %op.key,
            descriptor = %name,
            op = %op.op,
            reason = ?op.reason,
            "dispatching operation"
        );
        let started = Instant::now();
        let result = match &call {
            Call::Add(value) => descriptor.add(&op.key, value),
            Call::Update(old, new, metadata) => {
                descriptor.update(&op.key, old, new, metadata.as_ref())
            }
            Call::Delete(value, metadata) => descriptor
                .delete(&op.key, value, metadata.as_ref())
                .map(|()| None),
        };
        let elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        self.metrics.record_op(&name, &op.op.to_string(), elapsed_ms);

        let result = match (result, self.config.policy(&name).op_timeout_ms) {
            (Err(err), Some(limit))
                if elapsed_ms > limit && !matches!(err, DescriptorError::Timeout { .. }) =>
            {
                Err(DescriptorError::timeout(elapsed_ms, err.to_string()))
            }
            (Ok(metadata), Some(limit)) if elapsed_ms > limit => {
                tracing::warn!(
                    key = %op.key,
                    descriptor = %name,
                    elapsed_ms,
                    limit_ms = limit,
                    "slow operation succeeded"
                );
                Ok(metadata)
            }
            (result, _) => result,
        };

        let mut graph = self.graph.write();
        let error = self.record(&mut graph, seq, op, call, descriptor.as_ref(), result);
        Some(ExecutedOp {
            key: op.key.clone(),
            descriptor: name,
            op: op.op,
            reason: op.reason,
            elapsed_ms,
            error,
        })
    }

    fn prepare(&self, graph: &Graph, op: &PlannedOp) -> Prepared {
        let Some(node) = graph.get(&op.key) else {
            return Prepared::Skip;
        };
        let call = match op.op {
            OpKind::Add | OpKind::Update => {
                let Some(desired) = node.desired.clone() else {
                    return Prepared::Skip;
                };
                // The delete half of a re-creation failed.
                if op.op == OpKind::Add && node.applied.is_some() {
                    return Prepared::Skip;
                }
                if let Some(blocker) = blocker(graph, node) {
                    return Prepared::Blocked(blocker);
                }
                match (op.op, node.applied.clone()) {
                    (OpKind::Update, Some(applied)) => {
                        Call::Update(applied, desired, node.metadata.clone())
                    }
                    (OpKind::Update, None) => return Prepared::Skip,
                    _ => Call::Add(desired),
                }
            }
            OpKind::Delete => {
                let Some(applied) = node.applied.clone() else {
                    return Prepared::Skip;
                };
                if let Some(blocker) = delete_blocker(graph, node) {
                    return Prepared::Blocked(blocker);
                }
                Call::Delete(applied, node.metadata.clone())
            }
        };
        match self.registry.get(&node.descriptor) {
            Some(descriptor) => Prepared::Dispatch(Arc::clone(descriptor), call),
            None => Prepared::Skip,
        }
    }

    fn record(
        &self,
        graph: &mut Graph,
        seq: u64,
        op: &PlannedOp,
        call: Call,
        descriptor: &dyn Descriptor,
        result: Result<Option<Metadata>, DescriptorError>,
    ) -> Option<SchedulerError> {
        let Some(node) = graph.get_mut(&op.key) else {
            return None;
        };
        let err = match result {
            Ok(metadata) => {
                match call {
                    Call::Add(value) | Call::Update(_, value, _) => {
                        node.mark_applied(value, metadata)
                    }
                    Call::Delete(..) => node.mark_removed(),
                }
                self.retries.lock().cancel(&op.key);
                tracing::debug!(seq, key = %op.key, op = %op.op, "operation succeeded");
                return None;
            }
            Err(err) => err,
        };

        let retriable = descriptor.is_retriable_failure(&err);
        node.failures = node.failures.saturating_add(1);
        let failures = node.failures;
        let error = match self.retry_policy.decide(failures, retriable) {
            RetryDecision::Retry { delay } => {
                let error = SchedulerError::from_operation(&op.key, op.op, err, true);
                let deadline = self.clock.now().add_duration(delay);
                node.state = NodeState::PendingRetry;
                node.last_error = Some(error.clone());
                self.retries.lock().schedule(RetryEntry {
                    key: op.key.clone(),
                    op: op.op,
                    attempt: failures,
                    deadline,
                });
                tracing::warn!(
                    seq,
                    key = %op.key,
                    op = %op.op,
                    attempt = failures,
                    retry_at = %deadline,
                    error = %error,
                    "operation failed, retry scheduled"
                );
                error
            }
            RetryDecision::Exhausted => {
                let error = SchedulerError::MaxRetriesExceeded {
                    key: op.key.clone(),
                    attempts: failures,
                    last_error: err,
                };
                node.mark_failed(error.clone());
                self.retries.lock().cancel(&op.key);
                self.metrics.record_retry_exhausted();
                tracing::error!(seq, key = %op.key, op = %op.op, error = %error, "giving up");
                error
            }
            RetryDecision::Terminal => {
                let error = SchedulerError::from_operation(&op.key, op.op, err, false);
                node.mark_failed(error.clone());
                self.retries.lock().cancel(&op.key);
                tracing::error!(
                    seq,
                    key = %op.key,
                    op = %op.op,
                    error = %error,
                    "operation failed"
                );
                error
            }
        };
        self.metrics
            .record_op_failure(&node.descriptor, error.kind().as_str());
        Some(error)
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        seq: u64,
        kind: TxnKind,
        description: Option<String>,
        staging: Staging,
        affected: Vec<Key>,
        executed: Vec<ExecutedOp>,
        started_at: Tick,
        started: Instant,
    ) -> TxnReport {
        let now = self.clock.now();
        let (keys, side_effects) = {
            let mut graph = self.graph.write();
            let retries = self.retries.lock();
            let mut keys = Vec::with_capacity(staging.submitted.len());
            for key in staging.submitted {
                let status = match staging.rejected.get(&key) {
                    Some(err) => KeyStatus::Failed(err.clone()),
                    None => settle(&mut graph, &retries, &key, now),
                };
                keys.push(KeyReport { key, status });
            }
            let side_effects: Vec<KeyReport> = affected
                .into_iter()
                .map(|key| {
                    let status = settle(&mut graph, &retries, &key, now);
                    KeyReport { key, status }
                })
                .collect();
            self.metrics.set_graph_nodes(graph.len());
            self.metrics.set_retry_queue_depth(retries.len());
            (keys, side_effects)
        };

        let state = if keys
            .iter()
            .chain(side_effects.iter())
            .all(|r| r.status.is_committed())
        {
            TxnState::Committed
        } else {
            TxnState::PartiallyFailed
        };
        let duration_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        match state {
            TxnState::Committed => self.metrics.record_txn_committed(duration_ms),
            _ => self.metrics.record_txn_partially_failed(duration_ms),
        }

        let report = TxnReport {
            seq,
            kind,
            state,
            description,
            keys,
            side_effects,
            executed,
            started_at,
            finished_at: now,
        };
        tracing::info!(
            seq,
            kind = %kind,
            state = %state,
            keys = report.keys.len(),
            ops = report.executed.len(),
            failed = report.failed_keys().len(),
            pending = report.pending_keys().len(),
            "transaction finished"
        );
        self.history.lock().record(report.clone());
        report
    }

    fn cancelled_report(&self, seq: u64, txn: &Transaction) -> TxnReport {
        let now = self.clock.now();
        let keys = dedup(txn.changes.clone())
            .into_iter()
            .map(|(key, _)| KeyReport {
                key,
                status: KeyStatus::Cancelled,
            })
            .collect();
        self.metrics.record_txn_cancelled();
        tracing::info!(seq, "transaction cancelled before start");
        let report = TxnReport {
            seq,
            kind: txn.kind,
            state: TxnState::Cancelled,
            description: txn.description.clone(),
            keys,
            side_effects: Vec::new(),
            executed: Vec::new(),
            started_at: now,
            finished_at: now,
        };
        self.history.lock().record(report.clone());
        report
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("nodes", &self.graph.read().len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Collapse repeated keys: the last change wins, at the first position.
fn dedup(changes: Vec<(Key, Change)>) -> Vec<(Key, Change)> {
    let mut index: HashMap<Key, usize> = HashMap::new();
    let mut out: Vec<(Key, Change)> = Vec::with_capacity(changes.len());
    for (key, change) in changes {
        match index.get(&key) {
            Some(&i) => out[i].1 = change,
            None => {
                index.insert(key.clone(), out.len());
                out.push((key, change));
            }
        }
    }
    out
}

/// Add deletes for northbound values missing from a resync.
fn extend_resync(graph: &Graph, changes: &mut Vec<(Key, Change)>) {
    let requested: HashSet<&str> = changes.iter().map(|(k, _)| k.as_str()).collect();
    let stale: Vec<Key> = graph
        .nodes()
        .into_iter()
        .filter(|n| {
            n.origin == Origin::FromNorthbound
                && !n.is_derived()
                && n.desired.is_some()
                && !requested.contains(n.key.as_str())
        })
        .map(|n| n.key.clone())
        .collect();
    changes.extend(stale.into_iter().map(|key| (key, Change::Delete)));
}

fn blocker(graph: &Graph, node: &Node) -> Option<Blocker> {
    let mut pending = false;
    for dep in &node.dependencies {
        match graph.get(&dep.key) {
            Some(d) if d.satisfies_dependents() => {}
            Some(d) if d.state.is_failed() => return Some(Blocker::Failed(dep.key.clone())),
            _ => pending = true,
        }
    }
    pending.then_some(Blocker::Pending)
}

/// A value must stay in the dataplane while a dependent whose delete did
/// not go through is still there.
fn delete_blocker(graph: &Graph, node: &Node) -> Option<Blocker> {
    let mut pending = false;
    for dependent in graph.dependents_of(&node.key) {
        let Some(d) = graph.get(dependent) else {
            continue;
        };
        if d.applied.is_none() {
            continue;
        }
        match d.state {
            NodeState::Failed(_) => return Some(Blocker::Failed(d.key.clone())),
            NodeState::PendingRetry | NodeState::Pending => pending = true,
            _ => {}
        }
    }
    pending.then_some(Blocker::Pending)
}

/// Resolve the final state of a key after execution and report it.
fn settle(graph: &mut Graph, retries: &RetryQueue, key: &str, now: Tick) -> KeyStatus {
    let resolution = {
        let Some(node) = graph.get(key) else {
            return KeyStatus::Committed;
        };
        match node.state {
            NodeState::Applied => Resolution::Done(KeyStatus::Committed),
            NodeState::PendingRetry => Resolution::Done(KeyStatus::PendingRetry {
                attempt: node.failures,
                retry_at: retries.get(key).map_or(now, |e| e.deadline),
            }),
            NodeState::Failed(_) => Resolution::Done(
                node.last_error
                    .clone()
                    .map_or(KeyStatus::PendingDependency, KeyStatus::Failed),
            ),
            NodeState::Planned | NodeState::InFlight | NodeState::Pending => {
                if node.is_vacant() {
                    Resolution::Remove
                } else if node.desired.is_none() {
                    if node.origin == Origin::FromSouthbound {
                        Resolution::Set(NodeState::Applied, KeyStatus::Committed)
                    } else {
                        Resolution::Set(NodeState::Pending, KeyStatus::PendingDependency)
                    }
                } else if node.applied.is_some() && node.state != NodeState::Pending {
                    Resolution::Set(NodeState::Applied, KeyStatus::Committed)
                } else {
                    match blocker(graph, node) {
                        Some(Blocker::Failed(dependency)) => {
                            Resolution::Fail(SchedulerError::DependencyFailed {
                                key: key.to_string(),
                                dependency,
                            })
                        }
                        _ => Resolution::Set(NodeState::Pending, KeyStatus::PendingDependency),
                    }
                }
            }
        }
    };

    match resolution {
        Resolution::Done(status) => status,
        Resolution::Remove => {
            graph.remove_node(key);
            KeyStatus::Committed
        }
        Resolution::Set(state, status) => {
            if let Some(node) = graph.get_mut(key) {
                node.state = state;
            }
            status
        }
        Resolution::Fail(err) => {
            if let Some(node) = graph.get_mut(key) {
                node.mark_failed(err.clone());
            }
            KeyStatus::Failed(err)
        }
    }
}

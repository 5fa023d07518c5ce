//! Dump/refresh coordinator.
//!
//! A refresh reads back every descriptor's view of the dataplane, correlates
//! it with the graph and feeds the corrections through the regular engine as
//! one `Refresh` transaction. Dumps run concurrently; correlation and the
//! corrective transaction run under the writer role.

use super::engine::Scheduler;
use super::txn::{Change, Transaction, TxnKind, TxnReport};
use crate::core::error::DescriptorError;
use crate::descriptor::{Descriptor, Key, KvWithMetadata, Origin};
use crate::graph::{Graph, NodeState};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Class of a detected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriftKind {
    /// Desired and believed applied, but absent from the dataplane.
    Missing,
    /// Present in the dataplane without being desired.
    Unexpected,
    /// Present, but not equivalent to what the engine believes or wants.
    Modified,
    /// Desired and not yet applied, but already present and equivalent.
    Adopted,
    /// Present without being desired, kept by descriptor policy.
    Preserved,
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Unexpected => write!(f, "unexpected"),
            Self::Modified => write!(f, "modified"),
            Self::Adopted => write!(f, "adopted"),
            Self::Preserved => write!(f, "preserved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub key: Key,
    pub descriptor: String,
    pub kind: DriftKind,
}

/// Result of one refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub drifts: Vec<Drift>,
    /// Descriptors whose dump failed; their items were left untouched.
    pub failed_dumps: Vec<(String, DescriptorError)>,
    /// Corrective transaction, if any drift needed one.
    pub txn: Option<TxnReport>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty() && self.failed_dumps.is_empty()
    }

    pub fn drift(&self, key: &str) -> Option<DriftKind> {
        self.drifts.iter().find(|d| d.key == key).map(|d| d.kind)
    }
}

#[derive(Default)]
struct Correlation {
    drifts: Vec<Drift>,
    changes: Vec<(Key, Change)>,
    queued: HashSet<Key>,
}

impl Correlation {
    fn drift(&mut self, key: &str, descriptor: &str, kind: DriftKind) {
        tracing::debug!(key = %key, descriptor = %descriptor, drift = %kind, "drift detected");
        self.drifts.push(Drift {
            key: key.to_string(),
            descriptor: descriptor.to_string(),
            kind,
        });
    }

    fn reconcile(&mut self, key: &str) {
        if self.queued.insert(key.to_string()) {
            self.changes.push((key.to_string(), Change::Reconcile));
        }
    }
}

impl Scheduler {
    /// Dump every descriptor, correlate with the graph and correct drift.
    pub fn refresh(&self) -> RefreshReport {
        let _gate = self.gate.lock();
        let started = Instant::now();
        let descriptors: Vec<Arc<dyn Descriptor>> = self.registry.descriptors().to_vec();

        let correlate: Vec<Vec<KvWithMetadata>> = {
            let graph = self.graph.read();
            descriptors
                .iter()
                .map(|d| believed_applied(&graph, d.name()))
                .collect()
        };

        let dumps: Vec<Result<Vec<KvWithMetadata>, DescriptorError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = descriptors
                .iter()
                .zip(correlate.iter())
                .map(|(descriptor, items)| scope.spawn(move || descriptor.dump(items)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(DescriptorError::dataplane(-1, "dump panicked")))
                })
                .collect()
        });

        let mut failed_dumps = Vec::new();
        let mut correlation = Correlation::default();
        {
            let mut graph = self.graph.write();
            for (descriptor, dump) in descriptors.iter().zip(dumps) {
                match dump {
                    Ok(observed) => {
                        self.correlate(&mut graph, descriptor.as_ref(), observed, &mut correlation)
                    }
                    Err(err) => {
                        tracing::warn!(
                            descriptor = %descriptor.name(),
                            error = %err,
                            "dump failed, skipping descriptor"
                        );
                        failed_dumps.push((descriptor.name().to_string(), err));
                    }
                }
            }
        }

        let Correlation {
            drifts, changes, ..
        } = correlation;
        let txn = if changes.is_empty() {
            None
        } else {
            let seq = self.next_seq();
            Some(self.execute(seq, Transaction::internal(TxnKind::Refresh, changes)))
        };

        self.metrics.record_refresh(drifts.len(), failed_dumps.len());
        tracing::info!(
            descriptors = descriptors.len(),
            drifts = drifts.len(),
            failed_dumps = failed_dumps.len(),
            corrected = txn.as_ref().map_or(0, |t| t.executed.len()),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refresh finished"
        );
        RefreshReport {
            drifts,
            failed_dumps,
            txn,
        }
    }

    fn correlate(
        &self,
        graph: &mut Graph,
        descriptor: &dyn Descriptor,
        observed: Vec<KvWithMetadata>,
        out: &mut Correlation,
    ) {
        let name = descriptor.name();
        let preserve = self.config.policy(name).preserve_external;
        let mut observed: BTreeMap<Key, KvWithMetadata> = observed
            .into_iter()
            .filter(|kv| descriptor.is_descriptor_key(&kv.key))
            .map(|kv| (kv.key.clone(), kv))
            .collect();

        let known: Vec<Key> = graph
            .nodes_by_descriptor(name)
            .into_iter()
            .map(|n| n.key.clone())
            .collect();
        for key in known {
            let seen = observed.remove(&key);
            let Some(node) = graph.get_mut(&key) else {
                continue;
            };
            match seen {
                Some(kv) => match (node.desired.clone(), node.applied.clone()) {
                    (Some(_), Some(applied)) => {
                        if !descriptor.equivalent_values(&key, &applied, &kv.value) {
                            node.applied = Some(kv.value);
                            out.drift(&key, name, DriftKind::Modified);
                            out.reconcile(&key);
                        }
                    }
                    (Some(desired), None) => {
                        if descriptor.equivalent_values(&key, &desired, &kv.value) {
                            node.mark_applied(kv.value, kv.metadata);
                            self.retries.lock().cancel(&key);
                            out.drift(&key, name, DriftKind::Adopted);
                            self.unblock_dependents(graph, &key, out);
                        } else {
                            node.applied = Some(kv.value);
                            node.metadata = kv.metadata;
                            out.drift(&key, name, DriftKind::Modified);
                            out.reconcile(&key);
                        }
                    }
                    (None, _) => {
                        node.applied = Some(kv.value);
                        if kv.metadata.is_some() {
                            node.metadata = kv.metadata;
                        }
                        if !(preserve && node.origin == Origin::FromSouthbound) {
                            out.drift(&key, name, DriftKind::Unexpected);
                            out.reconcile(&key);
                        }
                    }
                },
                None => {
                    if node.applied.is_none() {
                        continue;
                    }
                    node.applied = None;
                    node.metadata = None;
                    if node.desired.is_some() {
                        out.drift(&key, name, DriftKind::Missing);
                    }
                    out.reconcile(&key);
                }
            }
        }

        // Unknown items keep the origin the descriptor reports. Only items
        // created outside the engine fall under the preserve policy.
        for (key, kv) in observed {
            let node = graph.entry(&key, name);
            node.origin = kv.origin;
            node.applied = Some(kv.value);
            node.metadata = kv.metadata;
            node.state = NodeState::Applied;
            if preserve && kv.origin == Origin::FromSouthbound {
                out.drift(&key, name, DriftKind::Preserved);
                self.unblock_dependents(graph, &key, out);
            } else {
                out.drift(&key, name, DriftKind::Unexpected);
                out.reconcile(&key);
            }
        }
    }

    /// Re-evaluate values that were waiting for `key`.
    fn unblock_dependents(&self, graph: &Graph, key: &str, out: &mut Correlation) {
        for dependent in graph.dependents_of(key) {
            let waiting = graph.get(dependent).map_or(false, |n| {
                n.desired.is_some() && n.applied.is_none() && n.state == NodeState::Pending
            });
            if waiting {
                out.reconcile(dependent);
            }
        }
    }
}

/// Items of a descriptor the engine believes to be in the dataplane.
fn believed_applied(graph: &Graph, descriptor: &str) -> Vec<KvWithMetadata> {
    graph
        .nodes_by_descriptor(descriptor)
        .into_iter()
        .filter_map(|n| {
            n.applied.clone().map(|value| KvWithMetadata {
                key: n.key.clone(),
                value,
                metadata: n.metadata.clone(),
                origin: n.origin,
            })
        })
        .collect()
}

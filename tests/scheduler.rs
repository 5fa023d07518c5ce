//! Transaction engine tests.

mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use trellis::core::config::DescriptorPolicy;
use trellis::core::error::{DescriptorError, ErrorKind};
use trellis::core::time::Tick;
use trellis::descriptor::{DescriptorRegistry, KvDescriptor, TypedKv};
use trellis::graph::{NodeState, OpKind};
use trellis::ops::observability::metrics;
use trellis::scheduler::{KeyStatus, Scheduler, Transaction, TxnKind, TxnState};

fn kind_of(status: Option<&KeyStatus>) -> Option<ErrorKind> {
    status.and_then(|s| s.error()).map(|e| e.kind())
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn dependencies_are_added_first() {
    let h = Harness::new();
    let txn = Transaction::new()
        .set(route("r1"), Item::new("r1").needs(iface("eth0")).value())
        .set(iface("eth0"), Item::new("eth0").value());

    let report = h.scheduler.commit(txn).unwrap();
    assert_eq!(report.state, TxnState::Committed);
    assert_eq!(report.committed_keys(), vec![route("r1"), iface("eth0")]);

    let iface_add = h.dataplane.position("add", &iface("eth0")).unwrap();
    let route_add = h.dataplane.position("add", &route("r1")).unwrap();
    assert!(iface_add < route_add);
}

#[test]
fn dependents_are_deleted_first() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("eth0"), Item::new("eth0").value())
                .set(route("r1"), Item::new("r1").needs(iface("eth0")).value()),
        )
        .unwrap();
    h.dataplane.clear_calls();

    let report = h
        .scheduler
        .commit(Transaction::new().delete(iface("eth0")).delete(route("r1")))
        .unwrap();
    assert!(report.is_committed());
    let route_delete = h.dataplane.position("delete", &route("r1")).unwrap();
    let iface_delete = h.dataplane.position("delete", &iface("eth0")).unwrap();
    assert!(route_delete < iface_delete);
    assert!(h.dataplane.keys().is_empty());
    assert!(h.scheduler.nodes().is_empty());
}

#[test]
fn deleting_a_dependency_returns_dependents_to_pending() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("eth0"), Item::new("eth0").value())
                .set(route("r1"), Item::new("r1").needs(iface("eth0")).value()),
        )
        .unwrap();

    let report = h.scheduler.commit(Transaction::new().delete(iface("eth0"))).unwrap();
    assert_eq!(report.state, TxnState::PartiallyFailed);
    assert_eq!(report.status(&iface("eth0")), Some(&KeyStatus::Committed));
    assert_eq!(report.status(&route("r1")), Some(&KeyStatus::PendingDependency));
    assert_eq!(h.scheduler.state(&route("r1")), Some(NodeState::Pending));
    assert!(h.dataplane.item(&route("r1")).is_none());

    // Re-creating the dependency brings the route back.
    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("eth0").value()))
        .unwrap();
    assert!(report.is_committed());
    assert_eq!(report.status(&route("r1")), Some(&KeyStatus::Committed));
    assert!(h.dataplane.item(&route("r1")).is_some());
}

// ============================================================================
// Updates and equivalence
// ============================================================================

#[test]
fn repeated_commit_is_a_no_op() {
    let h = Harness::new();
    let txn = Transaction::new().set(iface("eth0"), Item::new("eth0").value());
    h.scheduler.commit(txn.clone()).unwrap();
    h.dataplane.clear_calls();

    let report = h.scheduler.commit(txn).unwrap();
    assert!(report.is_committed());
    assert!(report.executed.is_empty());
    assert!(h.dataplane.calls().is_empty());
}

#[test]
fn equivalent_value_issues_no_operation() {
    let h = Harness::new();
    h.scheduler
        .commit(Transaction::new().set(route("r1"), Item::new("r1").value()))
        .unwrap();
    h.dataplane.clear_calls();

    let report = h
        .scheduler
        .commit(Transaction::new().set(route("r1"), Item::new("r1").noted("cosmetic").value()))
        .unwrap();
    assert!(report.is_committed());
    assert!(h.dataplane.calls().is_empty());
}

#[test]
fn changed_value_is_updated_in_place() {
    let h = Harness::new();
    h.scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("v1").value()))
        .unwrap();
    let index = h.scheduler.metadata(&iface("eth0")).unwrap();

    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("v2").value()))
        .unwrap();
    assert_eq!(report.ops_for(&iface("eth0")), vec![OpKind::Update]);
    assert_eq!(h.dataplane.item(&iface("eth0")).unwrap().data, "v2");
    // Update keeps the metadata returned by the descriptor.
    assert_eq!(
        h.scheduler.metadata(&iface("eth0")).unwrap().downcast_ref::<u32>(),
        index.downcast_ref::<u32>()
    );
}

#[test]
fn changed_value_without_update_is_recreated() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(route("r1"), Item::new("v1").value())
                .set(route("r2"), Item::new("r2").needs(route("r1")).value()),
        )
        .unwrap();
    h.dataplane.clear_calls();

    let report = h
        .scheduler
        .commit(Transaction::new().set(route("r1"), Item::new("v2").value()))
        .unwrap();
    assert!(report.is_committed());
    assert_eq!(report.ops_for(&route("r1")), vec![OpKind::Delete, OpKind::Add]);
    // The dependent is taken down and brought back around the re-creation.
    assert_eq!(h.dataplane.ops_for(&route("r2")), vec!["delete", "add"]);
    assert!(
        h.dataplane.position("delete", &route("r2")) < h.dataplane.position("delete", &route("r1"))
    );
    assert!(h.dataplane.position("add", &route("r1")) < h.dataplane.position("add", &route("r2")));
    assert_eq!(report.status(&route("r2")), Some(&KeyStatus::Committed));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn partial_failure_is_isolated() {
    let h = Harness::new();
    h.dataplane.fail(&iface("z"), DescriptorError::invalid("rejected by dataplane"), 1);
    let txn = Transaction::new()
        .set(iface("x"), Item::new("x").value())
        .set(route("y"), Item::new("y").needs(iface("z")).value())
        .set(iface("z"), Item::new("z").value());

    let report = h.scheduler.commit(txn).unwrap();
    assert_eq!(report.state, TxnState::PartiallyFailed);
    assert_eq!(report.keys.len(), 3);
    assert_eq!(report.status(&iface("x")), Some(&KeyStatus::Committed));
    assert_eq!(
        kind_of(report.status(&iface("z"))),
        Some(ErrorKind::OperationFailedTerminal)
    );
    assert_eq!(kind_of(report.status(&route("y"))), Some(ErrorKind::DependencyFailed));
    assert_eq!(report.failed_keys(), vec![route("y"), iface("z")]);
    assert!(h.dataplane.ops_for(&route("y")).is_empty());
    assert!(h.scheduler.retry_queue_len() == 0);
}

#[test]
fn failed_dependent_delete_keeps_its_dependency() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("b"), Item::new("b").value())
                .set(route("a"), Item::new("a").needs(iface("b")).value()),
        )
        .unwrap();
    h.dataplane.fail(&route("a"), DescriptorError::invalid("in use"), 1);
    h.dataplane.clear_calls();

    let report = h.scheduler.commit(Transaction::new().delete(iface("b"))).unwrap();
    assert_eq!(report.state, TxnState::PartiallyFailed);
    assert_eq!(kind_of(report.status(&iface("b"))), Some(ErrorKind::DependencyFailed));
    assert_eq!(
        kind_of(report.status(&route("a"))),
        Some(ErrorKind::OperationFailedTerminal)
    );
    assert_eq!(h.dataplane.ops_for(&route("a")), vec!["delete"]);
    assert!(h.dataplane.ops_for(&iface("b")).is_empty());
    assert_eq!(h.dataplane.keys(), vec![iface("b"), route("a")]);
    assert_eq!(
        h.scheduler.state(&iface("b")),
        Some(NodeState::Failed(ErrorKind::DependencyFailed))
    );
}

#[test]
fn held_delete_resumes_after_dependent_retry() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("b"), Item::new("b").value())
                .set(route("a"), Item::new("a").needs(iface("b")).value()),
        )
        .unwrap();
    h.dataplane.fail(&route("a"), DescriptorError::dataplane(-1, "busy"), 1);
    h.dataplane.clear_calls();

    let report = h.scheduler.commit(Transaction::new().delete(iface("b"))).unwrap();
    assert_eq!(report.status(&iface("b")), Some(&KeyStatus::PendingDependency));
    assert!(report.status(&route("a")).unwrap().is_pending());
    assert_eq!(h.scheduler.state(&iface("b")), Some(NodeState::Pending));
    assert!(h.dataplane.item(&iface("b")).is_some());

    h.clock.advance(100);
    let reports = h.scheduler.process_retries();
    assert_eq!(reports.len(), 1);
    assert_eq!(h.dataplane.ops_for(&route("a")), vec!["delete", "delete"]);
    assert_eq!(h.dataplane.ops_for(&iface("b")), vec!["delete"]);
    assert!(
        h.dataplane.position("delete", &route("a")) < h.dataplane.position("delete", &iface("b"))
    );
    assert!(h.dataplane.keys().is_empty());
    assert_eq!(reports[0].status(&route("a")), Some(&KeyStatus::PendingDependency));
    assert!(h.scheduler.node(&iface("b")).is_none());
}

#[test]
fn held_recreate_resumes_after_dependent_retry() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(route("b"), Item::new("v1").value())
                .set(route("a"), Item::new("a").needs(route("b")).value()),
        )
        .unwrap();
    h.dataplane.fail(&route("a"), DescriptorError::dataplane(-1, "busy"), 1);

    let report = h
        .scheduler
        .commit(Transaction::new().set(route("b"), Item::new("v2").value()))
        .unwrap();
    assert_eq!(report.status(&route("b")), Some(&KeyStatus::PendingDependency));
    assert_eq!(h.dataplane.item(&route("b")).unwrap().data, "v1");

    h.clock.advance(100);
    let reports = h.scheduler.process_retries();
    assert!(reports[0].is_committed(), "{}", reports[0]);
    assert_eq!(reports[0].ops_for(&route("b")), vec![OpKind::Delete, OpKind::Add]);
    assert_eq!(h.dataplane.item(&route("b")).unwrap().data, "v2");
    assert!(h.dataplane.item(&route("a")).is_some());
}

#[test]
fn validation_failure_never_reaches_the_dataplane() {
    let h = Harness::new();
    let report = h
        .scheduler
        .commit(
            Transaction::new()
                .set(iface("bad"), Item::new("invalid").value())
                .set(iface("good"), Item::new("good").value()),
        )
        .unwrap();
    assert_eq!(kind_of(report.status(&iface("bad"))), Some(ErrorKind::ValidationFailed));
    assert_eq!(report.status(&iface("good")), Some(&KeyStatus::Committed));
    assert!(h.dataplane.ops_for(&iface("bad")).is_empty());
    assert!(h.scheduler.node(&iface("bad")).is_none());
}

#[test]
fn validation_failure_keeps_applied_value() {
    let h = Harness::new();
    h.scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("v1").value()))
        .unwrap();
    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("invalid").value()))
        .unwrap();
    assert_eq!(kind_of(report.status(&iface("eth0"))), Some(ErrorKind::ValidationFailed));
    assert_eq!(h.dataplane.item(&iface("eth0")).unwrap().data, "v1");
    assert_eq!(h.scheduler.state(&iface("eth0")), Some(NodeState::Applied));
}

#[test]
fn unknown_prefix_is_reported() {
    let h = Harness::new();
    let report = h
        .scheduler
        .commit(Transaction::new().set("nowhere/x", Item::new("x").value()))
        .unwrap();
    assert_eq!(kind_of(report.status("nowhere/x")), Some(ErrorKind::NoDescriptor));
}

#[test]
fn cycle_is_rejected_while_unrelated_keys_commit() {
    let h = Harness::new();
    let txn = Transaction::new()
        .set(route("a"), Item::new("a").needs(route("b")).value())
        .set(route("b"), Item::new("b").needs(route("a")).value())
        .set(iface("c"), Item::new("c").value());

    let report = h.scheduler.commit(txn).unwrap();
    assert_eq!(report.state, TxnState::PartiallyFailed);
    assert_eq!(kind_of(report.status(&route("a"))), Some(ErrorKind::CyclicDependency));
    assert_eq!(kind_of(report.status(&route("b"))), Some(ErrorKind::CyclicDependency));
    assert_eq!(report.status(&iface("c")), Some(&KeyStatus::Committed));
    assert!(h.dataplane.ops_for(&route("a")).is_empty());
    assert!(h.dataplane.ops_for(&route("b")).is_empty());
}

#[test]
fn breaking_a_cycle_applies_its_members() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(route("a"), Item::new("a").needs(route("b")).value())
                .set(route("b"), Item::new("b").needs(route("a")).value()),
        )
        .unwrap();

    let report = h
        .scheduler
        .commit(Transaction::new().set(route("b"), Item::new("b").value()))
        .unwrap();
    assert!(report.is_committed(), "{}", report);
    assert_eq!(report.status(&route("a")), Some(&KeyStatus::Committed));
    assert!(h.dataplane.position("add", &route("b")) < h.dataplane.position("add", &route("a")));
}

#[test]
fn missing_dependency_leaves_value_pending() {
    let h = Harness::new();
    let report = h
        .scheduler
        .commit(Transaction::new().set(route("r1"), Item::new("r1").needs(iface("eth0")).value()))
        .unwrap();
    assert_eq!(report.status(&route("r1")), Some(&KeyStatus::PendingDependency));
    assert_eq!(report.pending_keys(), vec![route("r1")]);
    assert!(h.dataplane.calls().is_empty());

    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("eth0"), Item::new("eth0").value()))
        .unwrap();
    assert!(report.is_committed());
    assert_eq!(report.keys.len(), 1);
    assert_eq!(report.status(&route("r1")), Some(&KeyStatus::Committed));
    assert_eq!(h.dataplane.ops_for(&route("r1")), vec!["add"]);
}

// ============================================================================
// Retries
// ============================================================================

#[test]
fn retry_ceiling_counts_every_attempt() {
    let h = Harness::new();
    let key = iface("flaky");
    h.dataplane.fail(&key, DescriptorError::dataplane(-5, "busy"), 10);

    let report = h
        .scheduler
        .commit(Transaction::new().set(key.clone(), Item::new("flaky").value()))
        .unwrap();
    assert_eq!(
        report.status(&key),
        Some(&KeyStatus::PendingRetry {
            attempt: 1,
            retry_at: Tick::new(100)
        })
    );
    assert_eq!(h.scheduler.state(&key), Some(NodeState::PendingRetry));
    assert_eq!(h.scheduler.next_retry_deadline(), Some(Tick::new(100)));

    // Not yet due.
    assert!(h.scheduler.process_retries().is_empty());

    h.clock.advance(100);
    let reports = h.scheduler.process_retries();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, TxnKind::Retry);
    assert!(matches!(
        reports[0].status(&key),
        Some(KeyStatus::PendingRetry { attempt: 2, .. })
    ));

    h.clock.advance(100);
    let reports = h.scheduler.process_retries();
    assert_eq!(kind_of(reports[0].status(&key)), Some(ErrorKind::MaxRetriesExceeded));
    assert_eq!(h.dataplane.ops_for(&key), vec!["add", "add", "add"]);
    assert_eq!(h.scheduler.retry_queue_len(), 0);
    assert_eq!(
        h.scheduler.state(&key),
        Some(NodeState::Failed(ErrorKind::MaxRetriesExceeded))
    );

    h.clock.advance(1_000);
    assert!(h.scheduler.process_retries().is_empty());
}

#[test]
fn successful_retry_leaves_one_item_and_unblocks_dependents() {
    let h = Harness::new();
    h.dataplane.fail(&iface("eth0"), DescriptorError::dataplane(-1, "busy"), 1);
    let report = h
        .scheduler
        .commit(
            Transaction::new()
                .set(iface("eth0"), Item::new("eth0").value())
                .set(route("r1"), Item::new("r1").needs(iface("eth0")).value()),
        )
        .unwrap();
    assert!(report.status(&iface("eth0")).unwrap().is_pending());
    assert_eq!(report.status(&route("r1")), Some(&KeyStatus::PendingDependency));

    h.clock.advance(100);
    let reports = h.scheduler.process_retries();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_committed(), "{}", reports[0]);
    assert_eq!(reports[0].status(&route("r1")), Some(&KeyStatus::Committed));

    assert_eq!(h.dataplane.ops_for(&iface("eth0")), vec!["add", "add"]);
    assert_eq!(h.dataplane.ops_for(&route("r1")), vec!["add"]);
    assert_eq!(h.dataplane.keys(), vec![iface("eth0"), route("r1")]);
}

#[test]
fn northbound_change_drops_queued_retry() {
    let h = Harness::new();
    let key = iface("flaky");
    h.dataplane.fail(&key, DescriptorError::dataplane(-1, "busy"), 1);
    h.scheduler
        .commit(Transaction::new().set(key.clone(), Item::new("flaky").value()))
        .unwrap();
    assert!(h.scheduler.retry_entry(&key).is_some());

    let report = h.scheduler.commit(Transaction::new().delete(key.clone())).unwrap();
    assert!(report.is_committed());
    assert!(h.scheduler.retry_entry(&key).is_none());
    assert!(h.scheduler.node(&key).is_none());
}

#[test]
fn exponential_backoff_doubles_delay() {
    let mut config = test_config();
    config.exponential_backoff = true;
    config.max_retry_attempts = 4;
    let h = Harness::with_config(config);
    let key = iface("flaky");
    h.dataplane.fail(&key, DescriptorError::dataplane(-1, "busy"), 3);

    h.scheduler
        .commit(Transaction::new().set(key.clone(), Item::new("flaky").value()))
        .unwrap();
    assert_eq!(h.scheduler.retry_entry(&key).unwrap().deadline, Tick::new(100));

    h.clock.advance(100);
    h.scheduler.process_retries();
    assert_eq!(h.scheduler.retry_entry(&key).unwrap().deadline, Tick::new(300));

    h.clock.advance(200);
    h.scheduler.process_retries();
    assert_eq!(h.scheduler.retry_entry(&key).unwrap().deadline, Tick::new(700));

    h.clock.advance(400);
    let reports = h.scheduler.process_retries();
    assert!(reports[0].is_committed());
    assert_eq!(h.dataplane.ops_for(&key).len(), 4);
}

#[test]
fn slow_failure_is_reported_as_timeout() {
    let config = test_config().with_policy(
        "iface",
        DescriptorPolicy {
            preserve_external: false,
            op_timeout_ms: Some(5),
        },
    );
    let h = Harness::with_config(config);
    let key = iface("slow");
    h.dataplane.fail_after(
        &key,
        DescriptorError::dataplane(-1, "no reply"),
        1,
        Some(Duration::from_millis(30)),
    );

    let report = h
        .scheduler
        .commit(Transaction::new().set(key.clone(), Item::new("slow").value()))
        .unwrap();
    assert!(report.status(&key).unwrap().is_pending());
    let node = h.scheduler.node(&key).unwrap();
    assert_eq!(node.last_error.unwrap().kind(), ErrorKind::Timeout);
}

// ============================================================================
// Derived values
// ============================================================================

#[test]
fn derived_values_follow_their_parent() {
    let h = Harness::new();
    let parent = iface("eth0");
    let child = child_of(&parent);

    let report = h
        .scheduler
        .commit(Transaction::new().set(parent.clone(), Item::new("eth0").deriving(1).value()))
        .unwrap();
    assert!(report.is_committed());
    assert_eq!(report.keys.len(), 1);
    assert_eq!(report.status(&child), Some(&KeyStatus::Committed));
    assert!(h.dataplane.position("add", &parent) < h.dataplane.position("add", &child));
    assert_eq!(h.scheduler.node(&child).unwrap().derived_from, Some(parent.clone()));

    let report = h.scheduler.commit(Transaction::new().delete(parent.clone())).unwrap();
    assert!(report.is_committed());
    assert!(h.dataplane.position("delete", &child) < h.dataplane.position("delete", &parent));
    assert!(h.scheduler.node(&child).is_none());
}

#[test]
fn derived_value_cannot_be_changed_directly() {
    let h = Harness::new();
    let parent = iface("eth0");
    h.scheduler
        .commit(Transaction::new().set(parent.clone(), Item::new("eth0").deriving(1).value()))
        .unwrap();

    let report = h
        .scheduler
        .commit(Transaction::new().delete(child_of(&parent)))
        .unwrap();
    assert_eq!(
        kind_of(report.status(&child_of(&parent))),
        Some(ErrorKind::DerivedValueImmutable)
    );
    assert!(h.dataplane.item(&child_of(&parent)).is_some());
}

#[test]
fn derivation_depth_is_bounded() {
    let mut config = test_config();
    config.max_derivation_depth = 2;
    let h = Harness::with_config(config);

    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("ok"), Item::new("ok").deriving(2).value()))
        .unwrap();
    assert!(report.is_committed());
    assert!(h.dataplane.item(&child_of(&child_of(&iface("ok")))).is_some());

    let report = h
        .scheduler
        .commit(Transaction::new().set(iface("deep"), Item::new("deep").deriving(3).value()))
        .unwrap();
    assert_eq!(kind_of(report.status(&iface("deep"))), Some(ErrorKind::DerivationTooDeep));
    assert!(h.dataplane.ops_for(&iface("deep")).is_empty());
    assert!(h.scheduler.node(&iface("deep")).is_none());
}

// ============================================================================
// Queue, resync, queries
// ============================================================================

#[test]
fn cancelled_transaction_is_never_applied() {
    let h = Harness::new();
    let mut first = h
        .scheduler
        .submit(Transaction::new().set(iface("a"), Item::new("a").value()))
        .unwrap();
    let mut second = h
        .scheduler
        .submit(Transaction::new().set(iface("b"), Item::new("b").value()))
        .unwrap();
    assert!(second.cancel());
    assert_eq!(h.scheduler.queue_len(), 2);

    assert_eq!(h.scheduler.drain_queue(), 2);
    assert!(first.try_result().unwrap().is_committed());
    let cancelled = second.try_result().unwrap();
    assert_eq!(cancelled.state, TxnState::Cancelled);
    assert_eq!(cancelled.status(&iface("b")), Some(&KeyStatus::Cancelled));
    assert!(h.dataplane.ops_for(&iface("b")).is_empty());
    assert!(!second.cancel());
}

#[test]
fn closed_queue_rejects_submissions() {
    let h = Harness::new();
    h.scheduler.close();
    let err = h
        .scheduler
        .commit(Transaction::new().set(iface("a"), Item::new("a").value()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueClosed);
}

#[test]
fn resync_replaces_northbound_state() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("a"), Item::new("a").value())
                .set(iface("b"), Item::new("b").value()),
        )
        .unwrap();

    let report = h
        .scheduler
        .commit(Transaction::resync(vec![
            (iface("a"), Item::new("a").value()),
            (iface("c"), Item::new("c").value()),
        ]))
        .unwrap();
    assert_eq!(report.kind, TxnKind::Resync);
    assert!(report.is_committed());
    assert_eq!(report.keys.len(), 3);
    assert_eq!(h.dataplane.keys(), vec![iface("a"), iface("c")]);
    assert!(h.dataplane.ops_for(&iface("a")) == vec!["add"]);
}

#[test]
fn repeated_key_uses_last_change() {
    let h = Harness::new();
    let report = h
        .scheduler
        .commit(
            Transaction::new()
                .set(iface("a"), Item::new("first").value())
                .set(iface("a"), Item::new("second").value()),
        )
        .unwrap();
    assert_eq!(report.keys.len(), 1);
    assert_eq!(h.dataplane.item(&iface("a")).unwrap().data, "second");
}

#[test]
fn metadata_map_lists_applied_items() {
    let h = Harness::new();
    h.scheduler
        .commit(
            Transaction::new()
                .set(iface("a"), Item::new("a").value())
                .set(iface("b"), Item::new("b").value())
                .set(route("r"), Item::new("r").value()),
        )
        .unwrap();

    let map = h.scheduler.metadata_map("iface");
    assert_eq!(map.keys().cloned().collect::<Vec<_>>(), vec![iface("a"), iface("b")]);
    assert_eq!(map[&iface("a")].downcast_ref::<u32>(), Some(&1));
    assert_eq!(map[&iface("b")].downcast_ref::<u32>(), Some(&2));
}

#[test]
fn history_records_every_transaction() {
    let h = Harness::new();
    let first = h
        .scheduler
        .commit(
            Transaction::new()
                .set(iface("a"), Item::new("a").value())
                .with_description("initial"),
        )
        .unwrap();
    let second = h.scheduler.commit(Transaction::new().delete(iface("a"))).unwrap();
    assert!(second.seq > first.seq);

    let history = h.scheduler.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].description.as_deref(), Some("initial"));
    assert_eq!(history[1].seq, second.seq);
    assert!(h.scheduler.active_txn().is_none());

    let collected = h.scheduler.metrics();
    assert_eq!(collected.registry().counter_get(metrics::TXN_COMMITTED), 2);
}

// ============================================================================
// Locking
// ============================================================================

/// Reads the engine's view of its own key while the add runs.
struct Introspecting {
    scheduler: Arc<Mutex<Weak<Scheduler>>>,
    seen: Arc<Mutex<Vec<Option<NodeState>>>>,
}

impl KvDescriptor for Introspecting {
    type Value = Item;
    type Metadata = ();

    fn name(&self) -> &str {
        "introspecting"
    }

    fn key_prefix(&self) -> &str {
        "test/introspect/"
    }

    fn equivalent(&self, _key: &str, old: &Item, new: &Item) -> bool {
        old == new
    }

    fn add(&self, key: &str, _item: &Item) -> Result<Option<()>, DescriptorError> {
        if let Some(scheduler) = self.scheduler.lock().upgrade() {
            let state = scheduler.state(key);
            self.seen.lock().push(state);
        }
        Ok(None)
    }

    fn delete(
        &self,
        _key: &str,
        _item: &Item,
        _metadata: Option<&()>,
    ) -> Result<(), DescriptorError> {
        Ok(())
    }

    fn dump(
        &self,
        correlate: &[TypedKv<Item, ()>],
    ) -> Result<Vec<TypedKv<Item, ()>>, DescriptorError> {
        Ok(correlate.to_vec())
    }
}

#[test]
fn descriptor_can_query_the_engine_while_in_flight() {
    let slot = Arc::new(Mutex::new(Weak::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = DescriptorRegistry::new();
    registry
        .register_typed(Introspecting {
            scheduler: Arc::clone(&slot),
            seen: Arc::clone(&seen),
        })
        .unwrap();
    let scheduler = Arc::new(Scheduler::new(registry, test_config()));
    *slot.lock() = Arc::downgrade(&scheduler);

    let key = "test/introspect/a";
    let report = scheduler
        .commit(Transaction::new().set(key, Item::new("a").value()))
        .unwrap();
    assert!(report.is_committed());
    assert_eq!(*seen.lock(), vec![Some(NodeState::InFlight)]);
    assert_eq!(scheduler.state(key), Some(NodeState::Applied));
}

//! Runtime and background worker tests.

use std::sync::Arc;
use std::time::Duration;
use trellis::core::config::Config;
use trellis::core::error::DescriptorError;
use trellis::core::runtime::{ComponentHealth, Runtime};
use trellis::descriptor::{DescriptorRegistry, Value};
use trellis::plugins::{
    register_all, DataplaneOp, Fault, Interface, InterfaceKind, MemoryDataplane, Table,
};
use trellis::scheduler::{DriftKind, KeyStatus, Transaction};

fn runtime(config: Config) -> (Runtime, Arc<MemoryDataplane>) {
    let dataplane = Arc::new(MemoryDataplane::new());
    let mut registry = DescriptorRegistry::new();
    register_all(&mut registry, &dataplane).unwrap();
    (Runtime::new(config, registry).unwrap(), dataplane)
}

fn set_tap(name: &str) -> Transaction {
    let iface = Interface::new(name, InterfaceKind::Tap);
    Transaction::new().set(iface.key(), Value::new(iface))
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn commit_through_running_runtime() {
    let (mut runtime, dataplane) = runtime(Config::default());
    runtime.start().await.unwrap();
    assert!(runtime.is_running());
    assert!(runtime.is_ready());

    let report = runtime.commit(set_tap("tap0")).await.unwrap();
    assert!(report.is_committed());
    assert_eq!(dataplane.interface_names(), vec!["tap0"]);

    runtime.stop().await.unwrap();
    assert!(!runtime.is_running());
    assert_eq!(runtime.health().worker, ComponentHealth::Stopped);
    assert_eq!(runtime.health().scheduler, ComponentHealth::Stopped);
}

#[tokio::test]
async fn commit_requires_running_runtime() {
    let (runtime, dataplane) = runtime(Config::default());
    assert!(runtime.commit(set_tap("tap0")).await.is_err());
    assert!(dataplane.interface_names().is_empty());
}

#[tokio::test]
async fn start_twice_fails() {
    let (mut runtime, _) = runtime(Config::default());
    runtime.start().await.unwrap();
    assert!(runtime.start().await.is_err());
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn queued_before_start_is_applied_on_start() {
    let (mut runtime, dataplane) = runtime(Config::default());
    let ticket = runtime.scheduler().submit(set_tap("tap0")).unwrap();

    runtime.start().await.unwrap();
    let report = ticket.wait().await.unwrap();
    assert!(report.is_committed());
    assert_eq!(dataplane.interface_names(), vec!["tap0"]);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_runtime_rejects_submissions() {
    let (mut runtime, _) = runtime(Config::default());
    runtime.start().await.unwrap();
    runtime.stop().await.unwrap();
    assert!(runtime.scheduler().submit(set_tap("tap0")).is_err());
}

#[tokio::test]
async fn worker_retries_failed_operations() {
    let mut config = Config::default();
    config.scheduler.retry_backoff_ms = 20;
    config.scheduler.exponential_backoff = false;
    config.scheduler.retry_tick_ms = 5;
    let (mut runtime, dataplane) = runtime(config);
    dataplane.inject(
        Fault::new(Table::Interface, DataplaneOp::Add, DescriptorError::dataplane(-1, "busy"))
            .times(1),
    );
    runtime.start().await.unwrap();

    let report = runtime.commit(set_tap("tap0")).await.unwrap();
    assert!(matches!(
        report.status(&Interface::new("tap0", InterfaceKind::Tap).key()),
        Some(KeyStatus::PendingRetry { attempt: 1, .. })
    ));

    assert!(eventually(|| !dataplane.interface_names().is_empty()).await);
    assert_eq!(dataplane.count(Table::Interface, DataplaneOp::Add, Some("tap0")), 2);
    assert_eq!(runtime.scheduler().retry_queue_len(), 0);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn on_demand_refresh_corrects_drift() {
    let (mut runtime, dataplane) = runtime(Config::default());
    runtime.start().await.unwrap();
    dataplane.insert_interface_out_of_band(Interface::new("stray", InterfaceKind::Loopback));

    let report = runtime.refresh().await.unwrap();
    let key = Interface::new("stray", InterfaceKind::Loopback).key();
    assert_eq!(report.drift(&key), Some(DriftKind::Unexpected));
    assert!(dataplane.interface_names().is_empty());
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn periodic_refresh_corrects_drift() {
    let mut config = Config::default();
    config.scheduler.refresh_period_ms = 20;
    let (mut runtime, dataplane) = runtime(config);
    runtime.start().await.unwrap();

    runtime.commit(set_tap("tap0")).await.unwrap();
    assert!(dataplane.remove_out_of_band(Table::Interface, "tap0"));

    assert!(eventually(|| dataplane.interface_names() == vec!["tap0"]).await);
    runtime.stop().await.unwrap();
}

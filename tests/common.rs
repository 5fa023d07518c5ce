//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use trellis::core::config::{DescriptorPolicy, SchedulerConfig};
use trellis::core::error::DescriptorError;
use trellis::core::time::{ManualClock, Tick};
use trellis::descriptor::{
    Dependency, DescriptorRegistry, KeyValuePair, KvDescriptor, Origin, TypedKv, Value,
};
use trellis::scheduler::Scheduler;

/// Prefix of the descriptor that supports in-place updates.
pub const IFACE: &str = "test/iface/";
/// Prefix of the descriptor that only re-creates.
pub const ROUTE: &str = "test/route/";

pub fn iface(name: &str) -> String {
    format!("{}{}", IFACE, name)
}

pub fn route(name: &str) -> String {
    format!("{}{}", ROUTE, name)
}

/// Test item. `note` is ignored by equivalence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub data: String,
    pub note: String,
    pub deps: Vec<String>,
    /// Length of the chain of derived values below this item.
    pub derive: u32,
}

impl Item {
    pub fn new(data: &str) -> Self {
        Self {
            data: data.to_string(),
            note: String::new(),
            deps: Vec::new(),
            derive: 0,
        }
    }

    pub fn needs(mut self, key: impl Into<String>) -> Self {
        self.deps.push(key.into());
        self
    }

    pub fn noted(mut self, note: &str) -> Self {
        self.note = note.to_string();
        self
    }

    pub fn deriving(mut self, depth: u32) -> Self {
        self.derive = depth;
        self
    }

    pub fn value(self) -> Value {
        Value::new(self)
    }
}

/// Key of the value derived from `key`.
pub fn child_of(key: &str) -> String {
    format!("{}/child", key)
}

/// One recorded descriptor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub key: String,
}

#[derive(Debug)]
struct Fault {
    error: DescriptorError,
    remaining: u32,
    delay: Option<Duration>,
}

/// Fake dataplane shared by the test descriptors.
#[derive(Debug, Default)]
pub struct MockDataplane {
    items: Mutex<BTreeMap<String, Item>>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    failing_dumps: Mutex<HashSet<String>>,
    /// Keys the dump reports as engine-created even when unknown.
    leftovers: Mutex<HashSet<String>>,
    next_index: AtomicU32,
}

impl MockDataplane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls for `key` with `error`.
    pub fn fail(&self, key: &str, error: DescriptorError, times: u32) {
        self.fail_after(key, error, times, None);
    }

    /// Like [`fail`](Self::fail), but sleep before failing.
    pub fn fail_after(
        &self,
        key: &str,
        error: DescriptorError,
        times: u32,
        delay: Option<Duration>,
    ) {
        self.faults
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(Fault {
                error,
                remaining: times,
                delay,
            });
    }

    pub fn fail_dump(&self, descriptor: &str) {
        self.failing_dumps.lock().insert(descriptor.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Calls made for one key, in order.
    pub fn ops_for(&self, key: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.key == key)
            .map(|c| c.op)
            .collect()
    }

    /// Index of the first `op` call for `key`.
    pub fn position(&self, op: &str, key: &str) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|c| c.op == op && c.key == key)
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn item(&self, key: &str) -> Option<Item> {
        self.items.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.lock().keys().cloned().collect()
    }

    /// Change the dataplane behind the engine's back.
    pub fn insert_out_of_band(&self, key: &str, item: Item) {
        self.items.lock().insert(key.to_string(), item);
    }

    /// Leave an item behind as if a previous engine run had created it.
    pub fn insert_leftover(&self, key: &str, item: Item) {
        self.leftovers.lock().insert(key.to_string());
        self.insert_out_of_band(key, item);
    }

    pub fn remove_out_of_band(&self, key: &str) -> Option<Item> {
        self.items.lock().remove(key)
    }

    fn call(&self, op: &'static str, key: &str) -> Result<(), DescriptorError> {
        self.calls.lock().push(Call {
            op,
            key: key.to_string(),
        });
        let fault = {
            let mut faults = self.faults.lock();
            let Some(queue) = faults.get_mut(key) else {
                return Ok(());
            };
            let Some(front) = queue.front_mut() else {
                return Ok(());
            };
            front.remaining -= 1;
            let fault = (front.error.clone(), front.delay);
            if front.remaining == 0 {
                queue.pop_front();
            }
            fault
        };
        if let Some(delay) = fault.1 {
            std::thread::sleep(delay);
        }
        Err(fault.0)
    }
}

/// Descriptor over [`MockDataplane`] for items under one prefix.
pub struct MockDescriptor {
    name: &'static str,
    prefix: &'static str,
    updatable: bool,
    dataplane: Arc<MockDataplane>,
}

impl MockDescriptor {
    pub fn new(
        name: &'static str,
        prefix: &'static str,
        updatable: bool,
        dataplane: Arc<MockDataplane>,
    ) -> Self {
        Self {
            name,
            prefix,
            updatable,
            dataplane,
        }
    }
}

impl KvDescriptor for MockDescriptor {
    type Value = Item;
    type Metadata = u32;

    fn name(&self) -> &str {
        self.name
    }

    fn key_prefix(&self) -> &str {
        self.prefix
    }

    fn validate(&self, _key: &str, item: &Item) -> Result<(), DescriptorError> {
        if item.data == "invalid" {
            return Err(DescriptorError::invalid("data must not be \"invalid\""));
        }
        Ok(())
    }

    fn equivalent(&self, _key: &str, old: &Item, new: &Item) -> bool {
        old.data == new.data && old.deps == new.deps && old.derive == new.derive
    }

    fn add(&self, key: &str, item: &Item) -> Result<Option<u32>, DescriptorError> {
        self.dataplane.call("add", key)?;
        self.dataplane.items.lock().insert(key.to_string(), item.clone());
        Ok(Some(self.dataplane.next_index.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn delete(
        &self,
        key: &str,
        _item: &Item,
        _metadata: Option<&u32>,
    ) -> Result<(), DescriptorError> {
        self.dataplane.call("delete", key)?;
        self.dataplane.items.lock().remove(key);
        Ok(())
    }

    fn supports_update(&self) -> bool {
        self.updatable
    }

    fn update(
        &self,
        key: &str,
        _old: &Item,
        new: &Item,
        old_metadata: Option<&u32>,
    ) -> Result<Option<u32>, DescriptorError> {
        self.dataplane.call("update", key)?;
        self.dataplane.items.lock().insert(key.to_string(), new.clone());
        Ok(old_metadata.copied())
    }

    fn dependencies(&self, _key: &str, item: &Item) -> Vec<Dependency> {
        item.deps
            .iter()
            .map(|dep| Dependency::new("needs", dep.clone()))
            .collect()
    }

    fn derived_values(&self, key: &str, item: &Item) -> Vec<KeyValuePair> {
        if item.derive == 0 {
            return Vec::new();
        }
        let child = Item::new(&item.data).deriving(item.derive - 1);
        vec![KeyValuePair::new(child_of(key), Value::new(child))]
    }

    fn dump(
        &self,
        correlate: &[TypedKv<Item, u32>],
    ) -> Result<Vec<TypedKv<Item, u32>>, DescriptorError> {
        if self.dataplane.failing_dumps.lock().contains(self.name) {
            return Err(DescriptorError::dataplane(-1, "dump failed"));
        }
        let items = self.dataplane.items.lock();
        let leftovers = self.dataplane.leftovers.lock();
        Ok(items
            .iter()
            .filter(|(key, _)| key.starts_with(self.prefix))
            .map(|(key, item)| {
                let known = correlate.iter().find(|kv| &kv.key == key);
                TypedKv {
                    key: key.clone(),
                    value: item.clone(),
                    metadata: known.and_then(|kv| kv.metadata),
                    origin: if known.is_some() || leftovers.contains(key) {
                        Origin::FromNorthbound
                    } else {
                        Origin::FromSouthbound
                    },
                }
            })
            .collect())
    }
}

/// Scheduler over the two mock descriptors, driven by a manual clock.
pub struct Harness {
    pub scheduler: Scheduler,
    pub dataplane: Arc<MockDataplane>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let dataplane = MockDataplane::new();
        let clock = Arc::new(ManualClock::new(Tick::zero()));
        let scheduler = Scheduler::with_clock(registry(&dataplane), config, clock.clone());
        Self {
            scheduler,
            dataplane,
            clock,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn registry(dataplane: &Arc<MockDataplane>) -> DescriptorRegistry {
    let mut registry = DescriptorRegistry::new();
    registry
        .register_typed(MockDescriptor::new("iface", IFACE, true, Arc::clone(dataplane)))
        .expect("register iface");
    registry
        .register_typed(MockDescriptor::new("route", ROUTE, false, Arc::clone(dataplane)))
        .expect("register route");
    registry
}

/// Scheduler config with a 100ms linear backoff and three attempts.
pub fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.max_retry_attempts = 3;
    config.retry_backoff = Duration::from_millis(100);
    config.exponential_backoff = false;
    config
}

pub fn preserving(descriptor: &str) -> SchedulerConfig {
    test_config().with_policy(
        descriptor,
        DescriptorPolicy {
            preserve_external: true,
            op_timeout_ms: None,
        },
    )
}

/// Write a config file with the given content.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

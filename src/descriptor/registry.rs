//! Descriptor registry.
//!
//! Built once during initialization, then shared read-only with the
//! scheduler. Lookups test key prefixes in registration order.

use super::contract::Descriptor;
use super::typed::{KvDescriptor, TypedDescriptor};
use crate::core::error::{SchedulerError, SchedulerResult};
use std::sync::Arc;

/// Mapping from key prefix to the descriptor owning it.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: Vec<Arc<dyn Descriptor>>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// Fails with `DuplicateDescriptor` for a repeated name and with
    /// `DuplicatePrefix` when the new prefix overlaps a registered one,
    /// i.e. when either prefix is a prefix of the other.
    pub fn register(&mut self, descriptor: Arc<dyn Descriptor>) -> SchedulerResult<()> {
        let name = descriptor.name();
        let prefix = descriptor.key_prefix();
        for existing in &self.descriptors {
            if existing.name() == name {
                return Err(SchedulerError::DuplicateDescriptor {
                    name: name.to_string(),
                });
            }
            let existing_prefix = existing.key_prefix();
            if prefix.starts_with(existing_prefix) || existing_prefix.starts_with(prefix) {
                return Err(SchedulerError::DuplicatePrefix {
                    descriptor: name.to_string(),
                    prefix: prefix.to_string(),
                    existing: existing.name().to_string(),
                    existing_prefix: existing_prefix.to_string(),
                });
            }
        }
        tracing::debug!(descriptor = %name, prefix = %prefix, "descriptor registered");
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Register a typed descriptor through [`TypedDescriptor`].
    pub fn register_typed<D: KvDescriptor>(&mut self, descriptor: D) -> SchedulerResult<()> {
        self.register(Arc::new(TypedDescriptor::new(descriptor)))
    }

    /// Resolve the descriptor owning a key.
    pub fn lookup(&self, key: &str) -> SchedulerResult<&Arc<dyn Descriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.is_descriptor_key(key))
            .ok_or_else(|| SchedulerError::NoDescriptor {
                key: key.to_string(),
            })
    }

    /// Get a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Descriptor>> {
        self.descriptors.iter().find(|d| d.name() == name)
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> &[Arc<dyn Descriptor>] {
        &self.descriptors
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if no descriptor is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors.iter().map(|d| (d.name(), d.key_prefix())))
            .finish()
    }
}

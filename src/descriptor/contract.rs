//! The descriptor capability set.
//!
//! A descriptor teaches the scheduler how to manage one configuration item
//! type: which keys it owns, how to create, modify and remove items in the
//! dataplane, how to compare values, and how to read back what the dataplane
//! actually contains. The engine only ever talks to descriptors through the
//! object-safe [`Descriptor`] trait and never inspects values itself.

use super::value::{Dependency, Key, KeyValuePair, KvWithMetadata, Metadata, Value};
use crate::core::error::DescriptorError;

/// Handler for exactly one configuration item type.
///
/// Implementations hold only their own southbound handler; all graph state
/// is owned by the scheduler. Every method may be called from the scheduler's
/// worker thread while other threads read the graph, hence `Send + Sync`.
pub trait Descriptor: Send + Sync {
    /// Unique descriptor name.
    fn name(&self) -> &str;

    /// Key prefix selecting the items owned by this descriptor.
    fn key_prefix(&self) -> &str;

    /// Membership test for a key. Defaults to a prefix match.
    fn is_descriptor_key(&self, key: &str) -> bool {
        key.starts_with(self.key_prefix())
    }

    /// Identity part of the key, used in logs.
    fn key_label(&self, key: &str) -> String {
        key.strip_prefix(self.key_prefix())
            .unwrap_or(key)
            .to_string()
    }

    /// Check a value before Add/Update. Failures are never retried.
    fn validate(&self, _key: &str, _value: &Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    /// Semantic equality of two values for the same key.
    fn equivalent_values(&self, key: &str, old: &Value, new: &Value) -> bool;

    /// Create the item in the dataplane.
    fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, DescriptorError>;

    /// Remove the item from the dataplane.
    fn delete(
        &self,
        key: &str,
        value: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError>;

    /// Whether [`Descriptor::update`] is implemented.
    fn supports_update(&self) -> bool {
        false
    }

    /// Modify the item in place.
    fn update(
        &self,
        _key: &str,
        _old: &Value,
        _new: &Value,
        _old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
        })
    }

    /// Whether a change from `old` to `new` must be applied as Delete + Add.
    ///
    /// Descriptors without in-place update always recreate.
    fn recreate_on_update(
        &self,
        _key: &str,
        _old: &Value,
        _new: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        !self.supports_update()
    }

    /// Classify an error returned by any operation of this descriptor.
    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        err.is_retriable_by_default()
    }

    /// Items that must exist before this value can be applied.
    fn dependencies(&self, _key: &str, _value: &Value) -> Vec<Dependency> {
        Vec::new()
    }

    /// Sub-values implied by this value, managed as its dependents.
    fn derived_values(&self, _key: &str, _value: &Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Read back every item this descriptor owns in the dataplane.
    ///
    /// `correlate` holds what the scheduler believes is applied, so that
    /// dataplane-assigned fields can be matched back to requested values.
    fn dump(&self, correlate: &[KvWithMetadata]) -> Result<Vec<KvWithMetadata>, DescriptorError>;
}

impl std::fmt::Debug for dyn Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name())
            .field("key_prefix", &self.key_prefix())
            .finish()
    }
}

/// Key helper shared by descriptors that build keys as `prefix + label`.
pub fn key_from_label(prefix: &str, label: &str) -> Key {
    format!("{}{}", prefix, label)
}

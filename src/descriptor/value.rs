//! Keys, values, metadata and origin.
//!
//! Values and metadata are opaque to the engine: they are cheap-clone,
//! type-erased handles that only the owning descriptor downcasts.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Globally unique identifier of one configuration item.
///
/// The key encodes the item type through a registered prefix and the item
/// identity through the remainder.
pub type Key = String;

/// Object-safe payload bound shared by [`Value`] and [`Metadata`].
pub trait Payload: Any + fmt::Debug + Send + Sync {
    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opaque, type-specific description of one configuration item.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Payload>,
    type_name: &'static str,
}

impl Value {
    /// Wrap a typed value.
    pub fn new<T: Any + fmt::Debug + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the value as `T` if it has that type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).as_any().downcast_ref::<T>()
    }

    /// Check if the value has type `T`.
    pub fn is<T: Any>(&self) -> bool {
        (*self.inner).as_any().is::<T>()
    }

    /// Name of the wrapped type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check if both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

/// Descriptor-owned auxiliary state attached to an applied value.
#[derive(Clone)]
pub struct Metadata {
    inner: Arc<dyn Payload>,
}

impl Metadata {
    /// Wrap typed metadata.
    pub fn new<T: Any + fmt::Debug + Send + Sync>(metadata: T) -> Self {
        Self {
            inner: Arc::new(metadata),
        }
    }

    /// Borrow the metadata as `T` if it has that type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

/// Where the currently recorded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Declared by a caller as desired state.
    FromNorthbound,
    /// Observed in the dataplane through a dump.
    FromSouthbound,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromNorthbound => write!(f, "northbound"),
            Self::FromSouthbound => write!(f, "southbound"),
        }
    }
}

/// "This item requires `key` to exist before it can be applied."
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    /// Human-readable label of the relation.
    pub label: String,
    /// Key of the required item.
    pub key: Key,
}

impl Dependency {
    /// Create a dependency.
    pub fn new(label: impl Into<String>, key: impl Into<Key>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
        }
    }
}

/// A key with its value.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: Key,
    pub value: Value,
}

impl KeyValuePair {
    /// Create a pair.
    pub fn new(key: impl Into<Key>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// An item as known to the engine or as observed in the dataplane.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Metadata>,
    pub origin: Origin,
}

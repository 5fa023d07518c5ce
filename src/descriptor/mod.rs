//! Descriptors and the values they manage.
//!
//! - [`value`] - Keys, opaque values, metadata and origin
//! - [`contract`] - The object-safe descriptor capability set
//! - [`typed`] - Typed descriptor trait and the erasing adapter
//! - [`registry`] - Prefix-based descriptor registry

pub mod contract;
pub mod registry;
pub mod typed;
pub mod value;

pub use contract::Descriptor;
pub use registry::DescriptorRegistry;
pub use typed::{KvDescriptor, TypedDescriptor, TypedKv};
pub use value::{Dependency, Key, KeyValuePair, KvWithMetadata, Metadata, Origin, Value};

//! Typed descriptor adapter.
//!
//! Plugins implement [`KvDescriptor`] against their concrete value and
//! metadata types; [`TypedDescriptor`] erases those types so the engine can
//! hold every descriptor as `Arc<dyn Descriptor>`.

use super::contract::Descriptor;
use super::value::{Dependency, KeyValuePair, KvWithMetadata, Metadata, Origin, Value};
use crate::core::error::DescriptorError;
use std::any::Any;
use std::fmt::Debug;

/// A typed observed item returned from [`KvDescriptor::dump`].
#[derive(Debug, Clone)]
pub struct TypedKv<V, M> {
    pub key: String,
    pub value: V,
    pub metadata: Option<M>,
    pub origin: Origin,
}

/// Descriptor contract expressed over concrete types.
///
/// Mirrors [`Descriptor`] one-to-one; only `name`, `key_prefix`,
/// `equivalent`, `add`, `delete` and `dump` are mandatory.
pub trait KvDescriptor: Send + Sync + 'static {
    type Value: Any + Debug + Clone + Send + Sync;
    type Metadata: Any + Debug + Clone + Send + Sync;

    fn name(&self) -> &str;

    fn key_prefix(&self) -> &str;

    fn is_descriptor_key(&self, key: &str) -> bool {
        key.starts_with(self.key_prefix())
    }

    fn validate(&self, _key: &str, _value: &Self::Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    fn equivalent(&self, key: &str, old: &Self::Value, new: &Self::Value) -> bool;

    fn add(&self, key: &str, value: &Self::Value)
        -> Result<Option<Self::Metadata>, DescriptorError>;

    fn delete(
        &self,
        key: &str,
        value: &Self::Value,
        metadata: Option<&Self::Metadata>,
    ) -> Result<(), DescriptorError>;

    fn supports_update(&self) -> bool {
        false
    }

    fn update(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _old_metadata: Option<&Self::Metadata>,
    ) -> Result<Option<Self::Metadata>, DescriptorError> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
        })
    }

    fn recreate_on_update(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        !self.supports_update()
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        err.is_retriable_by_default()
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn dump(
        &self,
        correlate: &[TypedKv<Self::Value, Self::Metadata>],
    ) -> Result<Vec<TypedKv<Self::Value, Self::Metadata>>, DescriptorError>;
}

/// Erases the types of a [`KvDescriptor`].
#[derive(Debug)]
pub struct TypedDescriptor<D> {
    inner: D,
}

impl<D: KvDescriptor> TypedDescriptor<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Borrow the wrapped descriptor.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn value<'a>(&self, value: &'a Value) -> Result<&'a D::Value, DescriptorError> {
        value
            .downcast_ref::<D::Value>()
            .ok_or(DescriptorError::TypeMismatch {
                expected: std::any::type_name::<D::Value>(),
            })
    }

    fn metadata<'a>(
        &self,
        metadata: Option<&'a Metadata>,
    ) -> Result<Option<&'a D::Metadata>, DescriptorError> {
        match metadata {
            None => Ok(None),
            Some(m) => m
                .downcast_ref::<D::Metadata>()
                .map(Some)
                .ok_or(DescriptorError::TypeMismatch {
                    expected: std::any::type_name::<D::Metadata>(),
                }),
        }
    }

    fn erase(kv: TypedKv<D::Value, D::Metadata>) -> KvWithMetadata {
        KvWithMetadata {
            key: kv.key,
            value: Value::new(kv.value),
            metadata: kv.metadata.map(Metadata::new),
            origin: kv.origin,
        }
    }
}

impl<D: KvDescriptor> Descriptor for TypedDescriptor<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn key_prefix(&self) -> &str {
        self.inner.key_prefix()
    }

    fn is_descriptor_key(&self, key: &str) -> bool {
        self.inner.is_descriptor_key(key)
    }

    fn validate(&self, key: &str, value: &Value) -> Result<(), DescriptorError> {
        self.inner.validate(key, self.value(value)?)
    }

    fn equivalent_values(&self, key: &str, old: &Value, new: &Value) -> bool {
        match (self.value(old), self.value(new)) {
            (Ok(old), Ok(new)) => self.inner.equivalent(key, old, new),
            _ => false,
        }
    }

    fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, DescriptorError> {
        let metadata = self.inner.add(key, self.value(value)?)?;
        Ok(metadata.map(Metadata::new))
    }

    fn delete(
        &self,
        key: &str,
        value: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        self.inner
            .delete(key, self.value(value)?, self.metadata(metadata)?)
    }

    fn supports_update(&self) -> bool {
        self.inner.supports_update()
    }

    fn update(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        let metadata = self.inner.update(
            key,
            self.value(old)?,
            self.value(new)?,
            self.metadata(old_metadata)?,
        )?;
        Ok(metadata.map(Metadata::new))
    }

    fn recreate_on_update(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> bool {
        match (self.value(old), self.value(new), self.metadata(metadata)) {
            (Ok(old), Ok(new), Ok(metadata)) => {
                self.inner.recreate_on_update(key, old, new, metadata)
            }
            _ => true,
        }
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        self.inner.is_retriable_failure(err)
    }

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        self.value(value)
            .map(|v| self.inner.dependencies(key, v))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
        self.value(value)
            .map(|v| self.inner.derived_values(key, v))
            .unwrap_or_default()
    }

    fn dump(&self, correlate: &[KvWithMetadata]) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        let mut typed = Vec::with_capacity(correlate.len());
        for kv in correlate {
            // Items of a foreign type cannot be correlated and are skipped.
            let Ok(value) = self.value(&kv.value) else {
                continue;
            };
            let metadata = self.metadata(kv.metadata.as_ref()).ok().flatten();
            typed.push(TypedKv {
                key: kv.key.clone(),
                value: value.clone(),
                metadata: metadata.cloned(),
                origin: kv.origin,
            });
        }
        let observed = self.inner.dump(&typed)?;
        Ok(observed.into_iter().map(Self::erase).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Bridge {
        name: String,
        learning: bool,
    }

    struct BridgeDescriptor;

    impl KvDescriptor for BridgeDescriptor {
        type Value = Bridge;
        type Metadata = u32;

        fn name(&self) -> &str {
            "bridge"
        }

        fn key_prefix(&self) -> &str {
            "l2/bd/"
        }

        fn equivalent(&self, _key: &str, old: &Bridge, new: &Bridge) -> bool {
            old.name.eq_ignore_ascii_case(&new.name) && old.learning == new.learning
        }

        fn add(&self, _key: &str, _value: &Bridge) -> Result<Option<u32>, DescriptorError> {
            Ok(Some(4))
        }

        fn delete(
            &self,
            _key: &str,
            _value: &Bridge,
            metadata: Option<&u32>,
        ) -> Result<(), DescriptorError> {
            match metadata {
                Some(4) => Ok(()),
                _ => Err(DescriptorError::NotFound {
                    message: "bridge domain index".to_string(),
                }),
            }
        }

        fn dump(
            &self,
            correlate: &[TypedKv<Bridge, u32>],
        ) -> Result<Vec<TypedKv<Bridge, u32>>, DescriptorError> {
            Ok(correlate.to_vec())
        }
    }

    fn bridge(name: &str) -> Value {
        Value::new(Bridge {
            name: name.to_string(),
            learning: true,
        })
    }

    #[test]
    fn test_typed_adapter_round_trips_metadata() {
        let descriptor = TypedDescriptor::new(BridgeDescriptor);
        let metadata = descriptor.add("l2/bd/b1", &bridge("b1")).unwrap();
        let metadata = metadata.unwrap();
        assert_eq!(metadata.downcast_ref::<u32>(), Some(&4));
        descriptor
            .delete("l2/bd/b1", &bridge("b1"), Some(&metadata))
            .unwrap();
    }

    #[test]
    fn test_typed_adapter_rejects_foreign_values() {
        let descriptor = TypedDescriptor::new(BridgeDescriptor);
        let err = descriptor.add("l2/bd/b1", &Value::new(7u8)).unwrap_err();
        assert!(matches!(err, DescriptorError::TypeMismatch { .. }));
        assert!(!err.is_retriable_by_default());
        assert!(!descriptor.equivalent_values("l2/bd/b1", &bridge("b1"), &Value::new(7u8)));
    }

    #[test]
    fn test_typed_adapter_defaults() {
        let descriptor = TypedDescriptor::new(BridgeDescriptor);
        assert!(descriptor.equivalent_values("l2/bd/b1", &bridge("B1"), &bridge("b1")));
        assert!(!descriptor.supports_update());
        assert!(descriptor.recreate_on_update("l2/bd/b1", &bridge("b1"), &bridge("b2"), None));
        assert_eq!(descriptor.key_label("l2/bd/b1"), "b1");
        assert!(matches!(
            descriptor.update("l2/bd/b1", &bridge("b1"), &bridge("b2"), None),
            Err(DescriptorError::Unsupported { .. })
        ));
    }
}

//! IPSec security association descriptor.
//!
//! Security associations are modified only by re-creation. An SA without an
//! index, or with a non-numeric one, is rejected before any dataplane call
//! and never retried.

use super::memory::MemoryDataplane;
use crate::core::error::DescriptorError;
use crate::descriptor::contract::key_from_label;
use crate::descriptor::{KvDescriptor, Origin, TypedKv};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SA_PREFIX: &str = "vpp/ipsec/sa/";
pub const SA_DESCRIPTOR: &str = "vpp-ipsec-sa";

pub fn sa_key(index: &str) -> String {
    key_from_label(SA_PREFIX, index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpsecProtocol {
    Ah,
    Esp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoAlg {
    #[default]
    None,
    AesCbc128,
    AesCbc192,
    AesCbc256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegAlg {
    #[default]
    None,
    Sha1_96,
    Sha256_128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssociation {
    pub index: String,
    pub spi: u32,
    pub protocol: IpsecProtocol,
    #[serde(default)]
    pub crypto_alg: CryptoAlg,
    /// Hex-encoded.
    #[serde(default)]
    pub crypto_key: String,
    #[serde(default)]
    pub integ_alg: IntegAlg,
    /// Hex-encoded.
    #[serde(default)]
    pub integ_key: String,
    #[serde(default)]
    pub use_esn: bool,
    #[serde(default)]
    pub use_anti_replay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_src_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_dst_addr: Option<String>,
    #[serde(default)]
    pub enable_udp_encap: bool,
}

impl SecurityAssociation {
    pub fn esp(index: impl Into<String>, spi: u32) -> Self {
        Self {
            index: index.into(),
            spi,
            protocol: IpsecProtocol::Esp,
            crypto_alg: CryptoAlg::None,
            crypto_key: String::new(),
            integ_alg: IntegAlg::None,
            integ_key: String::new(),
            use_esn: false,
            use_anti_replay: false,
            tunnel_src_addr: None,
            tunnel_dst_addr: None,
            enable_udp_encap: false,
        }
    }

    pub fn with_crypto(mut self, alg: CryptoAlg, key: impl Into<String>) -> Self {
        self.crypto_alg = alg;
        self.crypto_key = key.into();
        self
    }

    pub fn with_integ(mut self, alg: IntegAlg, key: impl Into<String>) -> Self {
        self.integ_alg = alg;
        self.integ_key = key.into();
        self
    }

    pub fn key(&self) -> String {
        sa_key(&self.index)
    }
}

/// Descriptor for security associations.
pub struct SaDescriptor {
    dataplane: Arc<MemoryDataplane>,
}

impl SaDescriptor {
    pub fn new(dataplane: Arc<MemoryDataplane>) -> Self {
        Self { dataplane }
    }
}

impl KvDescriptor for SaDescriptor {
    type Value = SecurityAssociation;
    type Metadata = ();

    fn name(&self) -> &str {
        SA_DESCRIPTOR
    }

    fn key_prefix(&self) -> &str {
        SA_PREFIX
    }

    fn validate(&self, _key: &str, sa: &SecurityAssociation) -> Result<(), DescriptorError> {
        if sa.index.is_empty() {
            return Err(DescriptorError::invalid(
                "security association defined without index",
            ));
        }
        if sa.index.parse::<u32>().is_err() {
            return Err(DescriptorError::invalid(format!(
                "security association defined with invalid index {:?}",
                sa.index
            )));
        }
        Ok(())
    }

    /// Keys are hex strings and compare case-insensitively.
    fn equivalent(&self, _key: &str, old: &SecurityAssociation, new: &SecurityAssociation) -> bool {
        old.spi == new.spi
            && old.protocol == new.protocol
            && old.crypto_alg == new.crypto_alg
            && old.crypto_key.eq_ignore_ascii_case(&new.crypto_key)
            && old.integ_alg == new.integ_alg
            && old.integ_key.eq_ignore_ascii_case(&new.integ_key)
            && old.use_esn == new.use_esn
            && old.use_anti_replay == new.use_anti_replay
            && old.tunnel_src_addr == new.tunnel_src_addr
            && old.tunnel_dst_addr == new.tunnel_dst_addr
            && old.enable_udp_encap == new.enable_udp_encap
    }

    fn add(&self, _key: &str, sa: &SecurityAssociation) -> Result<Option<()>, DescriptorError> {
        self.dataplane.add_sa(sa)?;
        Ok(None)
    }

    fn delete(
        &self,
        _key: &str,
        sa: &SecurityAssociation,
        _metadata: Option<&()>,
    ) -> Result<(), DescriptorError> {
        self.dataplane.delete_sa(&sa.index)
    }

    fn recreate_on_update(
        &self,
        _key: &str,
        _old: &SecurityAssociation,
        _new: &SecurityAssociation,
        _metadata: Option<&()>,
    ) -> bool {
        true
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        !matches!(err, DescriptorError::InvalidValue { .. })
    }

    fn dump(
        &self,
        _correlate: &[TypedKv<SecurityAssociation, ()>],
    ) -> Result<Vec<TypedKv<SecurityAssociation, ()>>, DescriptorError> {
        let dump: Vec<_> = self
            .dataplane
            .dump_sas()?
            .into_iter()
            .map(|sa| TypedKv {
                key: sa.key(),
                value: sa,
                metadata: None,
                origin: Origin::FromNorthbound,
            })
            .collect();
        tracing::debug!(count = dump.len(), "dumped security associations");
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SaDescriptor {
        SaDescriptor::new(Arc::new(MemoryDataplane::new()))
    }

    #[test]
    fn test_index_validation() {
        let d = descriptor();
        let err = d.validate("vpp/ipsec/sa/", &SecurityAssociation::esp("", 1)).unwrap_err();
        assert!(err.to_string().contains("without index"));
        let err = d.validate("vpp/ipsec/sa/x", &SecurityAssociation::esp("x", 1)).unwrap_err();
        assert!(err.to_string().contains("invalid index"));
        assert!(!d.is_retriable_failure(&err));
        assert!(d.validate("vpp/ipsec/sa/10", &SecurityAssociation::esp("10", 1)).is_ok());
    }

    #[test]
    fn test_keys_compare_case_insensitively() {
        let d = descriptor();
        let a = SecurityAssociation::esp("1", 1001)
            .with_crypto(CryptoAlg::AesCbc128, "4A506A794F574265564551694D653768");
        let b = SecurityAssociation::esp("1", 1001)
            .with_crypto(CryptoAlg::AesCbc128, "4a506a794f574265564551694d653768");
        assert!(d.equivalent(&a.key(), &a, &b));
        let c = SecurityAssociation::esp("1", 1002)
            .with_crypto(CryptoAlg::AesCbc128, "4a506a794f574265564551694d653768");
        assert!(!d.equivalent(&a.key(), &a, &c));
        assert!(d.recreate_on_update(&a.key(), &a, &c, None));
    }

    #[test]
    fn test_dataplane_errors_are_retriable() {
        let d = descriptor();
        assert!(d.is_retriable_failure(&DescriptorError::dataplane(-1, "busy")));
        assert!(d.is_retriable_failure(&DescriptorError::timeout(10, "slow")));
    }
}

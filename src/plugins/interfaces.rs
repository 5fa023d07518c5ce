//! Interface and interface-address descriptors.
//!
//! An interface derives one address item per configured IP address, so
//! addresses are applied right after their interface and removed right
//! before it. The interface metadata carries the dataplane-assigned
//! `sw_if_index`, which other plugins read through the scheduler's
//! metadata map.

use super::memory::MemoryDataplane;
use super::parse_prefix;
use crate::core::error::DescriptorError;
use crate::descriptor::contract::key_from_label;
use crate::descriptor::{KeyValuePair, KvDescriptor, Origin, TypedKv, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const INTERFACE_PREFIX: &str = "vpp/interface/";
pub const ADDRESS_PREFIX: &str = "vpp/interface-address/";

pub const INTERFACE_DESCRIPTOR: &str = "vpp-interface";
pub const ADDRESS_DESCRIPTOR: &str = "vpp-interface-address";

pub fn interface_key(name: &str) -> String {
    key_from_label(INTERFACE_PREFIX, name)
}

pub fn address_key(interface: &str, address: &str) -> String {
    format!("{}{}/{}", ADDRESS_PREFIX, interface, address)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Loopback,
    Tap,
    Memif,
    /// VMware paravirtual NIC bound by PCI address.
    Vmxnet3 {
        /// `domain:bus:slot.function`, e.g. `0000:0b:00.0`.
        pci_addr: String,
        /// Zero selects the dataplane default.
        #[serde(default)]
        rxq_size: u16,
        #[serde(default)]
        txq_size: u16,
    },
}

impl InterfaceKind {
    pub fn vmxnet3(pci_addr: impl Into<String>) -> Self {
        Self::Vmxnet3 {
            pci_addr: pci_addr.into(),
            rxq_size: 0,
            txq_size: 0,
        }
    }
}

/// Pack a PCI address the way the dataplane API expects it.
pub fn parse_pci_addr(addr: &str) -> Result<u32, DescriptorError> {
    let invalid = || DescriptorError::invalid(format!("invalid PCI address {}", addr));
    let (domain, rest) = addr.split_once(':').ok_or_else(invalid)?;
    let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
    let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;
    let field = |text: &str, max: u32| {
        u32::from_str_radix(text, 16)
            .ok()
            .filter(|v| *v <= max)
            .ok_or_else(invalid)
    };
    let domain = field(domain, 0xffff)?;
    let bus = field(bus, 0xff)?;
    let slot = field(slot, 0x1f)?;
    let function = field(function, 0x7)?;
    Ok(domain | bus << 16 | slot << 24 | function << 29)
}

fn validate_queue_size(name: &str, size: u16) -> Result<(), DescriptorError> {
    if size == 0 || size.is_power_of_two() {
        Ok(())
    } else {
        Err(DescriptorError::invalid(format!(
            "{} {} is not a power of two",
            name, size
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Assigned by the dataplane when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// IP addresses in `addr/len` form.
    #[serde(default)]
    pub addresses: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Interface {
    pub fn new(name: impl Into<String>, kind: InterfaceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            mac: None,
            mtu: None,
            addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn key(&self) -> String {
        interface_key(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMeta {
    pub sw_if_index: u32,
}

fn validate_mac(mac: &str) -> Result<(), DescriptorError> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(DescriptorError::invalid(format!("invalid MAC address {}", mac)))
    }
}

fn same_mac(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Descriptor for interfaces.
pub struct InterfaceDescriptor {
    dataplane: Arc<MemoryDataplane>,
}

impl InterfaceDescriptor {
    pub fn new(dataplane: Arc<MemoryDataplane>) -> Self {
        Self { dataplane }
    }
}

impl KvDescriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMeta;

    fn name(&self) -> &str {
        INTERFACE_DESCRIPTOR
    }

    fn key_prefix(&self) -> &str {
        INTERFACE_PREFIX
    }

    fn validate(&self, key: &str, iface: &Interface) -> Result<(), DescriptorError> {
        if iface.name.is_empty() || iface.name.contains('/') {
            return Err(DescriptorError::invalid("interface name must be non-empty without '/'"));
        }
        if key != interface_key(&iface.name) {
            return Err(DescriptorError::invalid(format!(
                "key {} does not match interface {}",
                key, iface.name
            )));
        }
        if let Some(mtu) = iface.mtu {
            if !(64..=9216).contains(&mtu) {
                return Err(DescriptorError::invalid(format!("MTU {} out of range", mtu)));
            }
        }
        if let Some(mac) = &iface.mac {
            validate_mac(mac)?;
        }
        if let InterfaceKind::Vmxnet3 {
            pci_addr,
            rxq_size,
            txq_size,
        } = &iface.kind
        {
            parse_pci_addr(pci_addr)?;
            validate_queue_size("rxq_size", *rxq_size)?;
            validate_queue_size("txq_size", *txq_size)?;
        }
        for address in &iface.addresses {
            parse_prefix(address)?;
        }
        Ok(())
    }

    /// Addresses are separate derived items and do not take part.
    fn equivalent(&self, _key: &str, old: &Interface, new: &Interface) -> bool {
        old.name == new.name
            && old.kind == new.kind
            && old.enabled == new.enabled
            && old.mtu == new.mtu
            && same_mac(old.mac.as_deref(), new.mac.as_deref())
    }

    fn add(&self, _key: &str, iface: &Interface) -> Result<Option<InterfaceMeta>, DescriptorError> {
        let sw_if_index = self.dataplane.add_interface(iface)?;
        Ok(Some(InterfaceMeta { sw_if_index }))
    }

    fn delete(
        &self,
        _key: &str,
        iface: &Interface,
        _metadata: Option<&InterfaceMeta>,
    ) -> Result<(), DescriptorError> {
        self.dataplane.delete_interface(&iface.name)
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        _key: &str,
        _old: &Interface,
        new: &Interface,
        _old_metadata: Option<&InterfaceMeta>,
    ) -> Result<Option<InterfaceMeta>, DescriptorError> {
        let sw_if_index = self.dataplane.update_interface(new)?;
        Ok(Some(InterfaceMeta { sw_if_index }))
    }

    /// The interface type and an explicit MAC change cannot be changed in place.
    fn recreate_on_update(
        &self,
        _key: &str,
        old: &Interface,
        new: &Interface,
        _metadata: Option<&InterfaceMeta>,
    ) -> bool {
        old.kind != new.kind
            || (new.mac.is_some() && !same_mac(old.mac.as_deref(), new.mac.as_deref()))
    }

    fn derived_values(&self, _key: &str, iface: &Interface) -> Vec<KeyValuePair> {
        iface
            .addresses
            .iter()
            .map(|address| {
                KeyValuePair::new(
                    address_key(&iface.name, address),
                    Value::new(InterfaceAddress {
                        interface: iface.name.clone(),
                        address: address.clone(),
                    }),
                )
            })
            .collect()
    }

    fn dump(
        &self,
        correlate: &[TypedKv<Interface, InterfaceMeta>],
    ) -> Result<Vec<TypedKv<Interface, InterfaceMeta>>, DescriptorError> {
        let dump = self
            .dataplane
            .dump_interfaces()?
            .into_iter()
            .map(|(mut iface, sw_if_index)| {
                let key = interface_key(&iface.name);
                let believed = correlate.iter().find(|kv| kv.key == key);
                // A MAC the dataplane picked is not drift.
                if let Some(believed) = believed {
                    if believed.value.mac.is_none() {
                        iface.mac = None;
                    }
                }
                TypedKv {
                    origin: if believed.is_some() {
                        Origin::FromNorthbound
                    } else {
                        Origin::FromSouthbound
                    },
                    key,
                    value: iface,
                    metadata: Some(InterfaceMeta { sw_if_index }),
                }
            })
            .collect::<Vec<_>>();
        tracing::debug!(count = dump.len(), "dumped interfaces");
        Ok(dump)
    }
}

/// One IP address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: String,
}

/// Descriptor for interface addresses. Only ever used for derived values.
pub struct AddressDescriptor {
    dataplane: Arc<MemoryDataplane>,
}

impl AddressDescriptor {
    pub fn new(dataplane: Arc<MemoryDataplane>) -> Self {
        Self { dataplane }
    }
}

impl KvDescriptor for AddressDescriptor {
    type Value = InterfaceAddress;
    type Metadata = ();

    fn name(&self) -> &str {
        ADDRESS_DESCRIPTOR
    }

    fn key_prefix(&self) -> &str {
        ADDRESS_PREFIX
    }

    fn validate(&self, _key: &str, value: &InterfaceAddress) -> Result<(), DescriptorError> {
        parse_prefix(&value.address).map(|_| ())
    }

    fn equivalent(&self, _key: &str, old: &InterfaceAddress, new: &InterfaceAddress) -> bool {
        old.interface == new.interface
            && match (parse_prefix(&old.address), parse_prefix(&new.address)) {
                (Ok(a), Ok(b)) => a == b,
                _ => old.address == new.address,
            }
    }

    fn add(&self, _key: &str, value: &InterfaceAddress) -> Result<Option<()>, DescriptorError> {
        self.dataplane.add_address(&value.interface, &value.address)?;
        Ok(None)
    }

    fn delete(
        &self,
        _key: &str,
        value: &InterfaceAddress,
        _metadata: Option<&()>,
    ) -> Result<(), DescriptorError> {
        self.dataplane.delete_address(&value.interface, &value.address)
    }

    fn dump(
        &self,
        _correlate: &[TypedKv<InterfaceAddress, ()>],
    ) -> Result<Vec<TypedKv<InterfaceAddress, ()>>, DescriptorError> {
        Ok(self
            .dataplane
            .dump_addresses()?
            .into_iter()
            .map(|(interface, address)| TypedKv {
                key: address_key(&interface, &address),
                value: InterfaceAddress { interface, address },
                metadata: None,
                origin: Origin::FromSouthbound,
            })
            .collect())
    }
}

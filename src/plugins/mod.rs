//! Reference descriptors for a simulated dataplane.
//!
//! - [`interfaces`] - Interfaces and their derived IP addresses
//! - [`routes`] - Static routes depending on interfaces
//! - [`ipsec`] - IPSec security associations
//! - [`memory`] - In-memory southbound handler with fault injection
//! - [`model`] - JSON desired-state documents

pub mod interfaces;
pub mod ipsec;
pub mod memory;
pub mod model;
pub mod routes;

use crate::core::error::{DescriptorError, SchedulerResult};
use crate::descriptor::DescriptorRegistry;
use std::net::IpAddr;
use std::sync::Arc;

pub use interfaces::{
    AddressDescriptor, Interface, InterfaceDescriptor, InterfaceKind, InterfaceMeta,
};
pub use ipsec::{SaDescriptor, SecurityAssociation};
pub use memory::{DataplaneOp, Fault, MemoryDataplane, Table};
pub use model::DesiredState;
pub use routes::{Route, RouteDescriptor};

/// Register every reference descriptor against one dataplane.
pub fn register_all(
    registry: &mut DescriptorRegistry,
    dataplane: &Arc<MemoryDataplane>,
) -> SchedulerResult<()> {
    registry.register_typed(InterfaceDescriptor::new(Arc::clone(dataplane)))?;
    registry.register_typed(AddressDescriptor::new(Arc::clone(dataplane)))?;
    registry.register_typed(RouteDescriptor::new(Arc::clone(dataplane)))?;
    registry.register_typed(SaDescriptor::new(Arc::clone(dataplane)))?;
    Ok(())
}

/// Parse `addr/len` into a normalized address and prefix length.
pub(crate) fn parse_prefix(s: &str) -> Result<(IpAddr, u8), DescriptorError> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| DescriptorError::invalid(format!("{} is not in addr/len form", s)))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| DescriptorError::invalid(format!("invalid IP address {}", addr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| DescriptorError::invalid(format!("invalid prefix length in {}", s)))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(DescriptorError::invalid(format!(
            "prefix length {} exceeds {}",
            len, max
        )));
    }
    Ok((addr, len))
}

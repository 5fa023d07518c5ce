//! Static route descriptor.

use super::interfaces::interface_key;
use super::memory::MemoryDataplane;
use super::parse_prefix;
use crate::core::error::DescriptorError;
use crate::descriptor::{Dependency, KvDescriptor, Origin, TypedKv};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

pub const ROUTE_PREFIX: &str = "vpp/route/";
pub const ROUTE_DESCRIPTOR: &str = "vpp-route";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub vrf: u32,
    /// Destination network in `addr/len` form.
    pub dst_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_interface: Option<String>,
    /// Zero means the dataplane default of 1.
    #[serde(default)]
    pub weight: u32,
}

impl Route {
    pub fn new(dst_network: impl Into<String>) -> Self {
        Self {
            vrf: 0,
            dst_network: dst_network.into(),
            next_hop: None,
            outgoing_interface: None,
            weight: 0,
        }
    }

    pub fn via(mut self, next_hop: impl Into<String>) -> Self {
        self.next_hop = Some(next_hop.into());
        self
    }

    pub fn out(mut self, interface: impl Into<String>) -> Self {
        self.outgoing_interface = Some(interface.into());
        self
    }

    pub fn key(&self) -> String {
        route_key(self)
    }

    /// Identity inside the dataplane route table.
    pub fn id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.vrf,
            self.dst_network,
            self.next_hop.as_deref().unwrap_or("-")
        )
    }

    fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}

pub fn route_key(route: &Route) -> String {
    format!(
        "{}vrf/{}/dst/{}/gw/{}",
        ROUTE_PREFIX,
        route.vrf,
        route.dst_network,
        route.next_hop.as_deref().unwrap_or("-")
    )
}

/// Descriptor for static routes. Routes have no in-place update.
pub struct RouteDescriptor {
    dataplane: Arc<MemoryDataplane>,
}

impl RouteDescriptor {
    pub fn new(dataplane: Arc<MemoryDataplane>) -> Self {
        Self { dataplane }
    }
}

impl KvDescriptor for RouteDescriptor {
    type Value = Route;
    type Metadata = ();

    fn name(&self) -> &str {
        ROUTE_DESCRIPTOR
    }

    fn key_prefix(&self) -> &str {
        ROUTE_PREFIX
    }

    fn validate(&self, key: &str, route: &Route) -> Result<(), DescriptorError> {
        let (dst, _) = parse_prefix(&route.dst_network)?;
        match (&route.next_hop, &route.outgoing_interface) {
            (None, None) => {
                return Err(DescriptorError::invalid(
                    "route needs a next hop or an outgoing interface",
                ))
            }
            (Some(hop), _) => {
                let hop: IpAddr = hop
                    .parse()
                    .map_err(|_| DescriptorError::invalid(format!("invalid next hop {}", hop)))?;
                if hop.is_ipv4() != dst.is_ipv4() {
                    return Err(DescriptorError::invalid(
                        "next hop and destination differ in family",
                    ));
                }
            }
            (None, Some(_)) => {}
        }
        if key != route_key(route) {
            return Err(DescriptorError::invalid(format!("key {} does not match route", key)));
        }
        Ok(())
    }

    fn equivalent(&self, _key: &str, old: &Route, new: &Route) -> bool {
        let same_dst = match (parse_prefix(&old.dst_network), parse_prefix(&new.dst_network)) {
            (Ok(a), Ok(b)) => a == b,
            _ => old.dst_network == new.dst_network,
        };
        same_dst
            && old.vrf == new.vrf
            && old.next_hop == new.next_hop
            && old.outgoing_interface == new.outgoing_interface
            && old.effective_weight() == new.effective_weight()
    }

    fn add(&self, _key: &str, route: &Route) -> Result<Option<()>, DescriptorError> {
        self.dataplane.add_route(&route.id(), route)?;
        Ok(None)
    }

    fn delete(
        &self,
        _key: &str,
        route: &Route,
        _metadata: Option<&()>,
    ) -> Result<(), DescriptorError> {
        self.dataplane.delete_route(&route.id())
    }

    fn dependencies(&self, _key: &str, route: &Route) -> Vec<Dependency> {
        route
            .outgoing_interface
            .iter()
            .map(|iface| Dependency::new("outgoing-interface", interface_key(iface)))
            .collect()
    }

    fn dump(
        &self,
        correlate: &[TypedKv<Route, ()>],
    ) -> Result<Vec<TypedKv<Route, ()>>, DescriptorError> {
        Ok(self
            .dataplane
            .dump_routes()?
            .into_iter()
            .map(|route| {
                let key = route_key(&route);
                let origin = if correlate.iter().any(|kv| kv.key == key) {
                    Origin::FromNorthbound
                } else {
                    Origin::FromSouthbound
                };
                TypedKv {
                    key,
                    value: route,
                    metadata: None,
                    origin,
                }
            })
            .collect())
    }
}

//! In-memory dataplane.
//!
//! Stands in for the southbound API behind the reference descriptors. Every
//! call is logged, and faults can be injected per table and operation, so
//! tests and the CLI can exercise retries, drift and terminal failures
//! without a real forwarder.

use super::interfaces::Interface;
use super::ipsec::SecurityAssociation;
use super::routes::Route;
use crate::core::error::DescriptorError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Dataplane table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Interface,
    Address,
    Route,
    SecurityAssociation,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interface => write!(f, "interface"),
            Self::Address => write!(f, "address"),
            Self::Route => write!(f, "route"),
            Self::SecurityAssociation => write!(f, "sa"),
        }
    }
}

/// Dataplane operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataplaneOp {
    Add,
    Update,
    Delete,
    Dump,
}

/// A logged dataplane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataplaneCall {
    pub table: Table,
    pub op: DataplaneOp,
    /// Item identity; empty for dumps.
    pub id: String,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    pub table: Table,
    pub op: DataplaneOp,
    /// Restrict the fault to one item.
    pub id: Option<String>,
    pub error: DescriptorError,
    /// Remaining hits; `None` fails forever.
    pub times: Option<u32>,
    /// Sleep before failing.
    pub delay: Option<Duration>,
}

impl Fault {
    pub fn new(table: Table, op: DataplaneOp, error: DescriptorError) -> Self {
        Self {
            table,
            op,
            id: None,
            error,
            times: None,
            delay: None,
        }
    }

    pub fn for_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn matches(&self, table: Table, op: DataplaneOp, id: &str) -> bool {
        self.table == table
            && self.op == op
            && self.id.as_deref().map_or(true, |want| want == id)
            && self.times != Some(0)
    }
}

#[derive(Debug, Default)]
struct State {
    interfaces: BTreeMap<String, (Interface, u32)>,
    next_sw_if_index: u32,
    addresses: BTreeSet<(String, String)>,
    routes: BTreeMap<String, Route>,
    sas: BTreeMap<String, SecurityAssociation>,
    faults: Vec<Fault>,
    calls: Vec<DataplaneCall>,
}

impl State {
    /// Log the call and consume a matching fault.
    fn enter(
        &mut self,
        table: Table,
        op: DataplaneOp,
        id: &str,
    ) -> Option<(DescriptorError, Option<Duration>)> {
        self.calls.push(DataplaneCall {
            table,
            op,
            id: id.to_string(),
        });
        let fault = self.faults.iter_mut().find(|f| f.matches(table, op, id))?;
        if let Some(times) = fault.times.as_mut() {
            *times -= 1;
        }
        Some((fault.error.clone(), fault.delay))
    }
}

/// Simulated forwarder with interface, address, route and SA tables.
#[derive(Debug, Default)]
pub struct MemoryDataplane {
    state: Mutex<State>,
}

fn exists(what: &str, id: &str) -> DescriptorError {
    DescriptorError::dataplane(-17, format!("{} {} already exists", what, id))
}

fn not_found(what: &str, id: &str) -> DescriptorError {
    DescriptorError::NotFound {
        message: format!("{} {}", what, id),
    }
}

impl MemoryDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the lock unless a fault fires. Fault delays are slept
    /// outside the lock.
    fn call<T>(
        &self,
        table: Table,
        op: DataplaneOp,
        id: &str,
        f: impl FnOnce(&mut State) -> Result<T, DescriptorError>,
    ) -> Result<T, DescriptorError> {
        let fault = self.state.lock().enter(table, op, id);
        match fault {
            Some((error, delay)) => {
                if let Some(delay) = delay {
                    std::thread::sleep(delay);
                }
                Err(error)
            }
            None => f(&mut *self.state.lock()),
        }
    }

    // === Faults and call log ===

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn calls(&self) -> Vec<DataplaneCall> {
        self.state.lock().calls.clone()
    }

    /// Number of logged calls of one kind, optionally for one item.
    pub fn count(&self, table: Table, op: DataplaneOp, id: Option<&str>) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.table == table && c.op == op)
            .filter(|c| id.map_or(true, |id| c.id == id))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    // === Interfaces ===

    /// Create an interface and return its sw_if_index. A missing MAC is
    /// assigned by the dataplane.
    pub fn add_interface(&self, iface: &Interface) -> Result<u32, DescriptorError> {
        self.call(Table::Interface, DataplaneOp::Add, &iface.name, |state| {
            if state.interfaces.contains_key(&iface.name) {
                return Err(exists("interface", &iface.name));
            }
            state.next_sw_if_index += 1;
            let index = state.next_sw_if_index;
            let mut stored = iface.clone();
            stored.addresses.clear();
            if stored.mac.is_none() {
                stored.mac = Some(format!("02:fe:00:00:00:{:02x}", index & 0xff));
            }
            state.interfaces.insert(iface.name.clone(), (stored, index));
            Ok(index)
        })
    }

    pub fn update_interface(&self, iface: &Interface) -> Result<u32, DescriptorError> {
        self.call(Table::Interface, DataplaneOp::Update, &iface.name, |state| {
            let (stored, index) = state
                .interfaces
                .get_mut(&iface.name)
                .ok_or_else(|| not_found("interface", &iface.name))?;
            stored.enabled = iface.enabled;
            stored.mtu = iface.mtu;
            if iface.mac.is_some() {
                stored.mac = iface.mac.clone();
            }
            Ok(*index)
        })
    }

    /// Remove an interface together with its addresses.
    pub fn delete_interface(&self, name: &str) -> Result<(), DescriptorError> {
        self.call(Table::Interface, DataplaneOp::Delete, name, |state| {
            state
                .interfaces
                .remove(name)
                .ok_or_else(|| not_found("interface", name))?;
            state.addresses.retain(|(iface, _)| iface != name);
            Ok(())
        })
    }

    /// Interfaces with their sw_if_index and currently assigned addresses.
    pub fn dump_interfaces(&self) -> Result<Vec<(Interface, u32)>, DescriptorError> {
        self.call(Table::Interface, DataplaneOp::Dump, "", |state| {
            Ok(state
                .interfaces
                .values()
                .map(|(iface, index)| {
                    let mut iface = iface.clone();
                    iface.addresses = state
                        .addresses
                        .iter()
                        .filter(|(name, _)| *name == iface.name)
                        .map(|(_, addr)| addr.clone())
                        .collect();
                    (iface, *index)
                })
                .collect())
        })
    }

    pub fn sw_if_index(&self, name: &str) -> Option<u32> {
        self.state.lock().interfaces.get(name).map(|(_, index)| *index)
    }

    // === Addresses ===

    pub fn add_address(&self, iface: &str, address: &str) -> Result<(), DescriptorError> {
        let id = format!("{}/{}", iface, address);
        self.call(Table::Address, DataplaneOp::Add, &id, |state| {
            if !state.interfaces.contains_key(iface) {
                return Err(DescriptorError::dataplane(-2, format!("no interface {}", iface)));
            }
            if !state.addresses.insert((iface.to_string(), address.to_string())) {
                return Err(exists("address", &id));
            }
            Ok(())
        })
    }

    pub fn delete_address(&self, iface: &str, address: &str) -> Result<(), DescriptorError> {
        let id = format!("{}/{}", iface, address);
        self.call(Table::Address, DataplaneOp::Delete, &id, |state| {
            if !state.addresses.remove(&(iface.to_string(), address.to_string())) {
                return Err(not_found("address", &id));
            }
            Ok(())
        })
    }

    pub fn dump_addresses(&self) -> Result<Vec<(String, String)>, DescriptorError> {
        self.call(Table::Address, DataplaneOp::Dump, "", |state| {
            Ok(state.addresses.iter().cloned().collect())
        })
    }

    // === Routes ===

    pub fn add_route(&self, id: &str, route: &Route) -> Result<(), DescriptorError> {
        self.call(Table::Route, DataplaneOp::Add, id, |state| {
            if let Some(iface) = &route.outgoing_interface {
                if !state.interfaces.contains_key(iface) {
                    return Err(DescriptorError::dataplane(-2, format!("no interface {}", iface)));
                }
            }
            if state.routes.contains_key(id) {
                return Err(exists("route", id));
            }
            state.routes.insert(id.to_string(), route.clone());
            Ok(())
        })
    }

    pub fn delete_route(&self, id: &str) -> Result<(), DescriptorError> {
        self.call(Table::Route, DataplaneOp::Delete, id, |state| {
            state
                .routes
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| not_found("route", id))
        })
    }

    pub fn dump_routes(&self) -> Result<Vec<Route>, DescriptorError> {
        self.call(Table::Route, DataplaneOp::Dump, "", |state| {
            Ok(state.routes.values().cloned().collect())
        })
    }

    // === Security associations ===

    pub fn add_sa(&self, sa: &SecurityAssociation) -> Result<(), DescriptorError> {
        self.call(Table::SecurityAssociation, DataplaneOp::Add, &sa.index, |state| {
            if state.sas.contains_key(&sa.index) {
                return Err(exists("security association", &sa.index));
            }
            state.sas.insert(sa.index.clone(), sa.clone());
            Ok(())
        })
    }

    pub fn delete_sa(&self, index: &str) -> Result<(), DescriptorError> {
        self.call(Table::SecurityAssociation, DataplaneOp::Delete, index, |state| {
            state
                .sas
                .remove(index)
                .map(|_| ())
                .ok_or_else(|| not_found("security association", index))
        })
    }

    pub fn dump_sas(&self) -> Result<Vec<SecurityAssociation>, DescriptorError> {
        self.call(Table::SecurityAssociation, DataplaneOp::Dump, "", |state| {
            Ok(state.sas.values().cloned().collect())
        })
    }

    // === Out-of-band changes ===

    /// Remove an item behind the engine's back. Returns false if absent.
    pub fn remove_out_of_band(&self, table: Table, id: &str) -> bool {
        let mut state = self.state.lock();
        match table {
            Table::Interface => state.interfaces.remove(id).is_some(),
            Table::Address => {
                let before = state.addresses.len();
                state.addresses.retain(|(iface, addr)| format!("{}/{}", iface, addr) != id);
                state.addresses.len() != before
            }
            Table::Route => state.routes.remove(id).is_some(),
            Table::SecurityAssociation => state.sas.remove(id).is_some(),
        }
    }

    /// Create an interface behind the engine's back.
    pub fn insert_interface_out_of_band(&self, iface: Interface) -> u32 {
        let mut state = self.state.lock();
        state.next_sw_if_index += 1;
        let index = state.next_sw_if_index;
        state.interfaces.insert(iface.name.clone(), (iface, index));
        index
    }

    /// Create a security association behind the engine's back.
    pub fn insert_sa_out_of_band(&self, sa: SecurityAssociation) {
        self.state.lock().sas.insert(sa.index.clone(), sa);
    }

    /// Change the MTU of an interface behind the engine's back.
    pub fn set_mtu_out_of_band(&self, name: &str, mtu: Option<u32>) -> bool {
        match self.state.lock().interfaces.get_mut(name) {
            Some((iface, _)) => {
                iface.mtu = mtu;
                true
            }
            None => false,
        }
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.state.lock().interfaces.keys().cloned().collect()
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.state.lock().routes.keys().cloned().collect()
    }

    pub fn sa_indexes(&self) -> Vec<String> {
        self.state.lock().sas.keys().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<(String, String)> {
        self.state.lock().addresses.iter().cloned().collect()
    }
}

//! JSON desired-state documents.
//!
//! ```json
//! {
//!   "interfaces": [{ "name": "tap0", "kind": "tap", "addresses": ["10.0.0.1/24"] }],
//!   "routes": [{ "dst_network": "10.1.0.0/16", "next_hop": "10.0.0.254", "outgoing_interface": "tap0" }],
//!   "security_associations": [{ "index": "1", "spi": 1001, "protocol": "esp" }]
//! }
//! ```

use super::interfaces::Interface;
use super::ipsec::SecurityAssociation;
use super::routes::Route;
use crate::descriptor::{Key, Value};
use crate::scheduler::Transaction;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete northbound desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub security_associations: Vec<SecurityAssociation>,
}

impl DesiredState {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse desired state")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read state file: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize desired state")
    }

    pub fn len(&self) -> usize {
        self.interfaces.len() + self.routes.len() + self.security_associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every item with its key.
    pub fn items(&self) -> Vec<(Key, Value)> {
        let interfaces = self
            .interfaces
            .iter()
            .map(|i| (i.key(), Value::new(i.clone())));
        let routes = self.routes.iter().map(|r| (r.key(), Value::new(r.clone())));
        let sas = self
            .security_associations
            .iter()
            .map(|sa| (sa.key(), Value::new(sa.clone())));
        interfaces.chain(routes).chain(sas).collect()
    }

    /// Transaction that sets every item.
    pub fn to_transaction(&self) -> Transaction {
        self.items()
            .into_iter()
            .fold(Transaction::new(), |txn, (key, value)| txn.set(key, value))
    }

    /// Transaction that replaces the whole northbound state with this one.
    pub fn to_resync(&self) -> Transaction {
        Transaction::resync(self.items())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::interfaces::InterfaceKind;

    const DOC: &str = r#"{
        "interfaces": [{ "name": "tap0", "kind": "tap", "addresses": ["10.0.0.1/24"] }],
        "routes": [{ "dst_network": "10.1.0.0/16", "next_hop": "10.0.0.254", "outgoing_interface": "tap0" }],
        "security_associations": [{ "index": "1", "spi": 1001, "protocol": "esp" }]
    }"#;

    #[test]
    fn test_parse_document() {
        let state = DesiredState::from_json(DOC).unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.interfaces[0].kind, InterfaceKind::Tap);
        assert!(state.interfaces[0].enabled);

        let keys: Vec<Key> = state.items().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                "vpp/interface/tap0",
                "vpp/route/vrf/0/dst/10.1.0.0/16/gw/10.0.0.254",
                "vpp/ipsec/sa/1"
            ]
        );
    }

    #[test]
    fn test_json_round_trip() {
        let state = DesiredState::from_json(DOC).unwrap();
        let again = DesiredState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(state, again);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let doc = r#"{ "interfaces": [{ "name": "x", "kind": "vxlan" }] }"#;
        assert!(DesiredState::from_json(doc).is_err());
    }
}

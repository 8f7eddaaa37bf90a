//! Network-state reconciliation
//!
//! Pure diffs between the persisted [`NetworkSnapshot`] and the currently
//! observed network. The compiler turns these deltas into directives; nothing
//! here touches the filter engine.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Network facts the installed rules were last compiled against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// LAN subnet with exemption rules installed
    #[serde(default)]
    pub subnet: Option<IpNetwork>,
    /// Tethered interfaces with enable rules installed
    #[serde(default)]
    pub tethered_interfaces: BTreeSet<String>,
    /// Network each tethered interface had when its rules were installed
    #[serde(default)]
    pub tether_networks: BTreeMap<String, IpNetwork>,
}

impl NetworkSnapshot {
    pub fn is_empty(&self) -> bool {
        self.subnet.is_none() && self.tethered_interfaces.is_empty()
    }
}

/// Change of LAN subnet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetDelta {
    pub remove: Option<IpNetwork>,
    pub add: Option<IpNetwork>,
}

impl SubnetDelta {
    pub fn is_empty(&self) -> bool {
        self.remove.is_none() && self.add.is_none()
    }
}

/// Change of a set of names, each side sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDelta {
    pub removals: Vec<String>,
    pub additions: Vec<String>,
}

impl SetDelta {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

/// An unchanged subnet yields an empty delta
pub fn diff_subnet(old: Option<IpNetwork>, new: Option<IpNetwork>) -> SubnetDelta {
    if old == new {
        return SubnetDelta::default();
    }
    SubnetDelta {
        remove: old,
        add: new,
    }
}

/// Interfaces are compared by exact name; both sides come back sorted
pub fn diff_interfaces(before: &BTreeSet<String>, after: &BTreeSet<String>) -> SetDelta {
    SetDelta {
        removals: before.difference(after).cloned().collect(),
        additions: after.difference(before).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_subnet_unchanged() {
        let net: IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert!(diff_subnet(Some(net), Some(net)).is_empty());
        assert!(diff_subnet(None, None).is_empty());
    }

    #[test]
    fn test_subnet_changed() {
        let old: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let new: IpNetwork = "10.0.1.0/24".parse().unwrap();
        let delta = diff_subnet(Some(old), Some(new));
        assert_eq!(delta.remove, Some(old));
        assert_eq!(delta.add, Some(new));

        let gone = diff_subnet(Some(old), None);
        assert_eq!(gone.remove, Some(old));
        assert_eq!(gone.add, None);
    }

    #[test]
    fn test_interfaces_diff() {
        let delta = diff_interfaces(&set(&["A", "B"]), &set(&["B", "C"]));
        assert_eq!(delta.removals, ["A"]);
        assert_eq!(delta.additions, ["C"]);
    }

    #[test]
    fn test_interfaces_sorted_and_exact() {
        let delta = diff_interfaces(&set(&["wlan1", "rndis0"]), &set(&["Rndis0", "bt-pan", "usb0"]));
        assert_eq!(delta.removals, ["rndis0", "wlan1"]);
        assert_eq!(delta.additions, ["Rndis0", "bt-pan", "usb0"]);
    }

    #[test]
    fn test_interfaces_unchanged() {
        assert!(diff_interfaces(&set(&["usb0"]), &set(&["usb0"])).is_empty());
    }

    #[test]
    fn test_snapshot_serde_defaults() {
        let snapshot: NetworkSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.is_empty());
    }
}

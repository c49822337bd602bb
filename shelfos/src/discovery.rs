//! Discovery: periodic announce plus on-demand query, maintaining a
//! TTL-bounded peer record table and remote-peripheral cache.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::identity::NodeId;
use crate::message::{Payload, PeripheralSummary};
use crate::peripheral::PeripheralDirectory;

/// Default interval between periodic announces.
pub const ANNOUNCE_INTERVAL_MS: Timestamp = 5_000;
/// Default age beyond which a peer or remote peripheral is considered gone.
/// Should be several multiples of the announce interval.
pub const ANNOUNCE_TTL_MS: Timestamp = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub label: String,
    pub last_heard: Timestamp,
    pub peripherals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeripheral {
    pub origin: NodeId,
    pub type_name: String,
    pub last_seen: Timestamp,
}

/// Resolution of a peripheral name against the local-first rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Local,
    Remote(NodeId),
    Unknown,
}

/// Per-node discovery state: peer records and remote peripheral cache, both
/// TTL-bounded, plus the local peripheral directory used for the
/// local-first rule.
pub struct Discovery {
    node_id: NodeId,
    label: String,
    announce_interval: Timestamp,
    ttl: Timestamp,
    peers: HashMap<NodeId, PeerRecord>,
    remote_peripherals: HashMap<String, RemotePeripheral>,
    last_announce: Timestamp,
}

impl Discovery {
    pub fn new(node_id: NodeId, label: impl Into<String>) -> Self {
        Self::with_intervals(node_id, label, ANNOUNCE_INTERVAL_MS, ANNOUNCE_TTL_MS)
    }

    pub fn with_intervals(
        node_id: NodeId,
        label: impl Into<String>,
        announce_interval: Timestamp,
        ttl: Timestamp,
    ) -> Self {
        Self {
            node_id,
            label: label.into(),
            announce_interval,
            ttl,
            peers: HashMap::new(),
            remote_peripherals: HashMap::new(),
            last_announce: 0,
        }
    }

    /// Build the ANNOUNCE payload for our locally attached peripherals.
    pub fn announce_payload(&self, local: &PeripheralDirectory) -> Payload {
        Payload::Announce {
            node_id: self.node_id.clone(),
            label: self.label.clone(),
            peripherals: local
                .descriptors()
                .iter()
                .map(|d| PeripheralSummary {
                    name: d.name.clone(),
                    type_name: d.type_name.clone(),
                })
                .collect(),
        }
    }

    /// Called on every scheduler tick; returns `Some(payload)` if a periodic
    /// announce is due.
    pub fn tick(&mut self, local: &PeripheralDirectory, now: Timestamp) -> Option<Payload> {
        if now - self.last_announce < self.announce_interval {
            return None;
        }
        self.last_announce = now;
        Some(self.announce_payload(local))
    }

    /// Handle a verified ANNOUNCE from a peer. Never inserts a remote
    /// peripheral entry for a name that collides with a local one
    /// (local-first rule).
    pub fn on_announce(
        &mut self,
        from: NodeId,
        label: String,
        peripherals: Vec<PeripheralSummary>,
        local: &PeripheralDirectory,
        now: Timestamp,
    ) {
        let names: Vec<String> = peripherals.iter().map(|p| p.name.clone()).collect();
        self.peers.insert(
            from.clone(),
            PeerRecord {
                label,
                last_heard: now,
                peripherals: names,
            },
        );

        for p in peripherals {
            if local.contains(&p.name) {
                continue;
            }
            self.remote_peripherals.insert(
                p.name,
                RemotePeripheral {
                    origin: from.clone(),
                    type_name: p.type_name,
                    last_seen: now,
                },
            );
        }
    }

    /// Build the DISCOVER payload for an on-demand query.
    pub fn discover_payload(&self) -> Payload {
        Payload::Discover
    }

    /// Evict peer records and remote peripherals whose last-seen age exceeds
    /// the TTL. Intended to run on every housekeeping tick.
    pub fn housekeeping(&mut self, now: Timestamp) {
        self.peers.retain(|_, p| now - p.last_heard <= self.ttl);
        self.remote_peripherals
            .retain(|_, r| now - r.last_seen <= self.ttl);
    }

    /// Resolve a peripheral name under the local-first rule.
    pub fn resolve(&self, name: &str, local: &PeripheralDirectory) -> Resolution {
        if local.contains(name) {
            return Resolution::Local;
        }
        match self.remote_peripherals.get(name) {
            Some(r) => Resolution::Remote(r.origin.clone()),
            None => Resolution::Unknown,
        }
    }

    pub fn peers(&self) -> &HashMap<NodeId, PeerRecord> {
        &self.peers
    }

    pub fn remote_peripherals(&self) -> &HashMap<String, RemotePeripheral> {
        &self.remote_peripherals
    }

    pub fn list_peers(&self) -> impl Iterator<Item = (&NodeId, &PeerRecord)> {
        self.peers.iter()
    }

    pub fn list_remote_peripherals(&self) -> impl Iterator<Item = (&String, &RemotePeripheral)> {
        self.remote_peripherals.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::{MockHost, PeripheralDirectory};

    #[test]
    fn local_peripherals_take_precedence_over_remote_announces() {
        let a_host = MockHost::new().attach("me_bridge_0", "battery", ["getStoredEnergy"]);
        let a_local = PeripheralDirectory::rescan(&a_host);
        let mut a = Discovery::new(NodeId::new("A"), "node-a");

        a.on_announce(
            NodeId::new("B"),
            "node-b".into(),
            vec![PeripheralSummary {
                name: "me_bridge_0".into(),
                type_name: "battery".into(),
            }],
            &a_local,
            1_000,
        );

        assert_eq!(a.resolve("me_bridge_0", &a_local), Resolution::Local);
        assert!(a.list_remote_peripherals().next().is_none());
    }

    #[test]
    fn remote_peripheral_resolves_to_its_origin() {
        let empty_local = PeripheralDirectory::default();
        let mut a = Discovery::new(NodeId::new("A"), "node-a");

        a.on_announce(
            NodeId::new("B"),
            "node-b".into(),
            vec![PeripheralSummary {
                name: "relay_0".into(),
                type_name: "switch".into(),
            }],
            &empty_local,
            1_000,
        );

        assert_eq!(
            a.resolve("relay_0", &empty_local),
            Resolution::Remote(NodeId::new("B"))
        );
    }

    #[test]
    fn stale_peer_is_evicted_after_ttl() {
        let local = PeripheralDirectory::default();
        let mut a = Discovery::with_intervals(NodeId::new("A"), "node-a", 5_000, 30_000);

        a.on_announce(NodeId::new("B"), "node-b".into(), vec![], &local, 0);
        assert!(a.peers().contains_key(&NodeId::new("B")));

        a.housekeeping(30_001);
        assert!(!a.peers().contains_key(&NodeId::new("B")));
    }

    #[test]
    fn periodic_announce_is_due_on_interval() {
        let local = PeripheralDirectory::default();
        let mut a = Discovery::new(NodeId::new("A"), "node-a");

        assert!(a.tick(&local, 0).is_some());
        assert!(a.tick(&local, 1_000).is_none());
        assert!(a.tick(&local, ANNOUNCE_INTERVAL_MS).is_some());
    }
}

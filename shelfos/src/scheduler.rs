//! Cooperative single-threaded event loop wiring every subsystem together.
//! The host runtime drives this by calling `tick` and `on_receive` from its
//! own loop; nothing here spawns a thread or blocks.
use crate::clock::{RefClock, Timestamp};
use crate::codec;
use crate::discovery::Discovery;
use crate::envelope::{self, NonceCache};
use crate::identity::{NodeId, Secret};
use crate::message::{CallOutcome, Payload};
use crate::peripheral::{HostPeripherals, PeripheralDirectory};
use crate::rpc::{self, RpcClient};

use serde::{Deserialize, Serialize};

/// Seam to the host runtime's broadcast-capable radio network: a
/// single shared medium, no addressed unicast at the transport layer.
pub trait Radio {
    fn broadcast(&mut self, bytes: &[u8]);
    fn try_recv(&mut self) -> Option<Vec<u8>>;
}

/// Simple per-kind counters surfaced to the operator. Plain
/// fields rather than a metrics crate -- there is no exporter to feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub discover: u64,
    pub call: u64,
    pub announce: u64,
    pub rx: u64,
    pub rescan: u64,
    pub error: u64,
}

/// Outcome of feeding one wire frame through the scheduler: what, if
/// anything, it caused us to emit, and whether an RPC result resolved.
#[derive(Debug, Default)]
pub struct Reaction {
    pub to_send: Vec<Payload>,
    pub resolved_call: Option<(String, rpc::CallResult)>,
}

/// The cooperative core: owns clock, identity, the local peripheral
/// directory, discovery state, the RPC pending-call table and the nonce
/// cache. Pairing is driven separately (see [`crate::pairing`]) and its
/// resulting credentials are installed here via `set_swarm_secret`.
pub struct Scheduler {
    node_id: NodeId,
    label: String,
    clock: RefClock,
    swarm_secret: Option<Secret>,
    nonces: NonceCache,
    local: PeripheralDirectory,
    discovery: Discovery,
    rpc: RpcClient,
    activity: Activity,
    last_housekeeping: Timestamp,
}

/// How often housekeeping (nonce sweep, peer/remote-peripheral eviction,
/// pending-call timeout sweep) runs, independent of the announce interval.
pub const HOUSEKEEPING_INTERVAL_MS: Timestamp = 1_000;

impl Scheduler {
    pub fn new(node_id: NodeId, label: impl Into<String>, clock: RefClock) -> Self {
        let label = label.into();
        Self {
            discovery: Discovery::new(node_id.clone(), label.clone()),
            node_id,
            label,
            clock,
            swarm_secret: None,
            nonces: NonceCache::new(),
            local: PeripheralDirectory::default(),
            rpc: RpcClient::new(),
            activity: Activity::default(),
            last_housekeeping: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn local_peripherals(&self) -> &PeripheralDirectory {
        &self.local
    }

    pub fn is_enrolled(&self) -> bool {
        self.swarm_secret.is_some()
    }

    /// Install the swarm secret obtained through pairing. All general
    /// traffic (ANNOUNCE, DISCOVER, CALL, RESULT) is authenticated with it,
    /// since it is the one key every enrolled peer holds in common.
    pub fn set_swarm_secret(&mut self, secret: Secret) {
        self.swarm_secret = Some(secret);
    }

    /// Re-read the host's attached peripherals.
    pub fn rescan(&mut self, host: &dyn HostPeripherals) {
        self.local = PeripheralDirectory::rescan(host);
        self.activity.rescan += 1;
    }

    fn wrap(&self, payload: &Payload) -> Option<Vec<u8>> {
        let secret = self.swarm_secret.as_ref()?;
        let now = self.clock.timestamp_millis();
        let envelope = envelope::wrap(&payload.to_value(), &self.node_id, secret, now);
        Some(codec::encode(&envelope::to_wire_value(&envelope)))
    }

    /// Advance time-driven work: periodic announce and housekeeping. Call
    /// on every iteration of the host's loop. Returns the request ids of any
    /// RPC calls that timed out this tick, so the caller can notify whoever
    /// is waiting on them.
    pub fn tick(&mut self, radio: &mut dyn Radio) -> Vec<String> {
        let now = self.clock.timestamp_millis();

        if let Some(payload) = self.discovery.tick(&self.local, now) {
            self.activity.announce += 1;
            if let Some(bytes) = self.wrap(&payload) {
                radio.broadcast(&bytes);
            }
        }

        if now - self.last_housekeeping < HOUSEKEEPING_INTERVAL_MS {
            return Vec::new();
        }
        self.last_housekeeping = now;
        self.nonces.sweep(now);
        self.discovery.housekeeping(now);
        let timed_out = self.rpc.housekeeping(now);
        self.activity.error += timed_out.len() as u64;
        timed_out
    }

    /// Decode and authenticate one inbound frame, dispatching it to the
    /// right subsystem. Returns any payloads the caller should broadcast in
    /// response, plus a resolved RPC result if this frame was a RESULT.
    pub fn on_receive(&mut self, host: &dyn HostPeripherals, bytes: &[u8]) -> Reaction {
        self.activity.rx += 1;
        let mut reaction = Reaction::default();

        let Some(secret) = self.swarm_secret.clone() else {
            return reaction;
        };
        let Ok(value) = codec::decode(bytes) else {
            self.activity.error += 1;
            return reaction;
        };
        let Ok(envelope) = envelope::from_wire_value(&value) else {
            self.activity.error += 1;
            return reaction;
        };

        let now = self.clock.timestamp_millis();
        let unwrapped = envelope::unwrap(&envelope, |_| Some(secret.clone()), &mut self.nonces, now);
        let (payload_value, from) = match unwrapped {
            Ok(ok) => ok,
            Err(_) => {
                self.activity.error += 1;
                return reaction;
            }
        };
        let Ok(payload) = Payload::from_value(&payload_value) else {
            self.activity.error += 1;
            return reaction;
        };

        match payload {
            Payload::Announce {
                node_id,
                label,
                peripherals,
            } => {
                self.discovery
                    .on_announce(node_id, label, peripherals, &self.local, now);
            }
            Payload::Discover => {
                self.activity.discover += 1;
                reaction.to_send.push(self.discovery.announce_payload(&self.local));
            }
            Payload::Call {
                request_id,
                peripheral_name,
                method,
                args,
            } => {
                self.activity.call += 1;
                let call = Payload::Call {
                    request_id,
                    peripheral_name,
                    method,
                    args,
                };
                reaction.to_send.push(rpc::serve(host, &call));
            }
            Payload::Result { request_id, outcome } => {
                if let Some(resolved) = self.rpc.on_result(&request_id, outcome.clone()) {
                    reaction.resolved_call = Some((request_id, resolved));
                } else if matches!(outcome, CallOutcome::Err(_)) {
                    self.activity.error += 1;
                }
            }
            Payload::PairReady { .. } | Payload::PairDeliver { .. } | Payload::PairComplete { .. } => {
                // Pairing is driven by the caller through `crate::pairing`
                // directly; the scheduler only routes post-enrollment traffic.
            }
        }
        let _ = from;
        reaction
    }

    /// Encode and send a payload produced elsewhere (e.g. a [`Reaction`] or
    /// an RPC CALL built via [`crate::rpc::RpcClient::call`]).
    pub fn send(&self, radio: &mut dyn Radio, payload: &Payload) {
        if let Some(bytes) = self.wrap(payload) {
            radio.broadcast(&bytes);
        }
    }

    pub fn rpc_client_mut(&mut self) -> &mut RpcClient {
        &mut self.rpc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::MockHost;

    struct LoopbackRadio {
        outbox: Vec<Vec<u8>>,
    }

    impl Radio for LoopbackRadio {
        fn broadcast(&mut self, bytes: &[u8]) {
            self.outbox.push(bytes.to_vec());
        }
        fn try_recv(&mut self) -> Option<Vec<u8>> {
            self.outbox.pop()
        }
    }

    fn enrolled(node_id: &str) -> Scheduler {
        let mut s = Scheduler::new(NodeId::new(node_id), format!("node-{node_id}"), RefClock::new(crate::clock::LocalTime::from_millis(0)));
        s.set_swarm_secret(Secret::from_raw("s".repeat(32)));
        s
    }

    #[test]
    fn announce_round_trips_between_two_schedulers() {
        let host_a = MockHost::new().attach("me_bridge_0", "battery", ["getStoredEnergy"]);
        let mut a = enrolled("A");
        a.rescan(&host_a);

        let mut b = enrolled("B");
        let mut radio = LoopbackRadio { outbox: Vec::new() };

        a.tick(&mut radio);
        let frame = radio.try_recv().expect("announce was broadcast");

        let host_b = MockHost::new();
        b.on_receive(&host_b, &frame);

        assert!(matches!(
            b.discovery().resolve("me_bridge_0", b.local_peripherals()),
            crate::discovery::Resolution::Remote(_)
        ));
    }

    #[test]
    fn unenrolled_scheduler_ignores_inbound_frames() {
        let host = MockHost::new();
        let mut s = Scheduler::new(NodeId::new("A"), "node-a", RefClock::now());
        let reaction = s.on_receive(&host, b"garbage");
        assert!(reaction.to_send.is_empty());
        assert!(reaction.resolved_call.is_none());
    }

    #[test]
    fn call_is_served_and_result_resolves_the_pending_entry() {
        let host_a = MockHost::new().attach("me_bridge_0", "battery", ["getStoredEnergy"]);
        let mut a = enrolled("A");
        a.rescan(&host_a);

        let mut b = enrolled("B");
        let mut radio = LoopbackRadio { outbox: Vec::new() };

        let (request_id, call) = b.rpc_client_mut().call(
            NodeId::new("A"),
            "me_bridge_0",
            "getStoredEnergy",
            vec![],
            0,
        );
        b.send(&mut radio, &call);
        let frame = radio.try_recv().unwrap();

        let reaction = a.on_receive(&host_a, &frame);
        assert_eq!(reaction.to_send.len(), 1);
        a.send(&mut radio, &reaction.to_send[0]);
        let result_frame = radio.try_recv().unwrap();

        let host_b = MockHost::new();
        let reaction = b.on_receive(&host_b, &result_frame);
        let (resolved_id, outcome) = reaction.resolved_call.unwrap();
        assert_eq!(resolved_id, request_id);
        assert_eq!(
            outcome,
            rpc::CallResult::Ok(vec![crate::codec::Value::Int(500_000)])
        );
    }
}

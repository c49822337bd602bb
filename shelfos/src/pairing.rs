//! Pairing: bootstraps a worker into a swarm without a prior shared secret,
//! using a short out-of-band code as an ephemeral key.
use std::collections::HashMap;

use thiserror::Error;

use crate::clock::Timestamp;
use crate::envelope::{self, Envelope, NonceCache};
use crate::identity::{NodeId, Secret};
use crate::message::Payload;
use crate::queen::{Credentials, QueenAuthority};

/// How often a worker re-broadcasts `PAIR_READY` while advertising.
pub const ADVERTISE_INTERVAL_MS: Timestamp = 2_000;
/// How long a candidate is kept in the queen's listening list.
pub const CANDIDATE_TTL_MS: Timestamp = 15_000;
/// Total queen-side pairing session timeout.
pub const QUEEN_SESSION_TIMEOUT_MS: Timestamp = 30_000;
/// How long the queen waits for `PAIR_COMPLETE` after delivering credentials.
pub const DELIVER_ACK_TIMEOUT_MS: Timestamp = 5_000;

fn generate_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = fastrand::Rng::new();
    let mut group = || -> String {
        (0..4)
            .map(|_| ALPHABET[rng.usize(..ALPHABET.len())] as char)
            .collect()
    };
    format!("{}-{}", group(), group())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no pairing in progress")]
    NoSession,
    #[error("pairing session timed out")]
    TimedOut,
    #[error("operator cancelled the pairing session")]
    OperatorCancelled,
}

// ---- Worker side --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Advertising,
    Joined,
}

/// Worker-side pairing state machine: `IDLE -> ADVERTISING -> JOINED`, with
/// any bad `PAIR_DELIVER` in `ADVERTISING` looping back to `ADVERTISING`
/// (rather than a separate observable `VERIFYING` state).
pub struct WorkerPairing {
    node_id: NodeId,
    label: String,
    code: Option<String>,
    started_at: Timestamp,
    last_broadcast: Timestamp,
    state: WorkerState,
}

impl WorkerPairing {
    pub fn new(node_id: NodeId, label: impl Into<String>) -> Self {
        Self {
            node_id,
            label: label.into(),
            code: None,
            started_at: 0,
            last_broadcast: 0,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Begin advertising with a fresh ephemeral code. Returns the
    /// `PAIR_READY` payload to broadcast immediately.
    pub fn start(&mut self, now: Timestamp) -> Payload {
        let code = generate_code();
        let payload = Payload::PairReady {
            node_id: self.node_id.clone(),
            label: self.label.clone(),
            code: code.clone(),
        };
        self.code = Some(code);
        self.started_at = now;
        self.last_broadcast = now;
        self.state = WorkerState::Advertising;
        payload
    }

    /// Called on every scheduler tick. Returns `Some(payload)` with a
    /// `PAIR_READY` re-broadcast if one is due.
    pub fn tick(&mut self, now: Timestamp) -> Option<Payload> {
        if self.state != WorkerState::Advertising {
            return None;
        }
        if now - self.last_broadcast < ADVERTISE_INTERVAL_MS {
            return None;
        }
        self.last_broadcast = now;
        Some(Payload::PairReady {
            node_id: self.node_id.clone(),
            label: self.label.clone(),
            code: self.code.clone().unwrap_or_default(),
        })
    }

    /// Handle an inbound envelope that might carry a `PAIR_DELIVER` for us,
    /// verified with the locally displayed code as the shared secret. On a
    /// bad code the state machine stays in `ADVERTISING` so the worker keeps
    /// broadcasting and the operator can retry.
    pub fn on_envelope(&mut self, envelope: &Envelope, now: Timestamp) -> Option<Credentials> {
        if self.state != WorkerState::Advertising {
            return None;
        }
        let Some(code) = self.code.clone() else {
            return None;
        };
        let mut nonces = NonceCache::new();
        let (payload, _) = envelope::unwrap(
            envelope,
            |_| Some(Secret::from_raw(code.clone())),
            &mut nonces,
            now,
        )
        .ok()?;

        let Ok(Payload::PairDeliver { credentials }) = Payload::from_value(&payload) else {
            return None;
        };
        self.state = WorkerState::Joined;
        Some(credentials)
    }

    /// Build the `PAIR_COMPLETE` payload to send once credentials have been
    /// persisted.
    pub fn complete_payload(&self, final_label: impl Into<String>) -> Payload {
        Payload::PairComplete {
            node_id: self.node_id.clone(),
            label: final_label.into(),
        }
    }

    pub fn cancel(&mut self) {
        self.state = WorkerState::Idle;
        self.code = None;
    }
}

// ---- Queen side -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub node_id: NodeId,
    pub label: String,
    pub code: String,
    pub last_seen: Timestamp,
}

/// Short-lived candidate list the queen collects `PAIR_READY` broadcasts
/// into while `LISTENING`.
#[derive(Debug, Default)]
pub struct Candidates(HashMap<NodeId, Candidate>);

impl Candidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a `PAIR_READY` sighting. Duplicates from the same
    /// worker refresh the entry rather than duplicating it.
    pub fn observe(&mut self, node_id: NodeId, label: String, code: String, now: Timestamp) {
        self.0.insert(
            node_id.clone(),
            Candidate {
                node_id,
                label,
                code,
                last_seen: now,
            },
        );
    }

    pub fn evict_stale(&mut self, now: Timestamp) {
        self.0.retain(|_, c| now - c.last_seen <= CANDIDATE_TTL_MS);
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&Candidate> {
        self.0.get(node_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Candidate> {
        self.0.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueenState {
    Listening,
    Selected,
    Delivering,
    Committed,
    Cancelled,
}

/// Queen-side pairing session, driven by the operator's "Add Computer" flow.
pub struct QueenPairing {
    state: QueenState,
    peer_id: Option<NodeId>,
    started_at: Timestamp,
    deliver_deadline: Timestamp,
}

impl QueenPairing {
    pub fn new(now: Timestamp) -> Self {
        Self {
            state: QueenState::Listening,
            peer_id: None,
            started_at: now,
            deliver_deadline: 0,
        }
    }

    pub fn state(&self) -> &QueenState {
        &self.state
    }

    /// Operator selects a candidate from the listening list.
    pub fn select(&mut self, candidate: &Candidate) {
        self.peer_id = Some(candidate.node_id.clone());
        self.state = QueenState::Selected;
    }

    /// Operator typed the code shown on the worker's screen; deliver
    /// credentials signed with it.
    pub fn deliver(
        &mut self,
        queen: &mut QueenAuthority,
        label: Option<String>,
        code: &str,
        now: Timestamp,
    ) -> Result<Envelope, Error> {
        let peer_id = self.peer_id.clone().ok_or(Error::NoSession)?;
        let credentials = queen.reserve(peer_id.clone(), label, now);
        let payload = Payload::PairDeliver {
            credentials: credentials.clone(),
        }
        .to_value();
        let envelope = envelope::wrap_to(
            &payload,
            &queen.identity().queen_node_id.clone(),
            &peer_id,
            &Secret::from_raw(code),
            now,
        );
        self.state = QueenState::Delivering;
        self.deliver_deadline = now + DELIVER_ACK_TIMEOUT_MS;
        Ok(envelope)
    }

    /// Worker confirmed receipt; commit the reservation.
    pub fn on_pair_complete(
        &mut self,
        node_id: &NodeId,
        label: String,
        queen: &mut QueenAuthority,
        now: Timestamp,
    ) -> Result<bool, crate::queen::Error> {
        if self.state != QueenState::Delivering || self.peer_id.as_ref() != Some(node_id) {
            return Ok(false);
        }
        queen.commit(node_id, Some(label), now)?;
        self.state = QueenState::Committed;
        Ok(true)
    }

    /// Called on every scheduler tick. Returns an error and transitions to
    /// `Cancelled` if the session (or the delivery ack wait) has timed out.
    pub fn tick(&mut self, now: Timestamp) -> Result<(), Error> {
        if matches!(self.state, QueenState::Committed | QueenState::Cancelled) {
            return Ok(());
        }
        if now - self.started_at > QUEEN_SESSION_TIMEOUT_MS {
            self.state = QueenState::Cancelled;
            return Err(Error::TimedOut);
        }
        if self.state == QueenState::Delivering && now > self.deliver_deadline {
            self.state = QueenState::Cancelled;
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.state = QueenState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SwarmIdentity;
    use crate::trust::Registry;

    fn queen_authority() -> QueenAuthority {
        let identity = SwarmIdentity::create("kitchen-swarm", NodeId::new("queen"), 0);
        QueenAuthority::new(identity, Registry::in_memory())
    }

    #[test]
    fn full_pairing_happy_path() {
        let mut worker = WorkerPairing::new(NodeId::new("worker-1"), "kitchen-pi");
        let ready = worker.start(0);
        let Payload::PairReady { code, node_id, label } = ready.clone() else {
            panic!("expected PAIR_READY")
        };

        let mut candidates = Candidates::new();
        candidates.observe(node_id.clone(), label, code.clone(), 100);

        let mut queen = queen_authority();
        let mut session = QueenPairing::new(100);
        session.select(candidates.get(&node_id).unwrap());

        let deliver_env = session.deliver(&mut queen, None, &code, 200).unwrap();

        let credentials = worker.on_envelope(&deliver_env, 300).expect("valid code accepted");
        assert_eq!(credentials.peer_id, node_id);

        let complete = worker.complete_payload("kitchen-pi");
        let Payload::PairComplete { node_id: completed_id, label } = complete else {
            panic!("expected PAIR_COMPLETE")
        };

        let committed = session
            .on_pair_complete(&completed_id, label, &mut queen, 300)
            .unwrap();
        assert!(committed);
        assert!(queen.registry().is_authorized(&node_id));
        assert_eq!(*worker.state(), WorkerState::Joined);
    }

    #[test]
    fn wrong_code_is_rejected_and_worker_stays_advertising() {
        let mut worker = WorkerPairing::new(NodeId::new("worker-1"), "kitchen-pi");
        worker.start(0);
        let node_id = worker.node_id.clone();

        let mut queen = queen_authority();
        let credentials = queen.reserve(node_id.clone(), None, 0);
        let payload = Payload::PairDeliver { credentials }.to_value();
        let bad_envelope = envelope::wrap_to(
            &payload,
            &queen.identity().queen_node_id.clone(),
            &node_id,
            &Secret::from_raw("ABCD-EFGI"),
            10,
        );

        let result = worker.on_envelope(&bad_envelope, 10);
        assert!(result.is_none());
        assert_eq!(*worker.state(), WorkerState::Advertising);
    }

    #[test]
    fn duplicate_pair_ready_refreshes_not_duplicates() {
        let mut candidates = Candidates::new();
        let id = NodeId::new("worker-1");
        candidates.observe(id.clone(), "a".into(), "CODE-0001".into(), 0);
        candidates.observe(id.clone(), "a".into(), "CODE-0001".into(), 10);

        assert_eq!(candidates.list().count(), 1);
        assert_eq!(candidates.get(&id).unwrap().last_seen, 10);
    }

    #[test]
    fn stale_candidate_is_evicted() {
        let mut candidates = Candidates::new();
        let id = NodeId::new("worker-1");
        candidates.observe(id.clone(), "a".into(), "CODE-0001".into(), 0);

        candidates.evict_stale(CANDIDATE_TTL_MS + 1);
        assert!(candidates.get(&id).is_none());
    }

    #[test]
    fn queen_session_times_out_after_thirty_seconds() {
        let mut session = QueenPairing::new(0);
        assert!(session.tick(QUEEN_SESSION_TIMEOUT_MS + 1).is_err());
        assert_eq!(*session.state(), QueenState::Cancelled);
    }

    #[test]
    fn repairing_an_authorized_worker_keeps_its_secret() {
        let mut queen = queen_authority();
        let node_id = NodeId::new("worker-1");
        queen
            .registry_mut()
            .upsert(node_id.clone(), "old-label", Secret::from_raw("s".repeat(32)), 0);

        let mut session = QueenPairing::new(0);
        session.select(&Candidate {
            node_id: node_id.clone(),
            label: "new-label".into(),
            code: "CODE-0001".into(),
            last_seen: 0,
        });
        session.deliver(&mut queen, Some("new-label".into()), "CODE-0001", 0).unwrap();
        session
            .on_pair_complete(&node_id, "new-label".into(), &mut queen, 0)
            .unwrap();

        let entry = queen.registry().get(&node_id).unwrap();
        assert_eq!(entry.secret.expose(), "s".repeat(32));
        assert_eq!(entry.label, "new-label");
    }
}

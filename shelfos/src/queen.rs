//! Queen Authority: owns the swarm identity and issues per-peer secrets via
//! a two-phase pairing session (reserve / commit / cancel).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;
use crate::identity::{NodeId, Secret, SwarmIdentity};
use crate::trust::{Registry, RegistryEntry, Status};

/// Credentials handed to a peer as the result of a pairing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub peer_id: NodeId,
    pub peer_secret: Secret,
    pub swarm_id: String,
    pub swarm_secret: Secret,
    pub swarm_fingerprint: String,
}

/// A reservation in progress: a snapshot of the prior entry so `cancel` can
/// restore it exactly, making re-pairing idempotent.
#[derive(Debug, Clone)]
struct Pending {
    secret: Secret,
    label: Option<String>,
    prior: Option<RegistryEntry>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no pending pairing session for {0}")]
    NoPending(NodeId),
    #[error(transparent)]
    Registry(#[from] crate::trust::Error),
}

/// Facade over the swarm identity and trust registry that implements the
/// queen's half of enrollment.
pub struct QueenAuthority {
    identity: SwarmIdentity,
    registry: Registry,
    pending: HashMap<NodeId, Pending>,
}

impl QueenAuthority {
    pub fn new(identity: SwarmIdentity, registry: Registry) -> Self {
        Self {
            identity,
            registry,
            pending: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &SwarmIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Reserve credentials for a peer. If no pending session exists,
    /// generates a fresh per-peer secret -- unless the peer is already an
    /// active entry, in which case its existing secret is reused, so a
    /// re-pair does not invalidate a peer that is still authorized.
    pub fn reserve(&mut self, peer_id: NodeId, label: Option<String>, now: Timestamp) -> Credentials {
        if !self.pending.contains_key(&peer_id) {
            let prior = self.registry.get(&peer_id).cloned();
            let secret = match &prior {
                Some(entry) if entry.status == Status::Active => entry.secret.clone(),
                _ => Secret::generate(),
            };
            self.pending.insert(
                peer_id.clone(),
                Pending {
                    secret,
                    label,
                    prior,
                },
            );
        }
        let pending = &self.pending[&peer_id];
        let _ = now;
        Credentials {
            peer_id,
            peer_secret: pending.secret.clone(),
            swarm_id: self.identity.swarm_id.clone(),
            swarm_secret: self.identity.swarm_secret.clone(),
            swarm_fingerprint: self.identity.fingerprint(),
        }
    }

    /// Commit a pending reservation into the registry as an active entry.
    pub fn commit(
        &mut self,
        peer_id: &NodeId,
        label: Option<String>,
        now: Timestamp,
    ) -> Result<Credentials, Error> {
        let pending = self
            .pending
            .remove(peer_id)
            .ok_or_else(|| Error::NoPending(peer_id.clone()))?;
        let label = label.or(pending.label).unwrap_or_else(|| peer_id.to_string());

        self.registry
            .upsert(peer_id.clone(), label, pending.secret.clone(), now);
        self.registry.save()?;

        Ok(Credentials {
            peer_id: peer_id.clone(),
            peer_secret: pending.secret,
            swarm_id: self.identity.swarm_id.clone(),
            swarm_secret: self.identity.swarm_secret.clone(),
            swarm_fingerprint: self.identity.fingerprint(),
        })
    }

    /// Roll back a reservation: restore the prior entry (or remove the
    /// tentative one if there was none) and persist.
    pub fn cancel(&mut self, peer_id: &NodeId) -> Result<(), Error> {
        if let Some(pending) = self.pending.remove(peer_id) {
            match pending.prior {
                Some(entry) => self.registry.add(peer_id.clone(), entry),
                None => {
                    self.registry.remove(peer_id);
                }
            }
            self.registry.save()?;
        }
        Ok(())
    }

    /// Convenience: reserve then immediately commit.
    pub fn issue(
        &mut self,
        peer_id: NodeId,
        label: Option<String>,
        now: Timestamp,
    ) -> Result<Credentials, Error> {
        self.reserve(peer_id.clone(), label.clone(), now);
        self.commit(&peer_id, label, now)
    }

    pub fn has_pending(&self, peer_id: &NodeId) -> bool {
        self.pending.contains_key(peer_id)
    }
}

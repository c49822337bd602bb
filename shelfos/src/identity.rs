//! Node and swarm identity: the types every other module keys its tables by.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clock::Timestamp;

const SECRET_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const SECRET_LEN: usize = 32;

/// A peer's identifier on the radio network. Opaque and stable for the
/// lifetime of the node's enrollment; the host runtime is free to generate
/// it however it likes (MAC-derived, random, etc). We only require it be a
/// short, printable token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random node id, e.g. for a worker provisioning
    /// itself for the first time.
    pub fn generate() -> Self {
        let mut rng = fastrand::Rng::new();
        let bytes: [u8; 8] = std::array::from_fn(|_| rng.u8(..));
        Self(hex(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
#[error("node id must not be empty")]
pub struct NodeIdParseError;

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeIdParseError);
        }
        Ok(Self(s.to_owned()))
    }
}

/// A per-peer or swarm shared secret. Never given a `Display`/`Debug` that
/// prints the raw value -- secrets are never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(String);

impl Secret {
    pub fn generate() -> Self {
        let mut rng = fastrand::Rng::new();
        let s: String = (0..SECRET_LEN)
            .map(|_| {
                let idx = rng.usize(..SECRET_ALPHABET.len());
                SECRET_ALPHABET[idx] as char
            })
            .collect();
        Self(s)
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A 12-character hex grouping derived from a hash of the secret, safe
    /// to display and log: `f3a1-9c02-7bde`.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.0.as_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted>)")
    }
}

fn fingerprint_of(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    let grouped = hex(&digest[..6]);
    format!(
        "{}-{}-{}",
        &grouped[0..4],
        &grouped[4..8],
        &grouped[8..12]
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The queen's swarm identity. Created once at swarm-creation time, never
/// mutated thereafter; destroyed only on full swarm delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmIdentity {
    pub swarm_id: String,
    pub display_name: String,
    pub swarm_secret: Secret,
    pub created_at: Timestamp,
    pub queen_node_id: NodeId,
}

impl SwarmIdentity {
    pub fn create(display_name: impl Into<String>, queen_node_id: NodeId, now: Timestamp) -> Self {
        let swarm_secret = Secret::generate();
        Self {
            swarm_id: NodeId::generate().as_str().to_owned(),
            display_name: display_name.into(),
            swarm_secret,
            created_at: now,
            queen_node_id,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.swarm_secret.fingerprint()
    }
}

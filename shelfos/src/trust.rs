//! Trust Registry: persistent mapping from peer id to per-peer shared
//! secret and status. Exactly one entry per peer; `get_secret` only
//! returns a secret for an active entry.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;
use crate::identity::{NodeId, Secret};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Revoked,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub label: String,
    pub secret: Secret,
    pub added_at: Timestamp,
    pub status: Status,
    pub revoked_at: Option<Timestamp>,
}

impl RegistryEntry {
    pub fn fingerprint(&self) -> String {
        self.secret.fingerprint()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open registry file: {0}")]
    CannotOpen(#[from] io::Error),
    #[error("registry file is corrupt: {0}")]
    InvalidFile(#[from] serde_json::Error),
    #[error("no entry found for peer {0}")]
    NotFound(NodeId),
}

/// On-disk shape of the registry file ("serialized maps with a
/// `version` field; readers MUST tolerate forward-compatible additions").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: HashMap<NodeId, RegistryEntry>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: 1,
            entries: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Persistent dictionary of peer trust entries, backed by a JSON file.
#[derive(Debug)]
pub struct Registry {
    path: Option<PathBuf>,
    file: RegistryFile,
}

impl Registry {
    /// An in-memory registry with nothing persisted -- useful for tests and
    /// for a worker that hasn't enrolled yet.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: RegistryFile::default(),
        }
    }

    /// Load a registry from disk, or start fresh if no file exists yet (a
    /// missing file is not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(Error::CannotOpen(e)),
        };
        Ok(Self {
            path: Some(path),
            file,
        })
    }

    /// Persist the registry. Atomic from the caller's point of view: the
    /// new content is written to a temp file in the same directory, then
    /// renamed over the target (the rename-over pattern).
    pub fn save(&self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = if let Some(dir) = dir {
            tempfile::NamedTempFile::new_in(dir)
        } else {
            tempfile::NamedTempFile::new()
        }
        .map_err(Error::CannotOpen)?;

        serde_json::to_writer_pretty(&mut tmp, &self.file)?;
        tmp.persist(path).map_err(|e| Error::CannotOpen(e.error))?;
        Ok(())
    }

    /// Delete the registry file entirely (full swarm delete).
    pub fn delete(&mut self) -> Result<(), Error> {
        if let Some(path) = &self.path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::CannotOpen(e)),
            }
        }
        self.file = RegistryFile::default();
        Ok(())
    }

    pub fn add(&mut self, id: NodeId, entry: RegistryEntry) {
        self.file.entries.insert(id, entry);
    }

    /// Replace label and/or secret for a peer, reset status to active and
    /// refresh the added-at timestamp. Idempotent.
    pub fn upsert(&mut self, id: NodeId, label: impl Into<String>, secret: Secret, now: Timestamp) {
        self.file.entries.insert(
            id,
            RegistryEntry {
                label: label.into(),
                secret,
                added_at: now,
                status: Status::Active,
                revoked_at: None,
            },
        );
    }

    pub fn get(&self, id: &NodeId) -> Option<&RegistryEntry> {
        self.file.entries.get(id)
    }

    /// The peer's shared secret, but only if the entry is active.
    pub fn get_secret(&self, id: &NodeId) -> Option<Secret> {
        self.get(id)
            .filter(|e| e.status == Status::Active)
            .map(|e| e.secret.clone())
    }

    pub fn is_authorized(&self, id: &NodeId) -> bool {
        self.get(id).map(|e| e.status == Status::Active).unwrap_or(false)
    }

    pub fn revoke(&mut self, id: &NodeId, now: Timestamp) -> Result<(), Error> {
        let entry = self
            .file
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        entry.status = Status::Revoked;
        entry.revoked_at = Some(now);
        Ok(())
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<RegistryEntry> {
        self.file.entries.remove(id)
    }

    pub fn list_active(&self) -> impl Iterator<Item = (&NodeId, &RegistryEntry)> {
        self.file
            .entries
            .iter()
            .filter(|(_, e)| e.status == Status::Active)
    }

    pub fn count_active(&self) -> usize {
        self.list_active().count()
    }
}

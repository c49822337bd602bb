//! Per-node configuration: identity, display label, and enrollment state
//! once paired into a swarm. Same load/save shape as the trust registry --
//! missing file is a fresh start, writes go through a temp file rename.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{NodeId, Secret};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentConfig {
    pub swarm_id: String,
    pub swarm_secret: Secret,
    pub swarm_fingerprint: String,
    pub queen_node_id: NodeId,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open config file: {0}")]
    CannotOpen(#[from] io::Error),
    #[error("config file is corrupt: {0}")]
    InvalidFile(#[from] serde_json::Error),
}

/// On-disk shape. Readers must tolerate forward-compatible additions, so
/// unknown top-level keys round-trip through `extra` rather than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    version: u32,
    node_id: NodeId,
    label: String,
    enrollment: Option<EnrollmentConfig>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl RawConfig {
    fn fresh(node_id: NodeId, label: String) -> Self {
        Self {
            version: 1,
            node_id,
            label,
            enrollment: None,
            extra: serde_json::Map::new(),
        }
    }
}

pub struct Config {
    path: Option<PathBuf>,
    raw: RawConfig,
}

impl Config {
    /// A config that lives only in memory -- used by tests and by tools
    /// that operate on a node without a filesystem-backed profile.
    pub fn in_memory(node_id: NodeId, label: impl Into<String>) -> Self {
        Self {
            path: None,
            raw: RawConfig::fresh(node_id, label.into()),
        }
    }

    /// Load a config from disk, generating a fresh node identity if no
    /// file exists yet (first run).
    pub fn load(path: impl AsRef<Path>, default_label: impl Into<String>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let raw = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                RawConfig::fresh(NodeId::generate(), default_label.into())
            }
            Err(e) => return Err(Error::CannotOpen(e)),
        };
        Ok(Self {
            path: Some(path),
            raw,
        })
    }

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

        serde_json::to_writer_pretty(&mut tmp, &self.raw)?;
        tmp.persist(path).map_err(|e| Error::CannotOpen(e.error))?;
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.raw.node_id
    }

    pub fn label(&self) -> &str {
        &self.raw.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.raw.label = label.into();
    }

    pub fn enrollment(&self) -> Option<&EnrollmentConfig> {
        self.raw.enrollment.as_ref()
    }

    pub fn swarm_secret(&self) -> Option<&Secret> {
        self.raw.enrollment.as_ref().map(|e| &e.swarm_secret)
    }

    pub fn enroll(&mut self, enrollment: EnrollmentConfig) {
        self.raw.enrollment = Some(enrollment);
    }

    pub fn clear_enrollment(&mut self) {
        self.raw.enrollment = None;
    }

    pub fn is_enrolled(&self) -> bool {
        self.raw.enrollment.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment() -> EnrollmentConfig {
        EnrollmentConfig {
            swarm_id: "swarm-1".into(),
            swarm_secret: Secret::from_raw("s".repeat(32)),
            swarm_fingerprint: "aaaa-bbbb-cccc".into(),
            queen_node_id: NodeId::new("queen"),
        }
    }

    #[test]
    fn fresh_load_generates_a_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("config.json"), "kitchen-pi").unwrap();
        assert!(!config.node_id().as_str().is_empty());
        assert_eq!(config.label(), "kitchen-pi");
        assert!(!config.is_enrolled());
    }

    #[test]
    fn save_and_reload_round_trips_enrollment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load(&path, "kitchen-pi").unwrap();
        config.enroll(enrollment());
        config.save().unwrap();

        let reloaded = Config::load(&path, "kitchen-pi").unwrap();
        assert_eq!(reloaded.node_id(), config.node_id());
        assert_eq!(reloaded.swarm_secret().unwrap().expose(), "s".repeat(32));
    }

    #[test]
    fn unknown_top_level_keys_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"version":1,"node_id":"n1","label":"x","enrollment":null,"futureField":"kept"}"#,
        )
        .unwrap();

        let config = Config::load(&path, "x").unwrap();
        config.save().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("futureField"));
    }
}

//! Replica configuration (spec §6): read once at startup from a JSON
//! file, then handed by reference to every component that needs it --
//! no hidden global config singleton.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// One member of the replica group, as listed in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: u32,
    pub ip: String,
    pub port: u16,
    pub public_key_cert: String,
}

/// Storage backend selector (spec §6). Only [`crate::bft::storage::MemoryBackend`]
/// has bindings in this crate; the others are recognized so the
/// configuration surface matches the plurality of backends the original
/// storage interface abstracted over.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    LevelDb,
    RocksDb,
    DuckDb,
    Lmdb,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Memory
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    Ed25519,
    Ecdsa,
}

/// The full replica configuration, read once at startup (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub replicas: Vec<ReplicaInfo>,
    pub self_id: u32,
    pub signing_key_path: PathBuf,
    pub certificate_path: PathBuf,
    pub signature_algorithm: SignatureAlgorithm,
    pub checkpoint_interval: u32,
    pub window_size: u32,
    pub client_timeout_ms: u64,
    pub view_change_timeout_ms: u64,
    #[serde(default)]
    pub storage_backend: StorageBackend,
    pub db_path: PathBuf,
    /// Worker threads in the commitment pool (spec §5).
    #[serde(default = "default_commitment_workers")]
    pub commitment_workers: usize,
    /// Max client operations batched into a single consensus instance.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_commitment_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    64
}

impl ReplicaConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).wrapped(ErrorKind::ConfigInvalid)?;
        let config: Self = serde_json::from_str(&data).wrapped(ErrorKind::ConfigInvalid)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.n();
        if n < 4 {
            return Err("replica group must have at least 4 members (n >= 3f + 1, f >= 1)")
                .simple(ErrorKind::ConfigInvalid);
        }
        if !self.replicas.iter().any(|r| r.id == self.self_id) {
            return Err("self_id is not present in the replica list").simple(ErrorKind::ConfigInvalid);
        }
        if self.checkpoint_interval == 0 {
            return Err("checkpoint_interval must be greater than zero").simple(ErrorKind::ConfigInvalid);
        }
        if self.window_size == 0 {
            return Err("window_size must be greater than zero").simple(ErrorKind::ConfigInvalid);
        }
        Ok(())
    }

    /// Total replica count `n`.
    pub fn n(&self) -> u32 {
        self.replicas.len() as u32
    }

    /// Maximum tolerated Byzantine faults, derived from `n = 3f + 1`.
    pub fn f(&self) -> u32 {
        (self.n().saturating_sub(1)) / 3
    }

    pub fn wal_path(&self) -> PathBuf {
        self.db_path.join("wal")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.db_path.join("checkpoints")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> ReplicaConfig {
        ReplicaConfig {
            replicas: (0..n)
                .map(|id| ReplicaInfo {
                    id: id as u32,
                    ip: "127.0.0.1".into(),
                    port: 10000 + id as u16,
                    public_key_cert: format!("cert-{id}"),
                })
                .collect(),
            self_id: 0,
            signing_key_path: "key".into(),
            certificate_path: "cert".into(),
            signature_algorithm: SignatureAlgorithm::Ed25519,
            checkpoint_interval: 128,
            window_size: 100,
            client_timeout_ms: 5000,
            view_change_timeout_ms: 10000,
            storage_backend: StorageBackend::Memory,
            db_path: "db".into(),
            commitment_workers: 4,
            batch_size: 64,
        }
    }

    #[test]
    fn f_derived_from_n() {
        let config = sample(4);
        assert_eq!(config.n(), 4);
        assert_eq!(config.f(), 1);
    }

    #[test]
    fn rejects_group_smaller_than_four() {
        let config = sample(3);
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn rejects_self_id_not_in_replica_list() {
        let mut config = sample(4);
        config.self_id = 99;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::ConfigInvalid);
    }
}

//! Checkpoint Manager (spec §4.5): periodically digests the KV engine's
//! state, gathers signed agreement from 2f+1 replicas, and instructs the
//! message manager to garbage-collect everything below the new stable
//! checkpoint.

use parking_lot::Mutex;

use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::error::*;
use crate::bft::message_log::PERIOD as DEFAULT_INTERVAL;
use crate::bft::ordering::SeqNo;
use crate::bft::storage::{Storage, VersionedValue};

/// A checkpoint certificate: the sequence it covers, the agreed state
/// digest, and every signature collected for it.
#[derive(Clone)]
pub struct StableCheckpoint {
    seq: SeqNo,
    digest: Digest,
    signatures: HashMap<NodeId, Signature>,
}

impl StableCheckpoint {
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn signatures(&self) -> &HashMap<NodeId, Signature> {
        &self.signatures
    }
}

struct Inner {
    votes: HashMap<SeqNo, HashMap<Digest, HashMap<NodeId, Signature>>>,
    stable: Option<StableCheckpoint>,
}

/// Drives checkpoint creation and agreement.
///
/// Does not own the KV engine -- it only ever sees a `&dyn Storage`
/// handle passed in by the caller (the execution thread, per spec §5's
/// single-writer rule), long enough to fold a digest over it.
pub struct CheckpointManager {
    interval: u32,
    window: u32,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(interval: u32, window: u32) -> Self {
        Self {
            interval: if interval == 0 { DEFAULT_INTERVAL } else { interval },
            window,
            inner: Mutex::new(Inner {
                votes: collections::hash_map(),
                stable: None,
            }),
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whether `seq` is one of the sequences at which a replica should
    /// begin a new checkpoint.
    pub fn is_checkpoint_seq(&self, seq: SeqNo) -> bool {
        let seq: u32 = seq.into();
        seq > 0 && seq % self.interval == 0
    }

    /// Folds the KV engine's full item set into a single digest, in key
    /// order, so every correct replica produces the identical bytes at
    /// the same `seq` (spec §4.5, §8 "Checkpoint agreement").
    pub fn compute_state_digest(storage: &dyn Storage) -> Result<Digest> {
        let items: OrderedMap<String, VersionedValue> = storage.get_all_items()?;
        let mut buf = Vec::new();
        for (key, (value, version)) in items.iter() {
            buf.extend_from_slice(key.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
            buf.extend_from_slice(&version.to_be_bytes());
        }
        Ok(Digest::from_data(&buf))
    }

    /// Records a signed `Checkpoint(seq, digest)` vote from `node`.
    /// Returns the now-stable checkpoint once `quorum` replicas have
    /// signed the identical digest at `seq`; once that happens, every
    /// vote for an earlier sequence is dropped.
    pub fn record_checkpoint(
        &self,
        seq: SeqNo,
        digest: Digest,
        node: NodeId,
        signature: Signature,
        quorum: u32,
    ) -> Option<StableCheckpoint> {
        let mut inner = self.inner.lock();
        let by_digest = inner.votes.entry(seq).or_insert_with(collections::hash_map);
        let signers = by_digest.entry(digest).or_insert_with(collections::hash_map);
        signers.insert(node, signature);

        if signers.len() as u32 >= quorum {
            let stable = StableCheckpoint {
                seq,
                digest,
                signatures: signers.clone(),
            };
            inner.votes.retain(|&s, _| match s.index(seq) {
                either::Right(_) => true,
                either::Left(_) => false,
            });
            inner.stable = Some(stable.clone());
            Some(stable)
        } else {
            None
        }
    }

    pub fn stable(&self) -> Option<StableCheckpoint> {
        self.inner.lock().stable.clone()
    }

    pub fn low_water(&self) -> SeqNo {
        self.inner
            .lock()
            .stable
            .as_ref()
            .map(|cp| cp.seq)
            .unwrap_or(SeqNo::ZERO)
    }

    pub fn high_water(&self) -> SeqNo {
        let mut seq = self.low_water();
        for _ in 0..self.window {
            seq = seq.next();
        }
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::storage::MemoryBackend;

    #[test]
    fn checkpoint_interval_detection() {
        let cm = CheckpointManager::new(4, 100);
        assert!(!cm.is_checkpoint_seq(SeqNo::from(0)));
        assert!(!cm.is_checkpoint_seq(SeqNo::from(3)));
        assert!(cm.is_checkpoint_seq(SeqNo::from(4)));
        assert!(cm.is_checkpoint_seq(SeqNo::from(8)));
    }

    #[test]
    fn state_digest_is_deterministic_across_equal_states() {
        let a = MemoryBackend::new();
        a.set_with_version("k", "v", 0).unwrap();
        let b = MemoryBackend::new();
        b.set_with_version("k", "v", 0).unwrap();
        assert_eq!(
            CheckpointManager::compute_state_digest(&a).unwrap(),
            CheckpointManager::compute_state_digest(&b).unwrap()
        );
    }

    #[test]
    fn becomes_stable_after_quorum_matching_votes() {
        let cm = CheckpointManager::new(4, 100);
        let digest = Digest::from_data(b"state");
        let seq = SeqNo::from(4);
        assert!(cm
            .record_checkpoint(seq, digest, NodeId::from(0), Signature::zeroed(), 3)
            .is_none());
        assert!(cm
            .record_checkpoint(seq, digest, NodeId::from(1), Signature::zeroed(), 3)
            .is_none());
        let stable = cm
            .record_checkpoint(seq, digest, NodeId::from(2), Signature::zeroed(), 3)
            .expect("quorum reached");
        assert_eq!(stable.sequence_number(), seq);
        assert_eq!(cm.low_water(), seq);
    }
}

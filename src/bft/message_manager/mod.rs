//! Message Manager (spec §2.4, §4.2): owns the consensus log and drives
//! the executor forward strictly in sequence order.

use parking_lot::Mutex;

use crate::bft::communication::message::RequestMessage;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::message_log::{ConsensusLog, EntryState, InsertOutcome, PreparedEntry};
use crate::bft::ordering::SeqNo;

struct Inner<O> {
    log: ConsensusLog<O>,
    next_to_execute: SeqNo,
}

/// Owns the per-`(view, seq)` log and the "next sequence to execute"
/// cursor that the checkpoint manager and view-change manager both read.
pub struct MessageManager<O> {
    inner: Mutex<Inner<O>>,
}

impl<O> MessageManager<O> {
    pub fn new(window: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                log: ConsensusLog::new(window, SeqNo::ZERO),
                next_to_execute: SeqNo::ZERO,
            }),
        }
    }

    pub fn low_water(&self) -> SeqNo {
        self.inner.lock().log.low_water()
    }

    pub fn high_water(&self) -> SeqNo {
        self.inner.lock().log.high_water()
    }

    pub fn in_window(&self, seq: SeqNo) -> bool {
        self.inner.lock().log.in_window(seq)
    }

    pub fn next_to_execute(&self) -> SeqNo {
        self.inner.lock().next_to_execute
    }

    /// Inserts a `PrePrepare`, rejecting anything outside the watermark
    /// window or not claimed by `expected_primary`.
    pub fn insert_pre_prepare(
        &self,
        view: u32,
        seq: SeqNo,
        digest: Digest,
        batch: Vec<RequestMessage<O>>,
        from: NodeId,
        expected_primary: NodeId,
    ) -> Result<InsertOutcome> {
        if from != expected_primary {
            return Err("pre-prepare not signed by the view's primary").simple(ErrorKind::SignatureInvalid);
        }
        let mut inner = self.inner.lock();
        if !inner.log.in_window(seq) {
            return Err("sequence number outside the watermark window").simple(ErrorKind::MessageOutOfWindow);
        }
        let outcome = inner.log.insert_pre_prepare(view, seq, digest, batch, from);
        if outcome == InsertOutcome::Equivocation {
            return Err("primary sent two pre-prepares with different digests for the same slot")
                .simple(ErrorKind::Equivocation);
        }
        Ok(outcome)
    }

    pub fn add_prepare(&self, view: u32, seq: SeqNo, digest: Digest, node: NodeId, quorum: u32) -> Result<EntryState> {
        let mut inner = self.inner.lock();
        if !inner.log.in_window(seq) {
            return Err("sequence number outside the watermark window").simple(ErrorKind::MessageOutOfWindow);
        }
        Ok(inner.log.add_prepare(view, seq, digest, node, quorum))
    }

    pub fn add_commit(&self, view: u32, seq: SeqNo, digest: Digest, node: NodeId, quorum: u32) -> Result<EntryState> {
        let mut inner = self.inner.lock();
        if !inner.log.in_window(seq) {
            return Err("sequence number outside the watermark window").simple(ErrorKind::MessageOutOfWindow);
        }
        Ok(inner.log.add_commit(view, seq, digest, node, quorum))
    }

    pub fn digest(&self, view: u32, seq: SeqNo) -> Option<Digest> {
        self.inner.lock().log.digest(view, seq)
    }

    /// Pops every contiguous `Committed` entry starting at the current
    /// execution cursor, marking each `Executed` as it is handed off.
    /// Stalls at the first gap, per spec §4.2.
    pub fn commit_ready(&self, view: u32) -> Vec<(SeqNo, Vec<RequestMessage<O>>)>
    where
        O: Clone,
    {
        let mut inner = self.inner.lock();
        let mut ready = Vec::new();
        loop {
            let seq = inner.next_to_execute;
            match inner.log.state(view, seq) {
                EntryState::Committed => {
                    let batch = inner
                        .log
                        .batch(view, seq)
                        .expect("committed entry always has a batch")
                        .to_vec();
                    inner.log.mark_executed(view, seq);
                    ready.push((seq, batch));
                    inner.next_to_execute = seq.next();
                }
                _ => break,
            }
        }
        ready
    }

    /// Raises the low watermark and garbage-collects everything below it,
    /// invoked by the checkpoint manager once a checkpoint goes stable.
    pub fn truncate_below(&self, seq: SeqNo) {
        self.inner.lock().log.truncate_below(seq);
    }

    /// Every entry at or above `since` that reached `Prepared`, used to
    /// build this replica's `ViewChange` set-P.
    pub fn prepared_since(&self, since: SeqNo) -> Vec<PreparedEntry<O>>
    where
        O: Clone,
    {
        self.inner.lock().log.prepared_since(since)
    }

    /// Installs a re-proposed `PrePrepare` for `new_view`, as directed by
    /// a validated `NewView` message (spec §4.4 step 4). Unlike
    /// `insert_pre_prepare`, this bypasses the primary-signature check --
    /// the `NewView` itself is the authority here.
    pub fn install_re_proposal(&self, new_view: u32, seq: SeqNo, digest: Digest, batch: Vec<RequestMessage<O>>, primary: NodeId) {
        let mut inner = self.inner.lock();
        let _ = inner.log.insert_pre_prepare(new_view, seq, digest, batch, primary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_ready_stalls_at_first_gap() {
        let manager: MessageManager<u32> = MessageManager::new(100);
        let d1 = Digest::from_data(b"1");
        let d3 = Digest::from_data(b"3");
        let primary = NodeId::from(0);

        manager
            .insert_pre_prepare(0, SeqNo::from(0), d1, vec![RequestMessage::new(1, 1, 10)], primary, primary)
            .unwrap();
        manager.add_prepare(0, SeqNo::from(0), d1, NodeId::from(0), 1).unwrap();
        manager.add_commit(0, SeqNo::from(0), d1, NodeId::from(0), 1).unwrap();

        // seq 2 committed but seq 1 never arrives
        manager
            .insert_pre_prepare(0, SeqNo::from(2), d3, vec![RequestMessage::new(1, 3, 30)], primary, primary)
            .unwrap();
        manager.add_prepare(0, SeqNo::from(2), d3, NodeId::from(0), 1).unwrap();
        manager.add_commit(0, SeqNo::from(2), d3, NodeId::from(0), 1).unwrap();

        let ready = manager.commit_ready(0);
        assert_eq!(ready.len(), 1);
        assert_eq!(u32::from(ready[0].0), 0);
        assert_eq!(manager.next_to_execute(), SeqNo::from(1));
    }

    #[test]
    fn out_of_window_sequence_is_rejected() {
        let manager: MessageManager<u32> = MessageManager::new(2);
        let primary = NodeId::from(0);
        let digest = Digest::from_data(b"x");
        let err = manager
            .insert_pre_prepare(0, SeqNo::from(10), digest, vec![], primary, primary)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageOutOfWindow);
    }

    #[test]
    fn pre_prepare_from_non_primary_is_rejected() {
        let manager: MessageManager<u32> = MessageManager::new(100);
        let digest = Digest::from_data(b"x");
        let err = manager
            .insert_pre_prepare(0, SeqNo::from(0), digest, vec![], NodeId::from(1), NodeId::from(0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }
}

//! Commitment (spec §4.3): the three-phase `PrePrepare`/`Prepare`/`Commit`
//! core that drives a batch of client requests to a durable decision.
//!
//! Holds no network state of its own -- every outgoing vote goes straight
//! through the shared [`Broadcaster`], and every incoming vote is folded
//! into the [`MessageManager`]'s log. A replica always counts its own
//! vote the moment it accepts the message that implies it (a `PrePrepare`
//! implies this replica's `Prepare`; a self-observed `Prepared` implies
//! its `Commit`), so quorum counting never waits on a message looping
//! back from the network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::bft::communication::message::{
    seal, ConsensusMessage, ConsensusMessageKind, Header, RequestMessage, SystemMessage,
};
use crate::bft::communication::{Broadcaster, NodeId};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signer;
use crate::bft::error::*;
use crate::bft::message_log::EntryState;
use crate::bft::message_manager::MessageManager;
use crate::bft::ordering::SeqNo;
use crate::bft::sysinfo::SystemInfo;

/// Drives proposal and voting for one replica group across every view.
pub struct Commitment<O> {
    self_id: NodeId,
    sysinfo: Arc<SystemInfo>,
    manager: Arc<MessageManager<O>>,
    broadcaster: Arc<dyn Broadcaster>,
    signer: Arc<dyn Signer>,
    next_seq_to_assign: AtomicU32,
}

impl<O> Commitment<O>
where
    O: Clone + Serialize,
{
    pub fn new(
        self_id: NodeId,
        sysinfo: Arc<SystemInfo>,
        manager: Arc<MessageManager<O>>,
        broadcaster: Arc<dyn Broadcaster>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            self_id,
            sysinfo,
            manager,
            broadcaster,
            signer,
            next_seq_to_assign: AtomicU32::new(0),
        }
    }

    /// Assigns the next sequence number and broadcasts a `PrePrepare` for
    /// `batch`. Only ever called by the primary of the current view; the
    /// ingress dispatcher is responsible for that check before calling in
    /// (spec §4.1).
    pub fn propose(&self, batch: Vec<RequestMessage<O>>) -> Result<SeqNo> {
        let view = self.sysinfo.view().view();
        let seq = SeqNo::from(self.next_seq_to_assign.fetch_add(1, Ordering::AcqRel));
        let digest = digest_of_batch(&batch)?;

        self.manager
            .insert_pre_prepare(view, seq, digest, batch.clone(), self.self_id, self.self_id)?;

        self.broadcast_consensus(view, seq, ConsensusMessageKind::PrePrepare(digest, batch))?;
        self.vote_prepare(view, seq, digest)
    }

    /// Accepts a `PrePrepare` from `header.from()`, who must be the
    /// current view's primary, then casts this replica's own `Prepare`.
    pub fn handle_pre_prepare(&self, header: &Header, message: &ConsensusMessage<O>) -> Result<()> {
        let view = message.view();
        let expected_primary = NodeId::from(self.sysinfo.view_info_for(view).leader());
        let (digest, batch) = match message.kind() {
            ConsensusMessageKind::PrePrepare(digest, batch) => (*digest, batch.clone()),
            _ => return Err("expected a PrePrepare message").simple(ErrorKind::CommunicationMessage),
        };

        self.manager.insert_pre_prepare(
            view,
            message.sequence_number(),
            digest,
            batch,
            header.from(),
            expected_primary,
        )?;

        self.vote_prepare(view, message.sequence_number(), digest)?;
        Ok(())
    }

    /// Folds in a `Prepare` vote from `header.from()`; once this
    /// replica's own local quorum threshold is reached the entry moves to
    /// `Prepared` and this replica casts its `Commit`.
    pub fn handle_prepare(&self, header: &Header, message: &ConsensusMessage<O>) -> Result<()> {
        let digest = match message.kind() {
            ConsensusMessageKind::Prepare(digest) => *digest,
            _ => return Err("expected a Prepare message").simple(ErrorKind::CommunicationMessage),
        };
        let view = message.view();
        let seq = message.sequence_number();
        let quorum = self.sysinfo.view_info_for(view).quorum();

        let state = self.manager.add_prepare(view, seq, digest, header.from(), quorum)?;
        if state == EntryState::Prepared {
            self.vote_commit(view, seq, digest)?;
        }
        Ok(())
    }

    /// Folds in a `Commit` vote from `header.from()`, returning every
    /// contiguous batch now ready for execution (spec §4.2's stall-on-gap
    /// rule applies inside [`MessageManager::commit_ready`]).
    pub fn handle_commit(
        &self,
        header: &Header,
        message: &ConsensusMessage<O>,
    ) -> Result<Vec<(SeqNo, Vec<RequestMessage<O>>)>> {
        let digest = match message.kind() {
            ConsensusMessageKind::Commit(digest) => *digest,
            _ => return Err("expected a Commit message").simple(ErrorKind::CommunicationMessage),
        };
        let view = message.view();
        let seq = message.sequence_number();
        let quorum = self.sysinfo.view_info_for(view).quorum();

        self.manager.add_commit(view, seq, digest, header.from(), quorum)?;
        Ok(self.manager.commit_ready(view))
    }

    fn vote_prepare(&self, view: u32, seq: SeqNo, digest: Digest) -> Result<()> {
        let quorum = self.sysinfo.view_info_for(view).quorum();
        let state = self.manager.add_prepare(view, seq, digest, self.self_id, quorum)?;
        self.broadcast_consensus(view, seq, ConsensusMessageKind::Prepare(digest))?;
        if state == EntryState::Prepared {
            self.vote_commit(view, seq, digest)?;
        }
        Ok(())
    }

    fn vote_commit(&self, view: u32, seq: SeqNo, digest: Digest) -> Result<()> {
        let quorum = self.sysinfo.view_info_for(view).quorum();
        self.manager.add_commit(view, seq, digest, self.self_id, quorum)?;
        self.broadcast_consensus(view, seq, ConsensusMessageKind::Commit(digest))
    }

    fn broadcast_consensus(&self, view: u32, seq: SeqNo, kind: ConsensusMessageKind<O>) -> Result<()> {
        let message: SystemMessage<O, ()> =
            SystemMessage::Consensus(ConsensusMessage::new(view, seq, kind));
        let signer = self.signer.clone();
        let wire = seal(self.self_id, self.self_id, &message, |bytes| signer.sign(bytes))?;
        let targets: Vec<NodeId> = NodeId::targets_range(0..self.sysinfo.n()).collect();
        self.broadcaster.broadcast(&targets, wire);
        Ok(())
    }
}

fn digest_of_batch<O: Serialize>(batch: &[RequestMessage<O>]) -> Result<Digest> {
    let bytes = bincode::serialize(batch).wrapped(ErrorKind::CommunicationMessage)?;
    Ok(Digest::from_data(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::NullSigner;
    use crate::bft::crypto::signature::PublicKey;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingBroadcaster {
        sent: Mutex<Vec<(NodeId, SystemMessage<u32, ()>)>>,
    }

    impl RecordingBroadcaster {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn send(&self, target: NodeId, message: crate::bft::communication::message::WireMessage) -> Result<()> {
            let (_, payload) = message.into_inner();
            let decoded: SystemMessage<u32, ()> = crate::bft::communication::message::unseal(&payload)?;
            self.sent.lock().push((target, decoded));
            Ok(())
        }
    }

    fn commitment(id: u32, broadcaster: Arc<RecordingBroadcaster>) -> Commitment<u32> {
        let sysinfo = Arc::new(SystemInfo::new(4, 1, id));
        let manager = Arc::new(MessageManager::new(100));
        let signer = Arc::new(NullSigner(PublicKey::from_bytes(&[0u8; 32]).unwrap()));
        Commitment::new(NodeId::from(id), sysinfo, manager, broadcaster, signer)
    }

    #[test]
    fn primary_propose_casts_its_own_prepare_vote() {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let commitment = commitment(0, broadcaster.clone());
        let batch = vec![RequestMessage::new(1, 1, 42u32)];
        let seq = commitment.propose(batch).unwrap();
        assert_eq!(u32::from(seq), 0);

        let sent = broadcaster.sent.lock();
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, SystemMessage::Consensus(c) if matches!(c.kind(), ConsensusMessageKind::PrePrepare(_, _)))));
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, SystemMessage::Consensus(c) if matches!(c.kind(), ConsensusMessageKind::Prepare(_)))));
    }

    #[test]
    fn commit_quorum_yields_ready_batch() {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let commitment = commitment(0, broadcaster);
        let batch = vec![RequestMessage::new(1, 1, 7u32)];
        let digest = digest_of_batch(&batch).unwrap();
        let seq = commitment.propose(batch).unwrap();

        let msg = ConsensusMessage::new(0, seq, ConsensusMessageKind::Commit(digest));
        let header_from = |id: u32| {
            let wire = crate::bft::communication::message::WireMessage::new(
                NodeId::from(id),
                NodeId::from(0),
                vec![],
                crate::bft::crypto::signature::Signature::zeroed(),
            );
            wire.header().clone()
        };

        assert!(commitment.handle_commit(&header_from(1), &msg).unwrap().is_empty());
        let ready = commitment.handle_commit(&header_from(2), &msg).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(u32::from(ready[0].0), 0);
    }
}

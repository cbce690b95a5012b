//! View-Change Manager (spec §4.4): detects a silent or equivocating
//! primary, collects a quorum of `ViewChange` votes for the next view,
//! and assembles the `NewView` that re-proposes every sequence a quorum
//! once prepared.
//!
//! Buffers raw [`WireMessage`]s (not typed `SystemMessage`s) while a view
//! change is in flight, so this module never needs to know the reply
//! payload type `P` -- only the request type `O` that `ViewChangeMessage`
//! is generic over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::{
    seal, Header, NewViewMessage, PreparedProof, RequestMessage, SystemMessage, ViewChangeMessage,
    WireMessage,
};
use crate::bft::communication::{Broadcaster, NodeId};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signer;
use crate::bft::error::*;
use crate::bft::message_log::PreparedEntry;
use crate::bft::message_manager::MessageManager;
use crate::bft::ordering::SeqNo;
use crate::bft::sysinfo::SystemInfo;

/// Whether the replica is running the normal three-phase protocol or is
/// mid view-change, buffering non-view-change traffic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViewChangeState {
    Normal,
    ChangingView { target_view: u32 },
}

struct Inner {
    state: ViewChangeState,
    buffered: Vec<WireMessage>,
}

/// Coordinates the cluster's agreement on moving to a new view.
pub struct ViewChangeManager<O> {
    sysinfo: Arc<SystemInfo>,
    manager: Arc<MessageManager<O>>,
    broadcaster: Arc<dyn Broadcaster>,
    signer: Arc<dyn Signer>,
    inner: Mutex<Inner>,
    votes_detail: Mutex<HashMap<u32, HashMap<NodeId, ViewChangeMessage<O>>>>,
    timed_out: AtomicBool,
}

impl<O> ViewChangeManager<O>
where
    O: Clone + Serialize,
{
    pub fn new(
        sysinfo: Arc<SystemInfo>,
        manager: Arc<MessageManager<O>>,
        broadcaster: Arc<dyn Broadcaster>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            sysinfo,
            manager,
            broadcaster,
            signer,
            inner: Mutex::new(Inner {
                state: ViewChangeState::Normal,
                buffered: Vec::new(),
            }),
            votes_detail: Mutex::new(collections::hash_map()),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ViewChangeState {
        self.inner.lock().state
    }

    pub fn is_changing_view(&self) -> bool {
        matches!(self.state(), ViewChangeState::ChangingView { .. })
    }

    /// Buffers a message that arrived while mid view-change, to be
    /// re-dispatched once `NewView` installs.
    pub fn buffer(&self, message: WireMessage) {
        self.inner.lock().buffered.push(message);
    }

    /// Drains every buffered message, handing ownership to the caller
    /// (the core dispatcher) for re-processing under the new view.
    pub fn drain_buffered(&self) -> Vec<WireMessage> {
        std::mem::take(&mut self.inner.lock().buffered)
    }

    /// Called by the view-change timer when the current primary has gone
    /// silent (spec §4.4 step 1): moves to `ChangingView` and broadcasts
    /// this replica's own vote.
    pub fn begin_view_change(&self) -> Result<()> {
        let current = self.sysinfo.view().view();
        let target_view = current + 1;

        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ViewChangeState::ChangingView { target_view: v } if v >= target_view) {
                return Ok(());
            }
            inner.state = ViewChangeState::ChangingView { target_view };
        }

        let last_stable = self.manager.low_water();
        let prepared: Vec<PreparedProof<O>> = self
            .manager
            .prepared_since(last_stable)
            .into_iter()
            .map(|p: PreparedEntry<O>| PreparedProof::new(p.seq, p.digest, p.batch))
            .collect();

        let vote = ViewChangeMessage::new(target_view, last_stable, prepared);
        self.record_vote(NodeId::from(self.sysinfo.self_id()), target_view, vote.clone());
        self.broadcast_view_change(target_view, vote)
    }

    /// Folds in a peer's `ViewChange` vote. Once a quorum of replicas
    /// agree on `target_view`, and this replica is the new primary,
    /// assembles and broadcasts the `NewView`.
    pub fn handle_view_change(&self, header: &Header, message: ViewChangeMessage<O>) -> Result<Option<NewViewMessage<O>>> {
        let target_view = message.new_view();
        let quorum = self.sysinfo.view_info_for(target_view).quorum();

        self.record_vote(header.from(), target_view, message);

        let votes = self.votes_detail.lock();
        let by_view = match votes.get(&target_view) {
            Some(v) => v,
            None => return Ok(None),
        };
        if (by_view.len() as u32) < quorum {
            return Ok(None);
        }

        let is_new_primary = self.sysinfo.view_info_for(target_view).leader() == self.sysinfo.self_id();
        if !is_new_primary {
            return Ok(None);
        }

        let new_view_msg = assemble_new_view(target_view, self.manager.low_water(), by_view.values());
        drop(votes);

        self.broadcast_new_view(new_view_msg.clone())?;
        Ok(Some(new_view_msg))
    }

    /// Validates and installs a `NewView`: re-proposes every sequence it
    /// names, advances [`SystemInfo`]'s view, and returns to `Normal`.
    pub fn handle_new_view(&self, message: &NewViewMessage<O>) -> Result<()> {
        let view = message.view();
        let primary = NodeId::from(self.sysinfo.view_info_for(view).leader());

        for proof in message.proofs() {
            self.manager
                .install_re_proposal(view, proof.sequence_number(), *proof.digest(), proof.batch().to_vec(), primary);
        }

        self.sysinfo.advance_view(view);
        self.inner.lock().state = ViewChangeState::Normal;
        Ok(())
    }

    fn record_vote(&self, from: NodeId, target_view: u32, message: ViewChangeMessage<O>) {
        let mut votes = self.votes_detail.lock();
        let by_view = votes.entry(target_view).or_insert_with(collections::hash_map);
        by_view.insert(from, message);
    }

    fn broadcast_view_change(&self, target_view: u32, vote: ViewChangeMessage<O>) -> Result<()> {
        let message: SystemMessage<O, ()> = SystemMessage::ViewChange(vote);
        self.seal_and_broadcast(message)
    }

    fn broadcast_new_view(&self, new_view: NewViewMessage<O>) -> Result<()> {
        let message: SystemMessage<O, ()> = SystemMessage::NewView(new_view);
        self.seal_and_broadcast(message)
    }

    fn seal_and_broadcast(&self, message: SystemMessage<O, ()>) -> Result<()> {
        let self_id = NodeId::from(self.sysinfo.self_id());
        let signer = self.signer.clone();
        let wire = seal(self_id, self_id, &message, |bytes| signer.sign(bytes))?;
        let targets: Vec<NodeId> = NodeId::targets_range(0..self.sysinfo.n()).collect();
        self.broadcaster.broadcast(&targets, wire);
        Ok(())
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }
}

/// Merges a quorum's `ViewChange` votes into one `NewView`: for each
/// sequence named by any voter's prepared set, the first proof seen wins
/// -- any single quorum witness to a `Prepared` batch is sufficient proof
/// it is safe to reuse. Every sequence in `(stable_cp, max_seq_seen]` that
/// no voter witnessed as `Prepared` gets a null-batch no-op re-proposal
/// instead, so the new view's sequence range has no holes for
/// `MessageManager::commit_ready` to stall on (spec §4.4 step 3).
///
/// `own_low_water` is this (correct) replica's own checkpoint-certified
/// low-water mark, not a value carried by any vote: `last_stable_seq` on a
/// `ViewChangeMessage` is a bare, unauthenticated field, so a Byzantine
/// voter reporting one far below the true stable checkpoint must not be
/// able to drag `stable_cp` down and force a null-batch fill across the
/// whole history. `stable_cp` is clamped to never go below it.
fn assemble_new_view<'a, O: Clone + Serialize>(
    target_view: u32,
    own_low_water: SeqNo,
    votes: impl Iterator<Item = &'a ViewChangeMessage<O>>,
) -> NewViewMessage<O>
where
    O: 'a,
{
    let votes: Vec<&ViewChangeMessage<O>> = votes.collect();

    let mut by_seq: std::collections::BTreeMap<u32, PreparedProof<O>> = std::collections::BTreeMap::new();
    for vote in &votes {
        for proof in vote.prepared() {
            by_seq
                .entry(u32::from(proof.sequence_number()))
                .or_insert_with(|| PreparedProof::new(proof.sequence_number(), *proof.digest(), proof.batch().to_vec()));
        }
    }

    let reported_cp = votes.iter().map(|v| u32::from(v.last_stable_seq())).min().unwrap_or(0);
    let stable_cp = reported_cp.max(u32::from(own_low_water));
    let max_seq_seen = by_seq.keys().copied().max().unwrap_or(stable_cp);
    let null_digest = null_batch_digest::<O>();

    for seq in (stable_cp + 1)..=max_seq_seen {
        by_seq
            .entry(seq)
            .or_insert_with(|| PreparedProof::new(SeqNo::from(seq), null_digest, Vec::new()));
    }

    NewViewMessage::new(target_view, by_seq.into_values().collect())
}

/// Digest of the empty batch used for a no-op re-proposal, so every
/// correct replica computes the identical digest for the same hole.
fn null_batch_digest<O: Serialize>() -> Digest {
    let empty: Vec<RequestMessage<O>> = Vec::new();
    let bytes = bincode::serialize(&empty).expect("an empty batch always serializes");
    Digest::from_data(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::{NullSigner, PublicKey, Signature};

    struct NullBroadcaster;
    impl Broadcaster for NullBroadcaster {
        fn send(&self, _target: NodeId, _message: WireMessage) -> Result<()> {
            Ok(())
        }
    }

    fn manager_with_one_prepared(id: u32) -> Arc<ViewChangeManager<u32>> {
        let sysinfo = Arc::new(SystemInfo::new(4, 1, id));
        let manager = Arc::new(MessageManager::new(100));
        let digest = Digest::from_data(b"batch");
        manager
            .insert_pre_prepare(0, SeqNo::from(0), digest, vec![RequestMessage::new(1, 1, 9u32)], NodeId::from(0), NodeId::from(0))
            .unwrap();
        manager.add_prepare(0, SeqNo::from(0), digest, NodeId::from(0), 1).unwrap();

        let signer = Arc::new(NullSigner(PublicKey::from_bytes(&[0u8; 32]).unwrap()));
        Arc::new(ViewChangeManager::new(sysinfo, manager, Arc::new(NullBroadcaster), signer))
    }

    fn header_from(id: u32) -> Header {
        WireMessage::new(NodeId::from(id), NodeId::from(0), vec![], Signature::zeroed())
            .header()
            .clone()
    }

    #[test]
    fn begin_view_change_enters_changing_view_state() {
        let vcm = manager_with_one_prepared(0);
        vcm.begin_view_change().unwrap();
        assert!(vcm.is_changing_view());
    }

    #[test]
    fn new_primary_assembles_new_view_after_quorum() {
        let vcm = manager_with_one_prepared(1);
        vcm.begin_view_change().unwrap();
        let target_view = 1;

        let vote_from = |_id: u32| ViewChangeMessage::new(target_view, SeqNo::ZERO, vec![]);
        assert!(vcm.handle_view_change(&header_from(2), vote_from(2)).unwrap().is_none());
        let new_view = vcm
            .handle_view_change(&header_from(3), vote_from(3))
            .unwrap()
            .expect("quorum reached, replica 1 is the view-1 primary");
        assert_eq!(new_view.view(), 1);
    }

    #[test]
    fn handle_new_view_advances_system_view_and_returns_to_normal() {
        let vcm = manager_with_one_prepared(0);
        vcm.begin_view_change().unwrap();
        let new_view = NewViewMessage::new(1, vec![]);
        vcm.handle_new_view(&new_view).unwrap();
        assert_eq!(vcm.state(), ViewChangeState::Normal);
    }

    #[test]
    fn assemble_new_view_fills_unwitnessed_gaps_with_null_batches() {
        let target_view = 1;
        let vote_a = ViewChangeMessage::new(
            target_view,
            SeqNo::ZERO,
            vec![PreparedProof::new(SeqNo::from(1u32), Digest::from_data(b"one"), vec![RequestMessage::new(1, 1, 10u32)])],
        );
        let vote_b = ViewChangeMessage::new(
            target_view,
            SeqNo::ZERO,
            vec![PreparedProof::new(SeqNo::from(3u32), Digest::from_data(b"three"), vec![RequestMessage::new(2, 1, 30u32)])],
        );

        let new_view = assemble_new_view(target_view, SeqNo::ZERO, vec![&vote_a, &vote_b].into_iter());

        let sequences: Vec<u32> = new_view.proofs().iter().map(|p| u32::from(p.sequence_number())).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let gap = new_view
            .proofs()
            .iter()
            .find(|p| u32::from(p.sequence_number()) == 2)
            .expect("seq 2 must be filled even though no voter witnessed it as prepared");
        assert!(gap.batch().is_empty());
        assert_eq!(*gap.digest(), null_batch_digest::<u32>());
    }

    #[test]
    fn assemble_new_view_ignores_a_vote_reporting_a_falsely_low_stable_checkpoint() {
        let target_view = 1;
        // A Byzantine voter claims last_stable_seq 0 even though this replica's
        // own checkpoint-certified low-water mark is already 100; the fill
        // range must be clamped to the latter, not dragged down to the former.
        let byzantine_vote = ViewChangeMessage::new(
            target_view,
            SeqNo::ZERO,
            vec![PreparedProof::new(SeqNo::from(102u32), Digest::from_data(b"far"), vec![RequestMessage::new(9, 1, 90u32)])],
        );

        let new_view = assemble_new_view(target_view, SeqNo::from(100u32), vec![&byzantine_vote].into_iter());

        let sequences: Vec<u32> = new_view.proofs().iter().map(|p| u32::from(p.sequence_number())).collect();
        assert_eq!(sequences, vec![101, 102]);
    }
}

//! The per-`(view, sequence)` consensus log, owned exclusively by the
//! message manager (spec §4.2).
//!
//! Each entry tracks the single `PrePrepare` digest accepted for its slot
//! and the sets of replicas that voted `Prepare`/`Commit` on it. State only
//! ever moves forward -- `None -> PrePrepared -> Prepared -> Committed ->
//! Executed` -- except across a view change, which installs brand new
//! entries for re-proposed sequences rather than rewinding existing ones.

use either::{Left, Right};

use crate::bft::collections::{self, HashMap, OrderedSet};
use crate::bft::communication::message::RequestMessage;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::SeqNo;

/// Checkpoint period, in committed sequences.
///
/// Every `PERIOD` executed sequences the checkpoint manager begins a new
/// stable checkpoint and the log below the previous one is eligible for
/// truncation.
pub const PERIOD: u32 = 128;

/// How far an entry has progressed through the three-phase protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryState {
    None,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// Outcome of inserting a `PrePrepare` into the log.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsertOutcome {
    /// No prior `PrePrepare` existed for this slot; this one was recorded.
    Inserted,
    /// A `PrePrepare` with the exact same digest was already recorded.
    AlreadyPresent,
    /// A `PrePrepare` with a *different* digest was already recorded --
    /// the sender is equivocating.
    Equivocation,
}

struct LogEntry<O> {
    digest: Option<Digest>,
    batch: Option<Vec<RequestMessage<O>>>,
    primary: Option<NodeId>,
    prepares: OrderedSet<NodeId>,
    commits: OrderedSet<NodeId>,
    state: EntryState,
}

impl<O> LogEntry<O> {
    fn new() -> Self {
        Self {
            digest: None,
            batch: None,
            primary: None,
            prepares: collections::ordered_set(),
            commits: collections::ordered_set(),
            state: EntryState::None,
        }
    }
}

/// Proof that `(view, seq, digest)` reached `Prepared`, used when a
/// replica assembles its `ViewChange` set-P.
pub struct PreparedEntry<O> {
    pub seq: SeqNo,
    pub digest: Digest,
    pub batch: Vec<RequestMessage<O>>,
}

/// The message manager's consensus log.
///
/// Keyed by `(view, seq)` so that a stale message from an earlier view
/// never collides with the entry for the same sequence in the current
/// view -- the view-change protocol installs fresh entries for
/// re-proposed sequences rather than mutating old ones.
///
/// Not itself persisted: WAL replay (§4.7) rebuilds a log from scratch by
/// re-driving `insert_pre_prepare`/`add_prepare`/`add_commit` over the
/// recorded inputs, the same way the live pipeline does.
pub struct ConsensusLog<O> {
    window: u32,
    low_water: SeqNo,
    entries: HashMap<(u32, SeqNo), LogEntry<O>>,
}

impl<O> ConsensusLog<O> {
    pub fn new(window: u32, low_water: SeqNo) -> Self {
        Self {
            window,
            low_water,
            entries: collections::hash_map(),
        }
    }

    pub fn low_water(&self) -> SeqNo {
        self.low_water
    }

    pub fn high_water(&self) -> SeqNo {
        let mut seq = self.low_water;
        for _ in 0..self.window {
            seq = seq.next();
        }
        seq
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Whether `seq` falls inside `[low_water, low_water + window]`.
    pub fn in_window(&self, seq: SeqNo) -> bool {
        matches!(seq.index(self.low_water), Right(i) if (i as u32) <= self.window)
    }

    fn entry_mut(&mut self, view: u32, seq: SeqNo) -> &mut LogEntry<O> {
        self.entries.entry((view, seq)).or_insert_with(LogEntry::new)
    }

    /// Records a `PrePrepare` claimed by `primary` for `(view, seq)`.
    pub fn insert_pre_prepare(
        &mut self,
        view: u32,
        seq: SeqNo,
        digest: Digest,
        batch: Vec<RequestMessage<O>>,
        primary: NodeId,
    ) -> InsertOutcome {
        let entry = self.entry_mut(view, seq);
        match entry.digest {
            None => {
                entry.digest = Some(digest);
                entry.batch = Some(batch);
                entry.primary = Some(primary);
                if entry.state == EntryState::None {
                    entry.state = EntryState::PrePrepared;
                }
                InsertOutcome::Inserted
            }
            Some(d) if d == digest => InsertOutcome::AlreadyPresent,
            Some(_) => InsertOutcome::Equivocation,
        }
    }

    /// Records a `Prepare` vote from `node`. Returns the entry's state
    /// after applying the vote; transitions to `Prepared` once `quorum`
    /// distinct nodes have voted on the recorded digest.
    pub fn add_prepare(&mut self, view: u32, seq: SeqNo, digest: Digest, node: NodeId, quorum: u32) -> EntryState {
        let entry = self.entry_mut(view, seq);
        if entry.digest != Some(digest) {
            // vote for a digest we haven't (or won't) pre-prepare; record
            // it anyway so a late-arriving PrePrepare can still see it,
            // but don't let it count towards a different digest's quorum.
            return entry.state;
        }
        entry.prepares.insert(node);
        if matches!(entry.state, EntryState::PrePrepared) && entry.prepares.len() as u32 >= quorum {
            entry.state = EntryState::Prepared;
        }
        entry.state
    }

    /// Records a `Commit` vote from `node`. Returns the entry's state
    /// after applying the vote; transitions to `Committed` once `quorum`
    /// distinct nodes have voted, and the entry was already `Prepared`.
    pub fn add_commit(&mut self, view: u32, seq: SeqNo, digest: Digest, node: NodeId, quorum: u32) -> EntryState {
        let entry = self.entry_mut(view, seq);
        if entry.digest != Some(digest) {
            return entry.state;
        }
        entry.commits.insert(node);
        let prepared_or_better = matches!(entry.state, EntryState::Prepared | EntryState::Committed);
        if prepared_or_better && entry.commits.len() as u32 >= quorum {
            entry.state = EntryState::Committed;
        }
        entry.state
    }

    pub fn state(&self, view: u32, seq: SeqNo) -> EntryState {
        self.entries
            .get(&(view, seq))
            .map(|e| e.state)
            .unwrap_or(EntryState::None)
    }

    pub fn digest(&self, view: u32, seq: SeqNo) -> Option<Digest> {
        self.entries.get(&(view, seq)).and_then(|e| e.digest)
    }

    pub fn batch(&self, view: u32, seq: SeqNo) -> Option<&[RequestMessage<O>]> {
        self.entries
            .get(&(view, seq))
            .and_then(|e| e.batch.as_deref())
    }

    pub fn mark_executed(&mut self, view: u32, seq: SeqNo) {
        if let Some(entry) = self.entries.get_mut(&(view, seq)) {
            if entry.state == EntryState::Committed {
                entry.state = EntryState::Executed;
            }
        }
    }

    /// Garbage-collects every entry below `seq` and raises the low
    /// watermark to it, per a newly stable checkpoint.
    pub fn truncate_below(&mut self, seq: SeqNo) {
        self.entries.retain(|&(_, s), _| match s.index(seq) {
            Left(_) => false,
            Right(_) => true,
        } || s == seq);
        self.low_water = seq;
    }

    /// Every entry at or above `since` that reached at least `Prepared`,
    /// used to build a `ViewChange`'s set-P.
    pub fn prepared_since(&self, since: SeqNo) -> Vec<PreparedEntry<O>>
    where
        O: Clone,
    {
        let mut out: Vec<(SeqNo, PreparedEntry<O>)> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Prepared | EntryState::Committed | EntryState::Executed))
            .filter(|(&(_, seq), _)| matches!(seq.index(since), Right(_)) || seq == since)
            .filter_map(|(&(_, seq), e)| {
                Some((
                    seq,
                    PreparedEntry {
                        seq,
                        digest: e.digest?,
                        batch: e.batch.clone()?,
                    },
                ))
            })
            .collect();
        out.sort_by_key(|(seq, _)| u32::from(*seq));
        out.into_iter().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(n: u32) -> RequestMessage<u32> {
        RequestMessage::new(1, n as u64, n)
    }

    #[test]
    fn pre_prepare_then_matching_prepares_reach_quorum() {
        let mut log = ConsensusLog::new(100, SeqNo::ZERO);
        let seq = SeqNo::from(1);
        let digest = Digest::from_data(b"batch");
        log.insert_pre_prepare(0, seq, digest, vec![req(1)], NodeId::from(0));
        assert_eq!(log.state(0, seq), EntryState::PrePrepared);

        log.add_prepare(0, seq, digest, NodeId::from(0), 3);
        log.add_prepare(0, seq, digest, NodeId::from(1), 3);
        assert_eq!(log.state(0, seq), EntryState::PrePrepared);
        assert_eq!(log.add_prepare(0, seq, digest, NodeId::from(2), 3), EntryState::Prepared);
    }

    #[test]
    fn equivocating_pre_prepare_is_detected() {
        let mut log: ConsensusLog<u32> = ConsensusLog::new(100, SeqNo::ZERO);
        let seq = SeqNo::from(1);
        let d1 = Digest::from_data(b"a");
        let d2 = Digest::from_data(b"b");
        assert_eq!(
            log.insert_pre_prepare(0, seq, d1, vec![], NodeId::from(0)),
            InsertOutcome::Inserted
        );
        assert_eq!(
            log.insert_pre_prepare(0, seq, d2, vec![], NodeId::from(0)),
            InsertOutcome::Equivocation
        );
    }

    #[test]
    fn commit_requires_prepared_first() {
        let mut log = ConsensusLog::new(100, SeqNo::ZERO);
        let seq = SeqNo::from(1);
        let digest = Digest::from_data(b"batch");
        log.insert_pre_prepare(0, seq, digest, vec![], NodeId::from(0));
        // commits arrive before quorum of prepares: no-op towards Committed
        log.add_commit(0, seq, digest, NodeId::from(0), 3);
        log.add_commit(0, seq, digest, NodeId::from(1), 3);
        log.add_commit(0, seq, digest, NodeId::from(2), 3);
        assert_eq!(log.state(0, seq), EntryState::PrePrepared);

        log.add_prepare(0, seq, digest, NodeId::from(0), 3);
        log.add_prepare(0, seq, digest, NodeId::from(1), 3);
        log.add_prepare(0, seq, digest, NodeId::from(2), 3);
        assert_eq!(log.state(0, seq), EntryState::Prepared);

        log.add_commit(0, seq, digest, NodeId::from(0), 3);
        log.add_commit(0, seq, digest, NodeId::from(1), 3);
        assert_eq!(log.add_commit(0, seq, digest, NodeId::from(2), 3), EntryState::Committed);
    }

    #[test]
    fn truncate_below_drops_old_entries_and_raises_low_water() {
        let mut log: ConsensusLog<u32> = ConsensusLog::new(100, SeqNo::ZERO);
        for i in 1..=5u32 {
            log.insert_pre_prepare(0, SeqNo::from(i), Digest::from_data(&i.to_be_bytes()), vec![], NodeId::from(0));
        }
        log.truncate_below(SeqNo::from(3));
        assert_eq!(log.low_water(), SeqNo::from(3));
        assert_eq!(log.state(0, SeqNo::from(1)), EntryState::None);
        assert_eq!(log.state(0, SeqNo::from(3)), EntryState::PrePrepared);
        assert_eq!(log.state(0, SeqNo::from(5)), EntryState::PrePrepared);
    }

    #[test]
    fn prepared_since_collects_in_ascending_seq_order() {
        let mut log: ConsensusLog<u32> = ConsensusLog::new(100, SeqNo::ZERO);
        for i in 1..=3u32 {
            let seq = SeqNo::from(i);
            let digest = Digest::from_data(&i.to_be_bytes());
            log.insert_pre_prepare(0, seq, digest, vec![req(i)], NodeId::from(0));
            log.add_prepare(0, seq, digest, NodeId::from(0), 1);
        }
        let prepared = log.prepared_since(SeqNo::ZERO);
        let seqs: Vec<u32> = prepared.iter().map(|p| u32::from(p.seq)).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}

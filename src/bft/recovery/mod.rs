//! Recovery (spec §4.7): an append-only WAL of every accepted consensus
//! input, replayed on boot to restore `(view, executed-seq, KV state)`.
//!
//! Record framing matches spec §6's persistent state layout exactly:
//! `<db_path>/wal/` holds a flat file of `(u32 length | bytes)` records.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bft::communication::message::{NewViewMessage, RequestMessage, ViewChangeMessage};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// One accepted consensus input, in the order it was durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord<O> {
    PrePrepare {
        view: u32,
        seq: SeqNo,
        digest: Digest,
        batch: Vec<RequestMessage<O>>,
        from: NodeId,
    },
    Prepare {
        view: u32,
        seq: SeqNo,
        digest: Digest,
        from: NodeId,
    },
    Commit {
        view: u32,
        seq: SeqNo,
        digest: Digest,
        from: NodeId,
    },
    Checkpoint {
        seq: SeqNo,
        digest: Digest,
        from: NodeId,
    },
    ViewChange(ViewChangeMessage<O>),
    NewView(NewViewMessage<O>),
}

/// An append-only WAL of consensus inputs.
pub struct Wal {
    file: Mutex<File>,
}

impl Wal {
    /// Opens (creating if necessary) the WAL file at `path`, appending to
    /// whatever is already there.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).wrapped(ErrorKind::Recovery)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .wrapped(ErrorKind::Recovery)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Appends `record`, flushing before returning so every accepted
    /// input is durable before the protocol acts on it.
    pub fn append<O: Serialize>(&self, record: &WalRecord<O>) -> Result<()> {
        let bytes = bincode::serialize(record).wrapped(ErrorKind::Recovery)?;
        let len = bytes.len() as u32;
        let mut file = self.file.lock();
        file.write_all(&len.to_be_bytes()).wrapped(ErrorKind::Recovery)?;
        file.write_all(&bytes).wrapped(ErrorKind::Recovery)?;
        file.flush().wrapped(ErrorKind::Recovery)?;
        Ok(())
    }

    /// Reads every record currently on disk, in append order. Used on
    /// boot to replay into the message manager and commitment, and by
    /// tests to assert WAL contents.
    pub fn replay<O: DeserializeOwned>(path: &Path) -> Result<Vec<WalRecord<O>>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(path).wrapped(ErrorKind::Recovery)?;
        let mut records = Vec::new();
        let mut len_buf = [0u8; 4];
        loop {
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).wrapped(ErrorKind::Recovery),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            file.read_exact(&mut body).wrapped(ErrorKind::Recovery)?;
            let record: WalRecord<O> = bincode::deserialize(&body).wrapped(ErrorKind::Recovery)?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Replays `records` into a fresh message manager and checkpoint
/// manager, returning the restored `(view, next_to_execute)` along with
/// whether a `ViewChange` was left pending without a matching `NewView`
/// -- per spec §9's resolution, recovery re-enters `ChangingView` and
/// rebroadcasts this replica's own vote rather than guessing the
/// cluster's progress.
pub struct ReplayOutcome {
    pub view: u32,
    pub pending_view_change: bool,
}

pub fn replay_into<O: Clone>(
    records: Vec<WalRecord<O>>,
    manager: &crate::bft::message_manager::MessageManager<O>,
    checkpoint: &crate::bft::checkpoint::CheckpointManager,
    quorum: u32,
) -> ReplayOutcome {
    let mut view = 0u32;
    let mut pending_view_change = false;

    for record in records {
        match record {
            WalRecord::PrePrepare { view: v, seq, digest, batch, from } => {
                view = view.max(v);
                let _ = manager.insert_pre_prepare(v, seq, digest, batch, from, from);
            }
            WalRecord::Prepare { view: v, seq, digest, from } => {
                view = view.max(v);
                let _ = manager.add_prepare(v, seq, digest, from, quorum);
            }
            WalRecord::Commit { view: v, seq, digest, from } => {
                view = view.max(v);
                let _ = manager.add_commit(v, seq, digest, from, quorum);
                let _ = manager.commit_ready(v);
            }
            WalRecord::Checkpoint { seq, digest, from } => {
                checkpoint.record_checkpoint(seq, digest, from, crate::bft::crypto::signature::Signature::zeroed(), quorum);
            }
            WalRecord::ViewChange(vc) => {
                view = view.max(vc.new_view());
                pending_view_change = true;
            }
            WalRecord::NewView(nv) => {
                view = view.max(nv.view());
                pending_view_change = false;
            }
        }
    }

    ReplayOutcome { view, pending_view_change }
}

//! The replica dispatcher (spec §2, component 9): owns every other
//! component and is the single entry point a host application's network
//! layer calls into with each inbound [`WireMessage`].
//!
//! Three threads live behind a [`ConsensusManager`]: the execution
//! thread (spawned by [`crate::bft::executable::spawn`]), the timer
//! thread (spawned by [`TimeoutManager::spawn`]), and a small reply
//! thread this module spawns to drain executed results back to clients.
//! Everything else -- ingress verification, commitment voting,
//! checkpointing, view-change -- runs synchronously on whatever thread
//! calls [`ConsensusManager::handle_wire`], matching spec §5's
//! commitment-worker-pool design: the host hands inbound messages to a
//! [`WorkerPool`] of its own sizing, and each worker calls in here.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bft::checkpoint::CheckpointManager;
use crate::bft::collections::HashMap;
use crate::bft::communication::message::{
    seal, unseal, CheckpointMessage, ConsensusMessage, ConsensusMessageKind, Header,
    NewViewMessage, ReplyMessage, RequestMessage, SystemMessage, ViewChangeMessage, WireMessage,
};
use crate::bft::communication::{Broadcaster, NodeId};
use crate::bft::consensus::Commitment;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{PublicKey, Signer, Verifier};
use crate::bft::error::*;
use crate::bft::executable::{self, ExecutionResult, ExecutorHandle, Service, UpdateBatch};
use crate::bft::globals::Stats;
use crate::bft::message_manager::MessageManager;
use crate::bft::response::ResponseManager;
use crate::bft::storage::Storage;
use crate::bft::sysinfo::SystemInfo;
use crate::bft::threadpool::WorkerPool;
use crate::bft::timeouts::{TimeoutId, TimeoutKind, TimeoutManager};
use crate::bft::view_change::{ViewChangeManager, ViewChangeState};

/// Everything the dispatcher needs handed in from the host application:
/// the wire-level collaborators spec §1 puts out of scope for this
/// crate.
pub struct Collaborators {
    pub broadcaster: Arc<dyn Broadcaster>,
    pub verifier: Arc<dyn Verifier>,
    pub signer: Arc<dyn Signer>,
    pub keys: HashMap<NodeId, PublicKey>,
}

/// Owns every protocol component for one replica and routes inbound
/// wire traffic to the right one.
pub struct ConsensusManager<S>
where
    S: Service + 'static,
    S::State: 'static,
    S::Request: Clone + Send + Serialize + DeserializeOwned + 'static,
    S::Reply: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    self_id: NodeId,
    sysinfo: Arc<SystemInfo>,
    manager: Arc<MessageManager<S::Request>>,
    commitment: Commitment<S::Request>,
    checkpoint: Arc<CheckpointManager>,
    view_change: Arc<ViewChangeManager<S::Request>>,
    response: Arc<ResponseManager<S::Reply>>,
    executor: ExecutorHandle<S>,
    timeouts: Arc<TimeoutManager>,
    workers: WorkerPool,
    broadcaster: Arc<dyn Broadcaster>,
    verifier: Arc<dyn Verifier>,
    signer: Arc<dyn Signer>,
    stats: Arc<Stats>,
    keys: HashMap<NodeId, PublicKey>,
    checkpoint_interval: u32,
    window: u32,
    pending_batch: Mutex<Vec<RequestMessage<S::Request>>>,
    batch_size: usize,
    complaint_timeout: Duration,
    view_change_timeout: Duration,
    pending_complaints: Mutex<HashMap<(u32, u64), TimeoutId>>,
}

impl<S> ConsensusManager<S>
where
    S: Service + 'static,
    S::State: 'static,
    S::Request: Clone + Send + Serialize + DeserializeOwned + 'static,
    S::Reply: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Wires up every component and spawns the background threads.
    /// `result_rx` is drained by a dedicated reply thread for the
    /// lifetime of the returned manager.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        self_id: u32,
        n: u32,
        f: u32,
        checkpoint_interval: u32,
        window: u32,
        batch_size: usize,
        commitment_workers: usize,
        client_timeout_ms: u64,
        view_change_timeout_ms: u64,
        service: S,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let sysinfo = Arc::new(SystemInfo::new(n, f, self_id));
        let manager = Arc::new(MessageManager::new(window));
        let checkpoint = Arc::new(CheckpointManager::new(checkpoint_interval, window));
        let view_change = Arc::new(ViewChangeManager::new(
            sysinfo.clone(),
            manager.clone(),
            collaborators.broadcaster.clone(),
            collaborators.signer.clone(),
        ));
        let response: Arc<ResponseManager<S::Reply>> = Arc::new(ResponseManager::new());
        let timeouts = Arc::new(TimeoutManager::spawn());
        let workers = WorkerPool::new(commitment_workers.max(1));
        let stats = Arc::new(Stats::new());

        let commitment = Commitment::new(
            NodeId::from(self_id),
            sysinfo.clone(),
            manager.clone(),
            collaborators.broadcaster.clone(),
            collaborators.signer.clone(),
        );

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let executor = executable::spawn(service, result_tx)?;

        let manager = Self {
            self_id: NodeId::from(self_id),
            sysinfo,
            manager,
            commitment,
            checkpoint,
            view_change,
            response,
            executor,
            timeouts,
            workers,
            broadcaster: collaborators.broadcaster,
            verifier: collaborators.verifier,
            signer: collaborators.signer,
            stats,
            keys: collaborators.keys,
            checkpoint_interval,
            window,
            pending_batch: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            complaint_timeout: Duration::from_millis(client_timeout_ms.max(1)),
            view_change_timeout: Duration::from_millis(view_change_timeout_ms.max(1)),
            pending_complaints: Mutex::new(crate::bft::collections::hash_map()),
        };
        let manager = Arc::new(manager);

        let reply_manager = manager.clone();
        std::thread::Builder::new()
            .name("bft-reply".to_owned())
            .spawn(move || {
                while let Ok(result) = result_rx.recv() {
                    reply_manager.handle_execution_result(result);
                }
            })
            .expect("failed to spawn reply thread");

        let timeout_manager = manager.clone();
        std::thread::Builder::new()
            .name("bft-timeout-dispatch".to_owned())
            .spawn(move || {
                while let Some((_, kind)) = timeout_manager.timeouts.recv_fired() {
                    timeout_manager.handle_fired_timeout(kind);
                }
            })
            .expect("failed to spawn timeout dispatch thread");

        Ok(manager)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn is_primary(&self) -> bool {
        self.sysinfo.is_primary()
    }

    /// Whether this replica currently has a `ViewChange` in flight,
    /// buffering non-view-change traffic until a `NewView` installs.
    pub fn is_changing_view(&self) -> bool {
        self.view_change.is_changing_view()
    }

    pub fn view(&self) -> u32 {
        self.sysinfo.view().view()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The commitment worker pool, for a host that wants to hand inbound
    /// messages to [`ConsensusManager::handle_wire`] off its own network
    /// thread (spec §5).
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn checkpoint_interval(&self) -> u32 {
        self.checkpoint_interval
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Entry point for every message the host's network layer receives,
    /// whether from a client or a peer replica.
    pub fn handle_wire(&self, wire: WireMessage) -> Result<()> {
        if !wire.is_valid() {
            return Err("malformed wire message").simple(ErrorKind::Communication);
        }
        let header = *wire.header();
        if let Some(public_key) = self.keys.get(&header.from()) {
            if !self.verifier.verify(public_key, wire.payload(), header.signature()) {
                self.stats.record_invalid_signature();
                return Err("signature verification failed").simple(ErrorKind::SignatureInvalid);
            }
        }

        if self.view_change.is_changing_view() {
            let message: SystemMessage<S::Request, S::Reply> = unseal(wire.payload())?;
            return match message {
                SystemMessage::ViewChange(vc) => self.on_view_change(&header, vc),
                SystemMessage::NewView(nv) => self.on_new_view(&nv),
                _ => {
                    self.view_change.buffer(wire);
                    Ok(())
                }
            };
        }

        let message: SystemMessage<S::Request, S::Reply> = unseal(wire.payload())?;
        self.dispatch(header, message)
    }

    fn dispatch(&self, header: Header, message: SystemMessage<S::Request, S::Reply>) -> Result<()> {
        match message {
            SystemMessage::Request(request) => self.on_client_request(header.from(), request),
            SystemMessage::Consensus(consensus) => self.on_consensus(&header, consensus),
            SystemMessage::Checkpoint(checkpoint) => self.on_checkpoint(&header, checkpoint),
            SystemMessage::ViewChange(vc) => self.on_view_change(&header, vc),
            SystemMessage::NewView(nv) => self.on_new_view(&nv),
            SystemMessage::Reply(_) | SystemMessage::QueryState(_) => Ok(()),
        }
    }

    fn on_client_request(&self, proxy_id: NodeId, request: RequestMessage<S::Request>) -> Result<()> {
        if let Some(cached) = self.response.cached_reply(request.proxy_id(), request.user_seq()) {
            return self.send_reply(proxy_id, cached);
        }

        if !self.is_primary() {
            // Not the primary: forward to it and start this replica's own
            // complaint timer (spec §4.3's "complaint timer per in-flight
            // client request"). If the primary is honest a PrePrepare
            // carrying this request cancels the timer before it fires; if
            // not, firing escalates to a view change (spec §4.4, scenario 4).
            let key = (request.proxy_id(), request.user_seq());
            if self.pending_complaints.lock().contains_key(&key) {
                return Ok(());
            }
            let primary = NodeId::from(self.sysinfo.view().leader());
            let forward: SystemMessage<S::Request, S::Reply> = SystemMessage::Request(request);
            self.seal_and_send(primary, forward)?;

            let id = self
                .timeouts
                .schedule(TimeoutKind::Complaint { proxy_id: key.0, user_seq: key.1 }, self.complaint_timeout);
            self.pending_complaints.lock().insert(key, id);
            return Ok(());
        }

        let mut batch = self.pending_batch.lock();
        batch.push(request);
        if batch.len() >= self.batch_size {
            let drained = std::mem::take(&mut *batch);
            drop(batch);
            self.commitment.propose(drained)?;
        }
        Ok(())
    }

    /// Cancels the complaint timer for every request named by a just-seen
    /// `PrePrepare`, since they are now on their way through the pipeline.
    fn cancel_complaints_for(&self, batch: &[RequestMessage<S::Request>]) {
        let mut pending = self.pending_complaints.lock();
        for request in batch {
            if let Some(id) = pending.remove(&(request.proxy_id(), request.user_seq())) {
                self.timeouts.cancel(id);
            }
        }
    }

    fn handle_fired_timeout(&self, kind: TimeoutKind) {
        match kind {
            TimeoutKind::Complaint { proxy_id, user_seq } => {
                self.pending_complaints.lock().remove(&(proxy_id, user_seq));
                tracing::warn!(proxy_id, user_seq, "complaint timer fired, escalating to view change");
                self.escalate_view_change();
            }
            TimeoutKind::ViewChange { view } => {
                if view >= self.sysinfo.view().view() {
                    tracing::warn!(view, "view-change timer fired, escalating");
                    self.view_change.mark_timed_out();
                    self.escalate_view_change();
                }
            }
            TimeoutKind::CheckpointMissing { since } => {
                tracing::warn!(?since, "no new stable checkpoint since this sequence");
            }
        }
    }

    /// Starts (or re-broadcasts) this replica's `ViewChange` vote, and
    /// schedules the next escalation in case the new view also stalls.
    fn escalate_view_change(&self) {
        if self.view_change.begin_view_change().is_err() {
            return;
        }
        let target = match self.view_change.state() {
            ViewChangeState::ChangingView { target_view } => target_view,
            ViewChangeState::Normal => self.sysinfo.view().next_view().view(),
        };
        self.timeouts.schedule(TimeoutKind::ViewChange { view: target }, self.view_change_timeout);
    }

    fn on_consensus(&self, header: &Header, message: ConsensusMessage<S::Request>) -> Result<()> {
        match message.kind() {
            ConsensusMessageKind::PrePrepare(_, batch) => {
                self.cancel_complaints_for(batch);
                self.commitment.handle_pre_prepare(header, &message)
            }
            ConsensusMessageKind::Prepare(_) => self.commitment.handle_prepare(header, &message),
            ConsensusMessageKind::Commit(_) => {
                let ready = self.commitment.handle_commit(header, &message)?;
                for (seq, batch) in ready {
                    self.queue_for_execution(seq, batch)?;
                }
                Ok(())
            }
        }
    }

    fn queue_for_execution(&self, _seq: crate::bft::ordering::SeqNo, batch: Vec<RequestMessage<S::Request>>) -> Result<()> {
        let mut update_batch = UpdateBatch::new();
        for request in &batch {
            let bytes = bincode::serialize(request.operation()).wrapped(ErrorKind::Serialize)?;
            let digest = Digest::from_data(&bytes);
            update_batch.add(NodeId::from(request.proxy_id()), digest, request.operation().clone());
        }
        self.executor.queue_update(update_batch)
    }

    /// Folds the local KV engine's digest into a `Checkpoint` vote at
    /// `seq`, called by the host once the execution thread confirms
    /// `seq` -- a checkpoint boundary -- has run (spec §4.5).
    pub fn trigger_checkpoint(&self, seq: crate::bft::ordering::SeqNo, storage: &dyn Storage) -> Result<()> {
        let digest = CheckpointManager::compute_state_digest(storage)?;
        let signature = self.signer.sign(digest.as_ref());
        if let Some(stable) = self.checkpoint.record_checkpoint(seq, digest, self.self_id, signature, self.sysinfo.view().quorum()) {
            self.manager.truncate_below(stable.sequence_number());
        }
        let message: SystemMessage<S::Request, S::Reply> =
            SystemMessage::Checkpoint(CheckpointMessage::new(seq, digest));
        self.seal_and_broadcast(message)
    }

    fn on_checkpoint(&self, header: &Header, message: CheckpointMessage) -> Result<()> {
        let quorum = self.sysinfo.view().quorum();
        if let Some(stable) = self.checkpoint.record_checkpoint(
            message.last_included_seq(),
            *message.digest(),
            header.from(),
            *header.signature(),
            quorum,
        ) {
            self.manager.truncate_below(stable.sequence_number());
        }
        Ok(())
    }

    fn on_view_change(&self, header: &Header, message: ViewChangeMessage<S::Request>) -> Result<()> {
        if let Some(new_view) = self.view_change.handle_view_change(header, message)? {
            self.install_new_view(&new_view)?;
        }
        Ok(())
    }

    fn on_new_view(&self, message: &NewViewMessage<S::Request>) -> Result<()> {
        self.install_new_view(message)
    }

    fn install_new_view(&self, message: &NewViewMessage<S::Request>) -> Result<()> {
        self.view_change.handle_new_view(message)?;
        for buffered in self.view_change.drain_buffered() {
            self.handle_wire(buffered)?;
        }
        Ok(())
    }

    fn handle_execution_result(&self, result: ExecutionResult<S::State, S::Reply>) {
        let replies = match result {
            ExecutionResult::Replies(r) => r,
            ExecutionResult::RepliesWithAppstate(r, _) => r,
        };
        for update_reply in replies.into_inner() {
            let (to, _digest, payload) = update_reply.into_inner();
            if let Ok(payload) = payload {
                let reply = ReplyMessage::new(to.id(), 0, self.self_id.id(), payload);
                let _ = self.send_reply(to, reply);
            }
        }
    }

    fn send_reply(&self, to: NodeId, reply: ReplyMessage<S::Reply>) -> Result<()> {
        self.response.record_reply(reply.proxy_id(), reply.user_seq(), reply.clone());
        let message: SystemMessage<S::Request, S::Reply> = SystemMessage::Reply(reply);
        self.seal_and_send(to, message)
    }

    fn seal_and_send(&self, to: NodeId, message: SystemMessage<S::Request, S::Reply>) -> Result<()> {
        let signer = self.signer.clone();
        let wire = seal(self.self_id, to, &message, |bytes| signer.sign(bytes))?;
        self.broadcaster.send(to, wire)
    }

    fn seal_and_broadcast(&self, message: SystemMessage<S::Request, S::Reply>) -> Result<()> {
        let signer = self.signer.clone();
        let wire = seal(self.self_id, self.self_id, &message, |bytes| signer.sign(bytes))?;
        let targets: Vec<NodeId> = NodeId::targets_range(0..self.sysinfo.n()).collect();
        self.broadcaster.broadcast(&targets, wire);
        Ok(())
    }
}

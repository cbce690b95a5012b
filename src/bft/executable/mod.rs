//! User application execution.
//!
//! Execution runs on a single dedicated thread (per spec's concurrency
//! model): consensus delivers a decided batch over a bounded channel,
//! the executor thread applies each request in order against the
//! service's state, and replies flow back over a second channel to the
//! response manager. Only one thread ever mutates the state, so the
//! service implementation itself never needs to synchronize.

use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// A single client update request queued for execution.
#[derive(Clone)]
pub struct Update<O> {
    from: NodeId,
    digest: Digest,
    operation: O,
}

impl<O> Update<O> {
    pub fn new(from: NodeId, digest: Digest, operation: O) -> Self {
        Self {
            from,
            digest,
            operation,
        }
    }

    pub fn into_inner(self) -> (NodeId, Digest, O) {
        (self.from, self.digest, self.operation)
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }
}

/// A single client update reply, produced by executing an [`Update`].
#[derive(Clone)]
pub struct UpdateReply<P> {
    to: NodeId,
    digest: Digest,
    payload: Result<P>,
}

impl<P> UpdateReply<P> {
    pub fn into_inner(self) -> (NodeId, Digest, Result<P>) {
        (self.to, self.digest, self.payload)
    }
}

/// A batch of client update requests to be executed in order.
#[derive(Clone, Default)]
pub struct UpdateBatch<O> {
    inner: Vec<Update<O>>,
}

impl<O> UpdateBatch<O> {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn add(&mut self, from: NodeId, digest: Digest, operation: O) {
        self.inner.push(Update::new(from, digest, operation));
    }

    pub fn into_inner(self) -> Vec<Update<O>> {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<O> AsRef<[Update<O>]> for UpdateBatch<O> {
    fn as_ref(&self) -> &[Update<O>] {
        &self.inner[..]
    }
}

/// A batch of client update replies, produced from an [`UpdateBatch`].
#[derive(Clone, Default)]
pub struct UpdateBatchReplies<P> {
    inner: Vec<UpdateReply<P>>,
}

impl<P> UpdateBatchReplies<P> {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            inner: Vec::with_capacity(n),
        }
    }

    pub fn add(&mut self, to: NodeId, digest: Digest, payload: Result<P>) {
        self.inner.push(UpdateReply { to, digest, payload });
    }

    pub fn into_inner(self) -> Vec<UpdateReply<P>> {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

enum ExecutionRequest<S, O> {
    InstallState(S, Vec<O>),
    Update(UpdateBatch<O>),
    UpdateAndGetAppstate(UpdateBatch<O>),
}

/// What the executor delivers back to the dispatcher once a batch runs.
pub enum ExecutionResult<S, P> {
    Replies(UpdateBatchReplies<P>),
    RepliesWithAppstate(UpdateBatchReplies<P>, S),
}

/// The application logic replicated by the consensus pipeline.
///
/// This generalizes the donor library's infallible `update` into one
/// that returns a `Result`: a versioned KV operation can fail with a
/// typed error (version mismatch, wrong interface for the key) that
/// must reach the client as a reply rather than abort the replica.
pub trait Service: Send {
    type State: Clone + Send;
    type Request: Send;
    type Reply: Send;

    /// Returns the initial state of the application.
    fn initial_state(&mut self) -> Result<Self::State>;

    /// Applies a single client request to `state`, producing a reply.
    fn update(&mut self, state: &mut Self::State, request: Self::Request) -> Result<Self::Reply>;
}

/// Handle used by other threads to queue work for the executor thread.
pub struct ExecutorHandle<S: Service> {
    e_tx: Sender<ExecutionRequest<S::State, S::Request>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            e_tx: self.e_tx.clone(),
        }
    }
}

impl<S> ExecutorHandle<S>
where
    S: Service + 'static,
    S::State: 'static,
    S::Request: 'static,
{
    pub fn install_state(&self, state: S::State, after: Vec<S::Request>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::InstallState(state, after))
            .simple(ErrorKind::Executable)
    }

    pub fn queue_update(&self, batch: UpdateBatch<S::Request>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::Update(batch))
            .simple(ErrorKind::Executable)
    }

    pub fn queue_update_and_get_appstate(&self, batch: UpdateBatch<S::Request>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::UpdateAndGetAppstate(batch))
            .simple(ErrorKind::Executable)
    }
}

/// Spawns the dedicated execution thread.
///
/// `result_tx` carries every [`ExecutionResult`] back to the component
/// that drives client replies (the response manager).
pub fn spawn<S>(mut service: S, result_tx: Sender<ExecutionResult<S::State, S::Reply>>) -> Result<ExecutorHandle<S>>
where
    S: Service + 'static,
    S::State: 'static,
    S::Request: 'static,
    S::Reply: 'static,
{
    let (e_tx, e_rx): (_, Receiver<ExecutionRequest<S::State, S::Request>>) =
        crossbeam_channel::unbounded();

    let mut state = service.initial_state()?;

    thread::Builder::new()
        .name("bft-executor".to_owned())
        .spawn(move || {
            while let Ok(exec_req) = e_rx.recv() {
                match exec_req {
                    ExecutionRequest::InstallState(checkpoint, after) => {
                        state = checkpoint;
                        for req in after {
                            let _ = service.update(&mut state, req);
                        }
                    }
                    ExecutionRequest::Update(batch) => {
                        let mut replies = UpdateBatchReplies::with_capacity(batch.len());
                        for update in batch.into_inner() {
                            let (peer_id, dig, req) = update.into_inner();
                            let reply = service.update(&mut state, req);
                            replies.add(peer_id, dig, reply);
                        }
                        if result_tx.send(ExecutionResult::Replies(replies)).is_err() {
                            break;
                        }
                    }
                    ExecutionRequest::UpdateAndGetAppstate(batch) => {
                        let mut replies = UpdateBatchReplies::with_capacity(batch.len());
                        for update in batch.into_inner() {
                            let (peer_id, dig, req) = update.into_inner();
                            let reply = service.update(&mut state, req);
                            replies.add(peer_id, dig, reply);
                        }
                        let snapshot = state.clone();
                        if result_tx
                            .send(ExecutionResult::RepliesWithAppstate(replies, snapshot))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        })
        .expect("failed to spawn executor thread");

    Ok(ExecutorHandle { e_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::Digest;

    struct EchoService;

    impl Service for EchoService {
        type State = u64;
        type Request = u64;
        type Reply = u64;

        fn initial_state(&mut self) -> Result<Self::State> {
            Ok(0)
        }

        fn update(&mut self, state: &mut Self::State, request: Self::Request) -> Result<Self::Reply> {
            *state += request;
            Ok(*state)
        }
    }

    #[test]
    fn executor_applies_batch_in_order() {
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let handle = spawn(EchoService, result_tx).unwrap();

        let mut batch = UpdateBatch::new();
        batch.add(NodeId::from(0), Digest::from_data(b"a"), 1u64);
        batch.add(NodeId::from(0), Digest::from_data(b"b"), 2u64);
        handle.queue_update(batch).unwrap();

        match result_rx.recv().unwrap() {
            ExecutionResult::Replies(replies) => {
                let replies = replies.into_inner();
                assert_eq!(replies.len(), 2);
                let (_, _, first) = replies[0].clone().into_inner();
                let (_, _, second) = replies[1].clone().into_inner();
                assert_eq!(first.unwrap(), 1);
                assert_eq!(second.unwrap(), 3);
            }
            _ => panic!("unexpected result"),
        }
    }
}

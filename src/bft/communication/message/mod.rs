//! Wire message shapes traded between replicas and clients.
//!
//! `SystemMessage` enumerates every message kind spec'd for the
//! consensus pipeline: client requests and replies, the three-phase
//! commit messages, checkpoint digests, view-change/new-view, and state
//! queries used by recovery. Real framing and signing of these messages
//! over a socket is a [`crate::bft::communication::Broadcaster`]
//! concern; this module only describes their shape.

use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// A signed message ready to be handed to a [`crate::bft::communication::Broadcaster`].
#[derive(Debug, Clone)]
pub struct WireMessage {
    header: Header,
    payload: Vec<u8>,
}

/// Metadata that accompanies every message in transit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub(crate) version: u32,
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) length: u64,
    pub(crate) signature: Signature,
}

impl Header {
    pub const CURRENT_VERSION: u32 = 0;

    pub fn from(&self) -> NodeId {
        NodeId::from(self.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId::from(self.to)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl WireMessage {
    pub fn new(from: NodeId, to: NodeId, payload: Vec<u8>, signature: Signature) -> Self {
        let header = Header {
            version: Header::CURRENT_VERSION,
            from: from.into(),
            to: to.into(),
            length: payload.len() as u64,
            signature,
        };
        Self { header, payload }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_inner(self) -> (Header, Vec<u8>) {
        (self.header, self.payload)
    }

    /// Checks wire-level validity -- the protocol version and declared
    /// length match. Signature verification needs the payload and the
    /// sender's public key, so it happens one layer up, where both are
    /// in scope.
    pub fn is_valid(&self) -> bool {
        self.header.version == Header::CURRENT_VERSION
            && self.header.length as usize == self.payload.len()
    }
}

/// Serializes a system message and signs it, ready for sending.
pub fn seal<O, P>(
    from: NodeId,
    to: NodeId,
    message: &SystemMessage<O, P>,
    sign: impl FnOnce(&[u8]) -> Signature,
) -> Result<WireMessage>
where
    O: Serialize,
    P: Serialize,
{
    let payload = bincode::serialize(message).wrapped(ErrorKind::CommunicationMessage)?;
    let signature = sign(&payload);
    Ok(WireMessage::new(from, to, payload, signature))
}

/// Deserializes the payload of a [`WireMessage`] back into a
/// [`SystemMessage`].
pub fn unseal<O, P>(payload: &[u8]) -> Result<SystemMessage<O, P>>
where
    O: for<'de> Deserialize<'de>,
    P: for<'de> Deserialize<'de>,
{
    bincode::deserialize(payload).wrapped(ErrorKind::CommunicationMessage)
}

/// Every message kind traded between replicas and clients.
///
/// `O` is the client operation type and `P` is the reply payload type;
/// both are supplied by the executable layer (see
/// [`crate::bft::kvservice`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemMessage<O, P> {
    Request(RequestMessage<O>),
    Reply(ReplyMessage<P>),
    Consensus(ConsensusMessage<O>),
    Checkpoint(CheckpointMessage),
    ViewChange(ViewChangeMessage<O>),
    NewView(NewViewMessage<O>),
    QueryState(QueryStateMessage),
}

/// A request submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage<O> {
    proxy_id: u32,
    user_seq: u64,
    operation: O,
}

impl<O> RequestMessage<O> {
    pub fn new(proxy_id: u32, user_seq: u64, operation: O) -> Self {
        Self {
            proxy_id,
            user_seq,
            operation,
        }
    }

    pub fn proxy_id(&self) -> u32 {
        self.proxy_id
    }

    pub fn user_seq(&self) -> u64 {
        self.user_seq
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }

    pub fn into_operation(self) -> O {
        self.operation
    }
}

/// A reply to a previously submitted request, signed by the replica
/// that executed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessage<P> {
    proxy_id: u32,
    user_seq: u64,
    replica_id: u32,
    payload: P,
}

impl<P> ReplyMessage<P> {
    pub fn new(proxy_id: u32, user_seq: u64, replica_id: u32, payload: P) -> Self {
        Self {
            proxy_id,
            user_seq,
            replica_id,
            payload,
        }
    }

    pub fn proxy_id(&self) -> u32 {
        self.proxy_id
    }

    pub fn user_seq(&self) -> u64 {
        self.user_seq
    }

    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }
}

/// A consensus sub-protocol message: `PrePrepare`, `Prepare` or
/// `Commit`, scoped to a view and sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMessage<O> {
    view: u32,
    seq: SeqNo,
    kind: ConsensusMessageKind<O>,
}

impl<O> ConsensusMessage<O> {
    pub fn new(view: u32, seq: SeqNo, kind: ConsensusMessageKind<O>) -> Self {
        Self { view, seq, kind }
    }

    pub fn view(&self) -> u32 {
        self.view
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    pub fn kind(&self) -> &ConsensusMessageKind<O> {
        &self.kind
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessageKind<O> {
    /// Proposes a batch of requests. Only ever sent by the primary.
    /// `Digest` is the hash of the serialized batch.
    PrePrepare(Digest, Vec<RequestMessage<O>>),
    /// Votes to prepare the batch identified by `Digest`.
    Prepare(Digest),
    /// Votes to commit the batch identified by `Digest`.
    Commit(Digest),
}

/// A stable checkpoint proposal: the digest of the state at
/// `last_included_seq`, signed by the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMessage {
    last_included_seq: SeqNo,
    digest: Digest,
}

impl CheckpointMessage {
    pub fn new(last_included_seq: SeqNo, digest: Digest) -> Self {
        Self {
            last_included_seq,
            digest,
        }
    }

    pub fn last_included_seq(&self) -> SeqNo {
        self.last_included_seq
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// A replica's claim that the current view's primary is faulty, along
/// with the set `P` of prepared-but-not-yet-committed proofs it wants
/// reproposed in the next view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeMessage<O> {
    new_view: u32,
    last_stable_seq: SeqNo,
    prepared: Vec<PreparedProof<O>>,
}

impl<O> ViewChangeMessage<O> {
    pub fn new(new_view: u32, last_stable_seq: SeqNo, prepared: Vec<PreparedProof<O>>) -> Self {
        Self {
            new_view,
            last_stable_seq,
            prepared,
        }
    }

    pub fn new_view(&self) -> u32 {
        self.new_view
    }

    pub fn last_stable_seq(&self) -> SeqNo {
        self.last_stable_seq
    }

    pub fn prepared(&self) -> &[PreparedProof<O>] {
        &self.prepared
    }
}

/// Proof that a batch reached the `Prepared` state, carried inside a
/// `ViewChange` so the new primary can reuse it instead of asking
/// clients to resubmit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedProof<O> {
    seq: SeqNo,
    digest: Digest,
    batch: Vec<RequestMessage<O>>,
}

impl<O> PreparedProof<O> {
    pub fn new(seq: SeqNo, digest: Digest, batch: Vec<RequestMessage<O>>) -> Self {
        Self { seq, digest, batch }
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn batch(&self) -> &[RequestMessage<O>] {
        &self.batch
    }
}

/// Sent by the new primary once it collects a quorum of `ViewChange`
/// messages, announcing the view is now active and which sequences are
/// to be reproposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewViewMessage<O> {
    view: u32,
    proofs: Vec<PreparedProof<O>>,
}

impl<O> NewViewMessage<O> {
    pub fn new(view: u32, proofs: Vec<PreparedProof<O>>) -> Self {
        Self { view, proofs }
    }

    pub fn view(&self) -> u32 {
        self.view
    }

    pub fn proofs(&self) -> &[PreparedProof<O>] {
        &self.proofs
    }
}

/// Requests a state transfer from peers, used by recovery to catch up
/// to the current stable checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateMessage {
    known_seq: SeqNo,
}

impl QueryStateMessage {
    pub fn new(known_seq: SeqNo) -> Self {
        Self { known_seq }
    }

    pub fn known_seq(&self) -> SeqNo {
        self.known_seq
    }
}

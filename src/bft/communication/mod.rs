//! Inter-replica and client-replica communication.
//!
//! Real transport -- socket framing, TLS, reconnection -- is an external
//! collaborator out of scope for this crate; components here program
//! against [`Broadcaster`], a trait a host application implements over
//! whatever transport it runs. What lives in this crate is addressing
//! ([`NodeId`]) and the wire message shape ([`message`]).

pub mod message;

use std::ops::Range;

use message::WireMessage;

use crate::bft::error::*;

/// Uniquely identifies a replica or client connected to the system.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }

    pub fn targets_range(range: Range<u32>) -> impl Iterator<Item = Self> {
        range.map(Self)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Sends serialized, signed protocol messages to other nodes.
///
/// A replica's dispatcher and each of its protocol components hold a
/// shared `Arc<dyn Broadcaster>` and call into it whenever the protocol
/// calls for sending a message; delivery, retries and connection
/// management belong to the implementation, not to this crate.
pub trait Broadcaster: Send + Sync {
    /// Sends `message` to a single node.
    fn send(&self, target: NodeId, message: WireMessage) -> Result<()>;

    /// Sends `message` to every node in `targets`.
    fn broadcast(&self, targets: &[NodeId], message: WireMessage) {
        for &target in targets {
            let _ = self.send(target, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_through_u32() {
        let id = NodeId::from(7u32);
        assert_eq!(u32::from(id), 7);
    }

    #[test]
    fn targets_builds_from_iterator() {
        let ids: Vec<NodeId> = NodeId::targets(0..4u32).collect();
        assert_eq!(ids.len(), 4);
    }
}

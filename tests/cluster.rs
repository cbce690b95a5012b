//! End-to-end scenarios (spec §8) driven against small in-process replica
//! clusters, wired together through an in-memory [`Broadcaster`] instead
//! of real sockets -- the network layer is an external collaborator this
//! crate does not provide (spec §1).

use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bft::bft::collections;
use bft::bft::communication::message::{seal, ConsensusMessage, ConsensusMessageKind, RequestMessage, SystemMessage, WireMessage};
use bft::bft::communication::{Broadcaster, NodeId};
use bft::bft::core::{Collaborators, ConsensusManager};
use bft::bft::crypto::hash::Digest;
use bft::bft::crypto::signature::{NullSigner, NullVerifier, PublicKey, Signature, Verifier};
use bft::bft::error::{ErrorKind, Result};
use bft::bft::kvservice::{KvReply, KvRequest, KvService};
use bft::bft::storage::{MemoryBackend, Storage};

type Node = ConsensusManager<KvService<MemoryBackend>>;

/// Routes each replica's outbound traffic straight into the target
/// replica's `handle_wire`, synchronously. Replicas never registered
/// stand in for a replica that is down or partitioned away.
#[derive(Default)]
struct InMemoryNetwork {
    nodes: Mutex<StdHashMap<u32, Arc<Node>>>,
}

impl InMemoryNetwork {
    fn register(&self, id: u32, node: Arc<Node>) {
        self.nodes.lock().unwrap().insert(id, node);
    }
}

impl Broadcaster for InMemoryNetwork {
    fn send(&self, target: NodeId, message: WireMessage) -> Result<()> {
        let node = self.nodes.lock().unwrap().get(&target.id()).cloned();
        if let Some(node) = node {
            let _ = node.handle_wire(message);
        }
        Ok(())
    }
}

struct Cluster {
    nodes: Vec<Arc<Node>>,
    backends: Vec<MemoryBackend>,
}

fn spawn_cluster(n: u32, batch_size: usize, client_timeout_ms: u64, view_change_timeout_ms: u64, excluded: &[u32]) -> Cluster {
    let f = (n - 1) / 3;
    let network: Arc<InMemoryNetwork> = Arc::new(InMemoryNetwork::default());
    let mut nodes = Vec::new();
    let mut backends = Vec::new();

    for id in 0..n {
        let backend = MemoryBackend::new();
        backends.push(backend.clone());
        let service = KvService::new(backend);
        let signer = Arc::new(NullSigner(PublicKey::from_bytes(&[0u8; 32]).unwrap()));
        let verifier: Arc<dyn Verifier> = Arc::new(NullVerifier);
        let collaborators = Collaborators {
            broadcaster: network.clone(),
            verifier,
            signer,
            keys: collections::hash_map(),
        };
        let node = ConsensusManager::spawn(
            id,
            n,
            f,
            128,
            100,
            batch_size,
            2,
            client_timeout_ms,
            view_change_timeout_ms,
            service,
            collaborators,
        )
        .expect("cluster node spawns cleanly");

        if !excluded.contains(&id) {
            network.register(id, node.clone());
        }
        nodes.push(node);
    }

    Cluster { nodes, backends }
}

/// Submits a client request directly into `node`, as a client's own
/// network stack would after connecting to it.
fn submit(node: &Node, proxy_id: u32, user_seq: u64, op: KvRequest) {
    let message: SystemMessage<KvRequest, KvReply> = SystemMessage::Request(RequestMessage::new(proxy_id, user_seq, op));
    let wire = seal(NodeId::from(proxy_id), node.self_id(), &message, |_| Signature::zeroed()).unwrap();
    node.handle_wire(wire).unwrap();
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return cond();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn simple_commit_replicates_to_every_replica() {
    let cluster = spawn_cluster(4, 1, 5_000, 10_000, &[]);
    let primary = &cluster.nodes[0];

    submit(primary, 900, 1, KvRequest::Set { key: "a".into(), value: "1".into() });

    let replicated = wait_until(Duration::from_secs(2), || {
        cluster.backends.iter().all(|b| b.get("a").unwrap().as_deref() == Some("1"))
    });
    assert!(replicated, "every replica's storage should converge on the committed value");
}

#[test]
fn versioned_sequence_enforces_occ_and_builds_history() {
    let cluster = spawn_cluster(4, 1, 5_000, 10_000, &[]);
    let primary = &cluster.nodes[0];
    let backend = &cluster.backends[0];

    submit(primary, 901, 1, KvRequest::SetWithVersion { key: "x".into(), value: "v1".into(), version: 0 });
    assert!(wait_until(Duration::from_secs(2), || {
        backend.get_with_version("x", 0).unwrap().as_ref().map(|(_, v)| *v) == Some(1)
    }));

    submit(primary, 901, 2, KvRequest::SetWithVersion { key: "x".into(), value: "v2".into(), version: 1 });
    assert!(wait_until(Duration::from_secs(2), || {
        backend.get_with_version("x", 0).unwrap().as_ref().map(|(_, v)| *v) == Some(2)
    }));

    // Stale version: still gets ordered and executed by consensus, but the
    // storage engine itself rejects the write, leaving state untouched.
    submit(primary, 901, 3, KvRequest::SetWithVersion { key: "x".into(), value: "v3".into(), version: 0 });
    std::thread::sleep(Duration::from_millis(200));

    let latest = backend.get_with_version("x", 0).unwrap().unwrap();
    assert_eq!(latest, ("v2".to_owned(), 2));

    let history = backend.get_top_history("x", 10).unwrap();
    assert_eq!(history, vec![("v2".to_owned(), 2), ("v1".to_owned(), 1)]);
}

#[test]
fn duplicate_client_request_is_answered_from_cache_not_reexecuted() {
    let cluster = spawn_cluster(4, 1, 5_000, 10_000, &[]);
    let primary = &cluster.nodes[0];
    let backend = &cluster.backends[0];

    submit(primary, 902, 1, KvRequest::SetWithVersion { key: "y".into(), value: "v1".into(), version: 0 });
    assert!(wait_until(Duration::from_secs(2), || backend.get_top_history("y", 10).unwrap().len() == 1));

    // A retransmission carrying the same (proxy_id, user_seq) must be
    // answered from the reply cache without re-entering consensus, even
    // though its payload would otherwise be a perfectly valid write (a
    // fresh operation would be indistinguishable from a retransmission
    // if dedup only looked at content) -- spec §4.3/§8 scenario 3.
    submit(primary, 902, 1, KvRequest::SetWithVersion { key: "y".into(), value: "v2".into(), version: 1 });
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(backend.get_top_history("y", 10).unwrap().len(), 1);
}

#[test]
fn silent_primary_makes_a_backup_start_a_view_change() {
    // Replica 0 is the view-0 primary; excluding it from the network
    // simulates it going silent. A backup that forwards a client
    // request to it and never hears back must escalate on its own
    // complaint timer (spec §4.4, §8 scenario 4).
    let cluster = spawn_cluster(4, 1, 60, 5_000, &[0]);
    let backup = &cluster.nodes[1];

    submit(backup, 903, 1, KvRequest::Set { key: "z".into(), value: "1".into() });

    let escalated = wait_until(Duration::from_millis(800), || backup.is_changing_view());
    assert!(escalated, "backup should escalate to a view change once its complaint timer fires");
}

#[test]
fn equivocating_pre_prepare_is_rejected_as_equivocation() {
    let cluster = spawn_cluster(4, 1, 5_000, 10_000, &[]);
    let backup = &cluster.nodes[1];

    let seq = bft::bft::ordering::SeqNo::ZERO;
    let batch_a = vec![RequestMessage::new(1, 1, KvRequest::Get { key: "p".into() })];
    let batch_b = vec![RequestMessage::new(1, 1, KvRequest::Get { key: "q".into() })];
    let digest_a = Digest::from_data(b"batch-a");
    let digest_b = Digest::from_data(b"batch-b");

    let first: SystemMessage<KvRequest, KvReply> = SystemMessage::Consensus(ConsensusMessage::new(
        0,
        seq,
        ConsensusMessageKind::PrePrepare(digest_a, batch_a),
    ));
    let wire_first = seal(NodeId::from(0), backup.self_id(), &first, |_| Signature::zeroed()).unwrap();
    backup.handle_wire(wire_first).expect("first pre-prepare for this slot is accepted");

    let second: SystemMessage<KvRequest, KvReply> = SystemMessage::Consensus(ConsensusMessage::new(
        0,
        seq,
        ConsensusMessageKind::PrePrepare(digest_b, batch_b),
    ));
    let wire_second = seal(NodeId::from(0), backup.self_id(), &second, |_| Signature::zeroed()).unwrap();
    let err = backup
        .handle_wire(wire_second)
        .expect_err("a second, different pre-prepare for the same slot is equivocation");
    assert_eq!(err.kind(), ErrorKind::Equivocation);
}

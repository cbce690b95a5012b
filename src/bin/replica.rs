//! Replica host process (spec §6): reads a [`ReplicaConfig`], wires up
//! key material and a [`ConsensusManager`], and blocks forever handing
//! inbound wire traffic to it.
//!
//! Real transport is an external collaborator (spec §1) this crate does
//! not provide; this binary stands in a [`LoggingBroadcaster`] that only
//! traces what would have gone out over the wire, so the process is
//! runnable end-to-end without a network stack.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use bft::bft::collections::{self, HashMap};
use bft::bft::communication::message::WireMessage;
use bft::bft::communication::{Broadcaster, NodeId};
use bft::bft::config::ReplicaConfig;
use bft::bft::core::{Collaborators, ConsensusManager};
use bft::bft::crypto::signature::{PublicKey, Signer, Verifier};
use bft::bft::error::ErrorKind;
use bft::bft::kvservice::KvService;
use bft::bft::storage::MemoryBackend;
use bft::bft::{self as bft_lib, InitConfig};

#[derive(Parser)]
#[command(name = "replica")]
#[command(author, version, about = "Runs one replica of the permissioned BFT replicated KV store")]
struct Cli {
    /// Path to the replica group's JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

/// Sends outbound protocol traffic nowhere but the trace log.
///
/// Stands in for the real network layer spec §1 places out of this
/// crate's scope: a host application swaps this for a socket-backed
/// [`Broadcaster`] without touching anything else here.
struct LoggingBroadcaster;

impl Broadcaster for LoggingBroadcaster {
    fn send(&self, target: NodeId, message: WireMessage) -> bft::bft::error::Result<()> {
        tracing::debug!(target = target.id(), bytes = message.payload().len(), "would send wire message");
        Ok(())
    }
}

#[cfg(feature = "crypto_signature_ring_ed25519")]
fn load_signer(config: &ReplicaConfig) -> bft::bft::error::Result<Arc<dyn Signer>> {
    use bft::bft::crypto::signature::KeyPair;
    use bft::bft::error::*;

    let pkcs8 = std::fs::read(&config.signing_key_path).wrapped(ErrorKind::Crypto)?;
    let keypair = KeyPair::from_pkcs8(&pkcs8)?;
    Ok(Arc::new(keypair))
}

#[cfg(not(feature = "crypto_signature_ring_ed25519"))]
fn load_signer(_config: &ReplicaConfig) -> bft::bft::error::Result<Arc<dyn Signer>> {
    use bft::bft::error::*;
    Err(Error::simple(ErrorKind::Crypto))
}

#[cfg(feature = "crypto_signature_ring_ed25519")]
fn default_verifier() -> Arc<dyn Verifier> {
    Arc::new(bft::bft::crypto::signature::RingVerifier)
}

#[cfg(not(feature = "crypto_signature_ring_ed25519"))]
fn default_verifier() -> Arc<dyn Verifier> {
    struct AcceptAll;
    impl Verifier for AcceptAll {
        fn verify(&self, _: &PublicKey, _: &[u8], _: &bft::bft::crypto::signature::Signature) -> bool {
            true
        }
    }
    Arc::new(AcceptAll)
}

fn load_keys(config: &ReplicaConfig) -> bft::bft::error::Result<HashMap<NodeId, PublicKey>> {
    use bft::bft::error::*;

    let mut keys = collections::hash_map();
    for replica in &config.replicas {
        let raw = std::fs::read(&replica.public_key_cert).wrapped(ErrorKind::Crypto)?;
        let public_key = PublicKey::from_bytes(&raw)?;
        keys.insert(NodeId::from(replica.id), public_key);
    }
    Ok(keys)
}

fn run(cli: Cli) -> bft::bft::error::Result<()> {
    let config = ReplicaConfig::from_file(&cli.config)?;

    let signer = load_signer(&config)?;
    let verifier = default_verifier();
    let keys = load_keys(&config)?;

    let collaborators = Collaborators {
        broadcaster: Arc::new(LoggingBroadcaster),
        verifier,
        signer,
        keys,
    };

    let backend = MemoryBackend::new();
    let service = KvService::new(backend);

    let manager = ConsensusManager::spawn(
        config.self_id,
        config.n(),
        config.f(),
        config.checkpoint_interval,
        config.window_size,
        config.batch_size,
        config.commitment_workers,
        config.client_timeout_ms,
        config.view_change_timeout_ms,
        service,
        collaborators,
    )?;

    tracing::info!(
        self_id = config.self_id,
        n = config.n(),
        f = config.f(),
        primary = manager.is_primary(),
        "replica started"
    );

    // Transport is out of scope (spec §1): the process stays alive so
    // the background threads spawned by `ConsensusManager::spawn` keep
    // running, the way a host's real network loop would hand inbound
    // wire traffic to `manager.handle_wire` from here.
    loop {
        std::thread::park();
    }
}

fn main() -> ExitCode {
    let _guard = match bft_lib::init(InitConfig::default()) {
        Ok(guard) => guard,
        Err(_) => return ExitCode::FAILURE,
    };

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "replica exited with an error");
            match e.kind() {
                ErrorKind::ConfigInvalid => ExitCode::from(64),
                ErrorKind::Crypto => ExitCode::from(65),
                ErrorKind::Communication | ErrorKind::CommunicationMessage => ExitCode::from(66),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

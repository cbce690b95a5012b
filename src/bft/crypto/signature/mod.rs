//! Message signatures and the `Verifier`/`Signer` seams.
//!
//! Real replicas authenticate every consensus message with Ed25519 over
//! `ring`; the test suite swaps in [`NullVerifier`], which accepts any
//! signature, so protocol tests don't need to wire up real key material.
//! Key distribution and certificate management are out of scope -- see
//! spec's external collaborators list -- so this module only deals with
//! raw key bytes and signing/verification over byte slices.

use std::fmt;

#[cfg(feature = "crypto_signature_ring_ed25519")]
use ring::signature::{Ed25519KeyPair, KeyPair as _, UnparsedPublicKey, ED25519};
#[cfg(feature = "crypto_signature_ring_ed25519")]
use ring::rand::SystemRandom;

use serde::{Deserialize, Serialize};

use crate::bft::error::*;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// A replica's public key.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != PUBLIC_KEY_LENGTH {
            return Err("public key has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; PUBLIC_KEY_LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// A signature over some serialized message payload.
#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != SIGNATURE_LENGTH {
            return Err("signature has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; SIGNATURE_LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }

    pub fn zeroed() -> Self {
        Self([0; SIGNATURE_LENGTH])
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig(..)")
    }
}

/// A replica's signing key pair.
#[cfg(feature = "crypto_signature_ring_ed25519")]
pub struct KeyPair {
    inner: Ed25519KeyPair,
    public: PublicKey,
}

#[cfg(feature = "crypto_signature_ring_ed25519")]
impl KeyPair {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .wrapped(ErrorKind::Crypto)?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self> {
        let inner = Ed25519KeyPair::from_pkcs8(bytes).wrapped(ErrorKind::Crypto)?;
        let public = PublicKey::from_bytes(inner.public_key().as_ref())?;
        Ok(Self { inner, public })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        Signature::from_bytes(sig.as_ref()).expect("ring signature length mismatch")
    }
}

/// Verifies signatures attached to consensus messages.
///
/// Implementations must be `Send + Sync`, since messages are verified
/// from the ingress dispatcher thread while other threads hold a
/// reference to the same verifier.
pub trait Verifier: Send + Sync {
    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool;
}

/// Signs outgoing consensus and reply messages with this replica's key.
///
/// Kept as a trait (rather than handing out `KeyPair` directly) so
/// components only ever depend on the capability to sign, never on the
/// key material itself.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Signature;

    fn public_key(&self) -> PublicKey;
}

#[cfg(feature = "crypto_signature_ring_ed25519")]
impl Signer for KeyPair {
    fn sign(&self, message: &[u8]) -> Signature {
        KeyPair::sign(self, message)
    }

    fn public_key(&self) -> PublicKey {
        KeyPair::public_key(self)
    }
}

/// A signer that always produces the zeroed signature, paired with
/// [`NullVerifier`] so tests can exercise the consensus pipeline without
/// real key material.
#[cfg(feature = "test_crypto")]
pub struct NullSigner(pub PublicKey);

#[cfg(feature = "test_crypto")]
impl Signer for NullSigner {
    fn sign(&self, _message: &[u8]) -> Signature {
        Signature::zeroed()
    }

    fn public_key(&self) -> PublicKey {
        self.0
    }
}

/// Verifies Ed25519 signatures using `ring`.
#[cfg(feature = "crypto_signature_ring_ed25519")]
#[derive(Default)]
pub struct RingVerifier;

#[cfg(feature = "crypto_signature_ring_ed25519")]
impl Verifier for RingVerifier {
    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        let key = UnparsedPublicKey::new(&ED25519, public_key.as_ref());
        key.verify(message, signature.as_ref()).is_ok()
    }
}

/// A verifier that accepts any signature.
///
/// Used by tests that exercise the consensus pipeline without wiring up
/// real key material.
#[cfg(feature = "test_crypto")]
#[derive(Default)]
pub struct NullVerifier;

#[cfg(feature = "test_crypto")]
impl Verifier for NullVerifier {
    fn verify(&self, _public_key: &PublicKey, _message: &[u8], _signature: &Signature) -> bool {
        true
    }
}

#[cfg(all(test, feature = "crypto_signature_ring_ed25519"))]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let msg = b"pre-prepare digest goes here";
        let sig = kp.sign(msg);
        let verifier = RingVerifier::default();
        assert!(verifier.verify(&kp.public_key(), msg, &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"original");
        let verifier = RingVerifier::default();
        assert!(!verifier.verify(&kp.public_key(), b"tampered", &sig));
    }
}

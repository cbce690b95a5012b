//! Message digests.
//!
//! Digests identify a `PrePrepare`'s proposed batch and back the
//! checkpoint state digest; both must agree bit-for-bit across correct
//! replicas, so hashing always walks data in a deterministic order (see
//! [`crate::bft::collections::OrderedMap`]).

use std::fmt;

#[cfg(feature = "crypto_hash_ring_sha2")]
use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// A SHA-256 digest over some serialized payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    #[cfg(feature = "crypto_hash_ring_sha2")]
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;
    #[cfg(not(feature = "crypto_hash_ring_sha2"))]
    pub const LENGTH: usize = 32;

    /// Hashes an arbitrary byte slice.
    #[cfg(feature = "crypto_hash_ring_sha2")]
    pub fn from_data(data: &[u8]) -> Self {
        let digest = digest::digest(&SHA256, data);
        Self::from_bytes_unchecked(digest.as_ref())
    }

    /// Hashes an arbitrary byte slice.
    ///
    /// Used when the `ring`-backed hash is compiled out; folds the input
    /// through a fixed-size accumulator so digests stay deterministic
    /// without pulling in a second hashing crate just for tests.
    #[cfg(not(feature = "crypto_hash_ring_sha2"))]
    pub fn from_data(data: &[u8]) -> Self {
        let mut acc = [0u8; Self::LENGTH];
        for (i, byte) in data.iter().enumerate() {
            acc[i % Self::LENGTH] ^= byte.wrapping_add(i as u8);
        }
        Self(acc)
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("digest has an invalid length").wrapped(ErrorKind::Crypto);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

//! Cryptographic primitives used to authenticate consensus messages.
//!
//! Real key material and the wire-level transport that carries signed
//! messages between replicas are external collaborators (see
//! [`crate::bft::communication`]); this module only defines the digest and
//! signature types, and the `Verifier`/`Signer` seams other components
//! program against.

pub mod hash;
pub mod signature;

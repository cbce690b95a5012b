//! `basalt-bft`: a permissioned BFT replicated state machine.
//!
//! The crate implements the PBFT-style three-phase consensus pipeline and
//! the versioned key-value storage engine beneath it. Transport, crypto
//! primitives and alternative ordering protocols are external collaborators
//! modeled as traits (see [`bft::communication`] and [`bft::crypto`]).

pub mod bft;

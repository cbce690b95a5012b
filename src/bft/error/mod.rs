//! Error related business logic of `basalt-bft`.
//!
//! Contains the `ErrorKind` enum and other useful extensions of the
//! `std::result::Result` type, to work with our very own `Error` type.
//!
//! The donor library generated `ErrorKind` from a `build.rs` script that
//! walked the module tree; that indirection bought nothing here and can't
//! be authored without running the build, so the kinds are spelled out
//! directly and given their `Display` impl via `thiserror`.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `basalt_bft::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is
/// used in cases where we want to drop the underlying
/// error type in the `Result`. Having this possibility
/// might be useful when the error type in the `Result`
/// doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another
    /// error implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Io, e)
    }
}

impl error::Error for Error {}

/// Error kinds surfaced by this crate, following spec.md §7.
///
/// `ConfigInvalid`, `SignatureInvalid`, `MessageOutOfWindow`,
/// `Equivocation`, `VersionMismatch`, `VersionedKeyExists`,
/// `NonVersionedKeyExists`, `StorageUnavailable`, `ViewChangeTimeout` and
/// `QueueFull` are exactly the kinds named in the spec; the remaining
/// variants are plumbing (I/O, (de)serialization, internal module faults)
/// that doesn't cross the client-reply or view-change boundary.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid configuration")]
    ConfigInvalid,
    #[error("message signature failed verification")]
    SignatureInvalid,
    #[error("message sequence number outside the watermark window")]
    MessageOutOfWindow,
    #[error("equivocating message detected")]
    Equivocation,
    #[error("optimistic concurrency version mismatch")]
    VersionMismatch,
    #[error("key already has a versioned history")]
    VersionedKeyExists,
    #[error("key already has a non-versioned value")]
    NonVersionedKeyExists,
    #[error("storage backend unavailable")]
    StorageUnavailable,
    #[error("view-change timed out")]
    ViewChangeTimeout,
    #[error("queue is full")]
    QueueFull,
    #[error("communication error")]
    Communication,
    #[error("malformed wire message")]
    CommunicationMessage,
    #[error("message log error")]
    Log,
    #[error("executable layer error")]
    Executable,
    #[error("recovery/WAL error")]
    Recovery,
    #[error("checkpoint error")]
    Checkpoint,
    #[error("cryptography error")]
    Crypto,
    #[error("i/o error")]
    Io,
    #[error("serialization error")]
    Serialize,
    #[error("generic error")]
    Error,
}

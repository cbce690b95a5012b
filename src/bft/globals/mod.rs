//! Process-wide handles that would otherwise be global mutable state.
//!
//! Nothing here is a hidden singleton: `Flag` backs the one-shot init guard
//! in the crate root, and `Stats` is a handle callers construct explicitly
//! and pass by reference into the components that need to bump a counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A one-shot boolean flag, set once and never unset except by the
/// matching `InitGuard` drop.
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn test(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counters for the error kinds spec.md §7 says should be metriced rather
/// than logged at error severity: dropped signatures, out-of-window
/// messages, and detected equivocation.
///
/// Shared via `Arc` by every stage that can observe one of these
/// conditions; reads are for diagnostics only, so relaxed ordering
/// suffices.
#[derive(Default)]
pub struct Stats {
    invalid_signatures: AtomicU64,
    out_of_window: AtomicU64,
    equivocations: AtomicU64,
    queue_full: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invalid_signature(&self) {
        self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_window(&self) {
        self.out_of_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_equivocation(&self) {
        self.equivocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_signatures(&self) -> u64 {
        self.invalid_signatures.load(Ordering::Relaxed)
    }

    pub fn out_of_window(&self) -> u64 {
        self.out_of_window.load(Ordering::Relaxed)
    }

    pub fn equivocations(&self) -> u64 {
        self.equivocations.load(Ordering::Relaxed)
    }

    pub fn queue_full(&self) -> u64 {
        self.queue_full.load(Ordering::Relaxed)
    }
}

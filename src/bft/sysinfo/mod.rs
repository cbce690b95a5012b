//! System info: the replica's view number and the derived primary.
//!
//! Exactly one component -- the view-change manager -- advances the
//! view; everyone else only reads it, so a single `AtomicU32` behind a
//! thin wrapper is enough (single-writer, many-reader, per spec's
//! concurrency model).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::bft::ordering::SeqNo;

/// Static facts about the replica group: how many replicas `n`, and the
/// maximum number of faults `f` tolerated (`n = 3f + 1`).
#[derive(Debug, Copy, Clone)]
pub struct ViewInfo {
    n: u32,
    f: u32,
    view: u32,
}

impl ViewInfo {
    pub fn new(n: u32, f: u32, view: u32) -> Self {
        Self { n, f, view }
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn f(&self) -> u32 {
        self.f
    }

    pub fn view(&self) -> u32 {
        self.view
    }

    /// The replica id acting as primary in this view.
    pub fn leader(&self) -> u32 {
        self.view % self.n
    }

    /// Size of a prepare/commit quorum certificate: `2f`/`2f+1`
    /// respectively collapse to the same threshold function here,
    /// since both are "more than two thirds."
    pub fn quorum(&self) -> u32 {
        2 * self.f + 1
    }

    /// Smallest quorum that proves at least one correct replica
    /// participated (`f + 1`), used by the response manager to gather
    /// client replies.
    pub fn small_quorum(&self) -> u32 {
        self.f + 1
    }

    pub fn with_view(&self, view: u32) -> Self {
        Self { view, ..*self }
    }

    pub fn next_view(&self) -> Self {
        self.with_view(self.view + 1)
    }
}

/// Process-wide, atomically updated view number.
///
/// The view-change manager calls [`SystemInfo::advance_view`] once a
/// `NewView` takes effect; every other component reads the current view
/// via [`SystemInfo::view`] to decide whether it is the primary, or to
/// stamp outgoing messages.
pub struct SystemInfo {
    n: u32,
    f: u32,
    view: AtomicU32,
    self_id: u32,
}

impl SystemInfo {
    pub fn new(n: u32, f: u32, self_id: u32) -> Self {
        Self {
            n,
            f,
            view: AtomicU32::new(0),
            self_id,
        }
    }

    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn f(&self) -> u32 {
        self.f
    }

    pub fn view(&self) -> ViewInfo {
        ViewInfo::new(self.n, self.f, self.view.load(Ordering::Acquire))
    }

    pub fn is_primary(&self) -> bool {
        self.view().leader() == self.self_id
    }

    /// Builds the `ViewInfo` for an arbitrary view number, e.g. to check
    /// which replica will be the primary of a not-yet-installed view
    /// during view-change.
    pub fn view_info_for(&self, view: u32) -> ViewInfo {
        ViewInfo::new(self.n, self.f, view)
    }

    /// Moves to a new view. Panics if `view` would move backwards; the
    /// view-change manager is solely responsible for calling this in
    /// increasing order.
    pub fn advance_view(&self, view: u32) {
        let previous = self.view.fetch_max(view, Ordering::AcqRel);
        debug_assert!(view >= previous, "view numbers must be monotonic");
    }

    /// Computes the next sequence number's slot relative to the low
    /// watermark, used by the checkpoint manager to test whether a
    /// sequence falls inside the current window.
    pub fn in_window(&self, seq: SeqNo, low_water: SeqNo, window: u32) -> bool {
        use either::{Left, Right};
        matches!(seq.index(low_water), Right(i) if (i as u32) < window)
    }
}

//! The timer thread (spec §5): a single thread multiplexes every
//! complaint timer, view-change timer and checkpoint-missing timer,
//! firing events onto a channel the dispatcher polls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::bft::collections::{self, HashSet};
use crate::bft::ordering::SeqNo;

/// What a fired timeout refers to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    /// A backup hasn't seen a `PrePrepare` for this client request in time.
    Complaint { proxy_id: u32, user_seq: u64 },
    /// The primary of `view` has gone silent.
    ViewChange { view: u32 },
    /// No new stable checkpoint has formed since `since`.
    CheckpointMissing { since: SeqNo },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct TimeoutId(u64);

enum Command {
    Schedule { id: TimeoutId, at: Instant, kind: TimeoutKind },
    Cancel(TimeoutId),
}

/// Handle used by every other component to schedule or cancel timeouts,
/// and to drain fired ones.
pub struct TimeoutManager {
    cmd_tx: Sender<Command>,
    fired_rx: Receiver<(TimeoutId, TimeoutKind)>,
    next_id: AtomicU64,
}

impl TimeoutManager {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let (fired_tx, fired_rx) = unbounded();

        thread::Builder::new()
            .name("bft-timers".to_owned())
            .spawn(move || {
                let mut pending: BTreeMap<(Instant, TimeoutId), TimeoutKind> = BTreeMap::new();
                let mut cancelled: HashSet<TimeoutId> = collections::hash_set();

                loop {
                    let wait = pending
                        .keys()
                        .next()
                        .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                        .unwrap_or_else(|| Duration::from_secs(3600));

                    match cmd_rx.recv_timeout(wait) {
                        Ok(Command::Schedule { id, at, kind }) => {
                            pending.insert((at, id), kind);
                        }
                        Ok(Command::Cancel(id)) => {
                            cancelled.insert(id);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            let now = Instant::now();
                            let due: Vec<(Instant, TimeoutId)> =
                                pending.range(..=(now, TimeoutId(u64::MAX))).map(|(k, _)| *k).collect();
                            for key in due {
                                if let Some(kind) = pending.remove(&key) {
                                    if !cancelled.remove(&key.1) {
                                        if fired_tx.send((key.1, kind)).is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("failed to spawn timer thread");

        Self {
            cmd_tx,
            fired_rx,
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedules `kind` to fire after `after`, returning an id that can
    /// later be passed to [`TimeoutManager::cancel`].
    pub fn schedule(&self, kind: TimeoutKind, after: Duration) -> TimeoutId {
        let id = TimeoutId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let at = Instant::now() + after;
        let _ = self.cmd_tx.send(Command::Schedule { id, at, kind });
        id
    }

    pub fn cancel(&self, id: TimeoutId) {
        let _ = self.cmd_tx.send(Command::Cancel(id));
    }

    /// Non-blocking poll for a fired timeout.
    pub fn try_recv_fired(&self) -> Option<(TimeoutId, TimeoutKind)> {
        self.fired_rx.try_recv().ok()
    }

    /// Blocks until a timeout fires or the manager is torn down.
    pub fn recv_fired(&self) -> Option<(TimeoutId, TimeoutKind)> {
        self.fired_rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_the_scheduled_delay() {
        let timeouts = TimeoutManager::spawn();
        timeouts.schedule(TimeoutKind::ViewChange { view: 0 }, Duration::from_millis(20));
        let (_, kind) = timeouts.recv_fired().expect("timer fired");
        assert_eq!(kind, TimeoutKind::ViewChange { view: 0 });
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let timeouts = TimeoutManager::spawn();
        let id = timeouts.schedule(TimeoutKind::ViewChange { view: 1 }, Duration::from_millis(30));
        timeouts.cancel(id);
        thread::sleep(Duration::from_millis(80));
        assert!(timeouts.try_recv_fired().is_none());
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::signal::ShutdownSignal;
use crate::Optime;

/// Tracks which oplog positions are fully processed.
///
/// The producer registers how many intents every entry produced, or observes entries which
/// produced none.  Consumers resolve intents once their outcome is known.  The safe
/// position is the highest position such that every entry at or before it is resolved,
/// which is what a checkpoint may hold.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<Progress>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct Progress {
    // position -> number of unresolved intents.
    pending: BTreeMap<Optime, usize>,
    // finished positions above the lowest pending one.
    done: BTreeSet<Optime>,
    safe: Option<Optime>,
}

impl Progress {
    fn advance(&mut self) {
        let candidate = match self.pending.keys().next() {
            None => {
                let last = self.done.iter().next_back().copied();
                self.done.clear();
                last
            }
            Some(&lowest) => {
                let above = self.done.split_off(&lowest);
                let last = self.done.iter().next_back().copied();
                self.done = above;
                last
            }
        };
        if let Some(candidate) = candidate {
            if self.safe.map_or(true, |safe| candidate > safe) {
                self.safe = Some(candidate);
            }
        }
    }
}

impl ProgressTracker {
    /// create a tracker with nothing processed.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an entry which produced no intent.
    pub fn observe(&self, optime: Optime) {
        let mut state = self.lock();
        state.done.insert(optime);
        state.advance();
    }

    /// Record an entry which produced `intents` intents, all still unresolved.
    pub fn register(&self, optime: Optime, intents: usize) {
        if intents == 0 {
            return self.observe(optime);
        }
        *self.lock().pending.entry(optime).or_insert(0) += intents;
    }

    /// Record the outcome of one intent produced at `optime`.
    pub fn resolve(&self, optime: Optime) {
        let mut state = self.lock();
        let finished = match state.pending.get_mut(&optime) {
            Some(left) => {
                *left -= 1;
                *left == 0
            }
            None => return,
        };
        if finished {
            state.pending.remove(&optime);
            state.done.insert(optime);
            state.advance();
        }
        if state.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// highest position whose entries, and every entry before, are resolved.
    pub fn safe(&self) -> Option<Optime> {
        self.lock().safe
    }

    /// number of unresolved entries.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Block until every registered intent is resolved.
    ///
    /// Returns false when `signal` fired first.
    pub fn wait_idle(&self, signal: &ShutdownSignal) -> bool {
        let mut state = self.lock();
        loop {
            if state.pending.is_empty() {
                return true;
            }
            if signal.is_triggered() {
                return false;
            }
            state = match self.idle.wait_timeout(state, Duration::from_millis(50)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::signal::shutdown_pair;
    use std::sync::Arc;

    fn op(n: u32) -> Optime {
        Optime::new(n, 1)
    }

    #[test]
    fn test_observe_without_pending_moves_safe() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.safe(), None);
        tracker.observe(op(1));
        tracker.observe(op(2));
        assert_eq!(tracker.safe(), Some(op(2)));
    }

    #[test]
    fn test_safe_stays_below_lowest_pending() {
        let tracker = ProgressTracker::new();
        tracker.register(op(1), 1);
        tracker.register(op(2), 2);
        tracker.observe(op(3));
        tracker.register(op(4), 1);
        assert_eq!(tracker.safe(), None);

        // out of order resolution, as with several consumers.
        tracker.resolve(op(4));
        tracker.resolve(op(2));
        assert_eq!(tracker.safe(), None);
        tracker.resolve(op(1));
        assert_eq!(tracker.safe(), Some(op(1)));
        tracker.resolve(op(2));
        assert_eq!(tracker.safe(), Some(op(4)));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_safe_never_decreases() {
        let tracker = ProgressTracker::new();
        tracker.observe(op(5));
        tracker.register(op(6), 1);
        tracker.resolve(op(6));
        assert_eq!(tracker.safe(), Some(op(6)));
        // unknown positions are ignored.
        tracker.resolve(op(3));
        assert_eq!(tracker.safe(), Some(op(6)));
    }

    #[test]
    fn test_wait_idle() {
        let tracker = Arc::new(ProgressTracker::new());
        let (mut trigger, signal) = shutdown_pair();
        tracker.register(op(1), 1);

        let cloned = tracker.clone();
        let resolver = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cloned.resolve(op(1));
        });
        assert!(tracker.wait_idle(&signal));
        resolver.join().unwrap();

        tracker.register(op(2), 1);
        trigger.trigger();
        assert!(!tracker.wait_idle(&signal));
    }
}

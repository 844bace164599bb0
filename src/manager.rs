//! The timer manager: registration, cancellation, and draining of
//! deadline-ordered timers across the two clock domains.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::clock::{monotonic_millis, wall_millis, Deadline};
use crate::timer::{Link, Timer, TimerRef};

/// Cache value meaning "no timer pending in this domain".
const NO_TRIGGER: u64 = u64::MAX;

/// The two pending collections, keyed by `(time point, timer id)` ascending.
///
/// The composite key makes each `BTreeMap` a multimap (timers sharing a
/// deadline stay distinct through their ids) and doubles as the stable
/// position token: a timer is unlinked by its key in O(log n), unaffected by
/// other insertions or removals.
struct Pending {
    wall: BTreeMap<(SystemTime, u64), TimerRef>,
    monotonic: BTreeMap<(Instant, u64), TimerRef>,
}

/// Outcome of the unlink step of a cancellation.
enum Unlink {
    /// The timer was linked here and has been removed.
    Removed,
    /// The timer is no longer linked anywhere (drained, fired, or cancelled).
    NotLinked,
    /// The link state and the collections disagree: the handle belongs to a
    /// different manager. Refused.
    Foreign,
}

/// Deadline-ordered timer registry for a pool of scheduler workers.
///
/// Any thread may register, cancel, or drain concurrently. Both pending
/// collections and both next-trigger caches are guarded by one manager-wide
/// mutex; the caches are additionally readable lock-free through
/// [`next_trigger`](Self::next_trigger) so workers can decide whether to poll
/// at all without touching the lock.
///
/// Wall-clock deadlines (`SystemTime`) and monotonic deadlines (`Instant`)
/// live in separate collections because their time points are not comparable;
/// each is drained against its own clock's "now".
pub struct TimerManager {
    /// Instance name for logging
    name: String,
    pending: Mutex<Pending>,
    /// Epoch for millisecond projections of monotonic time points.
    monotonic_base: Instant,
    /// Earliest known wall deadline, ms since the Unix epoch. Written only
    /// under the manager lock right after a drain; read lock-free.
    wall_next_trigger: AtomicU64,
    /// Earliest known monotonic deadline, ms since `monotonic_base`.
    monotonic_next_trigger: AtomicU64,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::named("timers")
    }

    /// Create a manager with a name used as context in log output.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        log::debug!("timer manager '{}' created", name);
        TimerManager {
            name,
            pending: Mutex::new(Pending {
                wall: BTreeMap::new(),
                monotonic: BTreeMap::new(),
            }),
            monotonic_base: Instant::now(),
            wall_next_trigger: AtomicU64::new(NO_TRIGGER),
            monotonic_next_trigger: AtomicU64::new(NO_TRIGGER),
        }
    }

    /// Register `callback` to fire once `deadline` is reached.
    ///
    /// The deadline may be a `SystemTime` (wall-clock domain), an `Instant`
    /// (monotonic domain), or a relative `Duration`, which is normalized to
    /// `monotonic-now + duration`. Returns a shared handle usable with
    /// [`cancel`](Self::cancel) and [`block_cancel`](Self::block_cancel);
    /// dropping the handle does not cancel the timer.
    ///
    /// Registration cannot fail; running out of memory aborts the process.
    pub fn expire_at<F>(&self, deadline: impl Into<Deadline>, callback: F) -> TimerRef
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline: Deadline = deadline.into();
        let timer = Timer::new(Box::new(callback));
        let mut pending = self.pending.lock();
        match deadline {
            Deadline::Wall(tp) => {
                pending.wall.insert((tp, timer.id()), Arc::clone(&timer));
                *timer.link.lock() = Link::Wall(tp);
            }
            Deadline::Monotonic(tp) => {
                pending.monotonic.insert((tp, timer.id()), Arc::clone(&timer));
                *timer.link.lock() = Link::Monotonic(tp);
            }
        }
        drop(pending);

        log::trace!("manager '{}' registered timer {}", self.name, timer.id());
        timer
    }

    /// Non-blocking cancellation.
    ///
    /// Returns `true` only when the callback is now guaranteed never to run.
    /// `false` means the race was lost or already decided: the timer fired,
    /// is firing right now, or was cancelled earlier. Losing the race is an
    /// expected outcome, not an error.
    pub fn cancel(&self, timer: &TimerRef) -> bool {
        match self.unlink(timer) {
            Unlink::Foreign => false,
            Unlink::Removed | Unlink::NotLinked => timer.cancel(),
        }
    }

    /// Blocking cancellation.
    ///
    /// Like [`cancel`](Self::cancel), but if the timer is firing on another
    /// thread this waits for the callback to complete. On return either the
    /// callback never ran and never will (`true`), or it has fully finished
    /// or was already cancelled (`false`), making it safe for the caller to
    /// release anything the callback captured.
    pub fn block_cancel(&self, timer: &TimerRef) -> bool {
        match self.unlink(timer) {
            Unlink::Foreign => false,
            Unlink::Removed | Unlink::NotLinked => timer.block_cancel(),
        }
    }

    /// Removes the timer from whichever collection holds it.
    ///
    /// Membership is checked through the timer's link state, so removal is a
    /// keyed O(log n) operation, never a search. The fire race itself is
    /// resolved afterwards against the timer's private lock; linkage alone is
    /// not authoritative because draining and firing are separate steps.
    fn unlink(&self, timer: &TimerRef) -> Unlink {
        let mut pending = self.pending.lock();
        let mut link = timer.link.lock();
        let removed = match *link {
            Link::Unlinked => return Unlink::NotLinked,
            Link::Wall(tp) => pending.wall.remove(&(tp, timer.id())).is_some(),
            Link::Monotonic(tp) => pending.monotonic.remove(&(tp, timer.id())).is_some(),
        };
        if !removed {
            log::warn!(
                "manager '{}' refused to cancel timer {}: handle belongs to another manager",
                self.name,
                timer.id()
            );
            return Unlink::Foreign;
        }
        *link = Link::Unlinked;
        Unlink::Removed
    }

    /// Drain up to `n` due timers into `out` and return the wait hint.
    ///
    /// Each collection's earliest entry is compared against that collection's
    /// own "now"; among two due candidates the more-overdue one (relative to
    /// its own clock) is drained first, the monotonic domain winning exact
    /// ties. Within one domain timers come out in non-decreasing deadline
    /// order. Drained timers are unlinked but not yet run; the caller invokes
    /// [`Timer::fire`] on each, typically resuming suspended work.
    ///
    /// The returned hint is the time until the earliest remaining deadline:
    /// `Some(Duration::ZERO)` when something is already due, `None` when both
    /// collections are empty. The scheduler uses it to size its next poll
    /// interval. `n == 0` skips the drain entirely and reports the lock-free
    /// hint.
    pub fn get_expired(&self, out: &mut Vec<TimerRef>, n: usize) -> Option<Duration> {
        if n == 0 {
            return self.next_trigger();
        }

        let mut pending = self.pending.lock();
        let wall_now = SystemTime::now();
        let monotonic_now = Instant::now();

        let mut drained = 0;
        while drained < n {
            // overdue amount of each domain's earliest entry, None if not due
            let wall_over = pending
                .wall
                .first_key_value()
                .and_then(|((tp, _), _)| wall_now.duration_since(*tp).ok());
            let monotonic_over = pending
                .monotonic
                .first_key_value()
                .and_then(|((tp, _), _)| monotonic_now.checked_duration_since(*tp));

            let take_monotonic = match (wall_over, monotonic_over) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(wall), Some(monotonic)) => monotonic >= wall,
            };
            let entry = if take_monotonic {
                pending.monotonic.pop_first().map(|(_, timer)| timer)
            } else {
                pending.wall.pop_first().map(|(_, timer)| timer)
            };
            if let Some(timer) = entry {
                *timer.link.lock() = Link::Unlinked;
                out.push(timer);
                drained += 1;
            }
        }

        let wall_next = pending
            .wall
            .first_key_value()
            .map_or(NO_TRIGGER, |((tp, _), _)| wall_millis(*tp));
        let monotonic_next = pending
            .monotonic
            .first_key_value()
            .map_or(NO_TRIGGER, |((tp, _), _)| monotonic_millis(*tp, self.monotonic_base));
        self.wall_next_trigger.store(wall_next, Ordering::Relaxed);
        self.monotonic_next_trigger
            .store(monotonic_next, Ordering::Relaxed);
        drop(pending);

        if drained > 0 {
            log::trace!("manager '{}' drained {} due timer(s)", self.name, drained);
        }
        self.trigger_hint(wall_next, monotonic_next)
    }

    /// Lock-free wait hint from the next-trigger caches.
    ///
    /// The caches are rewritten only by drains, so the value is stale by up
    /// to the time since the last [`get_expired`](Self::get_expired) call; in
    /// particular a registration does not refresh it. A stale hint can only
    /// cause a harmless early poll, but a `None` here means "nothing was
    /// pending at the last drain", never permission to skip a scheduled poll.
    pub fn next_trigger(&self) -> Option<Duration> {
        self.trigger_hint(
            self.wall_next_trigger.load(Ordering::Relaxed),
            self.monotonic_next_trigger.load(Ordering::Relaxed),
        )
    }

    /// Combined count of pending timers in both domains, one consistent
    /// snapshot under the manager lock.
    pub fn size(&self) -> usize {
        let pending = self.pending.lock();
        pending.wall.len() + pending.monotonic.len()
    }

    /// Milliseconds until the nearer of the two cached triggers, measured
    /// against each domain's own clock. Saturates at zero for overdue
    /// entries; `None` when neither domain has a cached trigger.
    fn trigger_hint(&self, wall_next: u64, monotonic_next: u64) -> Option<Duration> {
        let mut nearest: Option<u64> = None;
        if wall_next != NO_TRIGGER {
            nearest = Some(wall_next.saturating_sub(wall_millis(SystemTime::now())));
        }
        if monotonic_next != NO_TRIGGER {
            let remaining = monotonic_next
                .saturating_sub(monotonic_millis(Instant::now(), self.monotonic_base));
            nearest = Some(nearest.map_or(remaining, |wall| wall.min(remaining)));
        }
        nearest.map(Duration::from_millis)
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn drain_all(manager: &TimerManager) -> (Vec<TimerRef>, Option<Duration>) {
        let mut out = Vec::new();
        let hint = manager.get_expired(&mut out, usize::MAX);
        (out, hint)
    }

    #[test]
    fn test_expired_timers_come_out_in_deadline_order() {
        let manager = TimerManager::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, delay_ms) in [("t100", 100u64), ("t2000", 2000), ("t25", 25)] {
            let fired = Arc::clone(&fired);
            manager.expire_at(now + Duration::from_millis(delay_ms), move || {
                fired.lock().push(label);
            });
        }
        assert_eq!(manager.size(), 3);

        thread::sleep(Duration::from_millis(200));
        let (due, hint) = drain_all(&manager);

        assert_eq!(due.len(), 2);
        for timer in &due {
            timer.fire();
        }
        assert_eq!(*fired.lock(), vec!["t25", "t100"]);
        assert_eq!(manager.size(), 1);

        // one timer left, due roughly 1.8s out
        let hint = hint.expect("a timer is still pending");
        assert!(hint > Duration::from_millis(500));
        assert!(hint <= Duration::from_millis(2000));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = {
            let hits = Arc::clone(&hits);
            manager.expire_at(Duration::from_millis(50), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(manager.cancel(&timer));
        assert_eq!(manager.size(), 0);

        thread::sleep(Duration::from_millis(100));
        let (due, hint) = drain_all(&manager);
        assert!(due.is_empty());
        assert_eq!(hint, None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // the race is long decided, repeat attempts report failure
        assert!(!manager.cancel(&timer));
        assert!(!manager.block_cancel(&timer));
    }

    #[test]
    fn test_get_expired_respects_limit() {
        let manager = TimerManager::new();
        let now = Instant::now();
        for delay_ms in [1u64, 2, 3] {
            manager.expire_at(now + Duration::from_millis(delay_ms), || {});
        }
        thread::sleep(Duration::from_millis(50));

        let mut out = Vec::new();
        manager.get_expired(&mut out, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(manager.size(), 2);

        manager.get_expired(&mut out, 10);
        assert_eq!(out.len(), 3);
        assert_eq!(manager.size(), 0);

        // non-decreasing deadline order across the two calls
        let ids: Vec<u64> = out.iter().map(|t| t.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_get_expired_with_zero_limit() {
        let manager = TimerManager::new();
        manager.expire_at(Duration::from_millis(50), || {});

        let mut out = Vec::new();
        // n = 0 drains nothing; the caches have never been written by a
        // drain, so the lock-free hint still reads "nothing pending"
        let hint = manager.get_expired(&mut out, 0);
        assert!(out.is_empty());
        assert_eq!(hint, None);
        assert_eq!(manager.size(), 1);

        // a real call recomputes the hint from the collections
        let hint = manager.get_expired(&mut out, 1);
        assert!(out.is_empty());
        assert!(hint.expect("timer pending") <= Duration::from_millis(50));
    }

    #[test]
    fn test_hint_tracks_earlier_registration() {
        let manager = TimerManager::new();
        let mut out = Vec::new();

        manager.expire_at(Duration::from_secs(5), || {});
        let first = manager
            .get_expired(&mut out, 1)
            .expect("five-second timer pending");
        assert!(first > Duration::from_secs(3));

        manager.expire_at(Duration::from_millis(50), || {});
        let second = manager
            .get_expired(&mut out, 1)
            .expect("two timers pending");
        assert!(second <= Duration::from_millis(50));
        assert!(out.is_empty());
    }

    #[test]
    fn test_both_domains_drain_against_their_own_clock() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for deadline in [
            Deadline::from(SystemTime::now() + Duration::from_millis(30)),
            Deadline::from(Instant::now() + Duration::from_millis(30)),
        ] {
            let hits = Arc::clone(&hits);
            manager.expire_at(deadline, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(manager.size(), 2);

        thread::sleep(Duration::from_millis(100));
        let (due, hint) = drain_all(&manager);
        assert_eq!(due.len(), 2);
        assert_eq!(hint, None);
        for timer in due {
            timer.fire();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_next_trigger_is_refreshed_by_drains_only() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_trigger(), None);

        manager.expire_at(Duration::from_secs(5), || {});
        // registration leaves the caches untouched
        assert_eq!(manager.next_trigger(), None);

        let mut out = Vec::new();
        manager.get_expired(&mut out, 1);
        let hint = manager.next_trigger().expect("cache refreshed by drain");
        assert!(hint <= Duration::from_secs(5));
    }

    #[test]
    fn test_block_cancel_waits_for_inflight_callback() {
        let manager = Arc::new(TimerManager::new());
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let timer = {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            manager.expire_at(Instant::now(), move || {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            })
        };

        let (due, _) = drain_all(&manager);
        assert_eq!(due.len(), 1);
        let firing = thread::spawn(move || {
            for timer in due {
                timer.fire();
            }
        });
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // cancellation lost the race; it must still wait out the callback
        assert!(!manager.block_cancel(&timer));
        assert!(finished.load(Ordering::SeqCst));
        firing.join().unwrap();
    }

    #[test]
    fn test_cancel_refuses_foreign_handle() {
        let ours = TimerManager::named("ours");
        let other = TimerManager::named("other");

        let timer = ours.expire_at(Duration::from_secs(5), || {});
        assert!(!other.cancel(&timer));
        assert!(!other.block_cancel(&timer));

        // the owning manager still controls it
        assert_eq!(ours.size(), 1);
        assert!(ours.cancel(&timer));
        assert_eq!(ours.size(), 0);
    }

    #[test]
    fn test_concurrent_registration_and_draining() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 50;

        let manager = Arc::new(TimerManager::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let registrars: Vec<_> = (0..THREADS)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let hits = Arc::clone(&hits);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let hits = Arc::clone(&hits);
                        manager.expire_at(Duration::from_millis(i as u64 % 20), move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while hits.load(Ordering::SeqCst) < THREADS * PER_THREAD {
            assert!(Instant::now() < deadline, "timers failed to drain in time");
            out.clear();
            manager.get_expired(&mut out, 16);
            for timer in &out {
                timer.fire();
            }
            thread::yield_now();
        }
        for registrar in registrars {
            registrar.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), THREADS * PER_THREAD);
        thread::sleep(Duration::from_millis(30));
        let (rest, hint) = drain_all(&manager);
        assert!(rest.is_empty());
        assert_eq!(hint, None);
        assert_eq!(manager.size(), 0);
    }
}

//! The timer entity: a deadline-triggered callback that fires at most once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

/// The callback a timer runs when it fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to a [`Timer`], returned by
/// [`TimerManager::expire_at`](crate::TimerManager::expire_at).
pub type TimerRef = Arc<Timer>;

/// Process-wide id source. At 64 bits the counter cannot be exhausted in a
/// process lifetime, so ids are treated as unique with no wraparound story.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Which pending collection currently holds this timer, and under which
/// time-point key. Read and written only while the owning manager's lock is
/// held, so the tag always matches the collections' contents.
pub(crate) enum Link {
    Unlinked,
    Wall(SystemTime),
    Monotonic(Instant),
}

/// One schedulable, at-most-once-fired callback.
///
/// The callback lives in a private-mutex-guarded slot; `Some` means the timer
/// is still active. Taking the callback out of the slot is simultaneously the
/// cancellation step and the single-call guard, so firing and cancelling can
/// race freely without double invocation.
pub struct Timer {
    id: u64,
    slot: Mutex<Option<TimerCallback>>,
    pub(crate) link: Mutex<Link>,
}

impl Timer {
    pub(crate) fn new(callback: TimerCallback) -> TimerRef {
        Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            slot: Mutex::new(Some(callback)),
            link: Mutex::new(Link::Unlinked),
        })
    }

    /// Unique ascending id, assigned at construction and stable for the
    /// timer's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs the callback if the timer is still active.
    ///
    /// Called by the drain consumer after [`get_expired`] has unlinked the
    /// timer. A second call, or a call on a cancelled timer, is a no-op.
    ///
    /// The callback executes while the timer's private lock is held; that is
    /// what lets a concurrent [`block_cancel`] observe completion. It also
    /// means a callback must not call `block_cancel` on its own timer.
    ///
    /// [`get_expired`]: crate::TimerManager::get_expired
    /// [`block_cancel`]: crate::TimerManager::block_cancel
    pub fn fire(&self) {
        let mut slot = self.slot.lock();
        if let Some(callback) = slot.take() {
            log::trace!("timer {} firing", self.id);
            callback();
        }
    }

    /// Non-blocking cancellation attempt.
    ///
    /// Returns `true` only when the callback was still pending and is now
    /// guaranteed never to run. Returns `false` without blocking when the
    /// private lock is unavailable (the timer is firing, or another cancel is
    /// in flight) or when the timer already fired or was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        match self.slot.try_lock() {
            Some(mut slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Blocking cancellation.
    ///
    /// Waits for the private lock, so on return either the callback never ran
    /// and never will (`true`), or it has already fully completed or been
    /// cancelled (`false`). Safe to call repeatedly.
    pub(crate) fn block_cancel(&self) -> bool {
        self.slot.lock().take().is_some()
    }
}

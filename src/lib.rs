//! # Deadline Timers
//!
//! Deadline-ordered timer registration, cancellation and draining for
//! cooperative scheduler runtimes.
//!
//! This library is the timer subsystem of a user-space multitasking runtime:
//! worker threads register deadline-triggered callbacks (sleeps, I/O
//! timeouts, deadlines for suspended work units) and the scheduler's polling
//! loop drains whichever are due, together with a hint for how long it may
//! safely wait before polling again.
//!
//! ## Features
//!
//! - **Thread-safe**: any worker thread may register, cancel, or drain
//!   concurrently
//! - **Two clock domains**: wall-clock (`SystemTime`) and monotonic
//!   (`Instant`) deadlines, each drained against its own clock
//! - **Exact ordering**: ordered collections, not a timing wheel; timers
//!   drain in non-decreasing deadline order within a domain
//! - **Race-safe cancellation**: best-effort [`cancel`] and a blocking
//!   [`block_cancel`] that guarantees the callback either never runs or has
//!   fully completed
//! - **Cheap polling**: a lock-free next-trigger hint so workers can skip
//!   the lock on the "should I even check" path
//!
//! ## Quick Start
//!
//! ```rust
//! use deadline_timers::{Duration, TimerManager};
//!
//! let manager = TimerManager::new();
//!
//! // Register a callback 20ms out; a SystemTime or Instant works too.
//! manager.expire_at(Duration::from_millis(20), || {
//!     println!("timer fired!");
//! });
//!
//! // The scheduler's polling loop: drain due timers, run them, and learn
//! // how long it may sleep before the next check.
//! std::thread::sleep(Duration::from_millis(50));
//! let mut due = Vec::new();
//! let wait_hint = manager.get_expired(&mut due, 16);
//! for timer in due {
//!     timer.fire();
//! }
//! assert_eq!(wait_hint, None); // nothing left pending
//! ```
//!
//! [`cancel`]: TimerManager::cancel
//! [`block_cancel`]: TimerManager::block_cancel

mod clock;
mod manager;
mod timer;

pub use clock::Deadline;
pub use manager::TimerManager;
pub use timer::{Timer, TimerCallback, TimerRef};

// Re-export commonly used types for convenience
pub use std::time::{Duration, Instant, SystemTime};

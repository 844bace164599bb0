//! Basic usage example for the deadline timer manager

use std::sync::Arc;
use std::thread;

use deadline_timers::{Duration, Instant, SystemTime, TimerManager};

fn main() {
    // Initialize logging
    env_logger::init();

    let manager = Arc::new(TimerManager::named("example_timer_manager"));

    // Register timers in both clock domains plus a relative delay
    manager.expire_at(Duration::from_millis(200), || {
        println!("short timer fired!");
    });
    manager.expire_at(Instant::now() + Duration::from_millis(500), || {
        println!("medium timer fired!");
    });
    manager.expire_at(SystemTime::now() + Duration::from_secs(1), || {
        println!("wall-clock timer fired!");
    });

    // Worker threads may register concurrently with the polling loop
    let worker = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            manager.expire_at(Duration::from_millis(800), || {
                println!("worker-registered timer fired!");
            });
        })
    };
    worker.join().expect("worker thread panicked");

    // A timer that will be cancelled before its deadline
    let doomed = manager.expire_at(Duration::from_secs(10), || {
        println!("this should never print");
    });

    println!("Timers set! Polling until they expire...");

    // The scheduler's polling loop: drain due timers, fire them, then sleep
    // for as long as the wait hint allows
    let mut due = Vec::new();
    let mut fired = 0;
    while fired < 4 {
        due.clear();
        let wait_hint = manager.get_expired(&mut due, 16);
        for timer in &due {
            timer.fire();
            fired += 1;
        }
        if let Some(wait) = wait_hint {
            thread::sleep(wait.min(Duration::from_millis(100)));
        }
    }

    // Demonstrate cancellation
    if manager.block_cancel(&doomed) {
        println!("Timer cancelled!");
    }
    assert_eq!(manager.size(), 0);

    println!("All timers accounted for, shutting down.");
}

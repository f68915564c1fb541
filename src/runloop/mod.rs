//! Maintenance runloop
//!
//! One dedicated thread drives the time-based side of the secure-connect
//! core: connect/disconnect/heartbeat timeouts, hub reconnect delays,
//! address resolution timeouts and cache freshness. The thread wakes at
//! least once a second and can be poked for an immediate tick.
//!
//! Transport callbacks process staged frames inline under the dispatch
//! lock, so the runloop's job reduces to the timer sweep plus whatever a
//! tick turns up in the staging queues after a missed poke.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::trace;

/// Upper bound between two maintenance sweeps.
pub const RUNLOOP_TICK: Duration = Duration::from_secs(1);

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic maintenance thread.
///
/// Runs the supplied closure once per tick with a freshly sampled
/// [`Instant`]. Stops cooperatively on [`Runloop::stop`] or drop.
pub struct Runloop {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl Runloop {
    /// Spawn the maintenance thread.
    pub fn spawn<F>(mut tick: F) -> Runloop
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name("bsc-runloop".to_string())
            .spawn(move || {
                trace!("runloop started");
                loop {
                    tick(Instant::now());
                    let guard = thread_signal
                        .stopped
                        .lock()
                        .expect("runloop signal poisoned");
                    if *guard {
                        break;
                    }
                    let (guard, _timeout) = thread_signal
                        .wake
                        .wait_timeout(guard, RUNLOOP_TICK)
                        .expect("runloop signal poisoned");
                    if *guard {
                        break;
                    }
                }
                trace!("runloop stopped");
            })
            .expect("spawning the runloop thread failed");
        Runloop {
            signal,
            thread: Some(thread),
        }
    }

    /// Request an immediate tick.
    pub fn poke(&self) {
        self.signal.wake.notify_all();
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock().expect("runloop signal poisoned");
            *stopped = true;
        }
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Runloop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runloop_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut runloop = Runloop::spawn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        // at least the immediate first tick
        std::thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) >= 1);

        runloop.poke();
        std::thread::sleep(Duration::from_millis(50));
        let after_poke = count.load(Ordering::SeqCst);
        assert!(after_poke >= 2);

        runloop.stop();
        let stopped_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) <= stopped_at + 1);
    }
}

//! Cooperative suspension. The collector never preempts a mutator thread:
//! the STOPPED bit in the world-state word is the request, and the mutator
//! observes it at its own poll points (allocation slow path, explicit poll,
//! heap-access acquisition). This module is only the bed the mutator sleeps
//! in while the request stands.

use std::sync::{Condvar, Mutex};

pub(crate) struct Safepoint {
    sync: Mutex<()>,
    resumed: Condvar,
}

impl Safepoint {
    pub fn new() -> Self {
        Safepoint {
            sync: Mutex::new(()),
            resumed: Condvar::new(),
        }
    }

    /// Park the calling thread until `ready` holds. `ready` reads state that
    /// is published before `notify_all` is called, so checking it under the
    /// lock cannot miss a wakeup.
    pub fn park_until<F: Fn() -> bool>(&self, ready: F) {
        let mut guard = self.sync.lock().unwrap();
        while !ready() {
            guard = self.resumed.wait(guard).unwrap();
        }
    }

    /// Wake every parked thread; each re-checks its own predicate.
    pub fn notify_all(&self) {
        let _guard = self.sync.lock().unwrap();
        self.resumed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn park_until_observes_predicate() {
        let safepoint = Arc::new(Safepoint::new());
        let flag = Arc::new(AtomicBool::new(false));

        let parked = {
            let safepoint = safepoint.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                safepoint.park_until(|| flag.load(Ordering::SeqCst));
            })
        };

        // Publish the state first, then notify: the waiter cannot miss it.
        flag.store(true, Ordering::SeqCst);
        safepoint.notify_all();
        parked.join().unwrap();
    }

    #[test]
    fn park_until_returns_immediately_when_ready() {
        let safepoint = Safepoint::new();
        safepoint.park_until(|| true);
    }
}

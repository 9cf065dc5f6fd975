//! The helper marker pool and its park/unpark monitor.
//!
//! Helpers are recruited only inside explicit parallel drain windows: the
//! primary agent opens a session, helpers steal segments from the shared
//! collector stack until the session closes, then park. The monitor's lock is
//! the serialization point for the classic concurrent-marking race: a helper
//! becomes *active* only while holding the lock, so the primary, also under
//! the lock, can trust "no helper is active and the shared stack is empty" as
//! a stable fact.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use super::mark_stack::Segment;
use super::visitor::SlotVisitor;
use super::MarkingShared;

pub(crate) struct MarkerMonitor {
    sync: Mutex<MarkerSync>,
    /// Helpers wait on this for a session to open or work to be donated.
    work_available: Condvar,
    /// The primary waits on this for helpers to donate back or go inactive.
    markers_changed: Condvar,
}

struct MarkerSync {
    active_markers: usize,
    shutdown: bool,
}

/// What a helper should do next.
pub(crate) enum HelperDirective {
    /// Drain this segment, then come back.
    Work(Segment),
    /// The pool is shutting down; the thread exits.
    Exit,
}

/// Outcome of the primary's wait for helper activity.
pub(crate) enum PrimaryWait {
    /// A segment appeared on the shared stack.
    WorkAvailable,
    /// Every helper is inactive and the shared stack is still empty.
    Quiescent,
    /// The drain deadline passed first.
    DeadlinePassed,
}

impl MarkerMonitor {
    pub fn new() -> Self {
        MarkerMonitor {
            sync: Mutex::new(MarkerSync {
                active_markers: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            markers_changed: Condvar::new(),
        }
    }

    pub fn notify_work_available(&self) {
        let _guard = self.sync.lock().unwrap();
        self.work_available.notify_all();
        // A donation is also what a waiting primary wants to hear about.
        self.markers_changed.notify_all();
    }

    pub fn active_markers(&self) -> usize {
        self.sync.lock().unwrap().active_markers
    }

    /// Park until there is a segment to steal during an open session, or the
    /// pool shuts down. Becoming active happens under the lock; see the
    /// module comment for why that ordering is what makes termination
    /// detection sound.
    fn poll_for_work(&self, shared: &MarkingShared) -> HelperDirective {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if sync.shutdown {
                return HelperDirective::Exit;
            }
            if shared.session_active.load(Ordering::SeqCst) {
                if let Some(segment) = shared.collector_stack.steal() {
                    sync.active_markers += 1;
                    return HelperDirective::Work(segment);
                }
            }
            sync = self.work_available.wait(sync).unwrap();
        }
    }

    /// A helper finished draining its segment (and whatever grew from it).
    fn finish_work(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.active_markers > 0);
        sync.active_markers -= 1;
        drop(sync);
        self.markers_changed.notify_all();
        // A finishing helper may have donated; wake siblings to check.
        self.notify_work_available();
    }

    /// The primary has nothing local and nothing to steal. Wait for a helper
    /// to donate work back, or for all helpers to go quiescent, or for the
    /// deadline.
    pub fn wait_for_helpers(&self, shared: &MarkingShared, deadline: Instant) -> PrimaryWait {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if !shared.collector_stack.is_empty() {
                return PrimaryWait::WorkAvailable;
            }
            if sync.active_markers == 0 {
                return PrimaryWait::Quiescent;
            }
            let now = Instant::now();
            if now >= deadline {
                return PrimaryWait::DeadlinePassed;
            }
            let (guard, _timeout) = self
                .markers_changed
                .wait_timeout(sync, deadline - now)
                .unwrap();
            sync = guard;
        }
    }

    /// Block until no helper is active. Called after a session closes so the
    /// window's helpers are genuinely derecruited before the phase machine
    /// moves on.
    pub fn wait_until_inactive(&self) {
        let mut sync = self.sync.lock().unwrap();
        while sync.active_markers > 0 {
            sync = self.markers_changed.wait(sync).unwrap();
        }
    }

    fn shutdown(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.shutdown = true;
        drop(sync);
        self.work_available.notify_all();
    }
}

/// The bounded pool of helper marker threads.
pub(crate) struct MarkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MarkerPool {
    /// Spawn `count` helper threads, parked until the first drain session.
    pub fn spawn(shared: &Arc<MarkingShared>, count: usize) -> Self {
        let mut handles = Vec::with_capacity(count);
        for ordinal in 0..count {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vmgc-marker-{}", ordinal))
                .spawn(move || run_marker(ordinal, shared))
                .expect("failed to spawn marker thread");
            handles.push(handle);
        }
        MarkerPool {
            handles: Mutex::new(handles),
        }
    }

    /// Tell every helper to exit and join them. Idempotent.
    pub fn shutdown(&self, shared: &MarkingShared) {
        shared.monitor.shutdown();
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.join().expect("marker thread panicked");
        }
    }
}

fn run_marker(ordinal: usize, shared: Arc<MarkingShared>) {
    trace!("marker {} up", ordinal);
    let mut visitor = SlotVisitor::new_helper(shared.clone());
    loop {
        match shared.monitor.poll_for_work(&shared) {
            HelperDirective::Exit => break,
            HelperDirective::Work(segment) => {
                visitor.drain_adopted_segment(segment);
                shared.monitor.finish_work();
            }
        }
    }
    trace!("marker {} exiting", ordinal);
}

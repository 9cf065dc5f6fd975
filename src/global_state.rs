//! Process-wide collector state: the world-state word and per-cycle counters.
//!
//! The world-state word is the single source of truth for who may touch the
//! heap right now. It is only ever mutated through compare-exchange retry
//! loops; a blind read-modify-write here would let two actors believe they
//! both stopped the world, which is exactly the kind of silent unsoundness
//! this crate crashes on instead.

use atomic::Atomic;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::heap::CollectionScope;

/// The mutator currently holds heap access.
pub(crate) const HAS_ACCESS: u32 = 1 << 0;
/// The world is stopped.
pub(crate) const STOPPED: u32 = 1 << 1;
/// The mutator holds the conn: it, not the collector thread, drives phases.
pub(crate) const MUTATOR_HAS_CONN: u32 = 1 << 2;
/// The mutator is blocked waiting for a collection ticket.
pub(crate) const MUTATOR_WAITING: u32 = 1 << 3;
/// A finished cycle left post-collection work for the mutator's next poll.
pub(crate) const NEED_FINALIZE: u32 = 1 << 4;

/// What happened when the collector asked for the world to stop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    /// The world is now stopped and the collector may proceed.
    Stopped,
    /// The mutator holds heap access, so the conn was handed to it instead;
    /// the collector must yield and let the mutator drive.
    HandedOff,
}

pub(crate) struct WorldState {
    bits: AtomicU32,
}

impl WorldState {
    pub fn new() -> Self {
        WorldState {
            bits: AtomicU32::new(0),
        }
    }

    fn update<F>(&self, mut f: F) -> (u32, u32)
    where
        F: FnMut(u32) -> u32,
    {
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            let new = f(old);
            debug_assert!(
                new & MUTATOR_HAS_CONN == 0 || new & STOPPED == 0,
                "mutatorHasConn and stopped are mutually exclusive (word {:#b})",
                new
            );
            match self
                .bits
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return (old, new),
                Err(current) => old = current,
            }
        }
    }

    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    pub fn has_access(&self) -> bool {
        self.load() & HAS_ACCESS != 0
    }

    pub fn is_stopped(&self) -> bool {
        self.load() & STOPPED != 0
    }

    pub fn mutator_has_conn(&self) -> bool {
        self.load() & MUTATOR_HAS_CONN != 0
    }

    pub fn mutator_is_waiting(&self) -> bool {
        self.load() & MUTATOR_WAITING != 0
    }

    /// Attempt to take heap access for the mutator. Fails while the world is
    /// stopped; the caller parks on the safepoint and retries.
    pub fn try_acquire_access(&self) -> bool {
        let mut ok = false;
        self.update(|old| {
            if old & STOPPED != 0 {
                ok = false;
                old
            } else {
                assert!(old & HAS_ACCESS == 0, "a mutator already holds heap access");
                ok = true;
                old | HAS_ACCESS
            }
        });
        ok
    }

    /// Drop heap access. Returns true if the mutator was also holding the
    /// conn, which the caller must then donate to the collector thread.
    pub fn release_access(&self) -> bool {
        let (old, _) = self.update(|old| {
            assert!(old & HAS_ACCESS != 0, "releasing heap access twice");
            old & !(HAS_ACCESS | MUTATOR_HAS_CONN)
        });
        old & MUTATOR_HAS_CONN != 0
    }

    /// The mutator, driving a phase that needs the world stopped, stops
    /// itself: it is at a safepoint by construction, so with a single mutator
    /// the world *is* stopped the moment it starts conducting. The word does
    /// not change: the STOPPED bit is a collector-side notion, which is what
    /// keeps it mutually exclusive with MUTATOR_HAS_CONN.
    pub fn stop_from_mutator(&self) {
        let word = self.load();
        assert!(word & HAS_ACCESS != 0, "mutator stopping without access");
        assert!(
            word & STOPPED == 0,
            "mutator conducting while the collector stopped the world"
        );
    }

    /// The mutator resumes running program code. Symmetric with
    /// `stop_from_mutator`: nothing to undo.
    pub fn resume_from_mutator(&self) {
        let word = self.load();
        assert!(word & HAS_ACCESS != 0, "mutator resuming without access");
        assert!(
            word & STOPPED == 0,
            "mutator resuming a collector-stopped world"
        );
    }

    /// The collector thread asks for a stopped world. If the mutator holds
    /// access, the conn is handed to it instead of handshaking: the mutator
    /// will drive the pending transition from its next safepoint.
    pub fn stop_from_collector(&self) -> StopOutcome {
        let mut outcome = StopOutcome::Stopped;
        self.update(|old| {
            if old & HAS_ACCESS != 0 {
                outcome = StopOutcome::HandedOff;
                old | MUTATOR_HAS_CONN
            } else {
                assert!(old & STOPPED == 0, "stopping an already-stopped world");
                outcome = StopOutcome::Stopped;
                old | STOPPED
            }
        });
        outcome
    }

    pub fn resume_from_collector(&self) {
        self.update(|old| {
            assert!(old & STOPPED != 0, "resuming a world that is not stopped");
            old & !STOPPED
        });
    }

    /// Give the conn to the access-holding mutator, so its allocation slow
    /// paths advance the collector instead of a cross-thread handshake.
    /// Returns false (and does nothing) if no mutator holds access.
    pub fn try_hand_conn_to_mutator(&self) -> bool {
        let mut handed = false;
        self.update(|old| {
            if old & HAS_ACCESS != 0 {
                handed = true;
                old | MUTATOR_HAS_CONN
            } else {
                handed = false;
                old
            }
        });
        handed
    }

    pub fn set_mutator_waiting(&self) {
        self.update(|old| old | MUTATOR_WAITING);
    }

    pub fn clear_mutator_waiting(&self) {
        self.update(|old| old & !MUTATOR_WAITING);
    }

    pub fn set_needs_finalize(&self) {
        self.update(|old| old | NEED_FINALIZE);
    }

    /// Claim the finalize request. Only one poll runs the epilogue.
    pub fn take_needs_finalize(&self) -> bool {
        let (old, _) = self.update(|old| old & !NEED_FINALIZE);
        old & NEED_FINALIZE != 0
    }
}

/// Global states for a heap instance. Components keep a reference to this
/// struct instead of reaching back into the heap, which keeps the access
/// pattern auditable.
pub(crate) struct GlobalState {
    /// The world-state word.
    pub(crate) world: WorldState,
    /// True from the start of marking to the end of the cycle. The write
    /// barrier must fence before trusting a cell state it observed while this
    /// flag is up.
    pub(crate) mutator_should_be_fenced: AtomicBool,
    /// Scope of the cycle in flight. Meaningless when no cycle is running.
    pub(crate) current_scope: Atomic<CollectionScope>,
    /// Nesting depth of scoped GC deferral regions.
    pub(crate) defer_depth: AtomicUsize,
    /// A collection became necessary inside a deferral region and is owed.
    pub(crate) deferred_collection_requested: AtomicBool,
    /// Completed Begin->End cycles.
    pub(crate) cycle_count: AtomicU64,
    /// Completed full-scope cycles.
    pub(crate) full_cycle_count: AtomicU64,
}

impl GlobalState {
    pub fn new() -> Self {
        GlobalState {
            world: WorldState::new(),
            mutator_should_be_fenced: AtomicBool::new(false),
            current_scope: Atomic::new(CollectionScope::Eden),
            defer_depth: AtomicUsize::new(0),
            deferred_collection_requested: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            full_cycle_count: AtomicU64::new(0),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.defer_depth.load(Ordering::Acquire) > 0
    }
}

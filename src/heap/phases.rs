//! The collector's top-level control flow: the phase state machine and the
//! conn protocol that decides who runs it.
//!
//! Phases advance only under the *conn*, held by exactly one of the mutator
//! or the collector thread at a time. A phase transition that needs the world
//! stopped resolves that requirement in `finish_changing_phase` before the
//! next handler runs; when the collector wants a stop but the mutator holds
//! heap access, the conn is handed to the mutator instead of handshaking, and
//! the mutator's next safepoint poll drives the same pending transition
//! itself. The collector thread only ever drives when no mutator is available
//! to.

use atomic::Ordering;
use bytemuck::NoUninit;
use enum_map::Enum;
use std::time::Instant;

use crate::global_state::StopOutcome;
use crate::heap::registry::cell_is_live;
use crate::heap::{CollectionScope, Heap};
use crate::marking::visitor::DrainOutcome;
use crate::vm::VirtualMachine;

/// The collector's phase. `NotRunning` is the only phase in which no cycle is
/// in flight; everything between `Begin` and `End` belongs to exactly one
/// cycle.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, Enum, strum_macros::Display)]
pub enum CollectorPhase {
    NotRunning,
    Begin,
    Fixpoint,
    Concurrent,
    Reloop,
    End,
}

impl CollectorPhase {
    /// Phases that touch roots, declare termination, or finalize may not run
    /// concurrently with the mutator.
    fn requires_stopped_world(self) -> bool {
        matches!(
            self,
            CollectorPhase::Begin | CollectorPhase::Fixpoint | CollectorPhase::End
        )
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            CollectorPhase::NotRunning => "NotRunning",
            CollectorPhase::Begin => "Begin",
            CollectorPhase::Fixpoint => "Fixpoint",
            CollectorPhase::Concurrent => "Concurrent",
            CollectorPhase::Reloop => "Reloop",
            CollectorPhase::End => "End",
        }
    }
}

/// Who is driving the phase machine right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Conductor {
    Mutator,
    Collector,
}

/// What the conn loop should do after a phase handler returns.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NextPhaseAction {
    /// Keep driving: run the (possibly new) current phase.
    Continue,
    /// Yield the conn loop back to the caller; someone else (or a later
    /// poll) continues from here.
    Yield,
}

impl<VM: VirtualMachine> Heap<VM> {
    /// Drive phases for as long as this conductor holds the conn and the
    /// handlers ask to continue.
    pub(crate) fn run_conn_loop(&self, conductor: Conductor) {
        while self.check_conn(conductor) {
            match self.run_current_phase(conductor) {
                NextPhaseAction::Continue => continue,
                NextPhaseAction::Yield => break,
            }
        }
    }

    fn check_conn(&self, conductor: Conductor) -> bool {
        match conductor {
            Conductor::Mutator => self.global.world.mutator_has_conn(),
            Conductor::Collector => !self.global.world.mutator_has_conn(),
        }
    }

    fn run_current_phase(&self, conductor: Conductor) -> NextPhaseAction {
        assert!(
            self.check_conn(conductor),
            "{:?} tried to drive the phase machine without the conn",
            conductor
        );
        // Resolve any transition a previous conductor left pending; this is
        // where a handed-off world stop actually happens.
        if !self.finish_changing_phase(conductor) {
            return NextPhaseAction::Yield;
        }
        let phase = self.phase.load(Ordering::SeqCst);
        let began = Instant::now();
        let action = match phase {
            CollectorPhase::NotRunning => self.run_not_running_phase(conductor),
            CollectorPhase::Begin => self.run_begin_phase(conductor),
            CollectorPhase::Fixpoint => self.run_fixpoint_phase(conductor),
            CollectorPhase::Concurrent => self.run_concurrent_phase(conductor),
            CollectorPhase::Reloop => self.run_reloop_phase(conductor),
            CollectorPhase::End => self.run_end_phase(conductor),
        };
        self.stats.record_phase(phase, began.elapsed());
        action
    }

    fn change_phase(&self, conductor: Conductor, to: CollectorPhase) -> NextPhaseAction {
        self.next_phase.store(to, Ordering::SeqCst);
        if self.finish_changing_phase(conductor) {
            NextPhaseAction::Continue
        } else {
            NextPhaseAction::Yield
        }
    }

    /// Complete the pending phase transition, stopping or resuming the world
    /// as the source and destination phases demand. Returns false if the
    /// transition could not complete under this conductor (the conn was
    /// handed off instead).
    fn finish_changing_phase(&self, conductor: Conductor) -> bool {
        let current = self.phase.load(Ordering::SeqCst);
        let next = self.next_phase.load(Ordering::SeqCst);
        if current == next {
            return true;
        }
        if next.requires_stopped_world() && !current.requires_stopped_world() {
            if !self.try_stop_the_world(conductor) {
                return false;
            }
        } else if !next.requires_stopped_world() && current.requires_stopped_world() {
            self.resume_the_world(conductor);
        }
        trace!("phase {} -> {} ({:?} conducting)", current, next, conductor);
        self.phase.store(next, Ordering::SeqCst);
        // Re-notify after the phase is published: shutdown parks on the phase
        // itself, and the resume above notified before this store.
        self.safepoint.notify_all();
        true
    }

    fn try_stop_the_world(&self, conductor: Conductor) -> bool {
        match conductor {
            Conductor::Mutator => {
                // The mutator is at a safepoint by construction: driving the
                // collector is not mutating. It stops itself cooperatively.
                self.global.world.stop_from_mutator();
            }
            Conductor::Collector => match self.global.world.stop_from_collector() {
                StopOutcome::Stopped => {}
                StopOutcome::HandedOff => {
                    trace!("world stop handed to the mutator via the conn");
                    return false;
                }
            },
        }
        let now = Instant::now();
        self.stats.world_stopped(now);
        self.pacing.did_stop(now);
        true
    }

    fn resume_the_world(&self, conductor: Conductor) {
        let now = Instant::now();
        self.stats.world_resumed(now);
        self.pacing
            .did_resume(now, self.growth.bytes_allocated_this_cycle());
        match conductor {
            Conductor::Mutator => self.global.world.resume_from_mutator(),
            Conductor::Collector => self.global.world.resume_from_collector(),
        }
        // Wake anything parked waiting for heap access.
        self.safepoint.notify_all();
    }

    // ===== Phase handlers =====

    fn run_not_running_phase(&self, conductor: Conductor) -> NextPhaseAction {
        if self.requests.has_pending() {
            self.change_phase(conductor, CollectorPhase::Begin)
        } else {
            NextPhaseAction::Yield
        }
    }

    /// Pick the cycle's scope, reset per-cycle state, and bootstrap the mark
    /// stacks from the remembered set and the conservative scan.
    fn run_begin_phase(&self, conductor: Conductor) -> NextPhaseAction {
        let (ticket, request) = self
            .requests
            .begin_cycle()
            .expect("Begin phase entered with an empty request queue");

        let mut scope = request.scope.unwrap_or(CollectionScope::Eden);
        if self.growth.take_force_next_full() {
            scope = CollectionScope::Full;
        }
        self.global.current_scope.store(scope, Ordering::SeqCst);
        self.marking.reset_for_cycle();
        if scope == CollectionScope::Full {
            // Every cell is a candidate again; eden cycles instead rely on
            // old cells keeping their marks.
            self.registry.lock().unwrap().clear_all_marks();
        }
        // Marking is about to run concurrently with mutation: barrier slow
        // paths must fence before trusting cell states.
        self.global
            .mutator_should_be_fenced
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let now = Instant::now();
        self.pacing.began_cycle(now);

        let mut collector = self.collector.lock().unwrap();
        collector.in_flight = Some((ticket, request));
        collector.cycle_began_at = Some(now);
        let state = &mut *collector;
        state.constraints.reset_for_cycle();

        // The remembered set: cells the barrier re-grayed since the last
        // cycle. Both scopes start from it; a full cycle would find them
        // again anyway, an eden cycle depends on them.
        for cell in self.marking.mutator_stack.drain_all() {
            state.visitor.append_for_rescan(cell);
        }
        let raced: Vec<_> = std::mem::take(&mut *self.marking.race_stack.lock());
        for cell in raced {
            state.visitor.append_for_rescan(cell);
        }
        state.constraints.execute_bootstrap(self, &mut state.visitor);

        info!(
            "GC cycle {} begin: {:?} scope, ticket {}, {} objects, {} bytes allocated since last cycle",
            self.global
                .cycle_count
                .load(std::sync::atomic::Ordering::Relaxed)
                + 1,
            scope,
            ticket,
            self.object_count(),
            self.growth.bytes_allocated_this_cycle(),
        );
        drop(collector);
        self.change_phase(conductor, CollectorPhase::Fixpoint)
    }

    /// Drain in parallel, then run the constraint set to convergence; repeat
    /// until both marking terminates and the constraints go quiet, yielding
    /// to the mutator whenever the pause budget runs out mid-drain.
    fn run_fixpoint_phase(&self, conductor: Conductor) -> NextPhaseAction {
        let mut collector = self.collector.lock().unwrap();
        let state = &mut *collector;

        let now = Instant::now();
        let deadline = if self.global.world.mutator_is_waiting() {
            // Somebody is blocked on this cycle; pause time no longer buys
            // anything.
            self.pacing.unbounded_deadline(now)
        } else {
            self.pacing.drain_deadline(now)
        };
        let outcome = state.visitor.drain_in_parallel(deadline);
        if outcome == DrainOutcome::DeadlinePassed && !state.visitor.did_reach_termination() {
            drop(collector);
            return self.change_phase(conductor, CollectorPhase::Concurrent);
        }

        // The drain went quiet; ask the constraints for more. Convergence
        // must run after the drain so constraints keyed to marking progress
        // (output constraints above all) see what it discovered.
        let progress = state
            .constraints
            .execute_convergence(self, &mut state.visitor);
        if !progress && state.visitor.did_reach_termination() && state.constraints.all_executed() {
            drop(collector);
            return self.change_phase(conductor, CollectorPhase::End);
        }
        NextPhaseAction::Continue
    }

    /// The world is running. Whoever holds the conn keeps marking moving:
    /// the collector drains passively in the background, while a conducting
    /// mutator pays its marking tax on allocation slow paths and comes back
    /// here only to check the pacing verdict.
    fn run_concurrent_phase(&self, conductor: Conductor) -> NextPhaseAction {
        match conductor {
            Conductor::Mutator => {
                if self.should_finish_concurrent_phase(Instant::now()) {
                    self.change_phase(conductor, CollectorPhase::Reloop)
                } else {
                    NextPhaseAction::Yield
                }
            }
            Conductor::Collector => {
                let mut collector = self.collector.lock().unwrap();
                let deadline = self.pacing.drain_deadline(Instant::now());
                let outcome = collector.visitor.drain_in_parallel_passively(deadline);
                drop(collector);
                if outcome == DrainOutcome::Exhausted
                    || self.should_finish_concurrent_phase(Instant::now())
                {
                    self.change_phase(conductor, CollectorPhase::Reloop)
                } else {
                    NextPhaseAction::Continue
                }
            }
        }
    }

    fn should_finish_concurrent_phase(&self, now: Instant) -> bool {
        self.global.world.mutator_is_waiting()
            || self.pacing.should_stop_the_mutator(
                now,
                self.growth.bytes_allocated_this_cycle(),
                self.growth.max_eden_size(),
            )
    }

    /// Bookkeeping between a concurrent window and the next fixpoint.
    fn run_reloop_phase(&self, conductor: Conductor) -> NextPhaseAction {
        self.concurrent_epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        trace!("reloop: scheduling another marking fixpoint");
        self.change_phase(conductor, CollectorPhase::Fixpoint)
    }

    /// The stopped-world epilogue: finalize marks, sweep, recompute limits,
    /// serve the ticket.
    fn run_end_phase(&self, conductor: Conductor) -> NextPhaseAction {
        let mut collector = self.collector.lock().unwrap();

        // Fatal, not recoverable: claiming termination with queued marking
        // work means the mark closure is incomplete and sweeping would free
        // reachable cells.
        assert!(
            collector.visitor.did_reach_termination(),
            "collection reached End with marking work remaining"
        );

        let scope = self.global.current_scope.load(Ordering::SeqCst);
        self.global
            .mutator_should_be_fenced
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let bytes_visited = self
            .marking
            .bytes_visited
            .load(std::sync::atomic::Ordering::SeqCst);
        let extra_visited = self
            .marking
            .extra_bytes_visited
            .load(std::sync::atomic::Ordering::SeqCst);
        // An eden cycle only visits what it newly reached; the old
        // generation's live size carries over from the last cycle.
        let current_heap_size = if scope == CollectionScope::Full {
            bytes_visited + extra_visited
        } else {
            self.growth.size_after_last_collect() + bytes_visited + extra_visited
        };

        // Compiled code first: the binding barriers surviving code units and
        // deletes dead ones, which may consult markedness but not free cells.
        self.vm.sweep_dead_code(self);

        let live = |cell| cell_is_live(cell, scope);
        let finalized = self.finalizers.finalize_survivors(live);
        let reaped = self.weak_handles.reap(live);
        // Stale-table pruning proper belongs to full collections, but an eden
        // sweep is about to free its dead cells too, and a table entry keyed
        // by one of those must not outlive the header it points at.
        for table in self.weak_tables.lock().unwrap().iter() {
            table.prune_dead_entries(&live);
        }
        let cancelled = self.deferred_work.cancel_dead(live);
        self.output_cells.lock().unwrap().retain(|&cell| live(cell));

        let tally = self.registry.lock().unwrap().sweep(scope);

        let full = scope == CollectionScope::Full;
        self.growth.did_finish_collection(full, current_heap_size);
        if full {
            self.growth.resync_extra_memory(extra_visited);
            *self.last_full_collection.lock().unwrap() = Some(Instant::now());
        }
        self.global
            .cycle_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if full {
            self.global
                .full_cycle_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        let now = Instant::now();
        self.pacing.end_cycle(now, bytes_visited);
        self.stats
            .cycle_finished(bytes_visited, tally.swept_cells, tally.swept_bytes);

        let (ticket, _) = collector
            .in_flight
            .take()
            .expect("End phase without an in-flight request");
        let cycle_duration = collector.cycle_began_at.take().map(|at| now - at);
        drop(collector);

        self.requests.did_serve(ticket);
        self.global.world.set_needs_finalize();

        info!(
            "GC cycle end: {:?}, {} bytes visited, swept {} cells ({} bytes), promoted {}, finalized {}, reaped {} weaks, cancelled {} deferred, ceiling {} bytes, took {:?}",
            scope,
            current_heap_size,
            tally.swept_cells,
            tally.swept_bytes,
            tally.promoted_cells,
            finalized,
            reaped,
            cancelled,
            self.growth.max_heap_size(),
            cycle_duration.unwrap_or_default(),
        );

        self.change_phase(conductor, CollectorPhase::NotRunning)
    }
}

//! The marking constraint set: an ordered collection of named root-scanning
//! and convergence tasks, executed to a fixed point around parallel drains.
//!
//! A constraint's *volatility* says when re-running it could produce new gray
//! cells, which is what keeps convergence passes from being quadratic: most
//! constraints append nothing on a re-run, and the ones that can are the only
//! ones re-executed.
//!
//! Constraint executors receive the heap and the primary visitor. They run
//! with the collector state lock held, so they must never reach back into the
//! phase driver or take that lock themselves.

use std::time::Instant;

use super::visitor::SlotVisitor;
use crate::heap::Heap;
use crate::vm::VirtualMachine;

/// When a constraint might produce new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintVolatility {
    /// Each execution can gray cells regardless of what else happened:
    /// re-run on every convergence pass.
    GreyedByExecution,
    /// Produces new work only after marking progressed since its last run.
    GreyedByMarking,
    /// Its inputs change only while the mutator runs. Re-run after a
    /// concurrent window, and then only once the pass has otherwise gone
    /// quiet; the conservative stack scan is the canonical case, since stack
    /// contents are stable between safepoints.
    SeldomGreyed,
}

pub(crate) type ConstraintFn<VM> = Box<dyn Fn(&Heap<VM>, &mut SlotVisitor) + Send + Sync>;

pub(crate) struct MarkingConstraint<VM: VirtualMachine> {
    name: &'static str,
    description: &'static str,
    volatility: ConstraintVolatility,
    executed_this_cycle: bool,
    /// The concurrent epoch at the last execution.
    last_epoch: u64,
    /// The cycle's visited-cell count at the last execution.
    last_visit_count: usize,
    execute: ConstraintFn<VM>,
}

pub(crate) struct MarkingConstraintSet<VM: VirtualMachine> {
    constraints: Vec<MarkingConstraint<VM>>,
}

impl<VM: VirtualMachine> MarkingConstraintSet<VM> {
    pub fn new() -> Self {
        MarkingConstraintSet {
            constraints: Vec::new(),
        }
    }

    /// Install a constraint. Order matters: constraints execute in
    /// installation order, and the first one doubles as the Begin-phase
    /// bootstrap (by convention, the conservative root scan).
    pub fn add(
        &mut self,
        name: &'static str,
        description: &'static str,
        volatility: ConstraintVolatility,
        execute: ConstraintFn<VM>,
    ) {
        self.constraints.push(MarkingConstraint {
            name,
            description,
            volatility,
            executed_this_cycle: false,
            last_epoch: 0,
            last_visit_count: 0,
            execute,
        });
    }

    pub fn reset_for_cycle(&mut self) {
        for constraint in &mut self.constraints {
            constraint.executed_this_cycle = false;
            constraint.last_epoch = 0;
            constraint.last_visit_count = 0;
        }
    }

    /// Begin-phase bootstrap: run the first constraint once so the mark
    /// stacks start populated.
    pub fn execute_bootstrap(&mut self, heap: &Heap<VM>, visitor: &mut SlotVisitor) {
        let epoch = heap.concurrent_epoch();
        let constraint = self
            .constraints
            .first_mut()
            .expect("marking requires at least the bootstrap constraint");
        Self::run_one(constraint, heap, visitor, epoch);
    }

    /// One convergence pass: execute every constraint whose volatility says
    /// it could produce new work. Returns true if the pass made progress
    /// (marked something or queued rescan work).
    pub fn execute_convergence(&mut self, heap: &Heap<VM>, visitor: &mut SlotVisitor) -> bool {
        let epoch = heap.concurrent_epoch();
        let mut progress = false;
        for constraint in &mut self.constraints {
            let visited_now = heap.marking().visited_snapshot();
            let should_run = match constraint.volatility {
                ConstraintVolatility::GreyedByExecution => true,
                ConstraintVolatility::GreyedByMarking => {
                    !constraint.executed_this_cycle
                        || visited_now != constraint.last_visit_count
                }
                ConstraintVolatility::SeldomGreyed => {
                    !constraint.executed_this_cycle
                        || (epoch > constraint.last_epoch && !progress)
                }
            };
            if !should_run {
                continue;
            }
            if Self::run_one(constraint, heap, visitor, epoch) {
                progress = true;
            }
        }
        progress
    }

    fn run_one(
        constraint: &mut MarkingConstraint<VM>,
        heap: &Heap<VM>,
        visitor: &mut SlotVisitor,
        epoch: u64,
    ) -> bool {
        let before = heap.marking().visited_snapshot();
        let was_empty = visitor.is_empty();
        let started = Instant::now();
        (constraint.execute)(heap, visitor);
        constraint.executed_this_cycle = true;
        constraint.last_epoch = epoch;
        let after = heap.marking().visited_snapshot();
        constraint.last_visit_count = after;
        let appended = after != before || (was_empty && !visitor.is_empty());
        trace!(
            "constraint {} ({}): visited {} cells in {:?}",
            constraint.name,
            constraint.description,
            after - before,
            started.elapsed()
        );
        appended
    }

    /// Every constraint has executed at least once this cycle; convergence
    /// may be declared once this holds and a pass makes no progress.
    pub fn all_executed(&self) -> bool {
        self.constraints.iter().all(|c| c.executed_this_cycle)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }
}

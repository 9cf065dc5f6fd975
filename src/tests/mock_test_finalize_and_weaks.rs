use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cell::CellRef;
use crate::finalize::WeakTable;
use crate::heap::CollectionScope;
use crate::mock::{
    new_cell, new_object, MutatorFixture, FINALIZABLE, FINALIZABLE_LATE, FINALIZED,
    FINALIZED_AT_FIRST_LATE,
};
use crate::util::test_util::serial_test;

// Unconditional finalizers run exactly once per *surviving* cell per cycle,
// in fixed pass order.
#[test]
fn finalizers_run_per_survivor_per_cycle_in_pass_order() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let late = new_cell(heap, &FINALIZABLE_LATE, 0);
        fixture.vm().push_root(late);
        let early_a = new_cell(heap, &FINALIZABLE, 0);
        fixture.vm().push_root(early_a);
        let early_b = new_cell(heap, &FINALIZABLE, 0);
        fixture.vm().push_root(early_b);
        // This one dies immediately; dead cells are not finalized.
        new_cell(heap, &FINALIZABLE, 0);

        heap.collect_now(CollectionScope::Eden);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 3);
        // The late-pass finalizer saw both early-pass runs complete first,
        // despite being enrolled before them.
        assert_eq!(FINALIZED_AT_FIRST_LATE.load(Ordering::SeqCst), 2);

        heap.collect_now(CollectionScope::Eden);
        assert_eq!(
            FINALIZED.load(Ordering::SeqCst),
            6,
            "survivors are finalized once per cycle"
        );
    })
}

#[test]
fn weak_handles_are_reaped_with_death_callbacks() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let keep = new_object(heap, 0);
        fixture.vm().push_root(keep);
        let w_keep = heap.make_weak(keep, None);

        let deaths = Arc::new(AtomicUsize::new(0));
        let counter = deaths.clone();
        let doomed = new_object(heap, 0);
        let w_doomed = heap.make_weak(
            doomed,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.weak_target(w_keep), Some(keep));
        assert_eq!(heap.weak_target(w_doomed), None);
        assert_eq!(deaths.load(Ordering::SeqCst), 1);

        heap.collect_now(CollectionScope::Full);
        assert_eq!(deaths.load(Ordering::SeqCst), 1, "death callback ran twice");
    })
}

struct MockWeakTable {
    entries: Mutex<HashMap<usize, &'static str>>,
}

impl WeakTable for MockWeakTable {
    fn prune_dead_entries(&self, is_live: &dyn Fn(CellRef) -> bool) {
        self.entries.lock().unwrap().retain(|&address, _| {
            let cell = unsafe { CellRef::from_raw_address(address) }.unwrap();
            is_live(cell)
        });
    }
}

#[test]
fn weak_tables_lose_entries_for_dead_cells() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let table = Arc::new(MockWeakTable {
            entries: Mutex::new(HashMap::new()),
        });
        heap.register_weak_table(table.clone());

        let keep = new_object(heap, 0);
        fixture.vm().push_root(keep);
        table.entries.lock().unwrap().insert(keep.as_usize(), "keep");
        let doomed = new_object(heap, 0);
        table
            .entries
            .lock()
            .unwrap()
            .insert(doomed.as_usize(), "doomed");

        heap.collect_now(CollectionScope::Eden);
        assert_eq!(table.entries.lock().unwrap().len(), 1);

        fixture.vm().pop_root();
        heap.collect_now(CollectionScope::Full);
        assert!(table.entries.lock().unwrap().is_empty());
    })
}

#[test]
fn deferred_work_referencing_dead_cells_is_cancelled() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let kept = new_object(heap, 0);
        fixture.vm().push_root(kept);

        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let doomed = new_object(heap, 0);
        heap.register_deferred_work(
            vec![kept, doomed],
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let never = Arc::new(AtomicUsize::new(0));
        let never_counter = never.clone();
        let survivor_id = heap.register_deferred_work(
            vec![kept],
            Box::new(move || {
                never_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        heap.collect_now(CollectionScope::Eden);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(never.load(Ordering::SeqCst), 0);

        heap.complete_deferred_work(survivor_id);
        heap.collect_now(CollectionScope::Full);
        assert_eq!(never.load(Ordering::SeqCst), 0);
    })
}

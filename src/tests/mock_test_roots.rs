use std::sync::atomic::Ordering;

use crate::heap::CollectionScope;
use crate::mock::{new_cell, new_object, set_slot, MutatorFixture, LAZY_EDGES};
use crate::util::test_util::serial_test;

#[test]
fn protected_values_are_roots_until_unprotected() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let cell = new_object(heap, 0);
        heap.protect(cell);
        heap.protect(cell);

        heap.collect_now(CollectionScope::Full);
        assert!(cell.is_marked());
        assert_eq!(heap.object_count(), 1);

        // Protection is counted: one unprotect leaves one level standing.
        assert!(!heap.unprotect(cell));
        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 1);

        assert!(heap.unprotect(cell));
        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 0);
    })
}

#[test]
fn compiled_code_roots_are_scanned_and_swept() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let code = new_object(heap, 1);
        fixture.vm().add_code_root(code);
        let data = new_object(heap, 0);
        set_slot(heap, code, 0, Some(data));

        heap.collect_now(CollectionScope::Full);
        assert!(code.is_marked());
        assert!(data.is_marked(), "code-to-data edge was not traced");
        assert_eq!(heap.object_count(), 2);
        assert!(fixture.vm().code_sweeps.load(Ordering::SeqCst) >= 1);
    })
}

// Output constraints: a black cell whose outgoing edges are produced lazily
// must be re-examined until its edge set stops growing.
#[test]
fn output_constraints_reveal_lazy_edges() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let code = new_cell(heap, &LAZY_EDGES, 4);
        fixture.vm().push_root(code);
        for index in 0..4 {
            let data = new_object(heap, 0);
            set_slot(heap, code, index, Some(data));
        }

        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 5);
        for index in 0..4 {
            let data = crate::mock::get_slot(code, index).unwrap();
            assert!(data.is_marked(), "lazy edge {} was not traced", index);
        }

        // Without the root the lazy container and its edges all die.
        fixture.vm().pop_root();
        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 0);
    })
}

#[test]
fn finish_notifications_arrive_at_safepoints() {
    serial_test(|| {
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;
        let root = new_object(heap, 0);
        fixture.vm().push_root(root);

        heap.collect_now(CollectionScope::Eden);
        heap.stop_if_necessary();
        assert!(fixture.vm().finished_collections.load(Ordering::SeqCst) >= 1);
    })
}

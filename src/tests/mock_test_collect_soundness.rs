use std::sync::atomic::Ordering;

use crate::heap::CollectionScope;
use crate::mock::graph::{grow_chain, grow_cycle};
use crate::mock::{new_object, MutatorFixture, DESTROYED};
use crate::util::test_util::serial_test;

#[test]
fn everything_reachable_from_a_root_is_marked() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let head = new_object(heap, 1);
        fixture.vm().push_root(head);
        let chain = grow_chain(heap, head, 100);

        heap.collect_now(CollectionScope::Eden);

        assert!(head.is_marked());
        for &cell in &chain {
            assert!(cell.is_marked(), "reachable cell {:?} left unmarked", cell);
        }
        assert_eq!(heap.object_count(), 101);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
    })
}

#[test]
fn unreachable_cells_are_swept() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let keeper = new_object(heap, 0);
        fixture.vm().push_root(keeper);
        for _ in 0..50 {
            new_object(heap, 0);
        }
        assert_eq!(heap.object_count(), 51);

        heap.collect_now(CollectionScope::Full);

        assert_eq!(heap.object_count(), 1);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 50);
        assert!(keeper.is_marked());
    })
}

#[test]
fn cyclic_graphs_are_retained_then_reclaimed() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let head = new_object(heap, 1);
        fixture.vm().push_root(head);
        let ring = grow_cycle(heap, head, 32);

        heap.collect_now(CollectionScope::Full);
        for &cell in &ring {
            assert!(cell.is_marked());
        }
        assert_eq!(heap.object_count(), 33);

        // Cut the only external edge; the ring keeps itself alive only
        // through its own cycle, which a full trace does not honor.
        fixture.vm().pop_root();
        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 0);
    })
}

#[test]
fn collecting_twice_is_idempotent() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let head = new_object(heap, 1);
        fixture.vm().push_root(head);
        grow_chain(heap, head, 20);

        heap.collect_now(CollectionScope::Full);
        let after_first = heap.object_count();
        heap.collect_now(CollectionScope::Full);

        assert_eq!(heap.object_count(), after_first);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
    })
}

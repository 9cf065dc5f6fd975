use std::sync::atomic::Ordering;

use crate::heap::CollectionScope;
use crate::mock::graph::grow_chain;
use crate::mock::{new_object, MutatorFixture, DESTROYED};
use crate::util::test_util::serial_test;

// The generational scenario: a chain rooted by a handle survives an eden
// collection; dropping the handle does not let a later *eden* collection
// reclaim it, because its cells were promoted and eden scope cannot prove an
// old cell dead; the next full collection reclaims everything.
#[test]
fn eden_promotes_then_full_reclaims() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;
        let handles = heap.new_handle_set("test-roots");

        let head = new_object(heap, 1);
        let handle = handles.add(head);
        let chain = grow_chain(heap, head, 40);

        heap.collect_now(CollectionScope::Eden);
        assert!(head.is_marked());
        for &cell in &chain {
            assert!(cell.is_marked());
        }
        assert_eq!(heap.object_count(), 41);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

        // Drop the only root. The chain is now garbage, but it is old
        // generation garbage.
        handles.remove(handle);

        heap.collect_now(CollectionScope::Eden);
        assert_eq!(
            heap.object_count(),
            41,
            "an eden collection must not reclaim old-generation cells"
        );
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

        heap.collect_now(CollectionScope::Full);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 41);
    })
}

// New cells written into an old (black) container between cycles reach the
// next eden collection through the barrier's remembered set, not through any
// root.
#[test]
fn barrier_remembered_set_feeds_eden_collections() {
    serial_test(|| {
        crate::mock::reset_counters();
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        let container = new_object(heap, 4);
        fixture.vm().push_root(container);
        heap.collect_now(CollectionScope::Eden);
        // The container survived a cycle: it is old and black.
        assert!(crate::mock::get_slot(container, 0).is_none());

        let young = new_object(heap, 0);
        crate::mock::set_slot(heap, container, 0, Some(young));

        heap.collect_now(CollectionScope::Eden);
        assert!(young.is_marked(), "barrier-remembered edge was not traced");
        assert_eq!(heap.object_count(), 2);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
    })
}

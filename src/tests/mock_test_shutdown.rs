use std::sync::atomic::Ordering;

use crate::heap::GCRequest;
use crate::mock::{new_object, MutatorFixture, DESTROYED};
use crate::util::test_util::{panic_after, serial_test};

// Shutdown must serve the outstanding ticket before tearing anything down,
// then refuse all further requests and force-sweep the heap.
#[test]
fn outstanding_tickets_are_served_before_shutdown() {
    serial_test(|| {
        panic_after(60_000, || {
            crate::mock::reset_counters();
            let fixture = MutatorFixture::create();
            let heap = &fixture.heap;

            let root = new_object(heap, 0);
            fixture.vm().push_root(root);
            for _ in 0..20 {
                new_object(heap, 0);
            }

            heap.collect_async(GCRequest::full());
            let granted = heap.debug_last_granted_ticket();
            assert_eq!(granted, 1);
            assert_eq!(heap.statistics().cycle_count, 0);

            heap.last_chance_to_finalize();

            // The async full collection ran to completion first...
            assert_eq!(heap.statistics().cycle_count, 1);
            assert_eq!(heap.statistics().full_cycle_count, 1);
            // ...then the forced sweep reclaimed even the rooted survivor.
            assert_eq!(heap.object_count(), 0);
            assert_eq!(DESTROYED.load(Ordering::SeqCst), 21);

            // No further requests are accepted.
            heap.collect_async(GCRequest::full());
            assert_eq!(heap.debug_last_granted_ticket(), granted);
            heap.collect_sync(GCRequest::full());
            assert_eq!(heap.statistics().cycle_count, 1);
            assert!(heap.is_shut_down());
        })
    })
}

#[test]
#[should_panic(expected = "allocating after last_chance_to_finalize")]
fn allocation_after_shutdown_is_fatal() {
    let fixture = MutatorFixture::create();
    fixture.heap.last_chance_to_finalize();
    let _ = new_object(&fixture.heap, 0);
}

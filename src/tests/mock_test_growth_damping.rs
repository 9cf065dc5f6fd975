use crate::mock::{new_object, MutatorFixture};
use crate::util::test_util::serial_test;

// Allocating below the computed allowance triggers no collection at all;
// exceeding it (here: discovered when the deferral region closes) triggers
// exactly one, not a flood of redundant requests.
#[test]
fn allowance_damps_collection_requests() {
    serial_test(|| {
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;
        let root = new_object(heap, 0);
        fixture.vm().push_root(root);

        // Roughly 400 KiB against a 1 MiB allowance: nothing may trigger.
        for _ in 0..100 {
            new_object(heap, 500);
        }
        heap.stop_if_necessary();
        assert_eq!(heap.statistics().cycle_count, 0);

        // Blow through the allowance inside a deferral region: the trigger
        // is recorded, not acted on.
        {
            let _no_gc = heap.defer_gc();
            for _ in 0..300 {
                new_object(heap, 500);
            }
            heap.stop_if_necessary();
            assert_eq!(heap.statistics().cycle_count, 0, "deferral was ignored");
        }
        // Dropping the guard starts the owed collection; the next safepoint
        // poll drives it.
        heap.stop_if_necessary();
        assert_eq!(heap.statistics().cycle_count, 1);

        // Post-cycle, the allowance is fresh: quiet allocation stays quiet.
        for _ in 0..10 {
            new_object(heap, 1);
            heap.stop_if_necessary();
        }
        assert_eq!(heap.statistics().cycle_count, 1, "redundant request flood");
    })
}

// One allocation that dominates the cycle's allocation is discounted from
// the trigger decision: collecting could not reclaim it anyway.
#[test]
fn oversized_allocation_does_not_trigger_collection() {
    serial_test(|| {
        let fixture = MutatorFixture::create();
        let heap = &fixture.heap;

        // A single ~2.4 MiB cell against a 1 MiB allowance.
        let giant = new_object(heap, 300_000);
        fixture.vm().push_root(giant);
        heap.stop_if_necessary();
        assert_eq!(heap.statistics().cycle_count, 0);
    })
}

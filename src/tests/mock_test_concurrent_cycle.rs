use crate::heap::GCRequest;
use crate::mock::graph::grow_tree;
use crate::mock::{new_object, set_slot, MutatorFixture};
use crate::util::constants::BYTES_IN_MBYTE;
use crate::util::test_util::{panic_after, serial_test};

// A graph large enough to blow the pause budget forces the cycle through
// Concurrent and Reloop; soundness must hold regardless of how many
// increments the marking took, and the helper markers must have been able to
// steal donated segments along the way.
#[test]
fn large_cycles_go_concurrent_and_stay_sound() {
    serial_test(|| {
        panic_after(120_000, || {
            crate::mock::reset_counters();
            let fixture = MutatorFixture::create_with(|options| {
                options.min_bytes_per_cycle = 64 * BYTES_IN_MBYTE;
                options.pause_budget_ms = 1;
            });
            let heap = &fixture.heap;

            let tree_root = new_object(heap, 6);
            fixture.vm().push_root(tree_root);
            let tree = grow_tree(heap, tree_root, 6, 6);

            // A flat, wide container: scanning it floods one agent's local
            // stack past the donation threshold, recruiting the markers.
            let wide = new_object(heap, 10_000);
            fixture.vm().push_root(wide);
            let mut leaves = Vec::with_capacity(10_000);
            for index in 0..10_000 {
                let leaf = new_object(heap, 0);
                set_slot(heap, wide, index, Some(leaf));
                leaves.push(leaf);
            }

            heap.collect_async(GCRequest::full());
            while heap.statistics().cycle_count == 0 {
                heap.stop_if_necessary();
            }

            assert!(tree_root.is_marked());
            assert!(wide.is_marked());
            for &cell in &tree {
                assert!(cell.is_marked());
            }
            for &leaf in &leaves {
                assert!(leaf.is_marked());
            }
            assert_eq!(heap.object_count(), 2 + tree.len() + leaves.len());

            let stats = heap.statistics();
            let concurrent = stats
                .phase_times
                .iter()
                .find(|(name, _, _)| *name == "Concurrent");
            assert!(
                concurrent.is_some(),
                "a 60k-cell cycle under a 1ms budget never went concurrent: {:?}",
                stats.phase_times
            );
        })
    })
}

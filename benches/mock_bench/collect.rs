use criterion::Criterion;

use vmgc::mock::{graph::grow_tree, new_object, MutatorFixture};
use vmgc::CollectionScope;

pub fn bench(c: &mut Criterion) {
    let fixture = MutatorFixture::create_with(|options| {
        options.min_bytes_per_cycle = 1 << 30;
    });
    let heap = &fixture.heap;

    // The classic binary-trees shape: a full tree kept live across cycles.
    let root = new_object(heap, 2);
    fixture.vm().push_root(root);
    grow_tree(heap, root, 14, 2);

    c.bench_function("collect_full_binary_tree", |b| {
        b.iter(|| {
            heap.collect_now(CollectionScope::Full);
        })
    });
}

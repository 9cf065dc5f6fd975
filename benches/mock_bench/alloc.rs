use criterion::Criterion;

use vmgc::mock::{new_object, MutatorFixture};

pub fn bench(c: &mut Criterion) {
    // A large floor keeps the limit heuristic from scheduling collections;
    // this measures the allocation path alone.
    let fixture = MutatorFixture::create_with(|options| {
        options.min_bytes_per_cycle = 1 << 30;
    });
    let heap = &fixture.heap;
    let root = new_object(heap, 0);
    fixture.vm().push_root(root);

    c.bench_function("alloc", |b| {
        b.iter(|| {
            let _cell = new_object(heap, 2);
        })
    });
}

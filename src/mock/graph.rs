//! Object-graph builders for scenario tests. Every helper keeps each new
//! cell reachable from an already-rooted cell before the next heap call, the
//! same discipline a real VM's handle scopes enforce.

use super::{new_object, set_slot, MockVM};
use crate::cell::CellRef;
use crate::heap::Heap;

/// Build a singly-linked chain of `length` cells hanging off `head`'s slot 0.
/// `head` must already be rooted. Returns every cell in the chain, `head`
/// excluded.
pub fn grow_chain(heap: &Heap<MockVM>, head: CellRef, length: usize) -> Vec<CellRef> {
    let mut cells = Vec::with_capacity(length);
    let mut tail = head;
    for _ in 0..length {
        let next = new_object(heap, 1);
        set_slot(heap, tail, 0, Some(next));
        cells.push(next);
        tail = next;
    }
    cells
}

/// Build a `fanout`-ary tree of the given depth under `root` (which must be
/// rooted and have at least `fanout` slots). Returns all created cells.
pub fn grow_tree(
    heap: &Heap<MockVM>,
    root: CellRef,
    depth: usize,
    fanout: usize,
) -> Vec<CellRef> {
    let mut cells = Vec::new();
    let mut frontier = vec![root];
    for _ in 0..depth {
        let mut next_frontier = Vec::with_capacity(frontier.len() * fanout);
        for &parent in &frontier {
            for index in 0..fanout {
                let child = new_object(heap, fanout);
                set_slot(heap, parent, index, Some(child));
                cells.push(child);
                next_frontier.push(child);
            }
        }
        frontier = next_frontier;
    }
    cells
}

/// A cycle of `length` cells reachable from `head` (rooted): the last links
/// back to the first. Exercises that traversal is worklist-driven, not
/// recursive ownership.
pub fn grow_cycle(heap: &Heap<MockVM>, head: CellRef, length: usize) -> Vec<CellRef> {
    let cells = grow_chain(heap, head, length);
    if let (Some(&first), Some(&last)) = (cells.first(), cells.last()) {
        set_slot(heap, last, 0, Some(first));
    }
    cells
}

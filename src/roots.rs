//! Explicit root registries. Roots are discovered, never owned: these sets
//! tell marking where to look, and dropping an entry is the only way a cell
//! leaves them.
//!
//! Conservative stack/register scanning and compiled-code roots are supplied
//! by the binding (see [`crate::vm::VirtualMachine`]); this module holds the
//! in-crate registries: named strong handle sets and the counted
//! protected-value set.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::cell::CellRef;
use crate::marking::Visitor;

/// An index into a [`HandleSet`]. Valid until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// A named set of strong handles: every live entry is a root.
pub struct HandleSet {
    name: &'static str,
    slots: Mutex<HandleSlots>,
}

struct HandleSlots {
    entries: Vec<Option<CellRef>>,
    free: Vec<usize>,
}

impl HandleSet {
    pub fn new(name: &'static str) -> Self {
        HandleSet {
            name,
            slots: Mutex::new(HandleSlots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, cell: CellRef) -> Handle {
        let mut slots = self.slots.lock().unwrap();
        if let Some(index) = slots.free.pop() {
            debug_assert!(slots.entries[index].is_none());
            slots.entries[index] = Some(cell);
            Handle(index)
        } else {
            slots.entries.push(Some(cell));
            Handle(slots.entries.len() - 1)
        }
    }

    pub fn remove(&self, handle: Handle) -> CellRef {
        let mut slots = self.slots.lock().unwrap();
        let cell = slots.entries[handle.0]
            .take()
            .expect("releasing a handle twice");
        slots.free.push(handle.0);
        cell
    }

    pub fn get(&self, handle: Handle) -> Option<CellRef> {
        self.slots.lock().unwrap().entries[handle.0]
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.entries.len() - slots.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn visit(&self, visitor: &mut dyn Visitor) {
        let slots = self.slots.lock().unwrap();
        for entry in slots.entries.iter().flatten() {
            visitor.append(*entry);
        }
    }
}

/// The counted protected-value set behind `protect`/`unprotect`. Counted so
/// independent subsystems can protect the same cell without coordinating.
pub(crate) struct ProtectedValues {
    counts: Mutex<HashMap<CellRef, usize>>,
}

impl ProtectedValues {
    pub fn new() -> Self {
        ProtectedValues {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn protect(&self, cell: CellRef) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(cell).or_insert(0) += 1;
    }

    /// Returns true when this call removed the last protection.
    pub fn unprotect(&self, cell: CellRef) -> bool {
        let mut counts = self.counts.lock().unwrap();
        match counts.get_mut(&cell) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(&cell);
                true
            }
            None => panic!("unprotecting a value that was never protected"),
        }
    }

    pub fn visit(&self, visitor: &mut dyn Visitor) {
        let counts = self.counts.lock().unwrap();
        for cell in counts.keys() {
            visitor.append(*cell);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.lock().unwrap().len()
    }
}

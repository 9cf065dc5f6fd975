//! vmgc is the managed-memory engine for dynamic-language virtual machines: a
//! concurrent, incremental, generational tracing garbage collector.  It reclaims
//! heap cells while the mutator keeps running, using a tricolor invariant
//! maintained by an inlineable write barrier, a phase state machine driven by
//! whichever side currently holds the *conn*, and an adaptive heap-growth
//! policy.
//!
//! A VM embeds vmgc by implementing the [`vm::VirtualMachine`] binding trait
//! (root scanning, compiled-code roots) and describing each managed type with a
//! [`cell::TypeSpec`] (child visitation, optional output constraint, optional
//! unconditional finalizer).  The [`memory_manager`] module is the stable entry
//! point for all VM-to-GC calls.
//!
//! Internally the crate is layered as follows, leaves first:
//!
//! * [`cell`]: cell headers, the tricolor cell state and the mark flag.
//! * [`marking`]: mark stacks, the marking visitor, parallel marker threads
//!   and the marking constraint set.
//! * [`barrier`]: the write barrier fast/slow paths.
//! * [`heap`]: the orchestrator: phases, conn protocol, requests, growth
//!   policy, pacing, registry and the collector thread.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod global_state;
pub(crate) use global_state::GlobalState;

pub mod barrier;
pub mod build_info;
pub mod cell;
pub mod finalize;
pub mod heap;
pub mod marking;
pub mod memory_manager;
pub mod roots;
pub mod safepoint;
pub mod util;
pub mod vm;

pub use crate::cell::{CellRef, CellState, TypeSpec};
pub use crate::heap::{CollectionScope, GCRequest, Heap, HeapBuilder, Synchronousness};
pub use crate::marking::visitor::SlotVisitor;
pub use crate::marking::Visitor;
pub use crate::vm::VirtualMachine;

/// The mock binding used by tests and benchmarks. Only available when the
/// `mock_test` feature is enabled, or within the crate's own test builds.
#[cfg(any(test, feature = "mock_test"))]
pub mod mock;

#[cfg(test)]
mod tests;

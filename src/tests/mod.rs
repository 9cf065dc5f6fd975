//! Scenario tests driving whole heaps through the mock binding. These cover
//! the end-to-end properties (soundness, generational behavior, barrier
//! races, ticket ordering, growth damping, shutdown); the finer-grained
//! behavior of each component is tested next to its code.
//!
//! All of these run under `serial_test`: the mock binding observes collector
//! callbacks through process-wide counters.

mod mock_test_collect_soundness;
mod mock_test_concurrent_cycle;
mod mock_test_eden_then_full;
mod mock_test_finalize_and_weaks;
mod mock_test_growth_damping;
mod mock_test_roots;
mod mock_test_shutdown;

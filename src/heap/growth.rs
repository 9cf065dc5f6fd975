//! The allocation-limit heuristic: how big the heap may get before the next
//! collection, and when allocation pressure should request one.
//!
//! Between cycles the policy computes `current_heap_size` (bytes the cycle
//! proved live, plus attributed off-heap memory) and derives the next ceiling
//! from it: a tiered multiplier keyed to fractions of physical memory, or an
//! exponential-decay ratio on machines with abundant memory. Collection is
//! requested when bytes allocated this cycle exceed the eden allowance,
//! damped two ways: memory pressure shrinks the allowance, and one oversized
//! allocation that dominates the cycle is discounted, since collecting could
//! not reclaim it anyway.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::util::options::{GrowthMode, Options};

lazy_static! {
    /// Physical memory, probed once. Loading all of sysinfo's components is
    /// slow; refreshing only RAM keeps heap construction under a millisecond.
    static ref PHYSICAL_RAM: usize = {
        use sysinfo::{MemoryRefreshKind, RefreshKind, System};
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        sys.total_memory() as usize
    };
}

pub(crate) struct GrowthPolicy {
    options: Arc<Options>,
    ram_size: usize,
    /// The ceiling for total heap size until the next full collection.
    max_heap_size: AtomicUsize,
    /// The allocation allowance for the cycle: ceiling minus live size.
    max_eden_size: AtomicUsize,
    size_after_last_collect: AtomicUsize,
    size_after_last_full_collect: AtomicUsize,
    bytes_allocated_this_cycle: AtomicUsize,
    largest_single_allocation: AtomicUsize,
    /// Off-heap bytes reported by the embedder; they count against the
    /// allowance like ordinary allocation.
    extra_memory: AtomicUsize,
    critical_memory: AtomicBool,
    force_next_full: AtomicBool,
}

impl GrowthPolicy {
    pub fn new(options: Arc<Options>) -> Self {
        let ram_size = if options.ram_size > 0 {
            options.ram_size
        } else {
            *PHYSICAL_RAM
        };
        let floor = options.min_bytes_per_cycle;
        debug!(
            "growth policy: ram = {} bytes, mode = {}, initial ceiling = {} bytes",
            ram_size, options.growth_mode, floor
        );
        GrowthPolicy {
            options,
            ram_size,
            max_heap_size: AtomicUsize::new(floor),
            max_eden_size: AtomicUsize::new(floor),
            size_after_last_collect: AtomicUsize::new(0),
            size_after_last_full_collect: AtomicUsize::new(0),
            bytes_allocated_this_cycle: AtomicUsize::new(0),
            largest_single_allocation: AtomicUsize::new(0),
            extra_memory: AtomicUsize::new(0),
            critical_memory: AtomicBool::new(false),
            force_next_full: AtomicBool::new(false),
        }
    }

    pub fn did_allocate(&self, bytes: usize) {
        self.bytes_allocated_this_cycle
            .fetch_add(bytes, Ordering::Relaxed);
        self.largest_single_allocation
            .fetch_max(bytes, Ordering::Relaxed);
    }

    /// Off-heap memory counts against the allowance like allocation, but it
    /// does not feed the oversize discount: that exemption exists for single
    /// cell allocations a collection could not reclaim, and letting a large
    /// report discount itself would blind the trigger to genuine growth.
    pub fn report_extra_memory(&self, bytes: usize) {
        self.extra_memory.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_allocated_this_cycle
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn extra_memory_size(&self) -> usize {
        self.extra_memory.load(Ordering::Relaxed)
    }

    /// A full collection just proved exactly `visited_extra` bytes of extra
    /// memory live; drop whatever dead cells had reported.
    pub fn resync_extra_memory(&self, visited_extra: usize) {
        self.extra_memory.store(visited_extra, Ordering::Relaxed);
    }

    pub fn size_after_last_collect(&self) -> usize {
        self.size_after_last_collect.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated_this_cycle(&self) -> usize {
        self.bytes_allocated_this_cycle.load(Ordering::Relaxed)
    }

    pub fn max_heap_size(&self) -> usize {
        self.max_heap_size.load(Ordering::Relaxed)
    }

    pub fn max_eden_size(&self) -> usize {
        self.max_eden_size.load(Ordering::Relaxed)
    }

    pub fn set_critical_memory(&self, critical: bool) {
        self.critical_memory.store(critical, Ordering::Relaxed);
    }

    pub fn take_force_next_full(&self) -> bool {
        self.force_next_full.swap(false, Ordering::Relaxed)
    }

    /// Should allocation pressure request a collection right now?
    pub fn should_request_collection(&self) -> bool {
        let mut allowance = self.max_eden_size.load(Ordering::Relaxed);
        if self.critical_memory.load(Ordering::Relaxed) {
            allowance =
                (allowance as f64 * self.options.critical_allowance_fraction) as usize;
        }

        let mut allocated = self.bytes_allocated_this_cycle.load(Ordering::Relaxed);
        let largest = self.largest_single_allocation.load(Ordering::Relaxed);
        if allocated > 0
            && largest as f64 >= self.options.oversize_discount_fraction * allocated as f64
        {
            // One allocation dominates the cycle; a collection could not
            // reclaim it, so it does not get to trigger one.
            allocated -= largest;
        }
        allocated > allowance
    }

    /// The tiered or exponential growth curve.
    fn proportional_heap_size(&self, current: usize) -> usize {
        let mode = match self.options.growth_mode {
            GrowthMode::Auto => {
                if self.ram_size >= self.options.aggressive_growth_threshold {
                    GrowthMode::Aggressive
                } else {
                    GrowthMode::Proportional
                }
            }
            explicit => explicit,
        };
        let ram = self.ram_size as f64;
        let factor = match mode {
            GrowthMode::Proportional => {
                if (current as f64) < self.options.small_heap_ram_fraction * ram {
                    self.options.small_heap_growth_factor
                } else if (current as f64) < self.options.medium_heap_ram_fraction * ram {
                    self.options.medium_heap_growth_factor
                } else {
                    self.options.large_heap_growth_factor
                }
            }
            GrowthMode::Aggressive => {
                self.options.heap_growth_max_increase
                    * (-self.options.heap_growth_steepness * current as f64 / ram).exp()
                    + 1.0
            }
            GrowthMode::Auto => unreachable!(),
        };
        (current as f64 * factor) as usize
    }

    /// Recompute the ceilings at the end of a cycle. `current_heap_size` is
    /// bytes visited plus extra memory attributed to survivors.
    pub fn did_finish_collection(&self, full: bool, current_heap_size: usize) {
        self.size_after_last_collect
            .store(current_heap_size, Ordering::Relaxed);

        if full {
            self.size_after_last_full_collect
                .store(current_heap_size, Ordering::Relaxed);
            let max_heap = std::cmp::max(
                self.options.min_bytes_per_cycle,
                self.proportional_heap_size(current_heap_size),
            );
            self.max_heap_size.store(max_heap, Ordering::Relaxed);
            self.max_eden_size
                .store(max_heap.saturating_sub(current_heap_size), Ordering::Relaxed);
            debug!(
                "full collection: live {} bytes, ceiling {} bytes, allowance {} bytes",
                current_heap_size,
                max_heap,
                self.max_eden_size.load(Ordering::Relaxed)
            );
        } else {
            let max_heap = self.max_heap_size.load(Ordering::Relaxed);
            let headroom = max_heap.saturating_sub(current_heap_size);
            self.max_eden_size.store(headroom, Ordering::Relaxed);
            if (headroom as f64) < self.options.eden_headroom_fraction * max_heap as f64 {
                debug!(
                    "eden collection left {} of {} bytes free; next cycle is full",
                    headroom, max_heap
                );
                self.force_next_full.store(true, Ordering::Relaxed);
            }
        }

        self.bytes_allocated_this_cycle.store(0, Ordering::Relaxed);
        self.largest_single_allocation.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_MBYTE;

    fn policy_with(ram: usize, configure: impl FnOnce(&mut Options)) -> GrowthPolicy {
        let mut options = Options::default();
        options.ram_size = ram;
        configure(&mut options);
        GrowthPolicy::new(Arc::new(options))
    }

    #[test]
    fn allocation_below_the_allowance_requests_nothing() {
        let policy = policy_with(64 * BYTES_IN_MBYTE, |_| ());
        policy.did_allocate(BYTES_IN_MBYTE / 2);
        assert!(!policy.should_request_collection());
    }

    #[test]
    fn exceeding_the_allowance_requests_collection() {
        let policy = policy_with(64 * BYTES_IN_MBYTE, |_| ());
        for _ in 0..64 {
            policy.did_allocate(BYTES_IN_MBYTE / 16);
        }
        assert!(policy.should_request_collection());
    }

    #[test]
    fn one_oversized_allocation_is_discounted() {
        let policy = policy_with(64 * BYTES_IN_MBYTE, |_| ());
        // One huge allocation well past the allowance, little else.
        policy.did_allocate(8 * BYTES_IN_MBYTE);
        policy.did_allocate(1024);
        assert!(!policy.should_request_collection());
    }

    #[test]
    fn critical_memory_shrinks_the_allowance() {
        let policy = policy_with(64 * BYTES_IN_MBYTE, |_| ());
        // Just over half the allowance, spread so no single allocation
        // dominates.
        for _ in 0..20 {
            policy.did_allocate(BYTES_IN_MBYTE / 32);
        }
        assert!(!policy.should_request_collection());
        policy.set_critical_memory(true);
        assert!(policy.should_request_collection());
    }

    #[test]
    fn full_collection_grows_ceiling_proportionally() {
        let policy = policy_with(1024 * BYTES_IN_MBYTE, |options| {
            options.growth_mode = GrowthMode::Proportional;
        });
        let live = 10 * BYTES_IN_MBYTE;
        policy.did_finish_collection(true, live);
        let expected = (live as f64 * policy.options.small_heap_growth_factor) as usize;
        assert_eq!(policy.max_heap_size(), expected);
        assert_eq!(policy.max_eden_size(), expected - live);
    }

    #[test]
    fn ceiling_never_drops_below_the_floor() {
        let policy = policy_with(1024 * BYTES_IN_MBYTE, |_| ());
        policy.did_finish_collection(true, 1024);
        assert_eq!(policy.max_heap_size(), policy.options.min_bytes_per_cycle);
    }

    #[test]
    fn aggressive_curve_decays_with_heap_size() {
        let policy = policy_with(64 * 1024 * BYTES_IN_MBYTE, |options| {
            options.growth_mode = GrowthMode::Aggressive;
        });
        let small = policy.proportional_heap_size(BYTES_IN_MBYTE);
        let large = policy.proportional_heap_size(32 * 1024 * BYTES_IN_MBYTE);
        // The growth *ratio* shrinks as the heap approaches RAM size.
        let small_ratio = small as f64 / BYTES_IN_MBYTE as f64;
        let large_ratio = large as f64 / (32.0 * 1024.0 * BYTES_IN_MBYTE as f64);
        assert!(small_ratio > large_ratio);
        assert!(large_ratio > 1.0);
    }

    #[test]
    fn shrunken_eden_headroom_forces_the_next_full() {
        let policy = policy_with(64 * BYTES_IN_MBYTE, |_| ());
        policy.did_finish_collection(true, BYTES_IN_MBYTE / 2);
        let ceiling = policy.max_heap_size();
        // An eden cycle that leaves almost nothing free.
        policy.did_finish_collection(false, ceiling - ceiling / 8);
        assert!(policy.take_force_next_full());
        assert!(!policy.take_force_next_full());
    }
}

//! The collector's tuning knobs.
//!
//! Every numeric policy constant of the growth and pacing heuristics lives
//! here rather than being hard-coded: the curves are policy, not structure.
//! Options are set programmatically through `HeapBuilder::set_option`, or by
//! environment variables with the `VMGC_` prefix (such as
//! `VMGC_MARKER_THREADS=4`).

use crate::util::constants::{BYTES_IN_GBYTE, BYTES_IN_MBYTE};
use std::default::Default;
use strum_macros::{Display, EnumString};

/// How the heap-growth policy maps live size to the next heap ceiling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
pub enum GrowthMode {
    /// Pick `Proportional` or `Aggressive` from the machine's physical memory.
    Auto,
    /// Tiered growth factors keyed to fractions of physical memory.
    Proportional,
    /// Exponential-decay growth ratio for machines with abundant memory.
    Aggressive,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// The typed option set. Each field has a validator; invalid values are
        /// rejected with a warning and the default is kept.
        pub struct Options {
            $($(#[$outer])*pub $name: $type),*
        }
        impl Options {
            /// Set an option from its string representation. Returns true on
            /// success. Unknown keys are fatal: they are programming errors in
            /// the embedder, not user input.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by HeapBuilder::set_option) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid option key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with VMGC_ and match any option
                // (such as VMGC_MARKER_THREADS), we set the option to its value
                // (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "VMGC_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Number of parallel marker threads recruited during drain windows.
    marker_threads:             usize      [|v: &usize| *v > 0] = num_cpus::get().min(8),
    /// The drain slice the collector may spend while the world is stopped, in
    /// milliseconds. Elapsing this budget mid-drain sends the cycle concurrent.
    pause_budget_ms:            u64        [|v: &u64| *v > 0] = 2,
    /// Length of one space-time scheduling period during concurrent marking,
    /// in milliseconds.
    concurrent_period_ms:       u64        [|v: &u64| *v > 0] = 10,
    /// Fraction of each period handed to the collector; the rest belongs to
    /// the mutator.
    collector_utilization:      f64        [|v: &f64| *v > 0.0 && *v < 1.0] = 0.5,
    /// Floor for the recomputed heap ceiling, in bytes.
    min_bytes_per_cycle:        usize      [|v: &usize| *v > 0] = BYTES_IN_MBYTE,
    /// Growth curve selection. `Auto` switches to `Aggressive` when physical
    /// memory exceeds `aggressive_growth_threshold`.
    growth_mode:                GrowthMode [always_valid] = GrowthMode::Auto,
    /// Heaps below this fraction of physical memory grow by
    /// `small_heap_growth_factor`.
    small_heap_ram_fraction:    f64        [|v: &f64| *v > 0.0 && *v < 1.0] = 0.25,
    /// Growth factor for small heaps.
    small_heap_growth_factor:   f64        [|v: &f64| *v > 1.0] = 1.27,
    /// Heaps below this fraction of physical memory (but above the small
    /// fraction) grow by `medium_heap_growth_factor`.
    medium_heap_ram_fraction:   f64        [|v: &f64| *v > 0.0 && *v < 1.0] = 0.5,
    /// Growth factor for medium heaps.
    medium_heap_growth_factor:  f64        [|v: &f64| *v > 1.0] = 1.5,
    /// Growth factor for heaps above the medium fraction.
    large_heap_growth_factor:   f64        [|v: &f64| *v > 1.0] = 1.24,
    /// Physical-memory threshold above which `GrowthMode::Auto` selects the
    /// aggressive exponential-decay curve, in bytes.
    aggressive_growth_threshold: usize     [|v: &usize| *v > 0] = 32 * BYTES_IN_GBYTE,
    /// Maximum extra growth ratio of the aggressive curve.
    heap_growth_max_increase:   f64        [|v: &f64| *v > 0.0] = 1.3,
    /// Decay steepness of the aggressive curve.
    heap_growth_steepness:      f64        [|v: &f64| *v > 0.0] = 5.0,
    /// Multiplier applied to the allocation allowance while the embedder
    /// reports memory pressure.
    critical_allowance_fraction: f64       [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.5,
    /// A single allocation larger than this fraction of the bytes allocated
    /// this cycle is discounted from the collect-now decision.
    oversize_discount_fraction: f64        [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.33,
    /// An eden collection that leaves less than this fraction of the heap
    /// ceiling free forces the next cycle to be full.
    eden_headroom_fraction:     f64        [|v: &f64| *v > 0.0 && *v < 1.0] = 1.0 / 3.0,
    /// `collect_now_full_if_not_done_recently` performs a full collection only
    /// if none completed within this window, in milliseconds.
    full_collection_staleness_ms: u64      [|v: &u64| *v > 0] = 10_000,
    /// Physical memory size override in bytes; 0 probes the operating system.
    /// Tests use this to pin the growth curve.
    ram_size:                   usize      [always_valid] = 0,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.pause_budget_ms, 2);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("VMGC_PAUSE_BUDGET_MS", "7");

                    let options = Options::default();
                    assert_eq!(options.pause_budget_ms, 7);
                },
                || {
                    std::env::remove_var("VMGC_PAUSE_BUDGET_MS");
                },
            )
        })
    }

    #[test]
    fn with_multiple_valid_env_vars() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("VMGC_PAUSE_BUDGET_MS", "7");
                    std::env::set_var("VMGC_MARKER_THREADS", "3");

                    let options = Options::default();
                    assert_eq!(options.pause_budget_ms, 7);
                    assert_eq!(options.marker_threads, 3);
                },
                || {
                    std::env::remove_var("VMGC_PAUSE_BUDGET_MS");
                    std::env::remove_var("VMGC_MARKER_THREADS");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // invalid value, we cannot parse the value, so use the default value
                    std::env::set_var("VMGC_PAUSE_BUDGET_MS", "abc");

                    let options = Options::default();
                    assert_eq!(options.pause_budget_ms, 2);
                },
                || {
                    std::env::remove_var("VMGC_PAUSE_BUDGET_MS");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_key() {
        serial_test(|| {
            with_cleanup(
                || {
                    // unknown keys from the environment are ignored
                    std::env::set_var("VMGC_ABC", "42");

                    let options = Options::default();
                    assert_eq!(options.pause_budget_ms, 2);
                },
                || {
                    std::env::remove_var("VMGC_ABC");
                },
            )
        })
    }

    #[test]
    fn enum_option_from_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("VMGC_GROWTH_MODE", "Aggressive");

                    let options = Options::default();
                    assert_eq!(options.growth_mode, GrowthMode::Aggressive);
                },
                || {
                    std::env::remove_var("VMGC_GROWTH_MODE");
                },
            )
        })
    }

    #[test]
    fn out_of_range_value_keeps_default() {
        serial_test(|| {
            let mut options = Options::default();
            assert!(!options.set_from_str("collector_utilization", "1.5"));
            assert_eq!(options.collector_utilization, 0.5);
        })
    }
}

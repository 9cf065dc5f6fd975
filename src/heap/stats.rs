//! Lightweight cycle statistics: per-phase wall time, pause tracking and
//! cycle totals. Cheap enough to stay on unconditionally; everything here is
//! behind one mutex that only the conn holder and `statistics()` touch.

use enum_map::EnumMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::phases::CollectorPhase;

#[derive(Default, Clone, Copy)]
struct PhaseStat {
    invocations: u64,
    total: Duration,
}

struct StatsSync {
    phases: EnumMap<CollectorPhase, PhaseStat>,
    pause_began_at: Option<Instant>,
    last_pause: Duration,
    max_pause: Duration,
    bytes_visited_last_cycle: usize,
    swept_cells_last_cycle: usize,
    swept_bytes_last_cycle: usize,
}

pub(crate) struct HeapStats {
    sync: Mutex<StatsSync>,
}

/// A point-in-time snapshot for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct HeapStatistics {
    pub cycle_count: u64,
    pub full_cycle_count: u64,
    pub bytes_visited_last_cycle: usize,
    pub swept_cells_last_cycle: usize,
    pub swept_bytes_last_cycle: usize,
    pub last_pause: Duration,
    pub max_pause: Duration,
    /// (phase name, invocations, accumulated wall time)
    pub phase_times: Vec<(&'static str, u64, Duration)>,
    /// Smoothed marking throughput, bytes per second.
    pub marking_rate: f64,
}

impl HeapStats {
    pub fn new() -> Self {
        HeapStats {
            sync: Mutex::new(StatsSync {
                phases: EnumMap::default(),
                pause_began_at: None,
                last_pause: Duration::ZERO,
                max_pause: Duration::ZERO,
                bytes_visited_last_cycle: 0,
                swept_cells_last_cycle: 0,
                swept_bytes_last_cycle: 0,
            }),
        }
    }

    pub fn record_phase(&self, phase: CollectorPhase, duration: Duration) {
        let mut sync = self.sync.lock().unwrap();
        sync.phases[phase].invocations += 1;
        sync.phases[phase].total += duration;
    }

    pub fn world_stopped(&self, now: Instant) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.pause_began_at.is_none(), "pause began twice");
        sync.pause_began_at = Some(now);
    }

    pub fn world_resumed(&self, now: Instant) {
        let mut sync = self.sync.lock().unwrap();
        if let Some(began) = sync.pause_began_at.take() {
            let pause = now.duration_since(began);
            sync.last_pause = pause;
            if pause > sync.max_pause {
                sync.max_pause = pause;
            }
        }
    }

    pub fn cycle_finished(&self, bytes_visited: usize, swept_cells: usize, swept_bytes: usize) {
        let mut sync = self.sync.lock().unwrap();
        sync.bytes_visited_last_cycle = bytes_visited;
        sync.swept_cells_last_cycle = swept_cells;
        sync.swept_bytes_last_cycle = swept_bytes;
    }

    pub fn snapshot(
        &self,
        cycle_count: u64,
        full_cycle_count: u64,
        marking_rate: f64,
    ) -> HeapStatistics {
        let sync = self.sync.lock().unwrap();
        HeapStatistics {
            cycle_count,
            full_cycle_count,
            bytes_visited_last_cycle: sync.bytes_visited_last_cycle,
            swept_cells_last_cycle: sync.swept_cells_last_cycle,
            swept_bytes_last_cycle: sync.swept_bytes_last_cycle,
            last_pause: sync.last_pause,
            max_pause: sync.max_pause,
            phase_times: sync
                .phases
                .iter()
                .filter(|(_, stat)| stat.invocations > 0)
                .map(|(phase, stat)| (phase.name(), stat.invocations, stat.total))
                .collect(),
            marking_rate,
        }
    }
}

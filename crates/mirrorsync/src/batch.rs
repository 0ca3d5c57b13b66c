//! Memory-aware batch sizing.
//!
//! The planner partitions pending work into batches whose size tracks
//! current memory utilization: shrink toward the minimum above the high
//! watermark, grow back toward the maximum below the low watermark. Size
//! changes are smoothed so noisy memory readings do not make consecutive
//! batches oscillate.

use tracing::warn;

use crate::config::BatchConfig;

/// Source of the current memory utilization ratio (0–1).
pub trait MemoryProbe: Send + Sync {
    fn utilization(&self) -> f64;
}

/// Probe reading this process's RSS against total system memory from
/// `/proc`. Returns 0 (no pressure) when the files cannot be read, which
/// leaves the planner at its default size.
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn utilization(&self) -> f64 {
        match (read_rss_bytes(), read_total_bytes()) {
            (Some(rss), Some(total)) if total > 0 => (rss as f64 / total as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

fn read_rss_bytes() -> Option<u64> {
    // /proc/self/statm: size resident shared ... in pages.
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

fn read_total_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Fixed-ratio probe for tests and for deployments that pin utilization
/// externally.
pub struct FixedProbe(pub f64);

impl MemoryProbe for FixedProbe {
    fn utilization(&self) -> f64 {
        self.0
    }
}

/// One planned batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchPlan {
    /// Items to take from the front of the pending queue.
    pub size: usize,
    /// Utilization observed when this batch was planned.
    pub memory_pressure: f64,
    /// Utilization crossed the emergency ceiling; the caller should pause
    /// for memory reclamation before processing this single-item batch.
    pub gc_pause_requested: bool,
}

/// Plans batch sizes against a [`MemoryProbe`].
///
/// Not shared across tasks: each task's persistence loop owns one planner
/// so smoothing tracks that task's own batch history.
pub struct BatchPlanner<P> {
    config: BatchConfig,
    probe: P,
    last_size: usize,
}

impl<P: MemoryProbe> BatchPlanner<P> {
    pub fn new(config: BatchConfig, probe: P) -> Self {
        let last_size = config.default_size;
        Self {
            config,
            probe,
            last_size,
        }
    }

    /// Size the next batch. Never exceeds `remaining`; returns a size of 0
    /// only when `remaining` is 0.
    pub fn next_batch(&mut self, remaining: usize) -> BatchPlan {
        let pressure = self.probe.utilization().clamp(0.0, 1.0);

        if pressure >= self.config.memory_emergency_ceiling {
            warn!(pressure, "memory past emergency ceiling, forcing single-item batch");
            self.last_size = self.config.min_size;
            return BatchPlan {
                size: remaining.min(1),
                memory_pressure: pressure,
                gc_pause_requested: true,
            };
        }

        let target = if pressure > self.config.memory_high_watermark {
            self.config.min_size
        } else if pressure < self.config.memory_low_watermark {
            self.config.max_size
        } else {
            self.config.default_size
        };

        // Move toward the target by at most the smoothing fraction per
        // batch, always by at least one item so progress never stalls.
        let max_step = ((self.last_size as f64 * self.config.smoothing) as usize).max(1);
        let next = if target > self.last_size {
            (self.last_size + max_step).min(target)
        } else {
            self.last_size.saturating_sub(max_step).max(target)
        };
        let next = next.clamp(self.config.min_size, self.config.max_size);
        self.last_size = next;

        BatchPlan {
            size: next.min(remaining),
            memory_pressure: pressure,
            gc_pause_requested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config() -> BatchConfig {
        BatchConfig::default()
    }

    /// Probe whose reading can be changed mid-test.
    struct DialProbe(Arc<AtomicU64>);

    impl MemoryProbe for DialProbe {
        fn utilization(&self) -> f64 {
            self.0.load(Ordering::Relaxed) as f64 / 100.0
        }
    }

    #[test]
    fn nominal_pressure_keeps_default_size() {
        let mut planner = BatchPlanner::new(config(), FixedProbe(0.60));
        let plan = planner.next_batch(1_000);
        assert_eq!(plan.size, 20);
        assert!(!plan.gc_pause_requested);
    }

    #[test]
    fn high_pressure_shrinks_toward_minimum() {
        let mut planner = BatchPlanner::new(config(), FixedProbe(0.80));
        let mut sizes = Vec::new();
        for _ in 0..6 {
            sizes.push(planner.next_batch(1_000).size);
        }
        // Monotone descent to the floor, never below it.
        assert!(sizes.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*sizes.last().unwrap(), 5);
    }

    #[test]
    fn low_pressure_grows_toward_maximum() {
        let mut planner = BatchPlanner::new(config(), FixedProbe(0.20));
        let mut last = 0;
        for _ in 0..12 {
            last = planner.next_batch(1_000).size;
        }
        assert_eq!(last, 60);
    }

    #[test]
    fn size_change_is_bounded_by_smoothing() {
        let probe = Arc::new(AtomicU64::new(20));
        let mut planner = BatchPlanner::new(config(), DialProbe(Arc::clone(&probe)));

        let first = planner.next_batch(1_000).size;
        // Pressure jumps; the next batch still moves by at most 25%.
        probe.store(85, Ordering::Relaxed);
        let second = planner.next_batch(1_000).size;

        let max_step = ((first as f64) * 0.25) as usize;
        assert!(first - second <= max_step.max(1));
    }

    #[test]
    fn emergency_ceiling_forces_single_item_and_gc_pause() {
        let mut planner = BatchPlanner::new(config(), FixedProbe(0.95));
        let plan = planner.next_batch(1_000);
        assert_eq!(plan.size, 1);
        assert!(plan.gc_pause_requested);
    }

    #[test]
    fn recovery_after_emergency_restarts_from_minimum() {
        let probe = Arc::new(AtomicU64::new(95));
        let mut planner = BatchPlanner::new(config(), DialProbe(Arc::clone(&probe)));
        assert!(planner.next_batch(1_000).gc_pause_requested);

        probe.store(20, Ordering::Relaxed);
        let plan = planner.next_batch(1_000);
        assert!(!plan.gc_pause_requested);
        // Climbs back from the minimum, not straight to the maximum.
        assert!(plan.size >= 5 && plan.size < 60);
    }

    #[test]
    fn batch_never_exceeds_remaining() {
        let mut planner = BatchPlanner::new(config(), FixedProbe(0.20));
        assert_eq!(planner.next_batch(3).size, 3);
        assert_eq!(planner.next_batch(0).size, 0);
    }

    #[test]
    fn process_probe_reports_a_sane_ratio() {
        let utilization = ProcessMemoryProbe.utilization();
        assert!((0.0..=1.0).contains(&utilization));
    }
}

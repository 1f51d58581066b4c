//! Throttled memory-pressure sensing.
//!
//! Sampling process memory is comparatively expensive, so the monitor only
//! re-samples once the poll interval has elapsed. Between samples it answers
//! "no pressure". Whether the platform can report memory at all is decided
//! once, when the monitor is created.

use std::time::{Duration, Instant};

use crate::config::JoinConfig;

/// Source of the process's current memory usage.
pub trait MemoryProbe: Send {
    /// Bytes in use, or `None` when the reading failed.
    fn used_bytes(&mut self) -> Option<u64>;
}

/// Physical memory of the current process, via `memory-stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    /// Returns a probe if the platform can report process memory.
    pub fn detect() -> Option<Self> {
        memory_stats::memory_stats().map(|_| ProcessMemoryProbe)
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&mut self) -> Option<u64> {
        memory_stats::memory_stats().map(|usage| usage.physical_mem as u64)
    }
}

/// One-time capability check: the process probe if it works here.
pub(crate) fn detect_process_probe() -> Option<Box<dyn MemoryProbe>> {
    match ProcessMemoryProbe::detect() {
        Some(probe) => Some(Box::new(probe)),
        None => {
            tracing::warn!("process memory usage unavailable; spilling only when forced");
            None
        }
    }
}

pub struct MemoryMonitor {
    probe: Option<Box<dyn MemoryProbe>>,
    budget_bytes: u64,
    threshold: f64,
    poll_interval: Duration,
    assume_low: bool,
    desired_spilled: usize,
    next_sample: Option<Instant>,
}

impl MemoryMonitor {
    /// `probe` is `None` when the platform cannot report memory usage.
    pub fn with_probe(
        config: &JoinConfig,
        threshold: f64,
        probe: Option<Box<dyn MemoryProbe>>,
    ) -> Self {
        Self {
            probe,
            budget_bytes: config.memory_budget_bytes,
            threshold,
            poll_interval: config.memory_poll_interval,
            assume_low: config.assume_memory_low,
            desired_spilled: config.desired_spilled_buckets,
            next_sample: None,
        }
    }

    /// Give back the probe, e.g. to reuse it for the next join.
    pub fn into_probe(self) -> Option<Box<dyn MemoryProbe>> {
        self.probe
    }

    /// Whether the caller should spill a bucket now.
    ///
    /// `spilled_so_far` is the number of buckets already on disk; while it is
    /// below the configured minimum the answer is always yes.
    pub fn is_under_pressure(&mut self, spilled_so_far: usize) -> bool {
        if self.assume_low || spilled_so_far < self.desired_spilled {
            return true;
        }

        let now = Instant::now();
        if let Some(next) = self.next_sample
            && now < next
        {
            return false;
        }
        self.next_sample = Some(now + self.poll_interval);

        let Some(probe) = self.probe.as_mut() else {
            return false;
        };
        match probe.used_bytes() {
            Some(used) => {
                let fraction = used as f64 / self.budget_bytes as f64;
                let low = fraction > self.threshold;
                if low {
                    tracing::debug!(used, budget = self.budget_bytes, fraction, "memory pressure");
                }
                low
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct FakeProbe {
        used: Arc<AtomicU64>,
        samples: Arc<AtomicUsize>,
    }

    impl MemoryProbe for FakeProbe {
        fn used_bytes(&mut self) -> Option<u64> {
            self.samples.fetch_add(1, Ordering::Relaxed);
            Some(self.used.load(Ordering::Relaxed))
        }
    }

    struct FailingProbe;

    impl MemoryProbe for FailingProbe {
        fn used_bytes(&mut self) -> Option<u64> {
            None
        }
    }

    fn config(poll: Duration) -> JoinConfig {
        JoinConfig::default()
            .with_memory_budget_bytes(1000)
            .with_memory_poll_interval(poll)
    }

    #[test]
    fn test_threshold_comparison() {
        let used = Arc::new(AtomicU64::new(950));
        let samples = Arc::new(AtomicUsize::new(0));
        let probe = FakeProbe {
            used: Arc::clone(&used),
            samples: Arc::clone(&samples),
        };
        let mut monitor =
            MemoryMonitor::with_probe(&config(Duration::ZERO), 0.9, Some(Box::new(probe)));
        assert!(monitor.is_under_pressure(0));
        used.store(100, Ordering::Relaxed);
        assert!(!monitor.is_under_pressure(0));
        assert_eq!(samples.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_sampling_is_throttled() {
        let used = Arc::new(AtomicU64::new(950));
        let samples = Arc::new(AtomicUsize::new(0));
        let probe = FakeProbe {
            used,
            samples: Arc::clone(&samples),
        };
        let mut monitor =
            MemoryMonitor::with_probe(&config(Duration::from_secs(3600)), 0.9, Some(Box::new(probe)));
        assert!(monitor.is_under_pressure(0));
        assert!(!monitor.is_under_pressure(0));
        assert!(!monitor.is_under_pressure(0));
        assert_eq!(samples.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_overrides_force_pressure() {
        let mut forced = MemoryMonitor::with_probe(
            &config(Duration::ZERO).with_assume_memory_low(true),
            0.9,
            None,
        );
        assert!(forced.is_under_pressure(100));

        let mut desired = MemoryMonitor::with_probe(
            &config(Duration::ZERO).with_desired_spilled_buckets(2),
            0.9,
            None,
        );
        assert!(desired.is_under_pressure(0));
        assert!(desired.is_under_pressure(1));
        assert!(!desired.is_under_pressure(2));
    }

    #[test]
    fn test_probe_failure_is_not_pressure() {
        let mut monitor =
            MemoryMonitor::with_probe(&config(Duration::ZERO), 0.9, Some(Box::new(FailingProbe)));
        assert!(!monitor.is_under_pressure(0));
    }
}

//! Progress reporting, cancellation and join statistics.
//!
//! [`JoinMonitor`] is a cheap cloneable handle over atomic counters. The
//! engine owns the only writer; callers may clone the handle before `run` and
//! poll [`JoinMonitor::snapshot`] from another thread while the join executes.

use hhj_result::{Error, Result as HhjResult};
use hhj_storage::SpillIoSnapshot;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle of a join invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JoinState {
    #[default]
    Idle = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl JoinState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => JoinState::Running,
            2 => JoinState::Completed,
            3 => JoinState::Cancelled,
            4 => JoinState::Failed,
            _ => JoinState::Idle,
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Idle => write!(f, "idle"),
            JoinState::Running => write!(f, "running"),
            JoinState::Completed => write!(f, "completed"),
            JoinState::Cancelled => write!(f, "cancelled"),
            JoinState::Failed => write!(f, "failed"),
        }
    }
}

/// Cooperative cancellation flag shared between the caller and the engine.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the join to stop at its next check point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Receiver of progress updates.
///
/// `set_progress` receives a fraction in `[0, 1]` that never decreases within
/// one join; `set_message` names the current phase.
pub trait ProgressSink {
    fn set_progress(&mut self, fraction: f64);

    fn set_message(&mut self, _message: &str) {}
}

/// Sink that discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn set_progress(&mut self, _fraction: f64) {}
}

#[derive(Default)]
struct MonitorInner {
    state: AtomicU8,
    num_buckets: AtomicU64,
    buckets_spilled: AtomicU64,
    build_rows: AtomicU64,
    probe_rows: AtomicU64,
    probe_rows_in_memory: AtomicU64,
    probe_rows_from_disk: AtomicU64,
    repartitioned_buckets: AtomicU64,
    recursion_fallbacks: AtomicU64,
    max_depth_reached: AtomicU64,
    rows_emitted: AtomicU64,
    bucket_sizes: Mutex<BucketSizes>,
    spill_io: Mutex<SpillIoSnapshot>,
}

#[derive(Default, Clone)]
struct BucketSizes {
    build: Vec<u64>,
    probe: Vec<u64>,
}

/// Read-only handle over the statistics of one join.
#[derive(Clone, Default)]
pub struct JoinMonitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for JoinMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinMonitor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl JoinMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> JoinState {
        JoinState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> JoinStatistics {
        let sizes = match self.inner.bucket_sizes.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let spill_io = match self.inner.spill_io.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        JoinStatistics {
            state: self.state(),
            num_buckets: load(&self.inner.num_buckets),
            buckets_spilled: load(&self.inner.buckets_spilled),
            build_rows: load(&self.inner.build_rows),
            probe_rows: load(&self.inner.probe_rows),
            probe_rows_in_memory: load(&self.inner.probe_rows_in_memory),
            probe_rows_from_disk: load(&self.inner.probe_rows_from_disk),
            repartitioned_buckets: load(&self.inner.repartitioned_buckets),
            recursion_fallbacks: load(&self.inner.recursion_fallbacks),
            max_depth_reached: load(&self.inner.max_depth_reached) as u32,
            rows_emitted: load(&self.inner.rows_emitted),
            build_bucket_rows: sizes.build,
            probe_bucket_rows: sizes.probe,
            spill_io,
        }
    }

    pub(crate) fn reset(&self) {
        let counters = [
            &self.inner.num_buckets,
            &self.inner.buckets_spilled,
            &self.inner.build_rows,
            &self.inner.probe_rows,
            &self.inner.probe_rows_in_memory,
            &self.inner.probe_rows_from_disk,
            &self.inner.repartitioned_buckets,
            &self.inner.recursion_fallbacks,
            &self.inner.max_depth_reached,
            &self.inner.rows_emitted,
        ];
        for counter in counters {
            counter.store(0, Ordering::Relaxed);
        }
        match self.inner.bucket_sizes.lock() {
            Ok(mut guard) => *guard = BucketSizes::default(),
            Err(poisoned) => *poisoned.into_inner() = BucketSizes::default(),
        }
        self.record_spill_io(SpillIoSnapshot::default());
        self.set_state(JoinState::Idle);
    }

    pub(crate) fn set_state(&self, state: JoinState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn buckets_created(&self, n: usize, depth: u32) {
        self.inner.num_buckets.fetch_add(n as u64, Ordering::Relaxed);
        self.inner
            .max_depth_reached
            .fetch_max(u64::from(depth), Ordering::Relaxed);
    }

    pub(crate) fn bucket_spilled(&self) {
        self.inner.buckets_spilled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn build_row(&self) {
        self.inner.build_rows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn probe_row_in_memory(&self) {
        self.inner.probe_rows.fetch_add(1, Ordering::Relaxed);
        self.inner
            .probe_rows_in_memory
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn probe_row_from_disk(&self) {
        self.inner.probe_rows.fetch_add(1, Ordering::Relaxed);
        self.inner
            .probe_rows_from_disk
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Probe rows that can never match and bypass every bucket.
    pub(crate) fn probe_row_unmatchable(&self) {
        self.inner.probe_rows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bucket_repartitioned(&self) {
        self.inner
            .repartitioned_buckets
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recursion_fallback(&self) {
        self.inner
            .recursion_fallbacks
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_rows_emitted(&self, rows: usize) {
        self.inner
            .rows_emitted
            .store(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_spill_io(&self, io: SpillIoSnapshot) {
        match self.inner.spill_io.lock() {
            Ok(mut guard) => *guard = io,
            Err(poisoned) => *poisoned.into_inner() = io,
        }
    }

    /// Record the sizes of a bucket pair that was joined.
    pub(crate) fn bucket_joined(&self, build_rows: u64, probe_rows: u64) {
        let mut guard = match self.inner.bucket_sizes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.build.push(build_rows);
        guard.probe.push(probe_rows);
    }
}

/// Plain snapshot of a join's counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinStatistics {
    pub state: JoinState,
    /// Build-side buckets created, across all recursion depths.
    pub num_buckets: u64,
    pub buckets_spilled: u64,
    pub build_rows: u64,
    pub probe_rows: u64,
    /// Probe rows joined while their bucket was resident.
    pub probe_rows_in_memory: u64,
    /// Probe rows written to a spill file and joined later.
    pub probe_rows_from_disk: u64,
    pub repartitioned_buckets: u64,
    /// Buckets joined by block-nested-loop after hitting the depth ceiling.
    pub recursion_fallbacks: u64,
    pub max_depth_reached: u32,
    pub rows_emitted: u64,
    /// Build rows of every bucket pair that was joined, in processing order.
    pub build_bucket_rows: Vec<u64>,
    /// Probe rows of every bucket pair that was joined, in processing order.
    pub probe_bucket_rows: Vec<u64>,
    /// Spill file traffic, filled in once the join has finished.
    pub spill_io: SpillIoSnapshot,
}

impl JoinStatistics {
    pub fn build_bucket_mean(&self) -> f64 {
        mean(&self.build_bucket_rows)
    }

    /// Coefficient of variation of build bucket sizes; high values mean skew.
    pub fn build_bucket_cv(&self) -> f64 {
        coefficient_of_variation(&self.build_bucket_rows)
    }

    pub fn probe_bucket_mean(&self) -> f64 {
        mean(&self.probe_bucket_rows)
    }

    pub fn probe_bucket_cv(&self) -> f64 {
        coefficient_of_variation(&self.probe_bucket_rows)
    }
}

fn mean(sizes: &[u64]) -> f64 {
    if sizes.is_empty() {
        return 0.0;
    }
    sizes.iter().map(|&s| s as f64).sum::<f64>() / sizes.len() as f64
}

fn coefficient_of_variation(sizes: &[u64]) -> f64 {
    let mean = mean(sizes);
    if mean == 0.0 {
        return 0.0;
    }
    let variance = sizes
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / sizes.len() as f64;
    variance.sqrt() / mean
}

/// Row-cadence check points: cancellation plus progress reporting.
pub(crate) struct ProgressTracker<'a> {
    token: &'a CancellationToken,
    sink: &'a mut dyn ProgressSink,
    check_every: usize,
    since_check: usize,
    processed: u64,
    expected: u64,
    reported: f64,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        token: &'a CancellationToken,
        sink: &'a mut dyn ProgressSink,
        check_every: usize,
        expected: u64,
    ) -> Self {
        Self {
            token,
            sink,
            check_every: check_every.max(1),
            since_check: 0,
            processed: 0,
            expected,
            reported: 0.0,
        }
    }

    /// Count one processed row, checking for cancellation every
    /// `check_every` rows.
    #[inline]
    pub(crate) fn row(&mut self) -> HhjResult<()> {
        self.processed += 1;
        self.since_check += 1;
        if self.since_check >= self.check_every {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Raise the expected total, e.g. when a spilled bucket is about to be
    /// read back.
    pub(crate) fn expect_more(&mut self, rows: u64) {
        self.expected += rows;
    }

    /// Check for cancellation and report progress now.
    pub(crate) fn checkpoint(&mut self) -> HhjResult<()> {
        self.since_check = 0;
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let total = self.expected.max(self.processed + 1);
        let fraction = (self.processed as f64 / total as f64).min(0.999);
        if fraction > self.reported {
            self.reported = fraction;
            self.sink.set_progress(fraction);
        }
        Ok(())
    }

    pub(crate) fn message(&mut self, message: &str) {
        self.sink.set_message(message);
    }

    pub(crate) fn complete(&mut self) {
        self.reported = 1.0;
        self.sink.set_progress(1.0);
    }
}

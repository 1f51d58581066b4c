//! End-to-end orchestration of one hybrid hash join.
//!
//! Algorithm:
//! 1. Validate the specification and tuning parameters. Nothing is read yet.
//! 2. Build pass: partition every build row into `num_partitions` buckets,
//!    spilling the largest resident bucket whenever the memory monitor
//!    reports pressure.
//! 3. Index every bucket that is still resident.
//! 4. Probe pass: rows whose bucket is indexed are joined immediately; rows
//!    whose build bucket was spilled are appended to the matching probe
//!    bucket on disk.
//! 5. Emit unmatched build rows of the resident buckets.
//! 6. Join spilled bucket pairs one at a time, re-partitioning buckets that
//!    are too large and falling back to block-nested-loop at the depth
//!    ceiling.
//!
//! The scoped working directory is removed before `run` returns, whatever
//! the outcome.

use hhj_result::{Error, Result as HhjResult};
use hhj_storage::{PartitionStore, SpillDir};
use hhj_types::RowSource;
use std::sync::Arc;

use crate::config::JoinConfig;
use crate::memory::{MemoryMonitor, MemoryProbe, detect_process_probe};
use crate::output::{JoinOutput, OutputCollector};
use crate::plan::JoinPlan;
use crate::progress::{
    CancellationToken, JoinMonitor, JoinState, JoinStatistics, NoopProgress, ProgressSink,
    ProgressTracker,
};
use crate::{BuildSide, JoinSpecification};

/// Terminal outcome of a join that did not fail.
#[derive(Debug)]
pub enum JoinOutcome {
    Completed {
        output: JoinOutput,
        statistics: JoinStatistics,
    },
    /// Stopped at a check point after the token was cancelled. No rows are
    /// delivered.
    Cancelled { statistics: JoinStatistics },
}

impl JoinOutcome {
    pub fn statistics(&self) -> &JoinStatistics {
        match self {
            JoinOutcome::Completed { statistics, .. } => statistics,
            JoinOutcome::Cancelled { statistics } => statistics,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinOutcome::Cancelled { .. })
    }

    pub fn into_output(self) -> Option<JoinOutput> {
        match self {
            JoinOutcome::Completed { output, .. } => Some(output),
            JoinOutcome::Cancelled { .. } => None,
        }
    }
}

/// Hybrid hash join engine.
///
/// One engine may run many joins, one at a time. Its [`JoinMonitor`] always
/// describes the current or most recent join.
pub struct HybridHashJoin {
    config: JoinConfig,
    monitor: JoinMonitor,
    memory_probe: Option<Box<dyn MemoryProbe>>,
}

impl Default for HybridHashJoin {
    fn default() -> Self {
        Self::new(JoinConfig::default())
    }
}

impl HybridHashJoin {
    pub fn new(config: JoinConfig) -> Self {
        Self {
            config,
            monitor: JoinMonitor::new(),
            memory_probe: None,
        }
    }

    /// Replace the process memory probe, e.g. with a scripted one in tests.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Handle for polling statistics, also from other threads.
    pub fn monitor(&self) -> JoinMonitor {
        self.monitor.clone()
    }

    /// Run a join to completion without progress reporting or cancellation.
    pub fn join<L, R>(
        &mut self,
        spec: &JoinSpecification,
        left: L,
        right: R,
    ) -> HhjResult<JoinOutput>
    where
        L: RowSource,
        R: RowSource,
    {
        let token = CancellationToken::new();
        match self.run(spec, left, right, &token, &mut NoopProgress)? {
            JoinOutcome::Completed { output, .. } => Ok(output),
            JoinOutcome::Cancelled { .. } => Err(Error::Cancelled),
        }
    }

    /// Join `left` with `right`.
    ///
    /// Returns `Ok(Completed)` with every output row, `Ok(Cancelled)` when
    /// `token` was cancelled before the join finished, or the error that
    /// aborted it. Configuration errors are reported before any row is read.
    pub fn run<L, R>(
        &mut self,
        spec: &JoinSpecification,
        mut left: L,
        mut right: R,
        token: &CancellationToken,
        sink: &mut dyn ProgressSink,
    ) -> HhjResult<JoinOutcome>
    where
        L: RowSource,
        R: RowSource,
    {
        self.monitor.reset();
        if let Err(e) = self
            .config
            .validate()
            .and_then(|()| spec.validate(left.schema(), right.schema()))
        {
            self.monitor.set_state(JoinState::Failed);
            return Err(e);
        }

        let build_is_left = match spec.build_side {
            BuildSide::Left => true,
            BuildSide::Right => false,
            BuildSide::Smaller => matches!(
                (left.estimated_rows(), right.estimated_rows()),
                (Some(l), Some(r)) if l < r
            ),
        };
        let left_width = left.schema().len();
        let right_width = right.schema().len();
        let expected = left.estimated_rows().unwrap_or(0) + right.estimated_rows().unwrap_or(0);
        let (build, probe): (&mut dyn RowSource, &mut dyn RowSource) = if build_is_left {
            (&mut left, &mut right)
        } else {
            (&mut right, &mut left)
        };

        let store = match SpillDir::create(self.config.spill_dir.as_deref()).and_then(|dir| {
            PartitionStore::new(
                dir,
                spec.max_open_files,
                Arc::new(build.schema().clone()),
                Arc::new(probe.schema().clone()),
            )
        }) {
            Ok(store) => store,
            Err(e) => {
                self.monitor.set_state(JoinState::Failed);
                return Err(e);
            }
        };

        let memory_probe = self.memory_probe.take().or_else(detect_process_probe);

        tracing::info!(
            join_type = ?spec.join_type(),
            build = if build_is_left { "left" } else { "right" },
            partitions = self.config.num_partitions,
            max_open_files = spec.max_open_files,
            spill_dir = %store.spill_dir().path().display(),
            "starting hybrid hash join"
        );

        self.monitor.set_state(JoinState::Running);
        let mut run = JoinRun {
            config: &self.config,
            plan: JoinPlan::new(spec, build_is_left),
            store,
            memory: MemoryMonitor::with_probe(&self.config, spec.memory_threshold, memory_probe),
            out: OutputCollector::new(spec, build_is_left, left_width, right_width),
            progress: ProgressTracker::new(token, sink, self.config.cancel_check_rows, expected),
            monitor: self.monitor.clone(),
            spilled: 0,
            warned_spill: false,
        };
        let result = run.execute(build, probe);

        let JoinRun {
            store,
            memory,
            out,
            mut progress,
            ..
        } = run;
        self.memory_probe = memory.into_probe();
        self.monitor.record_spill_io(store.io_stats());
        let cleanup = store.finish();

        match result {
            Ok(()) => {
                if let Err(e) = cleanup {
                    self.monitor.set_state(JoinState::Failed);
                    return Err(e);
                }
                self.monitor.set_rows_emitted(out.len());
                self.monitor.set_state(JoinState::Completed);
                progress.complete();
                let statistics = self.monitor.snapshot();
                tracing::info!(
                    rows = statistics.rows_emitted,
                    buckets = statistics.num_buckets,
                    spilled = statistics.buckets_spilled,
                    probe_in_memory = statistics.probe_rows_in_memory,
                    probe_from_disk = statistics.probe_rows_from_disk,
                    "hybrid hash join finished"
                );
                Ok(JoinOutcome::Completed {
                    output: out.finish(),
                    statistics,
                })
            }
            Err(e) if e.is_cancelled() => {
                if let Err(c) = cleanup {
                    tracing::warn!(error = %c, "cleanup after cancellation failed");
                }
                self.monitor.set_state(JoinState::Cancelled);
                tracing::info!("hybrid hash join cancelled");
                Ok(JoinOutcome::Cancelled {
                    statistics: self.monitor.snapshot(),
                })
            }
            Err(e) => {
                if let Err(c) = cleanup {
                    tracing::warn!(error = %c, "cleanup after failure failed");
                }
                self.monitor.set_state(JoinState::Failed);
                Err(e)
            }
        }
    }
}

/// Mutable state of one join invocation.
pub(crate) struct JoinRun<'a> {
    pub(crate) config: &'a JoinConfig,
    pub(crate) plan: JoinPlan,
    pub(crate) store: PartitionStore,
    pub(crate) memory: MemoryMonitor,
    pub(crate) out: OutputCollector,
    pub(crate) progress: ProgressTracker<'a>,
    pub(crate) monitor: JoinMonitor,
    /// Build buckets spilled so far, across all depths.
    pub(crate) spilled: usize,
    pub(crate) warned_spill: bool,
}

impl JoinRun<'_> {
    fn execute(&mut self, build: &mut dyn RowSource, probe: &mut dyn RowSource) -> HhjResult<()> {
        self.progress.checkpoint()?;
        self.progress.message("partitioning build input");
        let mut pass = self.partition_build(build, 0, self.config.num_partitions, true)?;
        self.index_resident(&mut pass)?;

        self.progress.message("probing");
        self.partition_probe(probe, &mut pass, true)?;
        self.finish_resident(&mut pass)?;

        self.progress.message("joining spilled buckets");
        self.join_spilled(pass)?;
        self.progress.checkpoint()
    }
}

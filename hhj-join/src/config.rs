//! Tuning parameters for the hybrid hash join.
//!
//! [`JoinSpecification`](crate::JoinSpecification) says *what* to join;
//! `JoinConfig` says how hard the engine should try to stay in memory. The
//! defaults suit large inputs. Tests shrink them to force the disk paths.

use hhj_result::{Error, Result as HhjResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_NUM_PARTITIONS: &str = "HHJ_NUM_PARTITIONS";
const ENV_RESIDENT_BUCKET_ROWS: &str = "HHJ_RESIDENT_BUCKET_ROWS";
const ENV_MAX_RECURSION_DEPTH: &str = "HHJ_MAX_RECURSION_DEPTH";
const ENV_MEMORY_BUDGET_BYTES: &str = "HHJ_MEMORY_BUDGET_BYTES";
const ENV_MEMORY_POLL_MS: &str = "HHJ_MEMORY_POLL_MS";
const ENV_SPILL_DIR: &str = "HHJ_SPILL_DIR";

#[derive(Clone, Debug, PartialEq)]
pub struct JoinConfig {
    /// Buckets created by the top-level partition pass.
    pub num_partitions: usize,
    /// Build rows partitioned between two consultations of the memory monitor.
    pub pressure_check_rows: usize,
    /// Minimum time between two samples of process memory.
    pub memory_poll_interval: Duration,
    /// A spilled build bucket holding more rows than this is re-partitioned
    /// instead of being loaded whole.
    pub resident_bucket_rows: usize,
    /// Deepest recursion level; buckets still too large there fall back to a
    /// block-nested-loop join.
    pub max_recursion_depth: u32,
    /// Children created when a bucket is re-partitioned.
    pub recursion_fanout: usize,
    /// Rows processed between two cancellation checks.
    pub cancel_check_rows: usize,
    /// Memory the process may use; the pressure threshold is a fraction of it.
    pub memory_budget_bytes: u64,
    /// Parent directory for the scoped working directory. System temp when unset.
    pub spill_dir: Option<PathBuf>,
    /// Report pressure on every check, regardless of real memory usage.
    pub assume_memory_low: bool,
    /// Report pressure until at least this many buckets have been spilled.
    pub desired_spilled_buckets: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            num_partitions: 64,
            pressure_check_rows: 1024,
            memory_poll_interval: Duration::from_millis(250),
            resident_bucket_rows: 262_144,
            max_recursion_depth: 3,
            recursion_fanout: 16,
            cancel_check_rows: 1024,
            memory_budget_bytes: 4 * 1024 * 1024 * 1024,
            spill_dir: None,
            assume_memory_low: false,
            desired_spilled_buckets: 0,
        }
    }
}

impl JoinConfig {
    /// Defaults overlaid with any `HHJ_*` environment variables that parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse(ENV_NUM_PARTITIONS) {
            config.num_partitions = v;
        }
        if let Some(v) = env_parse(ENV_RESIDENT_BUCKET_ROWS) {
            config.resident_bucket_rows = v;
        }
        if let Some(v) = env_parse(ENV_MAX_RECURSION_DEPTH) {
            config.max_recursion_depth = v;
        }
        if let Some(v) = env_parse(ENV_MEMORY_BUDGET_BYTES) {
            config.memory_budget_bytes = v;
        }
        if let Some(ms) = env_parse::<u64>(ENV_MEMORY_POLL_MS) {
            config.memory_poll_interval = Duration::from_millis(ms);
        }
        if let Some(dir) = std::env::var_os(ENV_SPILL_DIR)
            && !dir.is_empty()
        {
            config.spill_dir = Some(PathBuf::from(dir));
        }
        config
    }

    pub fn with_num_partitions(mut self, n: usize) -> Self {
        self.num_partitions = n;
        self
    }

    pub fn with_pressure_check_rows(mut self, rows: usize) -> Self {
        self.pressure_check_rows = rows;
        self
    }

    pub fn with_memory_poll_interval(mut self, interval: Duration) -> Self {
        self.memory_poll_interval = interval;
        self
    }

    pub fn with_resident_bucket_rows(mut self, rows: usize) -> Self {
        self.resident_bucket_rows = rows;
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn with_recursion_fanout(mut self, fanout: usize) -> Self {
        self.recursion_fanout = fanout;
        self
    }

    pub fn with_cancel_check_rows(mut self, rows: usize) -> Self {
        self.cancel_check_rows = rows;
        self
    }

    pub fn with_memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Force every pressure check to report low memory.
    pub fn with_assume_memory_low(mut self, assume: bool) -> Self {
        self.assume_memory_low = assume;
        self
    }

    pub fn with_desired_spilled_buckets(mut self, buckets: usize) -> Self {
        self.desired_spilled_buckets = buckets;
        self
    }

    pub fn validate(&self) -> HhjResult<()> {
        let positive = [
            ("num_partitions", self.num_partitions),
            ("pressure_check_rows", self.pressure_check_rows),
            ("resident_bucket_rows", self.resident_bucket_rows),
            ("cancel_check_rows", self.cancel_check_rows),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::configuration(format!("{name} must be > 0")));
            }
        }
        if self.recursion_fanout < 2 {
            return Err(Error::configuration(format!(
                "recursion_fanout must be at least 2, got {}",
                self.recursion_fanout
            )));
        }
        if self.memory_budget_bytes == 0 {
            return Err(Error::configuration("memory_budget_bytes must be > 0"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    parse_setting(name, &raw)
}

fn parse_setting<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable join setting");
            None
        }
    }
}

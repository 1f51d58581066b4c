//! Hybrid hash join over storage-agnostic row sources.
//!
//! This crate exposes the join description (`JoinKey`, `JoinType`,
//! `JoinSpecification`), the tuning knobs (`JoinConfig`) and the engine entry
//! point [`HybridHashJoin`]. Execution partitions the build side into buckets
//! by key hash, keeps as many buckets resident as memory allows, spills the
//! rest through [`hhj_storage::PartitionStore`] and joins spilled buckets one
//! at a time afterwards, re-partitioning buckets that are still too large.
#![forbid(unsafe_code)]

mod config;
mod coordinator;
mod executor;
mod hashing;
mod memory;
mod output;
mod partitioner;
mod plan;
mod progress;

use hhj_result::{Error, Result as HhjResult};
use hhj_types::{Row, RowSchema};
use std::fmt;
use std::sync::Arc;

pub use config::JoinConfig;
pub use coordinator::{HybridHashJoin, JoinOutcome};
pub use hashing::{HashKey, KeyValue};
pub use memory::{MemoryMonitor, MemoryProbe, ProcessMemoryProbe};
pub use output::{JoinOutput, OutputRow, SplitOutput};
pub use progress::{
    CancellationToken, JoinMonitor, JoinState, JoinStatistics, NoopProgress, ProgressSink,
};

/// Default ceiling on simultaneously open spill files.
pub const DEFAULT_MAX_OPEN_FILES: usize = 300;

/// Default fraction of the memory budget above which the engine spills.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.9;

/// Type of join to perform.
///
/// Each type is shorthand for a combination of the three inclusion flags on
/// [`JoinSpecification`]; the flags can also be set individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Emit only matching row pairs.
    Inner,
    /// Emit all left rows; unmatched left rows have NULL right columns.
    Left,
    /// Emit all right rows; unmatched right rows have NULL left columns.
    Right,
    /// Emit all rows from both sides; unmatched rows have NULLs.
    Full,
}

impl JoinType {
    fn includes_left_unmatched(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    fn includes_right_unmatched(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER"),
            JoinType::Left => write!(f, "LEFT"),
            JoinType::Right => write!(f, "RIGHT"),
            JoinType::Full => write!(f, "FULL"),
        }
    }
}

/// One of the two join inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinSide {
    Left,
    Right,
}

/// Join key pair describing which columns to equate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinKey {
    /// Column index in the left input's schema.
    pub left_column: usize,
    /// Column index in the right input's schema.
    pub right_column: usize,
    /// If true, NULL == NULL for this key (SQL-style NULL-safe equality).
    /// If false, a NULL in this column never matches anything.
    pub null_equals_null: bool,
}

impl JoinKey {
    /// Create a join key where NULLs never match.
    pub fn new(left_column: usize, right_column: usize) -> Self {
        Self {
            left_column,
            right_column,
            null_equals_null: false,
        }
    }

    /// Create a join key with NULL-safe equality (NULL == NULL).
    pub fn null_safe(left_column: usize, right_column: usize) -> Self {
        Self {
            left_column,
            right_column,
            null_equals_null: true,
        }
    }
}

/// Shape of the join result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum JoinOutputMode {
    /// One row list; unmatched rows are padded with NULLs for the other side.
    #[default]
    Combined,
    /// Separate lists for matches, left-unmatched and right-unmatched rows.
    Split,
}

/// Which input is indexed into hash tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BuildSide {
    Left,
    Right,
    /// The side with fewer estimated rows; right on ties or when unknown.
    #[default]
    Smaller,
}

impl fmt::Display for BuildSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildSide::Left => write!(f, "left"),
            BuildSide::Right => write!(f, "right"),
            BuildSide::Smaller => write!(f, "smaller"),
        }
    }
}

/// Ordering guarantee for the returned rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum OutputOrder {
    /// Whatever order buckets were processed in.
    #[default]
    Arbitrary,
    /// Matches ordered by `(left_row_id, right_row_id)`, unmatched rows by
    /// their own row id.
    Stable,
}

/// Residual predicate evaluated on `(left, right)` candidate pairs that
/// already share an equal join key.
pub type ResidualPredicate = Arc<dyn Fn(&Row, &Row) -> bool + Send + Sync>;

/// Immutable description of one join invocation.
#[derive(Clone)]
pub struct JoinSpecification {
    /// Equi-join key pairs, compared component-wise.
    pub keys: Vec<JoinKey>,
    pub residual: Option<ResidualPredicate>,
    pub output_mode: JoinOutputMode,
    pub include_matches: bool,
    pub include_left_unmatched: bool,
    pub include_right_unmatched: bool,
    /// Ceiling on spill files open at the same time. Must be at least 2.
    pub max_open_files: usize,
    /// Fraction of the memory budget in `(0, 1)` above which buckets spill.
    pub memory_threshold: f64,
    pub build_side: BuildSide,
    pub output_order: OutputOrder,
    /// Left columns to emit, in order. `None` emits every column.
    pub left_columns: Option<Vec<usize>>,
    /// Right columns to emit, in order. `None` emits every column.
    pub right_columns: Option<Vec<usize>>,
}

impl fmt::Debug for JoinSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinSpecification")
            .field("keys", &self.keys)
            .field("residual", &self.residual.as_ref().map(|_| "<predicate>"))
            .field("output_mode", &self.output_mode)
            .field("include_matches", &self.include_matches)
            .field("include_left_unmatched", &self.include_left_unmatched)
            .field("include_right_unmatched", &self.include_right_unmatched)
            .field("max_open_files", &self.max_open_files)
            .field("memory_threshold", &self.memory_threshold)
            .field("build_side", &self.build_side)
            .field("output_order", &self.output_order)
            .field("left_columns", &self.left_columns)
            .field("right_columns", &self.right_columns)
            .finish()
    }
}

impl JoinSpecification {
    /// Create a specification of the given type with default settings.
    pub fn new(join_type: JoinType, keys: Vec<JoinKey>) -> Self {
        Self {
            keys,
            residual: None,
            output_mode: JoinOutputMode::Combined,
            include_matches: true,
            include_left_unmatched: join_type.includes_left_unmatched(),
            include_right_unmatched: join_type.includes_right_unmatched(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            build_side: BuildSide::Smaller,
            output_order: OutputOrder::Arbitrary,
            left_columns: None,
            right_columns: None,
        }
    }

    /// Create a specification for an inner join with default settings.
    pub fn inner(keys: Vec<JoinKey>) -> Self {
        Self::new(JoinType::Inner, keys)
    }

    /// Create a specification for a left outer join with default settings.
    pub fn left(keys: Vec<JoinKey>) -> Self {
        Self::new(JoinType::Left, keys)
    }

    /// Create a specification for a right outer join with default settings.
    pub fn right(keys: Vec<JoinKey>) -> Self {
        Self::new(JoinType::Right, keys)
    }

    /// Create a specification for a full outer join with default settings.
    pub fn full(keys: Vec<JoinKey>) -> Self {
        Self::new(JoinType::Full, keys)
    }

    /// Reset the three inclusion flags to those of `join_type`.
    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.include_matches = true;
        self.include_left_unmatched = join_type.includes_left_unmatched();
        self.include_right_unmatched = join_type.includes_right_unmatched();
        self
    }

    /// Set the residual predicate, called as `predicate(left_row, right_row)`.
    pub fn with_residual<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row, &Row) -> bool + Send + Sync + 'static,
    {
        self.residual = Some(Arc::new(predicate));
        self
    }

    pub fn with_output_mode(mut self, mode: JoinOutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Emit or suppress matched pairs.
    pub fn with_matches(mut self, include: bool) -> Self {
        self.include_matches = include;
        self
    }

    /// Emit or suppress the unmatched rows of one side.
    pub fn with_unmatched(mut self, side: JoinSide, include: bool) -> Self {
        match side {
            JoinSide::Left => self.include_left_unmatched = include,
            JoinSide::Right => self.include_right_unmatched = include,
        }
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    pub fn with_build_side(mut self, side: BuildSide) -> Self {
        self.build_side = side;
        self
    }

    pub fn with_output_order(mut self, order: OutputOrder) -> Self {
        self.output_order = order;
        self
    }

    pub fn with_left_columns(mut self, columns: Vec<usize>) -> Self {
        self.left_columns = Some(columns);
        self
    }

    pub fn with_right_columns(mut self, columns: Vec<usize>) -> Self {
        self.right_columns = Some(columns);
        self
    }

    /// The named join type matching the inclusion flags, if there is one.
    pub fn join_type(&self) -> Option<JoinType> {
        if !self.include_matches {
            return None;
        }
        match (self.include_left_unmatched, self.include_right_unmatched) {
            (false, false) => Some(JoinType::Inner),
            (true, false) => Some(JoinType::Left),
            (false, true) => Some(JoinType::Right),
            (true, true) => Some(JoinType::Full),
        }
    }

    /// Check the specification against both input schemas.
    ///
    /// Called before any row is read; every failure is a
    /// [`Error::Configuration`].
    pub fn validate(&self, left: &RowSchema, right: &RowSchema) -> HhjResult<()> {
        if self.keys.is_empty() {
            return Err(Error::configuration(
                "a hash join needs at least one join key",
            ));
        }
        if self.max_open_files < 2 {
            return Err(Error::configuration(format!(
                "max_open_files must be at least 2, got {}",
                self.max_open_files
            )));
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold < 1.0) {
            return Err(Error::configuration(format!(
                "memory_threshold must lie strictly between 0 and 1, got {}",
                self.memory_threshold
            )));
        }

        for (idx, key) in self.keys.iter().enumerate() {
            let left_col = left.column(key.left_column).ok_or_else(|| {
                Error::configuration(format!(
                    "join key {idx}: left column {} out of range ({} columns)",
                    key.left_column,
                    left.len()
                ))
            })?;
            let right_col = right.column(key.right_column).ok_or_else(|| {
                Error::configuration(format!(
                    "join key {idx}: right column {} out of range ({} columns)",
                    key.right_column,
                    right.len()
                ))
            })?;
            if !left_col.data_type.is_key_compatible(right_col.data_type) {
                return Err(Error::configuration(format!(
                    "join key {idx}: cannot compare left '{}' ({}) with right '{}' ({})",
                    left_col.name, left_col.data_type, right_col.name, right_col.data_type
                )));
            }
        }

        validate_projection("left", self.left_columns.as_deref(), left)?;
        validate_projection("right", self.right_columns.as_deref(), right)?;
        Ok(())
    }
}

fn validate_projection(side: &str, columns: Option<&[usize]>, schema: &RowSchema) -> HhjResult<()> {
    if let Some(columns) = columns
        && let Some(bad) = columns.iter().find(|&&c| c >= schema.len())
    {
        return Err(Error::configuration(format!(
            "{side} output column {bad} out of range ({} columns)",
            schema.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhj_types::{ColumnDef, ValueType};

    fn schema(types: &[ValueType]) -> RowSchema {
        RowSchema::new(
            types
                .iter()
                .enumerate()
                .map(|(i, t)| ColumnDef::new(format!("c{i}"), *t, true))
                .collect(),
        )
    }

    #[test]
    fn test_join_key_constructors() {
        let key = JoinKey::new(1, 2);
        assert_eq!(key.left_column, 1);
        assert_eq!(key.right_column, 2);
        assert!(!key.null_equals_null);

        let key_null_safe = JoinKey::null_safe(1, 2);
        assert!(key_null_safe.null_equals_null);
    }

    #[test]
    fn test_specification_builders() {
        let spec = JoinSpecification::left(vec![JoinKey::new(0, 0)])
            .with_output_mode(JoinOutputMode::Split)
            .with_max_open_files(16)
            .with_memory_threshold(0.5)
            .with_build_side(BuildSide::Left)
            .with_output_order(OutputOrder::Stable);
        assert_eq!(spec.join_type(), Some(JoinType::Left));
        assert_eq!(spec.output_mode, JoinOutputMode::Split);
        assert_eq!(spec.max_open_files, 16);
        assert_eq!(spec.memory_threshold, 0.5);
        assert_eq!(spec.build_side, BuildSide::Left);
        assert_eq!(spec.output_order, OutputOrder::Stable);

        let full = spec.with_join_type(JoinType::Full);
        assert!(full.include_left_unmatched && full.include_right_unmatched);

        let anti = JoinSpecification::inner(vec![JoinKey::new(0, 0)])
            .with_matches(false)
            .with_unmatched(JoinSide::Left, true);
        assert_eq!(anti.join_type(), None);
    }

    #[test]
    fn test_default_limits() {
        let spec = JoinSpecification::inner(vec![JoinKey::new(0, 0)]);
        assert_eq!(spec.max_open_files, 300);
        assert_eq!(spec.memory_threshold, 0.9);
        assert_eq!(spec.build_side, BuildSide::Smaller);
        assert!(spec.residual.is_none());
    }

    #[test]
    fn test_validate_accepts_compatible_keys() {
        let left = schema(&[ValueType::Int64, ValueType::Utf8]);
        let right = schema(&[ValueType::Utf8, ValueType::UInt64]);
        let spec = JoinSpecification::inner(vec![JoinKey::new(0, 1), JoinKey::new(1, 0)]);
        assert!(spec.validate(&left, &right).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_specifications() {
        let left = schema(&[ValueType::Int64, ValueType::Utf8]);
        let right = schema(&[ValueType::Int64]);

        let cases = vec![
            JoinSpecification::inner(vec![]),
            JoinSpecification::inner(vec![JoinKey::new(0, 0)]).with_max_open_files(1),
            JoinSpecification::inner(vec![JoinKey::new(0, 0)]).with_memory_threshold(1.5),
            JoinSpecification::inner(vec![JoinKey::new(0, 0)]).with_memory_threshold(0.0),
            JoinSpecification::inner(vec![JoinKey::new(0, 0)]).with_memory_threshold(f64::NAN),
            JoinSpecification::inner(vec![JoinKey::new(5, 0)]),
            JoinSpecification::inner(vec![JoinKey::new(0, 3)]),
            JoinSpecification::inner(vec![JoinKey::new(1, 0)]),
            JoinSpecification::inner(vec![JoinKey::new(0, 0)]).with_right_columns(vec![0, 1]),
        ];
        for spec in cases {
            let err = spec.validate(&left, &right).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{spec:?}: {err}");
        }
    }

    #[test]
    fn test_join_type_display() {
        assert_eq!(JoinType::Inner.to_string(), "INNER");
        assert_eq!(JoinType::Left.to_string(), "LEFT");
        assert_eq!(JoinType::Right.to_string(), "RIGHT");
        assert_eq!(JoinType::Full.to_string(), "FULL");
    }
}

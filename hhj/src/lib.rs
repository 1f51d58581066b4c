//! hhj: a hybrid hash join for inputs that may not fit in memory.
//!
//! This crate is the entry point of the workspace. It re-exports the join
//! engine and its supporting types from the `hhj-*` crates and adds a CSV
//! adapter used by the `hhj` binary.
//!
//! # Quick Start
//!
//! ```rust
//! use hhj::{HybridHashJoin, JoinKey, JoinSpecification};
//! use hhj::types::{ColumnDef, RowSchema, Value, ValueType, VecRowSource};
//!
//! let schema = RowSchema::new(vec![ColumnDef::new("id", ValueType::Int64, false)]);
//! let left = VecRowSource::from_values(schema.clone(), vec![vec![Value::Int64(1)]]);
//! let right = VecRowSource::from_values(schema, vec![vec![Value::Int64(1)]]);
//!
//! let spec = JoinSpecification::inner(vec![JoinKey::new(0, 0)]);
//! let output = HybridHashJoin::default().join(&spec, left, right).unwrap();
//! assert_eq!(output.len(), 1);
//! ```
//!
//! # Architecture
//!
//! - **Errors** (`hhj-result`): the shared `Error` enum and `Result` alias.
//! - **Rows** (`hhj-types`): values, schemas and the `RowSource` trait.
//! - **Spilling** (`hhj-storage`): scoped spill directory and partition store.
//! - **Join** (`hhj-join`): partitioning, memory monitoring, in-memory join,
//!   progress and the coordinator.
#![forbid(unsafe_code)]

pub mod csv;

pub use hhj_join::{
    BuildSide, CancellationToken, HybridHashJoin, JoinConfig, JoinKey, JoinMonitor, JoinOutcome,
    JoinOutput, JoinOutputMode, JoinSide, JoinSpecification, JoinState, JoinStatistics, JoinType,
    MemoryProbe, NoopProgress, OutputOrder, OutputRow, ProgressSink, SplitOutput,
};

pub use hhj_result::{Error, Result};

pub mod types {
    //! Row model consumed by the join.

    pub use hhj_types::{
        ColumnDef, RecordBatchRowSource, Row, RowId, RowSchema, RowSource, Value, ValueType,
        VecRowSource,
    };
}

pub mod storage {
    //! Spill storage used by the join, exposed for diagnostics.

    pub use hhj_storage::{SpillDir, SpillIoSnapshot};
}

//! Storage-agnostic row model for the hhj join engine.
//!
//! The engine never looks at how a table is stored. It consumes rows through
//! the [`RowSource`] trait: a forward-only sequence of [`Row`]s that share one
//! [`RowSchema`]. Two adapters ship with the crate:
//!
//! - [`VecRowSource`]: rows already materialized in memory (tests, small inputs)
//! - [`RecordBatchRowSource`]: Arrow `RecordBatch`es, converted row by row
//!
//! Rows are `bitcode`-encodable so the partition store can spill them without
//! a bespoke format.
#![forbid(unsafe_code)]

mod arrow_source;
mod row;
mod source;
mod value;

pub use arrow_source::{RecordBatchRowSource, value_type_from_arrow};
pub use row::{ColumnDef, Row, RowId, RowSchema};
pub use source::{RowSource, VecRowSource};
pub use value::{Value, ValueType};

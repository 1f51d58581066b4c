use std::collections::VecDeque;

use hhj_result::Result;

use crate::row::{Row, RowId, RowSchema};
use crate::value::Value;

/// A forward-only sequence of rows sharing one schema.
///
/// A source is read once. Re-reading a table means acquiring a fresh source
/// from whoever owns it; the engine never asks a source to rewind.
pub trait RowSource {
    fn schema(&self) -> &RowSchema;

    /// Next row, or `None` once the sequence is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Total number of rows this source will deliver, when known up front.
    /// Used for build-side selection and progress estimation only.
    fn estimated_rows(&self) -> Option<u64> {
        None
    }
}

impl<S: RowSource + ?Sized> RowSource for Box<S> {
    fn schema(&self) -> &RowSchema {
        (**self).schema()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        (**self).next_row()
    }

    fn estimated_rows(&self) -> Option<u64> {
        (**self).estimated_rows()
    }
}

/// Row source over rows already held in memory.
#[derive(Debug, Clone)]
pub struct VecRowSource {
    schema: RowSchema,
    rows: VecDeque<Row>,
    total: u64,
}

impl VecRowSource {
    pub fn new(schema: RowSchema, rows: Vec<Row>) -> Self {
        let total = rows.len() as u64;
        Self {
            schema,
            rows: rows.into(),
            total,
        }
    }

    /// Build rows from plain value tuples, numbering them `0..n` in order.
    pub fn from_values(schema: RowSchema, values: Vec<Vec<Value>>) -> Self {
        let rows = values
            .into_iter()
            .enumerate()
            .map(|(idx, values)| Row::new(idx as RowId, values))
            .collect();
        Self::new(schema, rows)
    }
}

impl RowSource for VecRowSource {
    fn schema(&self) -> &RowSchema {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    fn estimated_rows(&self) -> Option<u64> {
        Some(self.total)
    }
}

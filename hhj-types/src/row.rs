use bitcode::{Decode, Encode};
use hhj_result::{Error, Result};

use crate::value::{Value, ValueType};

/// Identifier of a row, unique within one input side.
pub type RowId = u64;

/// One input row: an identifier plus its column values.
///
/// Rows are immutable once read from a source; the engine moves them between
/// buckets and spill files but never edits their values.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(id: RowId, values: Vec<Value>) -> Self {
        Self { id, values }
    }

    pub fn value(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    /// Approximate in-memory footprint, used for bucket accounting.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Row>() + self.values.iter().map(Value::estimated_size).sum::<usize>()
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ValueType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ValueType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered column list shared by every row of a source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowSchema {
    columns: Vec<ColumnDef>,
}

impl RowSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check that `row` has one value per column and that every non-null value
    /// matches its column's declared type.
    pub fn check_row(&self, row: &Row) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(Error::RowSource(format!(
                "row {} has {} values; schema declares {} columns",
                row.id,
                row.values.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.values.iter().zip(&self.columns) {
            if let Some(actual) = value.value_type()
                && actual != column.data_type
            {
                return Err(Error::RowSource(format!(
                    "row {} column '{}' holds {} but is declared {}",
                    row.id, column.name, actual, column.data_type
                )));
            }
        }
        Ok(())
    }
}

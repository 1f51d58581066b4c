//! Adapter turning a stream of Arrow `RecordBatch`es into hhj rows.

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float32Array, Float64Array, Int8Array,
    Int16Array, Int32Array, Int64Array, LargeBinaryArray, LargeStringArray, StringArray,
    UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use hhj_result::{Error, Result};

use crate::row::{ColumnDef, Row, RowId, RowSchema};
use crate::source::RowSource;
use crate::value::{Value, ValueType};

/// Map an Arrow data type onto the join's logical [`ValueType`].
pub fn value_type_from_arrow(data_type: &DataType) -> Result<ValueType> {
    let value_type = match data_type {
        DataType::Boolean => ValueType::Boolean,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => ValueType::Int64,
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            ValueType::UInt64
        }
        DataType::Float32 | DataType::Float64 => ValueType::Float64,
        DataType::Utf8 | DataType::LargeUtf8 => ValueType::Utf8,
        DataType::Binary | DataType::LargeBinary => ValueType::Binary,
        dt => {
            return Err(Error::configuration(format!(
                "unsupported column type for join input: {dt:?}"
            )));
        }
    };
    Ok(value_type)
}

/// Row source reading Arrow record batches one row at a time.
///
/// Row identifiers are assigned sequentially across batches, starting at
/// zero, so they are stable for a given batch sequence.
pub struct RecordBatchRowSource<I> {
    schema: RowSchema,
    batches: I,
    current: Option<RecordBatch>,
    position: usize,
    next_id: RowId,
    estimated_rows: Option<u64>,
}

impl<I> RecordBatchRowSource<I>
where
    I: Iterator<Item = std::result::Result<RecordBatch, ArrowError>>,
{
    pub fn new(arrow_schema: SchemaRef, batches: I) -> Result<Self> {
        let columns = arrow_schema
            .fields()
            .iter()
            .map(|field| {
                Ok(ColumnDef::new(
                    field.name().clone(),
                    value_type_from_arrow(field.data_type())?,
                    field.is_nullable(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema: RowSchema::new(columns),
            batches,
            current: None,
            position: 0,
            next_id: 0,
            estimated_rows: None,
        })
    }

    /// Attach a row-count estimate for build-side selection and progress.
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }
}

impl RecordBatchRowSource<std::vec::IntoIter<std::result::Result<RecordBatch, ArrowError>>> {
    /// Adapt batches that are already materialized; the row estimate is exact.
    pub fn from_batches(arrow_schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        let total: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let batches: Vec<_> = batches.into_iter().map(Ok).collect();
        Ok(Self::new(arrow_schema, batches.into_iter())?.with_estimated_rows(total as u64))
    }
}

impl<I> RowSource for RecordBatchRowSource<I>
where
    I: Iterator<Item = std::result::Result<RecordBatch, ArrowError>>,
{
    fn schema(&self) -> &RowSchema {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(batch) = &self.current
                && self.position < batch.num_rows()
            {
                let row_idx = self.position;
                let values = batch
                    .columns()
                    .iter()
                    .map(|column| value_at(column, row_idx))
                    .collect::<Result<Vec<_>>>()?;
                self.position += 1;
                let id = self.next_id;
                self.next_id += 1;
                return Ok(Some(Row::new(id, values)));
            }

            match self.batches.next() {
                Some(batch) => {
                    let batch = batch?;
                    if batch.num_columns() != self.schema.len() {
                        return Err(Error::row_source(format!(
                            "record batch has {} columns; schema declares {}",
                            batch.num_columns(),
                            self.schema.len()
                        )));
                    }
                    self.current = Some(batch);
                    self.position = 0;
                }
                None => {
                    self.current = None;
                    return Ok(None);
                }
            }
        }
    }

    fn estimated_rows(&self) -> Option<u64> {
        self.estimated_rows
    }
}

macro_rules! downcast_value {
    ($column:expr, $array_ty:ty, $row:expr, $wrap:expr) => {{
        let array = $column
            .as_any()
            .downcast_ref::<$array_ty>()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "column declared {:?} is not a {}",
                    $column.data_type(),
                    stringify!($array_ty)
                ))
            })?;
        $wrap(array.value($row))
    }};
}

/// Extract a single cell as a [`Value`].
fn value_at(column: &ArrayRef, row_idx: usize) -> Result<Value> {
    if column.is_null(row_idx) {
        return Ok(Value::Null);
    }

    let value = match column.data_type() {
        DataType::Boolean => downcast_value!(column, BooleanArray, row_idx, Value::Boolean),
        DataType::Int8 => downcast_value!(column, Int8Array, row_idx, |v: i8| Value::Int64(v.into())),
        DataType::Int16 => {
            downcast_value!(column, Int16Array, row_idx, |v: i16| Value::Int64(v.into()))
        }
        DataType::Int32 => {
            downcast_value!(column, Int32Array, row_idx, |v: i32| Value::Int64(v.into()))
        }
        DataType::Int64 => downcast_value!(column, Int64Array, row_idx, Value::Int64),
        DataType::UInt8 => {
            downcast_value!(column, UInt8Array, row_idx, |v: u8| Value::UInt64(v.into()))
        }
        DataType::UInt16 => {
            downcast_value!(column, UInt16Array, row_idx, |v: u16| Value::UInt64(v.into()))
        }
        DataType::UInt32 => {
            downcast_value!(column, UInt32Array, row_idx, |v: u32| Value::UInt64(v.into()))
        }
        DataType::UInt64 => downcast_value!(column, UInt64Array, row_idx, Value::UInt64),
        DataType::Float32 => {
            downcast_value!(column, Float32Array, row_idx, |v: f32| Value::Float64(v.into()))
        }
        DataType::Float64 => downcast_value!(column, Float64Array, row_idx, Value::Float64),
        DataType::Utf8 => {
            downcast_value!(column, StringArray, row_idx, |v: &str| Value::Utf8(v.to_string()))
        }
        DataType::LargeUtf8 => downcast_value!(column, LargeStringArray, row_idx, |v: &str| {
            Value::Utf8(v.to_string())
        }),
        DataType::Binary => {
            downcast_value!(column, BinaryArray, row_idx, |v: &[u8]| Value::Binary(v.to_vec()))
        }
        DataType::LargeBinary => downcast_value!(column, LargeBinaryArray, row_idx, |v: &[u8]| {
            Value::Binary(v.to_vec())
        }),
        dt => {
            return Err(Error::row_source(format!(
                "unsupported column type for join input: {dt:?}"
            )));
        }
    };

    Ok(value)
}

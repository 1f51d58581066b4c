//! Join keys and the partition function.
//!
//! A [`HashKey`] is the normalized tuple of a row's join-column values. Both
//! sides go through the same normalization, so a left `Int64(5)` and a right
//! `UInt64(5)` produce equal keys, and `-0.0` meets `0.0`.
//!
//! Partitioning hashes the key with a seed derived from the recursion depth.
//! Rows that collided in one bucket at depth `d` are spread out again at
//! depth `d + 1` instead of landing together a second time.

use hhj_result::{Error, Result as HhjResult};
use hhj_types::{Row, Value};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

const DEPTH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A single normalized join column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    /// Only produced for key columns marked NULL-safe.
    Null,
    Boolean(bool),
    /// Signed and unsigned integers share one domain.
    Int(i128),
    /// Canonical bit pattern: one zero, one NaN.
    Float(u64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl KeyValue {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Boolean(b) => KeyValue::Boolean(*b),
            Value::Int64(v) => KeyValue::Int(i128::from(*v)),
            Value::UInt64(v) => KeyValue::Int(i128::from(*v)),
            Value::Float64(v) => KeyValue::Float(canonical_float_bits(*v)),
            Value::Utf8(s) => KeyValue::Utf8(s.clone()),
            Value::Binary(b) => KeyValue::Binary(b.clone()),
        }
    }
}

fn canonical_float_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

/// Join-column values of one row, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashKey {
    values: Vec<KeyValue>,
}

impl HashKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }
}

/// Extract the join key of `row`.
///
/// Returns `Ok(None)` when a column not marked NULL-safe holds a NULL: such a
/// row can never match anything.
pub(crate) fn extract_key(
    row: &Row,
    columns: &[usize],
    null_safe: &[bool],
) -> HhjResult<Option<HashKey>> {
    let mut values = Vec::with_capacity(columns.len());
    for (&column, &safe) in columns.iter().zip(null_safe) {
        let value = row.value(column).ok_or_else(|| {
            Error::RowSource(format!(
                "row {} has no key column {column} ({} values)",
                row.id,
                row.values.len()
            ))
        })?;
        if value.is_null() && !safe {
            return Ok(None);
        }
        values.push(KeyValue::from_value(value));
    }
    Ok(Some(HashKey::new(values)))
}

/// Bucket index of `key` among `fanout` buckets at recursion `depth`.
///
/// Deterministic across runs and processes.
pub(crate) fn partition_for(key: &HashKey, depth: u32, fanout: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write_u64(DEPTH_SEED ^ u64::from(depth).wrapping_mul(DEPTH_SEED));
    key.hash(&mut hasher);
    (fmix64(hasher.finish()) % fanout as u64) as usize
}

/// MurmurHash3 64-bit finalizer; FxHash alone leaves low bits poorly mixed.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

use bitcode::{Decode, Encode};
use std::fmt;

/// Logical type of a column.
///
/// Narrow integer and float widths collapse onto the 64-bit variants; the join
/// only needs equality, not arithmetic, so the width carries no meaning here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Boolean,
    Int64,
    UInt64,
    Float64,
    Utf8,
    Binary,
}

impl ValueType {
    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::Int64 | ValueType::UInt64)
    }

    /// Whether values of `self` and `other` can be compared for key equality.
    ///
    /// Identical types are always compatible. Signed and unsigned integers are
    /// compatible with each other and compare as mathematical integers.
    pub fn is_key_compatible(self, other: ValueType) -> bool {
        self == other || (self.is_integer() && other.is_integer())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Boolean => write!(f, "BOOLEAN"),
            ValueType::Int64 => write!(f, "INT64"),
            ValueType::UInt64 => write!(f, "UINT64"),
            ValueType::Float64 => write!(f, "FLOAT64"),
            ValueType::Utf8 => write!(f, "UTF8"),
            ValueType::Binary => write!(f, "BINARY"),
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The logical type of this value, or `None` for [`Value::Null`].
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Int64(_) => Some(ValueType::Int64),
            Value::UInt64(_) => Some(ValueType::UInt64),
            Value::Float64(_) => Some(ValueType::Float64),
            Value::Utf8(_) => Some(ValueType::Utf8),
            Value::Binary(_) => Some(ValueType::Binary),
        }
    }

    /// Approximate heap plus inline footprint in bytes.
    pub fn estimated_size(&self) -> usize {
        let heap = match self {
            Value::Utf8(s) => s.capacity(),
            Value::Binary(b) => b.capacity(),
            _ => 0,
        };
        std::mem::size_of::<Value>() + heap
    }
}

macro_rules! impl_from_for_value {
    ($variant:ident, $($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_value!(Int64, i8, i16, i32, i64);
impl_from_for_value!(UInt64, u8, u16, u32, u64);
impl_from_for_value!(Float64, f32, f64);
impl_from_for_value!(Utf8, String);
impl_from_for_value!(Boolean, bool);
impl_from_for_value!(Binary, Vec<u8>);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => write!(f, "{v}"),
            Value::Binary(v) => {
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

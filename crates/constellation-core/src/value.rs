//! The self-describing value model.
//!
//! Every payload crossing CSCP or CMDP is built from [`Value`]: scalars,
//! timestamps, byte strings, arrays and the recursive [`Dictionary`]/[`List`]
//! containers. The MessagePack encoding lives in `constellation-protocol`;
//! this module only defines the data model and typed conversions.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::dictionary::{Dictionary, List};

/// A tagged value as carried in configurations, command arguments and replies.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value; also the return of a void user command.
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    /// Nanosecond-resolution UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Opaque byte string.
    Bytes(Vec<u8>),
    /// Homogeneous array of scalar values.
    Array(Vec<Value>),
    /// Recursive string-keyed mapping.
    Dictionary(Dictionary),
    /// Recursive sequence.
    List(List),
}

impl Value {
    /// Short human-readable name of the contained type, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Dictionary(_) => "dictionary",
            Value::List(_) => "list",
        }
    }

    /// Typed extraction, converting where lossless.
    ///
    /// # Errors
    /// Returns [`ValueError`] if the stored value does not convert to `T`.
    pub fn get<T: FromValue>(&self) -> Result<T, ValueError> {
        T::from_value(self)
    }

    /// Element-wise extraction of an array or list value.
    ///
    /// # Errors
    /// Returns [`ValueError`] if the value is not a sequence or any element
    /// does not convert to `T`.
    pub fn get_array<T: FromValue>(&self) -> Result<Vec<T>, ValueError> {
        match self {
            Value::Array(values) => values.iter().map(T::from_value).collect(),
            Value::List(list) => list.iter().map(T::from_value).collect(),
            other => Err(ValueError::new(other, "array")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(v) => v.fmt(f),
            Value::Int(v) => v.fmt(f),
            Value::UInt(v) => v.fmt(f),
            Value::Double(v) => v.fmt(f),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Timestamp(v) => v.fmt(f),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Array(values) => {
                f.write_str("[")?;
                for (n, value) in values.iter().enumerate() {
                    if n > 0 {
                        f.write_str(", ")?;
                    }
                    value.fmt(f)?;
                }
                f.write_str("]")
            }
            Value::Dictionary(dict) => dict.fmt(f),
            Value::List(list) => list.fmt(f),
        }
    }
}

/// Conversion failure between a [`Value`] and a concrete type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot convert {actual} value to {expected}")]
pub struct ValueError {
    /// Type name of the stored value.
    pub actual: &'static str,
    /// Requested type.
    pub expected: &'static str,
}

impl ValueError {
    fn new(value: &Value, expected: &'static str) -> Self {
        Self {
            actual: value.type_name(),
            expected,
        }
    }
}

/// Typed extraction from a [`Value`].
pub trait FromValue: Sized {
    /// Convert, succeeding only for lossless conversions.
    ///
    /// # Errors
    /// Returns [`ValueError`] if the value does not represent `Self`.
    fn from_value(value: &Value) -> Result<Self, ValueError>;
}

/// Conversion of a concrete type into a [`Value`].
pub trait IntoValue {
    /// Wrap into the tagged union.
    fn into_value(self) -> Value;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => Err(ValueError::new(other, "bool")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => i64::try_from(*v).map_err(|_| ValueError::new(value, "int")),
            other => Err(ValueError::new(other, "int")),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::UInt(v) => Ok(*v),
            Value::Int(v) => u64::try_from(*v).map_err(|_| ValueError::new(value, "uint")),
            other => Err(ValueError::new(other, "uint")),
        }
    }
}

impl FromValue for u16 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let wide: u64 = u64::from_value(value)?;
        u16::try_from(wide).map_err(|_| ValueError::new(value, "u16"))
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let wide: u64 = u64::from_value(value)?;
        u32::try_from(wide).map_err(|_| ValueError::new(value, "u32"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Double(v) => Ok(*v),
            other => Err(ValueError::new(other, "double")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::String(v) => Ok(v.clone()),
            other => Err(ValueError::new(other, "string")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Timestamp(v) => Ok(*v),
            other => Err(ValueError::new(other, "timestamp")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bytes(v) => Ok(v.clone()),
            other => Err(ValueError::new(other, "bytes")),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        Ok(value.clone())
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Nil
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Int(i64::from(self))
    }
}

impl IntoValue for u64 {
    fn into_value(self) -> Value {
        Value::UInt(self)
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        Value::UInt(u64::from(self))
    }
}

impl IntoValue for u16 {
    fn into_value(self) -> Value {
        Value::UInt(u64::from(self))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_owned())
    }
}

impl IntoValue for DateTime<Utc> {
    fn into_value(self) -> Value {
        Value::Timestamp(self)
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl IntoValue for Dictionary {
    fn into_value(self) -> Value {
        Value::Dictionary(self)
    }
}

impl IntoValue for List {
    fn into_value(self) -> Value {
        Value::List(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversions_are_lossless() {
        assert_eq!(Value::Int(42).get::<u64>(), Ok(42));
        assert_eq!(Value::UInt(42).get::<i64>(), Ok(42));
        assert!(Value::Int(-1).get::<u64>().is_err());
        assert!(Value::UInt(u64::MAX).get::<i64>().is_err());
    }

    #[test]
    fn narrowing_checks_range() {
        assert_eq!(Value::UInt(55001).get::<u16>(), Ok(55001));
        assert!(Value::UInt(70000).get::<u16>().is_err());
    }

    #[test]
    fn mismatched_types_report_both_sides() {
        let err = Value::String("x".into()).get::<bool>().unwrap_err();
        assert_eq!(err.actual, "string");
        assert_eq!(err.expected, "bool");
    }

    #[test]
    fn arrays_extract_element_wise() {
        let value = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(value.get_array::<i64>(), Ok(vec![1, 2]));
        let mixed = Value::Array(vec![Value::Int(1), Value::Bool(true)]);
        assert!(mixed.get_array::<i64>().is_err());
    }

    #[test]
    fn into_value_wraps_scalars() {
        assert_eq!(7_i64.into_value(), Value::Int(7));
        assert_eq!("hi".into_value(), Value::String("hi".into()));
        assert_eq!(().into_value(), Value::Nil);
    }
}

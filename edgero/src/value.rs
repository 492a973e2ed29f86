//! Decoded query values.
use bytes::Bytes;

use crate::common::Uuid;

/// A value decoded from, or encoded into, the binary protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Empty optional element, or an absent optional argument.
    Nothing,
    Str(String),
    Bytes(Bytes),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Uuid(Uuid),
    /// JSON text.
    Json(String),
    Enum(String),
    Set(Vec<Value>),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    NamedTuple(Vec<(String, Value)>),
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Returns the kind of this value, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Bool(_) => "bool",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
            Value::Enum(_) => "enum",
            Value::Set(_) => "set",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::NamedTuple(_) => "named tuple",
            Value::Object(_) => "object",
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Returns string content of `str`, `json` or `enum` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Json(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Returns any integer value widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int16(n) => Some(n.into()),
            Value::Int32(n) => Some(n.into()),
            Value::Int64(n) => Some(n),
            _ => None,
        }
    }

    /// Returns any float value widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(n) => Some(n.into()),
            Value::Float64(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Returns elements of a set, array or tuple.
    pub fn elements(&self) -> Option<&[Value]> {
        match self {
            Value::Set(v) | Value::Array(v) | Value::Tuple(v) => Some(v),
            _ => None,
        }
    }

    /// Get field of an object or named tuple by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) | Value::NamedTuple(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

macro_rules! from {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

from! {
    String => Str,
    &str => Str,
    Bytes => Bytes,
    Vec<u8> => Bytes,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    bool => Bool,
    Uuid => Uuid,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nothing, Into::into)
    }
}

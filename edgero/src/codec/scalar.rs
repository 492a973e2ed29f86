use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Codec, CodecError};
use crate::{common::Uuid, ext::{BufMutExt, UsizeExt}, value::Value};

pub(crate) const UUID_ID: Uuid = Uuid::from_u16(0x100);
pub(crate) const STR_ID: Uuid = Uuid::from_u16(0x101);
pub(crate) const BYTES_ID: Uuid = Uuid::from_u16(0x102);
pub(crate) const INT16_ID: Uuid = Uuid::from_u16(0x103);
pub(crate) const INT32_ID: Uuid = Uuid::from_u16(0x104);
pub(crate) const INT64_ID: Uuid = Uuid::from_u16(0x105);
pub(crate) const FLOAT32_ID: Uuid = Uuid::from_u16(0x106);
pub(crate) const FLOAT64_ID: Uuid = Uuid::from_u16(0x107);
pub(crate) const BOOL_ID: Uuid = Uuid::from_u16(0x109);
pub(crate) const JSON_ID: Uuid = Uuid::from_u16(0x10f);

/// JSON format version prefix.
const JSON_FORMAT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    Json,
}

/// Codec for base scalar types, and scalars derived from them.
#[derive(Debug, Clone)]
pub struct ScalarCodec {
    id: Uuid,
    kind: Kind,
}

impl ScalarCodec {
    /// Returns the codec of a well known base scalar.
    pub fn base(id: Uuid) -> Option<ScalarCodec> {
        let kind = match id {
            UUID_ID => Kind::Uuid,
            STR_ID => Kind::Str,
            BYTES_ID => Kind::Bytes,
            INT16_ID => Kind::Int16,
            INT32_ID => Kind::Int32,
            INT64_ID => Kind::Int64,
            FLOAT32_ID => Kind::Float32,
            FLOAT64_ID => Kind::Float64,
            BOOL_ID => Kind::Bool,
            JSON_ID => Kind::Json,
            _ => return None,
        };
        Some(ScalarCodec { id, kind })
    }

    /// Returns all well known base scalars codec.
    pub(crate) fn all() -> impl Iterator<Item = ScalarCodec> {
        [UUID_ID, STR_ID, BYTES_ID, INT16_ID, INT32_ID, INT64_ID, FLOAT32_ID, FLOAT64_ID, BOOL_ID, JSON_ID]
            .into_iter()
            .filter_map(ScalarCodec::base)
    }

    /// Create codec for a scalar type derived from this one.
    pub fn derive(&self, id: Uuid) -> ScalarCodec {
        ScalarCodec { id, kind: self.kind }
    }

    fn expect_len(buf: &Bytes, len: usize) -> Result<(), CodecError> {
        match buf.len() {
            n if n < len => Err(CodecError::Truncated),
            n if n > len => Err(CodecError::Trailing),
            _ => Ok(()),
        }
    }
}

fn int<T: TryFrom<i64>>(expected: &str, value: &Value) -> Result<T, CodecError> {
    let n = value.as_i64().ok_or_else(|| CodecError::invalid(expected, value))?;
    T::try_from(n).map_err(|_| CodecError::InvalidArgument(format!("{n} is out of range for {expected}")))
}

impl Codec for ScalarCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        match (self.kind, value) {
            (Kind::Uuid, Value::Uuid(id)) => buf.put_len_prefixed(id.as_bytes()),
            (Kind::Str, Value::Str(s)) => buf.put_len_prefixed(s.as_bytes()),
            (Kind::Bytes, Value::Bytes(b)) => buf.put_len_prefixed(b),
            (Kind::Int16, _) => {
                buf.put_i32(2);
                buf.put_i16(int("int16", value)?);
            }
            (Kind::Int32, _) => {
                buf.put_i32(4);
                buf.put_i32(int("int32", value)?);
            }
            (Kind::Int64, _) => {
                buf.put_i32(8);
                buf.put_i64(int("int64", value)?);
            }
            (Kind::Float32, Value::Float32(n)) => {
                buf.put_i32(4);
                buf.put_f32(*n);
            }
            (Kind::Float64, _) => {
                let n = value.as_f64().ok_or_else(|| CodecError::invalid("float64", value))?;
                buf.put_i32(8);
                buf.put_f64(n);
            }
            (Kind::Bool, Value::Bool(b)) => {
                buf.put_i32(1);
                buf.put_u8(*b as u8);
            }
            (Kind::Json, Value::Json(s) | Value::Str(s)) => {
                buf.put_u32((s.len() + 1).to_u32());
                buf.put_u8(JSON_FORMAT);
                buf.put_slice(s.as_bytes());
            }
            (kind, value) => {
                return Err(CodecError::invalid(kind.name(), value));
            }
        }
        Ok(())
    }

    fn decode(&self, mut buf: Bytes) -> Result<Value, CodecError> {
        let value = match self.kind {
            Kind::Uuid => {
                Self::expect_len(&buf, 16)?;
                let mut id = [0u8; 16];
                buf.copy_to_slice(&mut id);
                Value::Uuid(Uuid::from_bytes(id))
            }
            Kind::Str => Value::Str(utf8(buf)?),
            Kind::Bytes => Value::Bytes(buf),
            Kind::Int16 => {
                Self::expect_len(&buf, 2)?;
                Value::Int16(buf.get_i16())
            }
            Kind::Int32 => {
                Self::expect_len(&buf, 4)?;
                Value::Int32(buf.get_i32())
            }
            Kind::Int64 => {
                Self::expect_len(&buf, 8)?;
                Value::Int64(buf.get_i64())
            }
            Kind::Float32 => {
                Self::expect_len(&buf, 4)?;
                Value::Float32(buf.get_f32())
            }
            Kind::Float64 => {
                Self::expect_len(&buf, 8)?;
                Value::Float64(buf.get_f64())
            }
            Kind::Bool => {
                Self::expect_len(&buf, 1)?;
                Value::Bool(buf.get_u8() != 0)
            }
            Kind::Json => {
                if !buf.has_remaining() {
                    return Err(CodecError::Truncated);
                }
                let format = buf.get_u8();
                if format != JSON_FORMAT {
                    return Err(CodecError::Malformed(format!("unexpected JSON format {format}")));
                }
                Value::Json(utf8(buf)?)
            }
        };
        Ok(value)
    }
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Uuid => "uuid",
            Kind::Str => "str",
            Kind::Bytes => "bytes",
            Kind::Int16 => "int16",
            Kind::Int32 => "int32",
            Kind::Int64 => "int64",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::Bool => "bool",
            Kind::Json => "json",
        }
    }
}

fn utf8(buf: Bytes) -> Result<String, CodecError> {
    String::from_utf8(buf.to_vec()).map_err(|e| CodecError::Malformed(e.to_string()))
}

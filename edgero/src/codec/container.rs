use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use super::{Codec, CodecError, EMPTY_TUPLE_CODEC_ID, NULL_CODEC_ID, QueryArgs};
use crate::{
    common::Uuid,
    ext::{BytesExt, UsizeExt},
    value::Value,
};

/// Write `i32` length placeholder, returns position to [`end_len`].
fn begin_len(buf: &mut BytesMut) -> usize {
    let pos = buf.len();
    buf.put_i32(0);
    pos
}

/// Backpatch length written by [`begin_len`].
fn end_len(buf: &mut BytesMut, pos: usize) {
    let len = (buf.len() - pos - 4).to_u32();
    buf[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
}

/// Write tuple-like elements, `count` then `reserved` and data for each element.
fn encode_elements<'a, I>(buf: &mut BytesMut, elements: I) -> Result<(), CodecError>
where
    I: ExactSizeIterator<Item = (&'a Arc<dyn Codec>, &'a Value)>,
{
    let pos = begin_len(buf);
    buf.put_i32(elements.len().to_u32() as i32);
    for (codec, value) in elements {
        buf.put_i32(0);
        match value {
            Value::Nothing => buf.put_i32(-1),
            value => codec.encode(buf, value)?,
        }
    }
    end_len(buf, pos);
    Ok(())
}

fn decode_elements(mut buf: Bytes, codecs: &[Arc<dyn Codec>]) -> Result<Vec<Value>, CodecError> {
    let count = buf.get_i32_checked().ok_or(CodecError::Truncated)?;
    if usize::try_from(count).ok() != Some(codecs.len()) {
        return Err(CodecError::Malformed(format!(
            "cannot decode: expected {} elements, got {count}",
            codecs.len()
        )));
    }

    let mut values = Vec::with_capacity(codecs.len());
    for codec in codecs {
        buf.get_bytes_checked(4).ok_or(CodecError::Truncated)?;
        let len = buf.get_i32_checked().ok_or(CodecError::Truncated)?;
        if len == -1 {
            values.push(Value::Nothing);
            continue;
        }
        let len = usize::try_from(len).map_err(|_| CodecError::Malformed(format!("invalid element length {len}")))?;
        let data = buf.get_bytes_checked(len).ok_or(CodecError::Truncated)?;
        values.push(codec.decode(data)?);
    }

    if !buf.is_empty() {
        return Err(CodecError::Trailing);
    }
    Ok(values)
}

fn arg_count(expected: usize, got: usize) -> Result<(), CodecError> {
    if expected == got {
        return Ok(());
    }
    let s = if expected == 1 { "" } else { "s" };
    Err(CodecError::InvalidArgument(format!("expected {expected} argument{s}, got {got}")))
}

/// Encode positional arguments with one codec per argument.
fn encode_positional(codecs: &[Arc<dyn Codec>], args: &QueryArgs) -> Result<Bytes, CodecError> {
    let values: &[Value] = match args {
        QueryArgs::None => &[],
        QueryArgs::Positional(values) => values,
        QueryArgs::Named(_) => {
            return Err(CodecError::InvalidArgument(
                "expected positional arguments, got named arguments".into(),
            ));
        }
    };
    arg_count(codecs.len(), values.len())?;

    let mut buf = BytesMut::new();
    encode_elements(&mut buf, codecs.iter().zip(values))?;
    Ok(buf.freeze())
}

/// Codec of the input of statement without arguments.
#[derive(Debug, Default, Clone)]
pub struct EmptyTupleCodec;

impl Codec for EmptyTupleCodec {
    fn type_id(&self) -> Uuid {
        EMPTY_TUPLE_CODEC_ID
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Tuple(v) if v.is_empty() => {
                buf.put_i32(4);
                buf.put_i32(0);
                Ok(())
            }
            value => Err(CodecError::invalid("empty tuple", value)),
        }
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        decode_elements(buf, &[]).map(Value::Tuple)
    }

    fn encode_args(&self, args: &QueryArgs) -> Result<Bytes, CodecError> {
        if !args.is_empty() {
            return Err(CodecError::InvalidArgument("this query does not expect any arguments".into()));
        }
        Ok(Bytes::from_static(&[0, 0, 0, 4, 0, 0, 0, 0]))
    }
}

/// Codec of statement that does not return data.
#[derive(Debug, Default, Clone)]
pub struct NullCodec;

impl Codec for NullCodec {
    fn type_id(&self) -> Uuid {
        NULL_CODEC_ID
    }

    fn encode(&self, _: &mut BytesMut, _: &Value) -> Result<(), CodecError> {
        Err(CodecError::InvalidArgument("null codec cannot be used to encode data".into()))
    }

    fn decode(&self, _: Bytes) -> Result<Value, CodecError> {
        Err(CodecError::Malformed("null codec cannot be used to decode data".into()))
    }
}

#[derive(Debug)]
pub struct TupleCodec {
    id: Uuid,
    subcodecs: Vec<Arc<dyn Codec>>,
}

impl TupleCodec {
    pub fn new(id: Uuid, subcodecs: Vec<Arc<dyn Codec>>) -> Self {
        Self { id, subcodecs }
    }
}

impl Codec for TupleCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        let Value::Tuple(values) = value else {
            return Err(CodecError::invalid("tuple", value));
        };
        if values.len() != self.subcodecs.len() {
            return Err(CodecError::InvalidArgument(format!(
                "tuple length mismatch, expected {}, got {}",
                self.subcodecs.len(),
                values.len()
            )));
        }
        encode_elements(buf, self.subcodecs.iter().zip(values))
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        decode_elements(buf, &self.subcodecs).map(Value::Tuple)
    }

    fn encode_args(&self, args: &QueryArgs) -> Result<Bytes, CodecError> {
        encode_positional(&self.subcodecs, args)
    }
}

#[derive(Debug)]
pub struct NamedTupleCodec {
    id: Uuid,
    subcodecs: Vec<Arc<dyn Codec>>,
    names: Vec<String>,
}

impl NamedTupleCodec {
    pub fn new(id: Uuid, subcodecs: Vec<Arc<dyn Codec>>, names: Vec<String>) -> Self {
        Self { id, subcodecs, names }
    }
}

impl Codec for NamedTupleCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        let Value::NamedTuple(fields) = value else {
            return Err(CodecError::invalid("named tuple", value));
        };
        let values = fields_by_name(&self.names, fields)?;
        encode_elements(buf, self.subcodecs.iter().zip(values))
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        let values = decode_elements(buf, &self.subcodecs)?;
        Ok(Value::NamedTuple(self.names.iter().cloned().zip(values).collect()))
    }
}

/// Reorder `fields` following `names`, absent names are [`Value::Nothing`].
fn fields_by_name<'a>(names: &[String], fields: &'a [(String, Value)]) -> Result<Vec<&'a Value>, CodecError> {
    let unused = fields
        .iter()
        .filter(|(name, _)| !names.contains(name))
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>();
    if !unused.is_empty() {
        return Err(CodecError::InvalidArgument(format!(
            "unused named argument(s): {}",
            unused.join(", ")
        )));
    }

    static NOTHING: Value = Value::Nothing;
    Ok(names
        .iter()
        .map(|name| fields.iter().find(|(n, _)| n == name).map_or(&NOTHING, |(_, v)| v))
        .collect())
}

/// Codec of objects, also describes statement arguments.
#[derive(Debug)]
pub struct ObjectCodec {
    id: Uuid,
    subcodecs: Vec<Arc<dyn Codec>>,
    names: Vec<String>,
}

impl ObjectCodec {
    pub fn new(id: Uuid, subcodecs: Vec<Arc<dyn Codec>>, names: Vec<String>) -> Self {
        Self { id, subcodecs, names }
    }

    /// Arguments named `0`, `1`, ... are positional.
    fn is_positional(&self) -> bool {
        self.names.first().is_some_and(|name| name == "0")
    }
}

impl Codec for ObjectCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, _: &mut BytesMut, _: &Value) -> Result<(), CodecError> {
        Err(CodecError::InvalidArgument("objects cannot be passed as arguments".into()))
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        let values = decode_elements(buf, &self.subcodecs)?;
        Ok(Value::Object(self.names.iter().cloned().zip(values).collect()))
    }

    fn encode_args(&self, args: &QueryArgs) -> Result<Bytes, CodecError> {
        if self.is_positional() {
            return encode_positional(&self.subcodecs, args);
        }

        let fields: &[(String, Value)] = match args {
            QueryArgs::Named(fields) => fields,
            QueryArgs::None if self.names.is_empty() => &[],
            _ => {
                return Err(CodecError::InvalidArgument(
                    "expected named arguments, got positional arguments".into(),
                ));
            }
        };
        let values = fields_by_name(&self.names, fields)?;

        let mut buf = BytesMut::new();
        encode_elements(&mut buf, self.subcodecs.iter().zip(values))?;
        Ok(buf.freeze())
    }
}

/// Array and set data layout, `ndims`, `flags`, `reserved`,
/// then `len` and `lower bound` of the only dimension.
fn decode_array(mut buf: Bytes, subcodec: &dyn Codec, dim_len: Option<i32>) -> Result<Vec<Value>, CodecError> {
    let ndims = buf.get_i32_checked().ok_or(CodecError::Truncated)?;
    buf.get_bytes_checked(8).ok_or(CodecError::Truncated)?;
    match ndims {
        0 => return Ok(vec![]),
        1 => {}
        _ => return Err(CodecError::MultiDimensional),
    }

    let len = buf.get_i32_checked().ok_or(CodecError::Truncated)?;
    if let Some(expected) = dim_len.filter(|n| *n != -1) {
        if expected != len {
            return Err(CodecError::Malformed(format!(
                "invalid array size: received {len}, expected {expected}"
            )));
        }
    }
    buf.get_i32_checked().ok_or(CodecError::Truncated)?;

    let len = usize::try_from(len).map_err(|_| CodecError::Malformed(format!("invalid array size {len}")))?;
    // every element carries at least its 4 byte length
    let mut values = Vec::with_capacity(len.min(buf.len() / 4));
    for _ in 0..len {
        let Some(data) = buf.get_len_prefixed_checked() else {
            return Err(CodecError::Truncated);
        };
        values.push(subcodec.decode(data)?);
    }

    if !buf.is_empty() {
        return Err(CodecError::Trailing);
    }
    Ok(values)
}

#[derive(Debug)]
pub struct ArrayCodec {
    id: Uuid,
    subcodec: Arc<dyn Codec>,
    len: i32,
}

impl ArrayCodec {
    pub fn new(id: Uuid, subcodec: Arc<dyn Codec>, len: i32) -> Self {
        Self { id, subcodec, len }
    }
}

impl Codec for ArrayCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        let Value::Array(values) = value else {
            return Err(CodecError::invalid("array", value));
        };

        let pos = begin_len(buf);
        buf.put_i32(1); // ndims
        buf.put_i32(0); // flags
        buf.put_i32(0); // reserved
        buf.put_i32(values.len().to_u32() as i32);
        buf.put_i32(1); // lower bound
        for value in values {
            match value {
                Value::Nothing => {
                    return Err(CodecError::InvalidArgument("a null element is not allowed in an array".into()));
                }
                value => self.subcodec.encode(buf, value)?,
            }
        }
        end_len(buf, pos);
        Ok(())
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        decode_array(buf, &*self.subcodec, Some(self.len)).map(Value::Array)
    }
}

#[derive(Debug)]
pub struct SetCodec {
    id: Uuid,
    subcodec: Arc<dyn Codec>,
}

impl SetCodec {
    pub fn new(id: Uuid, subcodec: Arc<dyn Codec>) -> Self {
        Self { id, subcodec }
    }
}

impl Codec for SetCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, _: &mut BytesMut, _: &Value) -> Result<(), CodecError> {
        Err(CodecError::InvalidArgument("sets cannot be passed as arguments".into()))
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        decode_array(buf, &*self.subcodec, None).map(Value::Set)
    }
}

/// Enum values travel as strings.
#[derive(Debug)]
pub struct EnumCodec {
    id: Uuid,
    members: Vec<String>,
}

impl EnumCodec {
    pub fn new(id: Uuid, members: Vec<String>) -> Self {
        Self { id, members }
    }
}

impl Codec for EnumCodec {
    fn type_id(&self) -> Uuid {
        self.id
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
        let (Value::Enum(s) | Value::Str(s)) = value else {
            return Err(CodecError::invalid("enum", value));
        };
        if !self.members.contains(s) {
            return Err(CodecError::InvalidArgument(format!(
                "`{s}` is not a member of enum, expected one of {}",
                self.members.join(", ")
            )));
        }
        buf.put_u32(s.len().to_u32());
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn decode(&self, buf: Bytes) -> Result<Value, CodecError> {
        String::from_utf8(buf.to_vec())
            .map(Value::Enum)
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

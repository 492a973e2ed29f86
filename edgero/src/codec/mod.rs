//! Value codecs.
//!
//! Every type the server sends or receives is identified by a type descriptor
//! id. [`CodecRegistry`] maps those ids to a [`Codec`], building new codecs
//! from type descriptors when needed.
use bytes::{Bytes, BytesMut};
use std::fmt;

use crate::{ErrorKind, common::Uuid, value::Value};

mod scalar;
mod container;
mod registry;

pub use scalar::ScalarCodec;
pub use container::{ArrayCodec, EmptyTupleCodec, EnumCodec, NamedTupleCodec, NullCodec, ObjectCodec, SetCodec, TupleCodec};
pub use registry::CodecRegistry;

/// Type id of statement without input or output.
pub const NULL_CODEC_ID: Uuid = Uuid::from_u16(0);

/// Type id of the empty tuple, the input of statement without arguments.
pub const EMPTY_TUPLE_CODEC_ID: Uuid = Uuid::from_u16(0xff);

/// A type that can encode and decode one type of [`Value`].
pub trait Codec: fmt::Debug + Send + Sync {
    /// Returns the type descriptor id.
    fn type_id(&self) -> Uuid;

    /// Write `value` prefixed with its `i32` length.
    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<(), CodecError>;

    /// Decode one element, `buf` contains exactly the element data.
    fn decode(&self, buf: Bytes) -> Result<Value, CodecError>;

    /// Encode statement arguments, prefixed with its `i32` length.
    ///
    /// Only codecs describing statement input support this.
    fn encode_args(&self, args: &QueryArgs) -> Result<Bytes, CodecError> {
        let _ = args;
        Err(CodecError::NotInput(self.type_id()))
    }
}

/// Statement arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryArgs {
    #[default]
    None,
    /// Arguments referenced as `$0`, `$1`, ...
    Positional(Vec<Value>),
    /// Arguments referenced by name.
    Named(Vec<(String, Value)>),
}

impl QueryArgs {
    pub fn is_empty(&self) -> bool {
        match self {
            QueryArgs::None => true,
            QueryArgs::Positional(v) => v.is_empty(),
            QueryArgs::Named(v) => v.is_empty(),
        }
    }
}

impl From<Vec<Value>> for QueryArgs {
    fn from(value: Vec<Value>) -> Self {
        QueryArgs::Positional(value)
    }
}

impl From<Vec<(String, Value)>> for QueryArgs {
    fn from(value: Vec<(String, Value)>) -> Self {
        QueryArgs::Named(value)
    }
}

impl From<()> for QueryArgs {
    fn from(_: ()) -> Self {
        QueryArgs::None
    }
}

/// An error when encoding, decoding or building codecs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("unexpected end of data")]
    Truncated,
    #[error("unexpected trailing data")]
    Trailing,
    #[error("{0}")]
    Malformed(String),
    #[error("type descriptor {0} cannot be used to encode arguments")]
    NotInput(Uuid),
    #[error("no codec implementation for EdgeDB data class {0}")]
    UnknownDescriptor(u8),
    #[error("could not build a codec for {0} type")]
    Unsupported(Uuid),
    #[error("could not build {0} codec: missing subcodec")]
    MissingSubcodec(&'static str),
    #[error("cannot handle arrays with more than one dimension")]
    MultiDimensional,
    #[error("could not build a codec")]
    Empty,
}

impl CodecError {
    /// Returns the [`ErrorKind`] this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::InvalidArgument(_) => ErrorKind::QueryArgument,
            CodecError::Truncated | CodecError::Trailing | CodecError::Malformed(_) => ErrorKind::BinaryProtocol,
            _ => ErrorKind::InternalClient,
        }
    }

    pub(crate) fn invalid(expected: &str, value: &Value) -> CodecError {
        CodecError::InvalidArgument(format!("a {expected} was expected, got {}", value.kind()))
    }
}

use bytes::Bytes;
use lru::LruCache;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
};

use super::{
    ArrayCodec, Codec, CodecError, EMPTY_TUPLE_CODEC_ID, EmptyTupleCodec, EnumCodec, NULL_CODEC_ID,
    NamedTupleCodec, NullCodec, ObjectCodec, ScalarCodec, SetCodec, TupleCodec,
};
use crate::{common::Uuid, ext::BytesExt};

const CODECS_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

const CTYPE_SET: u8 = 0;
const CTYPE_SHAPE: u8 = 1;
const CTYPE_BASE_SCALAR: u8 = 2;
const CTYPE_SCALAR: u8 = 3;
const CTYPE_TUPLE: u8 = 4;
const CTYPE_NAMEDTUPLE: u8 = 5;
const CTYPE_ARRAY: u8 = 6;
const CTYPE_ENUM: u8 = 7;

/// Shape element flag of link properties.
const LINK_PROPERTY: u8 = 1 << 1;

/// Shared codec registry.
///
/// Cloning registry is cheap and share the same cache.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    known: Arc<HashMap<Uuid, Arc<dyn Codec>>>,
    cache: Arc<Mutex<LruCache<Uuid, Arc<dyn Codec>>>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        let mut known = HashMap::<Uuid, Arc<dyn Codec>>::new();
        for codec in ScalarCodec::all() {
            known.insert(codec.type_id(), Arc::new(codec));
        }
        known.insert(EMPTY_TUPLE_CODEC_ID, Arc::new(EmptyTupleCodec));
        known.insert(NULL_CODEC_ID, Arc::new(NullCodec));

        Self {
            known: Arc::new(known),
            cache: Arc::new(Mutex::new(LruCache::new(CODECS_CACHE_SIZE))),
        }
    }

    /// Returns codec of given type id if it is known.
    pub fn get(&self, id: &Uuid) -> Option<Arc<dyn Codec>> {
        if let Some(codec) = self.known.get(id) {
            return Some(codec.clone());
        }
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Returns `true` if given type id has a codec.
    pub fn has(&self, id: &Uuid) -> bool {
        self.known.contains_key(id) || self.cache.lock().unwrap_or_else(PoisonError::into_inner).contains(id)
    }

    fn insert(&self, codec: Arc<dyn Codec>) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(codec.type_id(), codec);
    }

    /// Build codec from type descriptors, the last descriptor is the result.
    ///
    /// Every codec built is registered.
    pub fn build_codec(&self, spec: &[u8]) -> Result<Arc<dyn Codec>, CodecError> {
        let mut buf = Bytes::copy_from_slice(spec);
        let mut codecs: Vec<Arc<dyn Codec>> = vec![];
        let mut last = None;

        while !buf.is_empty() {
            let ctype = buf.get_u8_checked().ok_or(CodecError::Truncated)?;
            let tid = buf.get_uuid_checked().ok_or(CodecError::Truncated)?;

            if (0xf0..=0xff).contains(&ctype) {
                // type annotation
                let len = buf.get_u32_checked().ok_or(CodecError::Truncated)?;
                buf.get_bytes_checked(len as usize).ok_or(CodecError::Truncated)?;
                continue;
            }

            let descriptor = Descriptor::parse(ctype, &mut buf)?;
            let codec = match self.get(&tid) {
                Some(codec) => codec,
                None => {
                    let codec = descriptor.build(tid, &codecs)?;
                    self.insert(codec.clone());
                    codec
                }
            };

            codecs.push(codec.clone());
            last = Some(codec);
        }

        last.ok_or(CodecError::Empty)
    }
}

/// Parsed type descriptor body, positions refer to preceding descriptors.
enum Descriptor {
    Set(u16),
    Shape(Vec<(u8, String, u16)>),
    BaseScalar,
    Scalar(u16),
    Tuple(Vec<u16>),
    NamedTuple(Vec<(String, u16)>),
    Array(u16, i32),
    Enum(Vec<String>),
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = buf.get_len_prefixed_checked().ok_or(CodecError::Truncated)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Malformed(e.to_string()))
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    buf.get_u16_checked().ok_or(CodecError::Truncated)
}

impl Descriptor {
    fn parse(ctype: u8, buf: &mut Bytes) -> Result<Descriptor, CodecError> {
        let desc = match ctype {
            CTYPE_SET => Descriptor::Set(get_u16(buf)?),
            CTYPE_SHAPE => {
                let count = get_u16(buf)?;
                let mut elements = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let flag = buf.get_u8_checked().ok_or(CodecError::Truncated)?;
                    let name = get_string(buf)?;
                    let pos = get_u16(buf)?;
                    elements.push((flag, name, pos));
                }
                Descriptor::Shape(elements)
            }
            CTYPE_BASE_SCALAR => Descriptor::BaseScalar,
            CTYPE_SCALAR => Descriptor::Scalar(get_u16(buf)?),
            CTYPE_TUPLE => {
                let count = get_u16(buf)?;
                let positions = (0..count).map(|_| get_u16(buf)).collect::<Result<_, _>>()?;
                Descriptor::Tuple(positions)
            }
            CTYPE_NAMEDTUPLE => {
                let count = get_u16(buf)?;
                let mut elements = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let name = get_string(buf)?;
                    elements.push((name, get_u16(buf)?));
                }
                Descriptor::NamedTuple(elements)
            }
            CTYPE_ARRAY => {
                let pos = get_u16(buf)?;
                let dims = get_u16(buf)?;
                if dims != 1 {
                    return Err(CodecError::MultiDimensional);
                }
                let len = buf.get_i32_checked().ok_or(CodecError::Truncated)?;
                Descriptor::Array(pos, len)
            }
            CTYPE_ENUM => {
                let count = get_u16(buf)?;
                let members = (0..count).map(|_| get_string(buf)).collect::<Result<_, _>>()?;
                Descriptor::Enum(members)
            }
            ctype => return Err(CodecError::UnknownDescriptor(ctype)),
        };
        Ok(desc)
    }

    fn build(self, tid: Uuid, codecs: &[Arc<dyn Codec>]) -> Result<Arc<dyn Codec>, CodecError> {
        let sub = |pos: u16, name: &'static str| {
            codecs.get(usize::from(pos)).cloned().ok_or(CodecError::MissingSubcodec(name))
        };

        let codec: Arc<dyn Codec> = match self {
            Descriptor::Set(pos) => Arc::new(SetCodec::new(tid, sub(pos, "set")?)),
            Descriptor::Shape(elements) => {
                let mut subcodecs = Vec::with_capacity(elements.len());
                let mut names = Vec::with_capacity(elements.len());
                for (flag, name, pos) in elements {
                    subcodecs.push(sub(pos, "object")?);
                    names.push(match flag & LINK_PROPERTY {
                        0 => name,
                        _ => format!("@{name}"),
                    });
                }
                Arc::new(ObjectCodec::new(tid, subcodecs, names))
            }
            Descriptor::BaseScalar => Arc::new(ScalarCodec::base(tid).ok_or(CodecError::Unsupported(tid))?),
            Descriptor::Scalar(pos) => {
                // derived scalars are only built from well known base scalars
                let base = sub(pos, "scalar")?.type_id();
                let base = ScalarCodec::base(base).ok_or(CodecError::Unsupported(base))?;
                Arc::new(base.derive(tid))
            }
            Descriptor::Tuple(positions) if positions.is_empty() => Arc::new(EmptyTupleCodec),
            Descriptor::Tuple(positions) => {
                let subcodecs = positions.into_iter().map(|pos| sub(pos, "tuple")).collect::<Result<_, _>>()?;
                Arc::new(TupleCodec::new(tid, subcodecs))
            }
            Descriptor::NamedTuple(elements) => {
                let mut subcodecs = Vec::with_capacity(elements.len());
                let mut names = Vec::with_capacity(elements.len());
                for (name, pos) in elements {
                    subcodecs.push(sub(pos, "named tuple")?);
                    names.push(name);
                }
                Arc::new(NamedTupleCodec::new(tid, subcodecs, names))
            }
            Descriptor::Array(pos, len) => Arc::new(ArrayCodec::new(tid, sub(pos, "array")?, len)),
            Descriptor::Enum(members) => Arc::new(EnumCodec::new(tid, members)),
        };
        Ok(codec)
    }
}

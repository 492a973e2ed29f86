use bytes::{Buf, BufMut, Bytes};

use crate::common::Uuid;

/// Integer signess in protocol docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while the protocol want `u32`,
    /// this will panic when overflow instead of wrapping.
    fn to_u32(self) -> u32;
    /// Length is `usize` in rust, while the protocol want `u16`,
    /// this will panic when overflow instead of wrapping.
    fn to_u16(self) -> u16;
}

/// Length prefixed operation in [`BufMut`].
pub trait BufMutExt {
    /// Write `u32` length then the bytes.
    fn put_len_prefixed(&mut self, bytes: &[u8]);
}

/// Checked read operation in [`Bytes`].
///
/// Returns [`None`] if there is not enough remaining bytes.
pub trait BytesExt {
    /// Read `i32` length then the bytes, negative length returns [`None`].
    fn get_len_prefixed_checked(&mut self) -> Option<Bytes>;

    fn get_bytes_checked(&mut self, len: usize) -> Option<Bytes>;

    fn get_u8_checked(&mut self) -> Option<u8>;

    fn get_u16_checked(&mut self) -> Option<u16>;

    fn get_i32_checked(&mut self) -> Option<i32>;

    fn get_u32_checked(&mut self) -> Option<u32>;

    fn get_uuid_checked(&mut self) -> Option<Uuid>;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_len_prefixed(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len().to_u32());
        self.put_slice(bytes);
    }
}

macro_rules! get_checked {
    ($name:ident, $ty:ty, $get:ident) => {
        fn $name(&mut self) -> Option<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return None;
            }
            Some(self.$get())
        }
    };
}

impl BytesExt for Bytes {
    fn get_len_prefixed_checked(&mut self) -> Option<Bytes> {
        let len = usize::try_from(self.get_i32_checked()?).ok()?;
        self.get_bytes_checked(len)
    }

    fn get_bytes_checked(&mut self, len: usize) -> Option<Bytes> {
        if self.remaining() < len {
            return None;
        }
        Some(self.split_to(len))
    }

    get_checked!(get_u8_checked, u8, get_u8);
    get_checked!(get_u16_checked, u16, get_u16);
    get_checked!(get_i32_checked, i32, get_i32);
    get_checked!(get_u32_checked, u32, get_u32);

    fn get_uuid_checked(&mut self) -> Option<Uuid> {
        let mut id = [0u8; 16];
        if self.remaining() < id.len() {
            return None;
        }
        self.copy_to_slice(&mut id);
        Some(Uuid::from_bytes(id))
    }
}

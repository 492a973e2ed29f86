//! Message framing.
//!
//! Every message is `[u8 type][i32 length][payload]`, where length counts
//! itself but not the type byte.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{common::Uuid, ext::UsizeExt};

/// Buffered bytes at which [`ReadMessageBuffer::feed`] asks the reader to pause.
pub const HIGH_WATER_MARK: usize = 1024 * 1024;

/// Buffered bytes which is considered overflow.
const MAX_BUFFERED: usize = 64 * HIGH_WATER_MARK;

/// Largest accepted frame, leaves room for one more read chunk under [`MAX_BUFFERED`].
const MAX_MESSAGE_LEN: usize = MAX_BUFFERED - HIGH_WATER_MARK;

const DEFAULT_BUF_CAPACITY: usize = 4096;

/// An error when reading or writing message frames.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("cannot {0}: no current message")]
    NoMessage(&'static str),
    #[error("cannot {0}: the previous message is not finished")]
    MessageInProgress(&'static str),
    #[error("buffer overread")]
    Overread,
    #[error("cannot finish message: unread data in message `{}`", *.0 as char)]
    UnreadData(u8),
    #[error("invalid message length: {0}")]
    InvalidLength(i32),
    #[error("query result is too big: buffer overflow")]
    Overflow,
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Buffer to construct outgoing message frames.
///
/// Field writers are only valid between [`begin_message`][Self::begin_message]
/// and [`end_message`][Self::end_message].
#[derive(Debug, Default)]
pub struct WriteMessageBuffer {
    buf: BytesMut,
    message_pos: Option<usize>,
}

macro_rules! write_field {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $put:ident, $op:literal) => {
        $(#[$doc])*
        pub fn $name(&mut self, value: $ty) -> Result<&mut Self, BufferError> {
            self.ensure_message($op)?;
            self.buf.$put(value);
            Ok(self)
        }
    };
}

impl WriteMessageBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY), message_pos: None }
    }

    /// Returns `true` if there is no bytes written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    fn ensure_message(&self, op: &'static str) -> Result<(), BufferError> {
        match self.message_pos {
            Some(_) => Ok(()),
            None => Err(BufferError::NoMessage(op)),
        }
    }

    /// Start a new message frame.
    pub fn begin_message(&mut self, mtype: u8) -> Result<&mut Self, BufferError> {
        if self.message_pos.is_some() {
            return Err(BufferError::MessageInProgress("begin message"));
        }
        self.message_pos = Some(self.buf.len());
        self.buf.put_u8(mtype);
        // length, backpatched in `end_message`
        self.buf.put_i32(0);
        Ok(self)
    }

    /// Finish current message frame by writing its length.
    pub fn end_message(&mut self) -> Result<&mut Self, BufferError> {
        let Some(pos) = self.message_pos.take() else {
            return Err(BufferError::NoMessage("end message"));
        };
        let len = (self.buf.len() - pos - 1).to_u32();
        self.buf[pos + 1..pos + 5].copy_from_slice(&len.to_be_bytes());
        Ok(self)
    }

    write_field!(write_char, u8, put_u8, "write char");
    write_field!(write_i16, i16, put_i16, "write i16");
    write_field!(write_u16, u16, put_u16, "write u16");
    write_field!(write_i32, i32, put_i32, "write i32");
    write_field!(write_u32, u32, put_u32, "write u32");
    write_field!(write_u64, u64, put_u64, "write u64");

    /// Write `u32` length prefixed utf-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self, BufferError> {
        self.write_len_prefixed(value.as_bytes())
    }

    /// Write `u32` length prefixed bytes.
    pub fn write_len_prefixed(&mut self, value: &[u8]) -> Result<&mut Self, BufferError> {
        self.ensure_message("write bytes")?;
        self.buf.put_u32(value.len().to_u32());
        self.buf.put_slice(value);
        Ok(self)
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self, BufferError> {
        self.ensure_message("write bytes")?;
        self.buf.put_slice(value);
        Ok(self)
    }

    pub fn write_uuid(&mut self, value: &Uuid) -> Result<&mut Self, BufferError> {
        self.write_bytes(value.as_bytes())
    }

    /// Write `u16` count followed by `(u16 key, u32 length prefixed value)` pairs.
    pub fn write_headers(&mut self, headers: &[(u16, &[u8])]) -> Result<&mut Self, BufferError> {
        self.ensure_message("write headers")?;
        self.buf.put_u16(headers.len().to_u16());
        for (key, value) in headers {
            self.buf.put_u16(*key);
            self.buf.put_u32(value.len().to_u32());
            self.buf.put_slice(value);
        }
        Ok(self)
    }

    /// Write a complete `Sync` message.
    pub fn write_sync(&mut self) -> Result<&mut Self, BufferError> {
        self.begin_message(b'S')?.end_message()
    }

    /// Returns all complete messages as one buffer.
    ///
    /// Returns error if a message is still in progress.
    pub fn take(&mut self) -> Result<BytesMut, BufferError> {
        if self.message_pos.is_some() {
            return Err(BufferError::MessageInProgress("take buffer"));
        }
        Ok(self.buf.split())
    }
}

#[derive(Debug)]
struct Current {
    mtype: u8,
    payload: Bytes,
}

/// Buffer to reassemble incoming message frames from arbitrary chunks.
#[derive(Debug, Default)]
pub struct ReadMessageBuffer {
    buf: BytesMut,
    current: Option<Current>,
}

macro_rules! read_field {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $get:ident) => {
        $(#[$doc])*
        pub fn $name(&mut self) -> Result<$ty, BufferError> {
            let payload = self.payload(size_of::<$ty>())?;
            Ok(payload.$get())
        }
    };
}

impl ReadMessageBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY), current: None }
    }

    /// Returns the length of buffered bytes which is not yet taken as a message.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append bytes read from the socket.
    ///
    /// Returns `true` when the reader should pause reading until buffered
    /// messages are drained.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<bool, BufferError> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_BUFFERED {
            return Err(BufferError::Overflow);
        }
        Ok(self.buf.len() >= HIGH_WATER_MARK)
    }

    /// Try to take the next complete message as the current message.
    ///
    /// Returns `true` if there is a current message, partial frame is never taken.
    pub fn take_message(&mut self) -> Result<bool, BufferError> {
        if self.current.is_some() {
            return Ok(true);
        }

        let Some(mut header) = self.buf.get(..5) else {
            return Ok(false);
        };

        let mtype = header.get_u8();
        let len = header.get_i32();

        if len < 4 {
            return Err(BufferError::InvalidLength(len));
        }
        if len as usize > MAX_MESSAGE_LEN {
            return Err(BufferError::Overflow);
        }

        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(false);
        }

        let mut payload = self.buf.split_to(total).freeze();
        payload.advance(5);
        self.current = Some(Current { mtype, payload });
        Ok(true)
    }

    /// Take the next message only if it has the given type.
    pub fn take_message_type(&mut self, mtype: u8) -> Result<bool, BufferError> {
        match &self.current {
            Some(current) => Ok(current.mtype == mtype),
            None => match self.buf.first() {
                Some(&next) if next == mtype => self.take_message(),
                _ => Ok(false),
            },
        }
    }

    /// Returns current message type.
    pub fn message_type(&self) -> Option<u8> {
        self.current.as_ref().map(|c| c.mtype)
    }

    /// Returns unread length of current message.
    pub fn unread(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.payload.len())
    }

    fn payload(&mut self, size: usize) -> Result<&mut Bytes, BufferError> {
        let Some(current) = self.current.as_mut() else {
            return Err(BufferError::NoMessage("read"));
        };
        if current.payload.len() < size {
            return Err(BufferError::Overread);
        }
        Ok(&mut current.payload)
    }

    read_field!(read_char, u8, get_u8);
    read_field!(read_i16, i16, get_i16);
    read_field!(read_u16, u16, get_u16);
    read_field!(read_i32, i32, get_i32);
    read_field!(read_u32, u32, get_u32);
    read_field!(read_u64, u64, get_u64);

    /// Read exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BufferError> {
        Ok(self.payload(len)?.split_to(len))
    }

    /// Read `u32` length prefixed bytes.
    pub fn read_len_prefixed(&mut self) -> Result<Bytes, BufferError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read `u32` length prefixed utf-8 string.
    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let bytes = self.read_len_prefixed()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, BufferError> {
        let mut id = [0u8; 16];
        self.payload(16)?.copy_to_slice(&mut id);
        Ok(Uuid::from_bytes(id))
    }

    /// Consume the rest of current message.
    pub fn consume_message(&mut self) -> Result<Bytes, BufferError> {
        match self.current.take() {
            Some(current) => Ok(current.payload),
            None => Err(BufferError::NoMessage("consume message")),
        }
    }

    /// Finish current message, asserting all payload is read.
    pub fn finish_message(&mut self) -> Result<(), BufferError> {
        match self.current.take() {
            Some(current) if !current.payload.is_empty() => Err(BufferError::UnreadData(current.mtype)),
            _ => Ok(()),
        }
    }

    /// Skip current message regardless of unread payload.
    pub fn discard_message(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_sample() -> BytesMut {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'P').unwrap()
            .write_headers(&[(0xff04, &[1, 2, 3][..])]).unwrap()
            .write_char(b'b').unwrap()
            .write_i16(-7).unwrap()
            .write_string("select 1").unwrap()
            .end_message().unwrap();
        wb.write_sync().unwrap();
        wb.begin_message(b'E').unwrap()
            .write_u32(0xdead_beef).unwrap()
            .write_len_prefixed(b"").unwrap()
            .end_message().unwrap();
        wb.take().unwrap()
    }

    fn read_sample(rb: &mut ReadMessageBuffer) {
        assert_eq!(rb.message_type(), Some(b'P'));
        assert_eq!(rb.read_u16().unwrap(), 1);
        assert_eq!(rb.read_u16().unwrap(), 0xff04);
        assert_eq!(&rb.read_len_prefixed().unwrap()[..], &[1, 2, 3]);
        assert_eq!(rb.read_char().unwrap(), b'b');
        assert_eq!(rb.read_i16().unwrap(), -7);
        assert_eq!(rb.read_string().unwrap(), "select 1");
        rb.finish_message().unwrap();
    }

    #[test]
    fn frame_layout() {
        let bytes = write_sample();
        assert_eq!(bytes[0], b'P');
        let len = i32::from_be_bytes(bytes[1..5].try_into().unwrap());
        // sync follows right after the parse frame
        assert_eq!(bytes[1 + len as usize], b'S');
        assert_eq!(&bytes[2 + len as usize..6 + len as usize], &[0, 0, 0, 4]);
    }

    #[test]
    fn split_chunks() {
        let bytes = write_sample();

        for chunk_size in [1, 2, 3, 5, 7, 64] {
            let mut rb = ReadMessageBuffer::new();
            let mut seen = vec![];

            for chunk in bytes.chunks(chunk_size) {
                rb.feed(chunk).unwrap();
                while rb.take_message().unwrap() {
                    match rb.message_type().unwrap() {
                        b'P' => read_sample(&mut rb),
                        b'S' => rb.finish_message().unwrap(),
                        b'E' => {
                            assert_eq!(rb.read_u32().unwrap(), 0xdead_beef);
                            assert!(rb.read_len_prefixed().unwrap().is_empty());
                            rb.finish_message().unwrap();
                        }
                        m => panic!("unexpected {m}"),
                    }
                    seen.push(chunk_size);
                }
            }

            assert_eq!(seen.len(), 3, "chunk size {chunk_size}");
            assert!(rb.is_empty());
        }
    }

    #[test]
    fn partial_frame_is_not_taken() {
        let bytes = write_sample();
        let mut rb = ReadMessageBuffer::new();
        rb.feed(&bytes[..8]).unwrap();
        assert!(!rb.take_message().unwrap());
        assert_eq!(rb.message_type(), None);
        rb.feed(&bytes[8..]).unwrap();
        assert!(rb.take_message().unwrap());
        assert!(rb.take_message_type(b'P').unwrap());
        assert!(!rb.take_message_type(b'S').unwrap());
    }

    #[test]
    fn write_without_message() {
        let mut wb = WriteMessageBuffer::new();
        assert!(matches!(wb.write_i32(1), Err(BufferError::NoMessage(_))));
        wb.begin_message(b'X').unwrap().end_message().unwrap();
        assert!(matches!(wb.write_string("late"), Err(BufferError::NoMessage(_))));
        assert!(matches!(wb.end_message(), Err(BufferError::NoMessage(_))));
        wb.begin_message(b'Q').unwrap();
        assert!(matches!(wb.begin_message(b'Q'), Err(BufferError::MessageInProgress(_))));
        assert!(matches!(wb.take(), Err(BufferError::MessageInProgress(_))));
    }

    #[test]
    fn read_past_boundary() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'Z').unwrap().write_i16(0).unwrap().end_message().unwrap();
        wb.begin_message(b'Z').unwrap().write_i16(0).unwrap().end_message().unwrap();

        let mut rb = ReadMessageBuffer::new();
        rb.feed(&wb.take().unwrap()).unwrap();
        assert!(rb.take_message().unwrap());
        assert!(matches!(rb.read_i32(), Err(BufferError::Overread)));
        rb.read_i16().unwrap();
        assert!(matches!(rb.read_char(), Err(BufferError::Overread)));
        rb.finish_message().unwrap();

        assert!(rb.take_message().unwrap());
        assert!(matches!(rb.finish_message(), Err(BufferError::UnreadData(b'Z'))));
    }

    #[test]
    fn discard_and_consume() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'L').unwrap().write_string("ignored").unwrap().end_message().unwrap();
        wb.begin_message(b'D').unwrap().write_bytes(b"raw").unwrap().end_message().unwrap();

        let mut rb = ReadMessageBuffer::new();
        rb.feed(&wb.take().unwrap()).unwrap();
        assert!(rb.take_message().unwrap());
        rb.discard_message();
        assert!(rb.take_message().unwrap());
        assert_eq!(&rb.consume_message().unwrap()[..], b"raw");
        assert!(!rb.take_message().unwrap());
    }

    #[test]
    fn malformed_length() {
        let mut rb = ReadMessageBuffer::new();
        rb.feed(&[b'Z', 0, 0, 0, 2]).unwrap();
        assert!(matches!(rb.take_message(), Err(BufferError::InvalidLength(2))));
    }

    #[test]
    fn feed_signals_pause() {
        let mut rb = ReadMessageBuffer::new();
        assert!(!rb.feed(&[0; 16]).unwrap());
        assert!(rb.feed(&vec![0; HIGH_WATER_MARK]).unwrap());
    }

    #[test]
    fn oversized_frame_header() {
        let mut rb = ReadMessageBuffer::new();
        rb.feed(&[b'D', 0x7f, 0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(rb.take_message(), Err(BufferError::Overflow)));
        assert!(rb.buf.capacity() < MAX_BUFFERED);
    }

    #[test]
    fn overflow_while_assembling() {
        let mut rb = ReadMessageBuffer::new();
        let len = (MAX_MESSAGE_LEN as i32).to_be_bytes();
        rb.feed(&[b'D', len[0], len[1], len[2], len[3]]).unwrap();
        assert!(!rb.take_message().unwrap());

        let chunk = vec![0; HIGH_WATER_MARK];
        let mut result = Ok(true);
        while result.is_ok() && rb.len() <= MAX_BUFFERED {
            result = rb.feed(&chunk);
        }
        assert!(matches!(result, Err(BufferError::Overflow)));
        assert_eq!(rb.message_type(), None);
    }
}

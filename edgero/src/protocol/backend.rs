//! Backend messages, sent by the server.
use bytes::Bytes;
use std::collections::HashMap;

use super::{
    Cardinality, ProtocolError, ProtocolVersion, TransactionStatus, auth,
    buffer::{BufferError, ReadMessageBuffer},
};
use crate::{Error, common::Uuid};

/// A type that can be decoded from backend message.
pub trait BackendProtocol: Sized {
    /// Decode the current message in `buf`, the message is not finished.
    fn decode(msgtype: u8, buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError>;

    /// Convert already decoded message.
    fn from_message(message: BackendMessage) -> Result<Self, ProtocolError>;
}

/// Backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    ServerHandshake(ServerHandshake),
    Authentication(Authentication),
    ServerKeyData(ServerKeyData),
    ParameterStatus(ParameterStatus),
    LogMessage(LogMessage),
    ErrorResponse(ErrorResponse),
    ReadyForCommand(ReadyForCommand),
    PrepareComplete(PrepareComplete),
    CommandDataDescription(CommandDataDescription),
    Data(Data),
    CommandComplete(CommandComplete),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, buf)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }

            fn from_message(message: BackendMessage) -> Result<Self, ProtocolError> {
                Ok(message)
            }
        }

        $(
            impl BackendProtocol for $name {
                fn decode(msgtype: u8, buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
                    if Self::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(Self::MSGTYPE, msgtype));
                    }
                    Self::decode_body(buf)
                }

                fn from_message(message: BackendMessage) -> Result<Self, ProtocolError> {
                    match message {
                        BackendMessage::$name(ok) => Ok(ok),
                        message => Err(ProtocolError::unexpected(Self::MSGTYPE, message.msgtype())),
                    }
                }
            }
        )*
    };
}

match_backend! {
    ServerHandshake,
    Authentication,
    ServerKeyData,
    ParameterStatus,
    LogMessage,
    ErrorResponse,
    ReadyForCommand,
    PrepareComplete,
    CommandDataDescription,
    Data,
    CommandComplete,
}

/// Read `u16` count followed by `(u16 key, u32 length prefixed value)` pairs.
pub(crate) fn read_headers(buf: &mut ReadMessageBuffer) -> Result<HashMap<u16, Bytes>, BufferError> {
    let count = buf.read_u16()?;
    let mut headers = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = buf.read_u16()?;
        let value = buf.read_len_prefixed()?;
        headers.insert(key, value);
    }
    Ok(headers)
}

fn read_cardinality(buf: &mut ReadMessageBuffer) -> Result<Cardinality, ProtocolError> {
    let ch = buf.read_char()?;
    Cardinality::from_char(ch).ok_or(ProtocolError::Cardinality(ch))
}

/// Server protocol version proposal.
#[derive(Debug)]
pub struct ServerHandshake {
    pub version: ProtocolVersion,
    pub extensions: HashMap<u16, Bytes>,
}

impl ServerHandshake {
    pub const MSGTYPE: u8 = b'v';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        let major = buf.read_u16()?;
        let minor = buf.read_u16()?;
        Ok(Self {
            version: ProtocolVersion::new(major, minor),
            extensions: read_headers(buf)?,
        })
    }
}

/// Authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Authentication was successful.
    Ok,
    /// SASL authentication is required.
    Sasl {
        /// Offered mechanisms, in the server order of preference.
        methods: Vec<String>,
    },
    /// SASL challenge.
    SaslContinue { data: String },
    /// SASL outcome.
    SaslFinal { data: String },
    /// Unsupported authentication method.
    Other { status: i32 },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        let auth = match buf.read_i32()? {
            auth::AUTH_OK => Authentication::Ok,
            auth::AUTH_SASL => {
                let count = buf.read_i32()?;
                let mut methods = Vec::new();
                for _ in 0..count {
                    methods.push(buf.read_string()?);
                }
                Authentication::Sasl { methods }
            }
            auth::AUTH_SASL_CONTINUE => Authentication::SaslContinue { data: buf.read_string()? },
            auth::AUTH_SASL_FINAL => Authentication::SaslFinal { data: buf.read_string()? },
            status => {
                buf.read_bytes(buf.unread())?;
                Authentication::Other { status }
            }
        };
        Ok(auth)
    }
}

/// Opaque session key issued by the server.
#[derive(Debug)]
pub struct ServerKeyData {
    pub data: Bytes,
}

impl ServerKeyData {
    pub const MSGTYPE: u8 = b'K';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self { data: buf.read_bytes(32)? })
    }
}

/// Server setting report.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: String,
    pub value: Bytes,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: buf.read_string()?,
            value: buf.read_len_prefixed()?,
        })
    }
}

/// Server log message, not related to the current operation.
#[derive(Debug)]
pub struct LogMessage {
    pub severity: u8,
    pub code: u32,
    pub text: String,
    pub attributes: HashMap<u16, Bytes>,
}

impl LogMessage {
    pub const MSGTYPE: u8 = b'L';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            severity: buf.read_char()?,
            code: buf.read_u32()?,
            text: buf.read_string()?,
            attributes: read_headers(buf)?,
        })
    }
}

/// Structured server error.
#[derive(Debug)]
pub struct ErrorResponse {
    pub severity: u8,
    pub code: u32,
    pub message: String,
    pub attributes: HashMap<u16, Bytes>,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            severity: buf.read_char()?,
            code: buf.read_u32()?,
            message: buf.read_string()?,
            attributes: read_headers(buf)?,
        })
    }

    pub fn into_error(self) -> Error {
        Error::from_server(self.code, self.message, self.attributes)
    }
}

/// Server is ready for the next command.
#[derive(Debug)]
pub struct ReadyForCommand {
    pub status: TransactionStatus,
}

impl ReadyForCommand {
    pub const MSGTYPE: u8 = b'Z';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        read_headers(buf)?;
        Ok(Self { status: TransactionStatus::from_char(buf.read_char()?) })
    }
}

/// Response to `Parse`.
#[derive(Debug)]
pub struct PrepareComplete {
    pub headers: HashMap<u16, Bytes>,
    pub cardinality: Cardinality,
    pub in_id: Uuid,
    pub out_id: Uuid,
}

impl PrepareComplete {
    pub const MSGTYPE: u8 = b'1';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            headers: read_headers(buf)?,
            cardinality: read_cardinality(buf)?,
            in_id: buf.read_uuid()?,
            out_id: buf.read_uuid()?,
        })
    }
}

/// Type descriptors of a statement.
#[derive(Debug)]
pub struct CommandDataDescription {
    pub headers: HashMap<u16, Bytes>,
    pub cardinality: Cardinality,
    pub in_id: Uuid,
    pub in_data: Bytes,
    pub out_id: Uuid,
    pub out_data: Bytes,
}

impl CommandDataDescription {
    pub const MSGTYPE: u8 = b'T';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            headers: read_headers(buf)?,
            cardinality: read_cardinality(buf)?,
            in_id: buf.read_uuid()?,
            in_data: buf.read_len_prefixed()?,
            out_id: buf.read_uuid()?,
            out_data: buf.read_len_prefixed()?,
        })
    }
}

/// One result element.
#[derive(Debug)]
pub struct Data {
    /// Element encoded with the statement output codec, without length prefix.
    pub data: Bytes,
}

impl Data {
    pub const MSGTYPE: u8 = b'D';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        let count = buf.read_u16()?;
        if count != 1 {
            return Err(ProtocolError::DataChunks(count));
        }
        Ok(Self { data: buf.read_len_prefixed()? })
    }
}

/// Statement completed.
#[derive(Debug)]
pub struct CommandComplete {
    pub headers: HashMap<u16, Bytes>,
    pub status: String,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    fn decode_body(buf: &mut ReadMessageBuffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            headers: read_headers(buf)?,
            status: buf.read_string()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, protocol::WriteMessageBuffer};

    fn read<B: BackendProtocol>(wb: &mut WriteMessageBuffer) -> B {
        let mut rb = ReadMessageBuffer::new();
        rb.feed(&wb.take().unwrap()).unwrap();
        assert!(rb.take_message().unwrap());
        let msgtype = rb.message_type().unwrap();
        let message = B::decode(msgtype, &mut rb).unwrap();
        rb.finish_message().unwrap();
        message
    }

    #[test]
    fn sasl_methods() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'R').unwrap()
            .write_i32(auth::AUTH_SASL).unwrap()
            .write_i32(2).unwrap()
            .write_string("SCRAM-SHA-1").unwrap()
            .write_string("SCRAM-SHA-256").unwrap()
            .end_message().unwrap();

        match read::<BackendMessage>(&mut wb) {
            BackendMessage::Authentication(Authentication::Sasl { methods }) => {
                assert_eq!(methods, ["SCRAM-SHA-1", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_response() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'E').unwrap()
            .write_char(120).unwrap()
            .write_u32(0x05_03_01_02).unwrap()
            .write_string("deadlock detected").unwrap()
            .write_headers(&[(0x0001, &b"hint"[..])]).unwrap()
            .end_message().unwrap();

        let err = read::<ErrorResponse>(&mut wb).into_error();
        assert_eq!(err.kind(), ErrorKind::TransactionDeadlock);
        assert_eq!(err.message(), "deadlock detected");
        assert_eq!(&err.attributes()[&0x0001][..], b"hint");
    }

    #[test]
    fn unexpected_message() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'Z').unwrap()
            .write_u16(0).unwrap()
            .write_char(b'T').unwrap()
            .end_message().unwrap();

        let message = read::<BackendMessage>(&mut wb);
        let err = CommandComplete::from_message(message).unwrap_err();
        assert_eq!(err.to_string(), "expected message `CommandComplete`, found `ReadyForCommand`");

        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'!').unwrap().end_message().unwrap();
        let mut rb = ReadMessageBuffer::new();
        rb.feed(&wb.take().unwrap()).unwrap();
        assert!(rb.take_message().unwrap());
        assert!(BackendMessage::decode(b'!', &mut rb).is_err());
    }

    #[test]
    fn sasl_method_count_overstated() {
        let mut wb = WriteMessageBuffer::new();
        wb.begin_message(b'R').unwrap()
            .write_i32(auth::AUTH_SASL).unwrap()
            .write_i32(i32::MAX).unwrap()
            .end_message().unwrap();

        let mut rb = ReadMessageBuffer::new();
        rb.feed(&wb.take().unwrap()).unwrap();
        assert!(rb.take_message().unwrap());
        let err = BackendMessage::decode(b'R', &mut rb).unwrap_err();
        assert!(matches!(err, ProtocolError::Buffer(BufferError::Overread)), "{err:?}");
    }
}

//! Protocol error
use std::fmt;

use super::{BackendMessage, BufferError, ProtocolVersion};
use crate::ErrorKind;

/// An error when translating messages from the server.
pub enum ProtocolError {
    Buffer(BufferError),
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnsupportedVersion(ProtocolVersion),
    UnsupportedAuth(i32),
    NoSaslMethods,
    UnsupportedSasl(Vec<String>),
    Cardinality(u8),
    DataChunks(u16),
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    /// Returns the [`ErrorKind`] this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Buffer(_) | Self::Cardinality(_) | Self::DataChunks(_) => ErrorKind::BinaryProtocol,
            Self::Unexpected { .. } => ErrorKind::UnexpectedMessage,
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedProtocolVersion,
            Self::UnsupportedAuth(_) | Self::NoSaslMethods | Self::UnsupportedSasl(_) => ErrorKind::Authentication,
        }
    }
}

impl From<BufferError> for ProtocolError {
    fn from(value: BufferError) -> Self {
        Self::Buffer(value)
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Buffer(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(err) => write!(f, "{err}"),
            Self::Unexpected { expect, found, phase } => {
                let name = BackendMessage::message_name(*found);
                match expect {
                    Some(m) => write!(
                        f,
                        "expected message `{}`, found `{name}`",
                        BackendMessage::message_name(*m),
                    )?,
                    None => write!(f, "unexpected message type {found} (`{}`, {name})", *found as char)?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "the server requested an unsupported version of the protocol {version}")
            }
            Self::UnsupportedAuth(status) => {
                write!(f, "unsupported authentication method requested by the server: {status}")
            }
            Self::NoSaslMethods => {
                f.write_str("the server requested SASL authentication but did not offer any methods")
            }
            Self::UnsupportedSasl(methods) => write!(
                f,
                "the server offered the following SASL authentication methods: {}, neither are supported.",
                methods.join(", "),
            ),
            Self::Cardinality(ch) => write!(f, "unknown cardinality `{}`", *ch as char),
            Self::DataChunks(count) => write!(f, "expected exactly one data chunk, found {count}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages() {
        let err = ProtocolError::UnsupportedSasl(vec!["SCRAM-SHA-1".into(), "PLAIN".into()]);
        assert_eq!(
            err.to_string(),
            "the server offered the following SASL authentication methods: SCRAM-SHA-1, PLAIN, neither are supported."
        );
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = ProtocolError::unexpected_phase(b'D', "handshake");
        assert_eq!(err.to_string(), "unexpected message type 68 (`D`, Data) in `handshake`");
        assert_eq!(err.kind(), ErrorKind::UnexpectedMessage);
    }
}

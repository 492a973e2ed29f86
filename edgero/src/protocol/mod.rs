//! EdgeDB binary protocol.
//!
//! Every message is framed as `[u8 type][i32 length][payload]`, see [`buffer`]
//! for the framing primitives, [`frontend`] for messages sent by the client
//! and [`backend`] for messages sent by the server.
use std::fmt;

pub mod buffer;
pub mod frontend;
pub mod backend;
mod error;

pub use buffer::{BufferError, ReadMessageBuffer, WriteMessageBuffer};
pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol};
pub use error::ProtocolError;

/// Protocol version requested by this client.
pub const PROTO_VER: ProtocolVersion = ProtocolVersion::new(0, 13);

/// Minimum protocol version accepted from the server.
pub const PROTO_VER_MIN: ProtocolVersion = ProtocolVersion::new(0, 9);

/// Authentication status in `Authentication` message.
pub mod auth {
    pub const AUTH_OK: i32 = 0;
    pub const AUTH_SASL: i32 = 10;
    pub const AUTH_SASL_CONTINUE: i32 = 11;
    pub const AUTH_SASL_FINAL: i32 = 12;
}

/// Capability flags of a statement.
pub mod capabilities {
    /// Statement is not read-only.
    pub const MODIFICATIONS: u64 = 0b00001;
    /// Statement contains session config change.
    pub const SESSION_CONFIG: u64 = 0b00010;
    /// Statement contains start/commit/rollback of transaction or savepoint manipulation.
    pub const TRANSACTION: u64 = 0b00100;
    /// Statement contains DDL.
    pub const DDL: u64 = 0b01000;
    /// Server or database config change.
    pub const PERSISTENT_CONFIG: u64 = 0b10000;

    pub const ALL: u64 = u64::MAX;

    /// Capabilities allowed for statements outside of [`Transaction`][crate::Transaction].
    pub const NO_TRANSACTION: u64 = ALL & !TRANSACTION & !SESSION_CONFIG;
}

/// Message header keys.
pub mod headers {
    /// Client header carrying allowed capabilities as big endian `u64`.
    pub const ALLOW_CAPABILITIES: u16 = 0xff04;
    /// Server header carrying statement capabilities as big endian `u64`.
    pub const CAPABILITIES: u16 = 0x1001;
}

/// Protocol version as `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns `true` if this version is within [`PROTO_VER_MIN`] and [`PROTO_VER`].
    pub fn is_supported(&self) -> bool {
        (PROTO_VER_MIN..=PROTO_VER).contains(self)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Result set size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    One,
    Many,
    AtLeastOne,
}

impl Cardinality {
    pub fn from_char(ch: u8) -> Option<Self> {
        match ch {
            b'n' => Some(Self::NoResult),
            b'o' => Some(Self::AtMostOne),
            b'A' => Some(Self::One),
            b'm' => Some(Self::Many),
            b'M' => Some(Self::AtLeastOne),
            _ => None,
        }
    }

    pub fn as_char(&self) -> u8 {
        match self {
            Self::NoResult => b'n',
            Self::AtMostOne => b'o',
            Self::One => b'A',
            Self::Many => b'm',
            Self::AtLeastOne => b'M',
        }
    }
}

/// Requested output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Binary,
    Json,
}

impl OutputFormat {
    pub fn as_char(&self) -> u8 {
        match self {
            Self::Binary => b'b',
            Self::Json => b'j',
        }
    }
}

/// Server transaction status reported by `ReadyForCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InError,
    #[default]
    Unknown,
}

impl TransactionStatus {
    pub fn from_char(ch: u8) -> Self {
        match ch {
            b'I' => Self::Idle,
            b'T' => Self::InTransaction,
            b'E' => Self::InError,
            _ => Self::Unknown,
        }
    }
}

//! `edgero` error types.
use bytes::Bytes;
use std::{backtrace::Backtrace, borrow::Cow, collections::HashMap, fmt, io};

use crate::{
    codec::CodecError,
    connection::{CredentialsError, ParseError, ScramError},
    protocol::{BufferError, ProtocolError},
};

/// A specialized [`Result`] type for `edgero` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Legacy server codes which were moved under `TransactionConflictError`.
const OLD_ERROR_CODES: [(u32, u32); 2] = [
    (0x05_03_00_01, 0x05_03_01_01),
    (0x05_03_00_02, 0x05_03_01_02),
];

/// All possible error from `edgero` library.
pub struct Error {
    kind: ErrorKind,
    code: u32,
    message: Cow<'static, str>,
    attributes: HashMap<u16, Bytes>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Backtrace,
}

impl Error {
    /// Create new error with given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            attributes: HashMap::new(),
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    /// Wrap an error returned from user code, e.g. inside a transaction block.
    ///
    /// User errors are never retried.
    pub fn user(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let source = source.into();
        Self::new(ErrorKind::User, source.to_string()).with_source(source)
    }

    /// Create error from the code reported by the server.
    pub(crate) fn from_server(code: u32, message: String, attributes: HashMap<u16, Bytes>) -> Self {
        let code = OLD_ERROR_CODES
            .iter()
            .find_map(|&(old, new)| (old == code).then_some(new))
            .unwrap_or(code);
        let mut me = Self::new(ErrorKind::from_code(code), message);
        me.code = code;
        me.attributes = attributes;
        me
    }

    pub(crate) fn with_source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the raw error code.
    ///
    /// For server errors this is the code sent by the server, which may be
    /// more specific than [`ErrorKind::code`] of the resolved kind.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional attributes sent by the server.
    pub fn attributes(&self) -> &HashMap<u16, Bytes> {
        &self.attributes
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns `true` if this error kind is, or is a descendant of, `kind`.
    ///
    /// ```
    /// use edgero::{Error, ErrorKind};
    ///
    /// let err = Error::new(ErrorKind::TransactionSerialization, "conflict");
    /// assert!(err.is(ErrorKind::TransactionConflict));
    /// assert!(err.is(ErrorKind::Execution));
    /// assert!(!err.is(ErrorKind::Client));
    /// ```
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind.is(kind)
    }

    /// Whether an operation failing with this error can be retried.
    pub fn should_retry(&self) -> bool {
        self.kind.should_retry()
    }

    /// Whether a connection attempt failing with this error can be reattempted.
    pub fn should_reconnect(&self) -> bool {
        self.kind.should_reconnect()
    }
}

macro_rules! error_kinds {
    ($($name:ident = $code:literal => $display:literal,)*) => {
        /// Error category.
        ///
        /// Every kind except [`ErrorKind::User`] and [`ErrorKind::Unknown`]
        /// corresponds to a numeric code on the wire. Codes are hierarchical,
        /// zeroing the lowest non-zero byte yields the parent category.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ErrorKind {
            $($name,)*
            /// Error returned from user code.
            User,
            /// Server error with unrecognized code.
            Unknown,
        }

        impl ErrorKind {
            /// Returns the wire code of this kind, `0` for kinds without one.
            pub const fn code(self) -> u32 {
                match self {
                    $(Self::$name => $code,)*
                    Self::User | Self::Unknown => 0,
                }
            }

            /// Returns the error class name.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $display,)*
                    Self::User => "UserError",
                    Self::Unknown => "EdgeDBError",
                }
            }

            fn from_exact_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

error_kinds! {
    InternalServer = 0x01_00_00_00 => "InternalServerError",
    UnsupportedFeature = 0x02_00_00_00 => "UnsupportedFeatureError",
    Protocol = 0x03_00_00_00 => "ProtocolError",
    BinaryProtocol = 0x03_01_00_00 => "BinaryProtocolError",
    UnsupportedProtocolVersion = 0x03_01_00_01 => "UnsupportedProtocolVersionError",
    TypeSpecNotFound = 0x03_01_00_02 => "TypeSpecNotFoundError",
    UnexpectedMessage = 0x03_01_00_03 => "UnexpectedMessageError",
    InputData = 0x03_02_00_00 => "InputDataError",
    ResultCardinalityMismatch = 0x03_03_00_00 => "ResultCardinalityMismatchError",
    Capability = 0x03_04_00_00 => "CapabilityError",
    Query = 0x04_00_00_00 => "QueryError",
    InvalidSyntax = 0x04_01_00_00 => "InvalidSyntaxError",
    InvalidType = 0x04_02_00_00 => "InvalidTypeError",
    InvalidReference = 0x04_03_00_00 => "InvalidReferenceError",
    Schema = 0x04_04_00_00 => "SchemaError",
    Execution = 0x05_00_00_00 => "ExecutionError",
    InvalidValue = 0x05_01_00_00 => "InvalidValueError",
    Integrity = 0x05_02_00_00 => "IntegrityError",
    ConstraintViolation = 0x05_02_00_01 => "ConstraintViolationError",
    CardinalityViolation = 0x05_02_00_02 => "CardinalityViolationError",
    MissingRequired = 0x05_02_00_03 => "MissingRequiredError",
    Transaction = 0x05_03_00_00 => "TransactionError",
    TransactionConflict = 0x05_03_01_00 => "TransactionConflictError",
    TransactionSerialization = 0x05_03_01_01 => "TransactionSerializationError",
    TransactionDeadlock = 0x05_03_01_02 => "TransactionDeadlockError",
    Configuration = 0x06_00_00_00 => "ConfigurationError",
    Access = 0x07_00_00_00 => "AccessError",
    Authentication = 0x07_01_00_00 => "AuthenticationError",
    Client = 0xff_00_00_00 => "ClientError",
    ClientConnection = 0xff_01_00_00 => "ClientConnectionError",
    ClientConnectionFailed = 0xff_01_01_00 => "ClientConnectionFailedError",
    ClientConnectionFailedTemporarily = 0xff_01_01_01 => "ClientConnectionFailedTemporarilyError",
    ClientConnectionTimeout = 0xff_01_02_00 => "ClientConnectionTimeoutError",
    ClientConnectionClosed = 0xff_01_03_00 => "ClientConnectionClosedError",
    Interface = 0xff_02_00_00 => "InterfaceError",
    QueryArgument = 0xff_02_01_00 => "QueryArgumentError",
    NoData = 0xff_03_00_00 => "NoDataError",
    InternalClient = 0xff_04_00_00 => "InternalClientError",
}

/// Zero the lowest non-zero byte.
fn parent_code(code: u32) -> u32 {
    if code == 0 {
        return 0;
    }
    let shift = code.trailing_zeros() / 8 * 8;
    code & !(0xff << shift)
}

impl ErrorKind {
    /// Resolve an error code to the most specific known kind.
    ///
    /// Unknown codes resolve to their closest known ancestor, or
    /// [`ErrorKind::Unknown`] if there is none.
    pub fn from_code(code: u32) -> ErrorKind {
        let mut code = code;
        while code != 0 {
            if let Some(kind) = Self::from_exact_code(code) {
                return kind;
            }
            code = parent_code(code);
        }
        ErrorKind::Unknown
    }

    /// Returns the parent category, if any.
    pub fn parent(self) -> Option<ErrorKind> {
        let mut code = parent_code(self.code());
        while code != 0 {
            if let Some(kind) = Self::from_exact_code(code) {
                return Some(kind);
            }
            code = parent_code(code);
        }
        None
    }

    /// Returns `true` if `self` is `ancestor` or one of its descendants.
    pub fn is(self, ancestor: ErrorKind) -> bool {
        let mut kind = Some(self);
        while let Some(k) = kind {
            if k == ancestor {
                return true;
            }
            kind = k.parent();
        }
        false
    }

    pub fn should_retry(self) -> bool {
        self.is(ErrorKind::TransactionConflict) || self.should_reconnect()
    }

    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            ErrorKind::ClientConnectionFailedTemporarily
                | ErrorKind::ClientConnectionTimeout
                | ErrorKind::ClientConnectionClosed
        )
    }
}

macro_rules! from {
    (<$ty:ty>$id:ident => $kind:expr) => {
        impl From<$ty> for Error {
            fn from($id: $ty) -> Self {
                let kind = $kind;
                let message = $id.to_string();
                Error::new(kind, message).with_source($id)
            }
        }
    };
}

from!(<BufferError>e => ErrorKind::BinaryProtocol);
from!(<ProtocolError>e => e.kind());
from!(<CodecError>e => e.kind());
from!(<ParseError>e => ErrorKind::Interface);
from!(<CredentialsError>e => ErrorKind::Interface);
from!(<ScramError>e => ErrorKind::Authentication);
from!(<io::Error>e => ErrorKind::ClientConnectionClosed);

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(e) => Some(&**e),
            None => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//! Frontend messages, sent by the client.
use super::{
    Cardinality, OutputFormat, ProtocolVersion,
    buffer::{BufferError, WriteMessageBuffer},
    headers,
};
use crate::{common::Uuid, ext::UsizeExt};

/// Write a complete frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: &F, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
    buf.begin_message(F::MSGTYPE)?;
    msg.encode(buf)?;
    buf.end_message()?;
    Ok(())
}

/// A type which can be encoded into frontend message.
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Write the message payload.
    ///
    /// Message type and length is written by [`write`].
    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError>;
}

fn write_allow_capabilities(buf: &mut WriteMessageBuffer, caps: Option<u64>) -> Result<(), BufferError> {
    match caps {
        Some(caps) => buf.write_headers(&[(headers::ALLOW_CAPABILITIES, &caps.to_be_bytes()[..])])?,
        None => buf.write_headers(&[])?,
    };
    Ok(())
}

/// Version negotiation and connection parameters, the first message sent.
#[derive(Debug)]
pub struct ClientHandshake<'a> {
    pub version: ProtocolVersion,
    pub params: &'a [(&'a str, &'a str)],
}

impl FrontendProtocol for ClientHandshake<'_> {
    const MSGTYPE: u8 = b'V';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        buf.write_u16(self.version.major)?
            .write_u16(self.version.minor)?
            .write_u16(self.params.len().to_u16())?;
        for (key, value) in self.params {
            buf.write_string(key)?.write_string(value)?;
        }
        // no extensions requested
        buf.write_u16(0)?;
        Ok(())
    }
}

/// Selected SASL mechanism with the initial response.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    pub method: &'a str,
    pub data: &'a str,
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        buf.write_string(self.method)?.write_string(self.data)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a str,
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'r';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        buf.write_string(self.data)?;
        Ok(())
    }
}

/// Prepare an anonymous statement.
#[derive(Debug)]
pub struct Parse<'a> {
    pub allow_capabilities: u64,
    pub format: OutputFormat,
    pub cardinality: Cardinality,
    pub query: &'a str,
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        write_allow_capabilities(buf, Some(self.allow_capabilities))?;
        buf.write_char(self.format.as_char())?
            .write_char(self.cardinality.as_char())?
            // statement name
            .write_string("")?
            .write_string(self.query)?;
        Ok(())
    }
}

/// Request type descriptors of the anonymous statement.
#[derive(Debug)]
pub struct DescribeStatement;

impl FrontendProtocol for DescribeStatement {
    const MSGTYPE: u8 = b'D';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        buf.write_headers(&[])?
            // aspect: data types
            .write_char(b'T')?
            .write_string("")?;
        Ok(())
    }
}

/// Execute the anonymous statement.
#[derive(Debug)]
pub struct Execute<'a> {
    pub allow_capabilities: u64,
    /// Arguments, already encoded with the statement input codec.
    pub args: &'a [u8],
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        write_allow_capabilities(buf, Some(self.allow_capabilities))?;
        buf.write_string("")?.write_bytes(self.args)?;
        Ok(())
    }
}

/// Parse and execute in one round trip using type descriptor ids known from a previous run.
#[derive(Debug)]
pub struct OptimisticExecute<'a> {
    pub allow_capabilities: u64,
    pub format: OutputFormat,
    pub cardinality: Cardinality,
    pub query: &'a str,
    pub in_id: Uuid,
    pub out_id: Uuid,
    pub args: &'a [u8],
}

impl FrontendProtocol for OptimisticExecute<'_> {
    const MSGTYPE: u8 = b'O';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        write_allow_capabilities(buf, Some(self.allow_capabilities))?;
        buf.write_char(self.format.as_char())?
            .write_char(self.cardinality.as_char())?
            .write_string(self.query)?
            .write_uuid(&self.in_id)?
            .write_uuid(&self.out_id)?
            .write_bytes(self.args)?;
        Ok(())
    }
}

/// Execute a script without arguments and without returning data.
///
/// Server always responds with `ReadyForCommand`, no `Sync` is required.
#[derive(Debug)]
pub struct ExecuteScript<'a> {
    /// [`None`] allows every capabilities.
    pub allow_capabilities: Option<u64>,
    pub script: &'a str,
}

impl FrontendProtocol for ExecuteScript<'_> {
    const MSGTYPE: u8 = b'Q';

    fn encode(&self, buf: &mut WriteMessageBuffer) -> Result<(), BufferError> {
        write_allow_capabilities(buf, self.allow_capabilities)?;
        buf.write_string(self.script)?;
        Ok(())
    }
}

macro_rules! empty_message {
    ($(#[$doc:meta])* $name:ident = $msgtype:literal) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $msgtype;

            fn encode(&self, _: &mut WriteMessageBuffer) -> Result<(), BufferError> {
                Ok(())
            }
        }
    };
}

empty_message! {
    /// Ask the server to finish current pipeline and respond with `ReadyForCommand`.
    Sync = b'S'
}

empty_message! {
    /// Graceful connection termination.
    Terminate = b'X'
}

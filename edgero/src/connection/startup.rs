//! Connection startup, version negotiation and authentication.
use super::{ConnectionState, NormalizedConnectConfig, RawConnection, ScramError, scram};
use crate::{
    Error, ErrorKind, Result,
    common::verbose,
    protocol::{
        BackendMessage, PROTO_VER, ProtocolError,
        backend::Authentication,
        frontend::{ClientHandshake, SaslInitialResponse, SaslResponse},
    },
    transport::{Transport, TransportExt},
};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Perform the handshake until the first `ReadyForCommand`.
pub(super) async fn startup(conn: &mut RawConnection, config: &NormalizedConnectConfig) -> Result<()> {
    conn.send(&ClientHandshake {
        version: PROTO_VER,
        params: &[("user", config.user()), ("database", config.database())],
    })?;
    conn.flush().await?;

    loop {
        match conn.recv::<BackendMessage>().await? {
            BackendMessage::ServerHandshake(handshake) => {
                if !handshake.version.is_supported() {
                    return Err(conn.abort_with(ProtocolError::UnsupportedVersion(handshake.version).into()));
                }
                verbose!("negotiated protocol version {}", handshake.version);
                conn.protocol_version = handshake.version;
            }
            BackendMessage::Authentication(Authentication::Ok) => {
                conn.state = ConnectionState::Syncing;
            }
            BackendMessage::Authentication(Authentication::Sasl { methods }) => {
                conn.state = ConnectionState::Authenticating;
                if let Err(err) = sasl(conn, config, methods).await {
                    return Err(conn.abort_with(err));
                }
                conn.state = ConnectionState::Syncing;
            }
            BackendMessage::Authentication(Authentication::Other { status }) => {
                return Err(conn.abort_with(ProtocolError::UnsupportedAuth(status).into()));
            }
            BackendMessage::ServerKeyData(key) => {
                conn.server_secret = Some(key.data);
            }
            BackendMessage::ReadyForCommand(_) => {
                conn.state = ConnectionState::Connected;
                return Ok(());
            }
            message => return Err(conn.unexpected(message, "handshake")),
        }
    }
}

fn unexpected_auth(auth: Authentication, expect: &str) -> Error {
    Error::new(
        ErrorKind::BinaryProtocol,
        format!("expected {expect} during SASL authentication, got {auth:?}"),
    )
}

async fn sasl(conn: &mut RawConnection, config: &NormalizedConnectConfig, methods: Vec<String>) -> Result<()> {
    if methods.is_empty() {
        return Err(ProtocolError::NoSaslMethods.into());
    }
    if !methods.iter().any(|m| m == SCRAM_SHA_256) {
        return Err(ProtocolError::UnsupportedSasl(methods).into());
    }

    let client_nonce = scram::generate_nonce();
    let (client_first, client_first_bare) = scram::build_client_first_message(&client_nonce, config.user())?;

    conn.send(&SaslInitialResponse { method: SCRAM_SHA_256, data: &client_first })?;
    conn.flush().await?;

    let server_first = match conn.recv::<Authentication>().await? {
        Authentication::SaslContinue { data } => data,
        auth => return Err(unexpected_auth(auth, "SASLContinue")),
    };

    let (server_nonce, salt, iterations) = scram::parse_server_first_message(&server_first)?;
    if !server_nonce.starts_with(&client_nonce) {
        return Err(ScramError::NonceMismatch.into());
    }

    let (client_final, expected_signature) = scram::build_client_final_message(
        config.password().unwrap_or_default(),
        &salt,
        iterations,
        &client_first_bare,
        &server_first,
        &server_nonce,
    )?;

    conn.send(&SaslResponse { data: &client_final })?;
    conn.flush().await?;

    let server_final = match conn.recv::<Authentication>().await? {
        Authentication::SaslFinal { data } => data,
        auth => return Err(unexpected_auth(auth, "SASLFinal")),
    };

    if scram::parse_server_final_message(&server_final)? != expected_signature {
        return Err(ScramError::ProofMismatch.into());
    }

    match conn.recv::<Authentication>().await? {
        Authentication::Ok => Ok(()),
        auth => Err(unexpected_auth(auth, "AuthenticationOk")),
    }
}

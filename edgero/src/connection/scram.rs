//! SCRAM-SHA-256 primitives.
//!
//! <https://datatracker.ietf.org/doc/html/rfc5802>
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Length of the random part of client nonce, before encoding.
const RAW_NONCE_LENGTH: usize = 18;

type HmacSha256 = Hmac<Sha256>;

/// An error in SCRAM message exchange.
#[derive(Debug, thiserror::Error)]
pub enum ScramError {
    #[error("malformed SCRAM message")]
    Malformed,
    #[error("server SCRAM nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server SCRAM proof does not match")]
    ProofMismatch,
    #[error("failed to normalize SCRAM credentials: {0}")]
    Prep(#[from] stringprep::Error),
}

/// Generate a base64 encoded random nonce.
pub fn generate_nonce() -> String {
    let raw: [u8; RAW_NONCE_LENGTH] = rand::random();
    BASE64.encode(raw)
}

/// Returns `(client_first, client_first_bare)`.
pub fn build_client_first_message(client_nonce: &str, username: &str) -> Result<(String, String), ScramError> {
    let bare = format!("n={},r={client_nonce}", saslprep(username)?);
    Ok((format!("n,,{bare}"), bare))
}

/// Returns `(server_nonce, salt, iterations)`.
pub fn parse_server_first_message(msg: &str) -> Result<(String, Vec<u8>, u32), ScramError> {
    let mut attrs = msg.split(',');

    let nonce = attr(attrs.next(), 'r')?;
    let salt = BASE64.decode(attr(attrs.next(), 's')?).map_err(|_| ScramError::Malformed)?;
    let iterations = attr(attrs.next(), 'i')?.parse().map_err(|_| ScramError::Malformed)?;

    Ok((nonce.to_owned(), salt, iterations))
}

/// Returns the server signature.
pub fn parse_server_final_message(msg: &str) -> Result<Vec<u8>, ScramError> {
    let sig = attr(msg.split(',').next(), 'v')?;
    BASE64.decode(sig).map_err(|_| ScramError::Malformed)
}

/// Returns `(client_final, expected_server_signature)`.
pub fn build_client_final_message(
    password: &str,
    salt: &[u8],
    iterations: u32,
    client_first_bare: &str,
    server_first: &str,
    server_nonce: &str,
) -> Result<(String, Vec<u8>), ScramError> {
    // base64 of the `n,,` gs2 header, no channel binding
    let without_proof = format!("c=biws,r={server_nonce}");
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

    let salted = hi(saslprep(password)?.as_bytes(), salt, iterations);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let client_signature = hmac(&stored_key, auth_message.as_bytes());

    let proof = client_key
        .iter()
        .zip(client_signature)
        .map(|(k, s)| k ^ s)
        .collect::<Vec<u8>>();

    let server_key = hmac(&salted, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());

    Ok((format!("{without_proof},p={}", BASE64.encode(proof)), server_signature.to_vec()))
}

fn attr(part: Option<&str>, name: char) -> Result<&str, ScramError> {
    part.and_then(|p| p.strip_prefix(name))
        .and_then(|p| p.strip_prefix('='))
        .ok_or(ScramError::Malformed)
}

fn saslprep(s: &str) -> Result<String, ScramError> {
    Ok(stringprep::saslprep(s)?.into_owned())
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `Hi()` function, PBKDF2 with HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).expect("HMAC can take key of any size");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = prev;

    for _ in 1..iterations {
        prev = hmac(password, &prev);
        for (r, p) in result.iter_mut().zip(prev) {
            *r ^= p;
        }
    }

    result
}

//! Instance credentials file.
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Connection parameters stored in a credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub database: Option<String>,
    pub password: Option<String>,
    pub tls_cert_data: Option<String>,
    pub tls_verify_hostname: Option<bool>,
}

/// An error when reading or validating credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("cannot read credentials file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

fn optional_string(data: &Value, key: &str, err: &'static str) -> Result<Option<String>, CredentialsError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(CredentialsError::Invalid(err)),
    }
}

/// Validate parsed credentials file content.
pub fn validate_credentials(data: &Value) -> Result<Credentials, CredentialsError> {
    let port = match data.get("port") {
        None | Some(Value::Null) => None,
        Some(port) => {
            let port = port
                .as_u64()
                .filter(|p| (1..=65535).contains(p))
                .ok_or(CredentialsError::Invalid("invalid `port` value"))?;
            Some(port as u16)
        }
    };

    let user = match data.get("user") {
        None | Some(Value::Null) => return Err(CredentialsError::Invalid("`user` key is required")),
        Some(Value::String(user)) => user.clone(),
        Some(_) => return Err(CredentialsError::Invalid("`user` must be string")),
    };

    let tls_verify_hostname = match data.get("tls_verify_hostname") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(CredentialsError::Invalid("`tls_verify_hostname` must be boolean")),
    };

    Ok(Credentials {
        user,
        port,
        host: optional_string(data, "host", "`host` must be string")?,
        database: optional_string(data, "database", "`database` must be string")?,
        password: optional_string(data, "password", "`password` must be string")?,
        tls_cert_data: optional_string(data, "tls_cert_data", "`tls_cert_data` must be string")?,
        tls_verify_hostname,
    })
}

/// Read and validate a credentials file.
pub fn read_credentials_file(path: impl AsRef<Path>) -> Result<Credentials, CredentialsError> {
    let path = path.as_ref();
    let read_err = |source: Box<dyn std::error::Error + Send + Sync>| CredentialsError::Read {
        path: path.to_owned(),
        source,
    };

    let data = std::fs::read_to_string(path).map_err(|e| read_err(e.into()))?;
    let data = serde_json::from_str::<Value>(&data).map_err(|e| read_err(e.into()))?;
    validate_credentials(&data).map_err(|e| read_err(e.into()))
}

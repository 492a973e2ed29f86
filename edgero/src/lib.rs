//! EdgeDB Driver
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use edgero::{Executor, RawConnection, Value};
//!
//! # async fn app() -> edgero::Result<()> {
//! let mut conn = RawConnection::connect_env().await?;
//!
//! let res = conn.query_required_single("SELECT <str>$0", vec![Value::Str("Foo".into())]).await?;
//!
//! assert_eq!(res, Value::Str("Foo".into()));
//! # Ok(())
//! # }
//! ```
//!
//! Retrying client:
//!
//! ```no_run
//! use edgero::{Client, Executor};
//!
//! # async fn app() -> edgero::Result<()> {
//! let client = Client::connect_env().await?;
//!
//! let mut handles = vec![];
//!
//! for i in 0..14i64 {
//!     let mut client = client.clone();
//!     let t = tokio::spawn(async move {
//!         client.execute(&format!("INSERT Foo {{ id := {i} }}")).await
//!     });
//!     handles.push(t);
//! }
//!
//! for h in handles {
//!     h.await.unwrap();
//! }
//!
//! let total = client
//!     .transaction(async |tx| tx.query_required_single("SELECT count(Foo)", ()).await)
//!     .await?;
//!
//! # Ok(())
//! # }
//! # mod tokio { pub fn spawn<F>(_: F) -> F { todo!() } }
//! ```

pub mod common;
mod net;
mod ext;

// Protocol
pub mod protocol;

// Encoding
mod value;
pub mod codec;

// Operation
pub mod transport;
pub mod executor;
pub mod options;
pub mod transaction;

// Connection
pub mod connection;
pub mod pool;
pub mod client;

mod error;

#[cfg(test)]
mod testing;


pub use codec::QueryArgs;
pub use value::Value;

pub use executor::Executor;
pub use connection::{RawConnection, ConnectConfig, NormalizedConnectConfig};
pub use pool::{Pool, PoolConfig, PoolConnection, PoolStats};
pub use transaction::{Transaction, TransactionState};
pub use client::Client;
pub use options::{
    IsolationLevel, Options, RetryCondition, RetryOptions, RetryRule, Session, TransactionOptions,
};
pub use error::{Error, ErrorKind, Result};

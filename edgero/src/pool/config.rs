use std::{fmt, pin::Pin, sync::Arc};

use super::Pool;
use crate::{ConnectConfig, RawConnection, Result};

/// Boxed future returned from pool hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection lifecycle callback.
///
/// A failing hook closes the connection, since its state is unknown.
pub type Hook = Arc<dyn for<'a> Fn(&'a mut RawConnection) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Pool configuration builder.
#[derive(Clone)]
pub struct PoolConfig {
    pub(crate) conn: ConnectConfig,
    pub(crate) min_size: usize,
    pub(crate) max_size: usize,
    pub(crate) on_connect: Option<Hook>,
    pub(crate) on_acquire: Option<Hook>,
    pub(crate) on_release: Option<Hook>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(ConnectConfig::new())
    }
}

impl PoolConfig {
    pub fn new(conn: ConnectConfig) -> PoolConfig {
        Self {
            conn,
            min_size: 0,
            max_size: 100,
            on_connect: None,
            on_acquire: None,
            on_release: None,
        }
    }

    /// Pool configuration where connection parameters are resolved from
    /// environment variables.
    pub fn from_env() -> PoolConfig {
        Self::new(ConnectConfig::new())
    }

    /// Pool configuration with the given dsn.
    pub fn parse(dsn: &str) -> PoolConfig {
        Self::new(ConnectConfig::new().dsn(dsn))
    }

    /// Get connection config.
    pub fn connection(&self) -> &ConnectConfig {
        &self.conn
    }

    /// Replace connection config.
    pub fn connect_config(mut self, conn: ConnectConfig) -> Self {
        self.conn = conn;
        self
    }

    /// Number of connections opened when the pool is created.
    pub fn min_size(mut self, value: usize) -> Self {
        self.min_size = value;
        self
    }

    /// Maximum number of open connections.
    pub fn max_size(mut self, value: usize) -> Self {
        self.max_size = value;
        self
    }

    /// Called once on every new connection.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut RawConnection) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called every time a connection is acquired.
    pub fn on_acquire<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut RawConnection) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_acquire = Some(Arc::new(hook));
        self
    }

    /// Called every time a connection is released with [`Pool::release`].
    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut RawConnection) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_release = Some(Arc::new(hook));
        self
    }

    /// Create the pool.
    pub async fn connect(self) -> Result<Pool> {
        Pool::create(self).await
    }
}

impl From<ConnectConfig> for PoolConfig {
    fn from(value: ConnectConfig) -> Self {
        PoolConfig::new(value)
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("conn", &self.conn)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_acquire", &self.on_acquire.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

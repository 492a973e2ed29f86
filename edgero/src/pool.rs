//! Database connection pooling.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    Error, ErrorKind, NormalizedConnectConfig, RawConnection, Result,
    codec::CodecRegistry,
    executor::{Executor, Request},
    value::Value,
};

mod config;
mod worker;

pub use config::{BoxFuture, Hook, PoolConfig};

use worker::{AcquireRecv, Holder, WorkerHandle, pool_closed};

/// Pool close warns when it takes longer than this.
const CLOSE_WARNING: Duration = Duration::from_secs(60);

/// State shared by every [`Pool`] handle and the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    connect: NormalizedConnectConfig,
    config: PoolConfig,
    codecs: CodecRegistry,
    generation: AtomicU64,
    open: AtomicUsize,
    waiting: AtomicUsize,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of callers waiting for a connection.
    pub queue_length: usize,
    /// Number of open connections.
    pub open_connections: usize,
}

/// Database connection pool.
///
/// Connections are handed out most recently released first. Cloning the
/// pool is cheap and refers to the same pool.
///
/// # Example
///
/// ```no_run
/// use edgero::{Executor, Pool, PoolConfig};
///
/// # async fn app() -> edgero::Result<()> {
/// let pool = PoolConfig::from_env().max_size(4).connect().await?;
///
/// let mut conn = pool.acquire().await?;
/// conn.query("SELECT 1", ()).await?;
/// pool.release(&mut conn).await?;
///
/// pool.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Pool {
    handle: WorkerHandle,
    shared: Arc<Shared>,
}

impl Pool {
    /// Create [`Pool`] with the given dsn.
    pub async fn connect(dsn: &str) -> Result<Pool> {
        Self::create(PoolConfig::parse(dsn)).await
    }

    /// Create [`Pool`] with connection parameters from environment variables.
    pub async fn connect_env() -> Result<Pool> {
        Self::create(PoolConfig::from_env()).await
    }

    /// Create [`Pool`], opening [`min_size`][PoolConfig::min_size] connections.
    pub async fn create(config: PoolConfig) -> Result<Pool> {
        if config.max_size == 0 {
            return Err(Error::new(ErrorKind::Interface, "maxSize is expected to be greater than zero"));
        }
        if config.min_size > config.max_size {
            return Err(Error::new(ErrorKind::Interface, "minSize is greater than maxSize"));
        }

        let shared = Arc::new(Shared {
            connect: config.conn.normalize()?,
            codecs: CodecRegistry::new(),
            generation: AtomicU64::new(0),
            open: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            config,
        });

        let mut holders = (0..shared.config.max_size).map(Holder::new).collect::<Vec<_>>();

        // the top of the stack is handed out first
        for holder in holders.iter_mut().rev().take(shared.config.min_size) {
            let conn = RawConnection::connect_with_registry(&shared.connect, shared.codecs.clone()).await?;
            holder.set_conn(conn, 0, &shared);
            if let Some(hook) = &shared.config.on_connect {
                run_hook(hook, holder, &shared).await?;
            }
        }

        let (handle, worker) = WorkerHandle::new(shared.clone(), holders);
        tokio::spawn(worker);

        Ok(Self { handle, shared })
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns resolved connection parameters.
    pub fn connect_config(&self) -> &NormalizedConnectConfig {
        &self.shared.connect
    }

    /// Acquire a connection, waiting until one is available.
    ///
    /// The connection is (re)connected if it is absent, broken or expired.
    pub async fn acquire(&self) -> Result<PoolConnection> {
        let holder = self.acquire_holder().await?;
        let mut conn = PoolConnection { pool: self.clone(), holder: Some(holder) };
        // on error, dropping `conn` returns the holder
        self.prepare(&mut conn).await?;
        Ok(conn)
    }

    async fn acquire_holder(&self) -> Result<Holder> {
        let mut guard = AcquireGuard { handle: &self.handle, recv: self.handle.acquire() };
        match (&mut guard.recv).await {
            Ok(result) => result,
            Err(_) => Err(pool_closed()),
        }
    }

    async fn prepare(&self, conn: &mut PoolConnection) -> Result<()> {
        let shared = &*self.shared;
        let Some(holder) = conn.holder.as_mut() else {
            return Err(detached());
        };

        let generation = shared.generation.load(Ordering::Acquire);
        if !holder.is_fresh(generation) {
            if let Some(mut stale) = holder.take_conn(shared) {
                if let Err(_err) = stale.close().await {
                    #[cfg(feature = "log")]
                    log::debug!("failed to close stale connection: {_err}");
                }
            }

            let new = RawConnection::connect_with_registry(&shared.connect, shared.codecs.clone()).await?;
            holder.set_conn(new, generation, shared);

            if let Some(hook) = &shared.config.on_connect {
                run_hook(hook, holder, shared).await?;
            }
        }

        if let Some(hook) = &shared.config.on_acquire {
            run_hook(hook, holder, shared).await?;
        }

        Ok(())
    }

    /// Return a connection to the pool.
    ///
    /// Releasing an already released connection does nothing.
    pub async fn release(&self, conn: &mut PoolConnection) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &conn.pool.shared) {
            return Err(Error::new(
                ErrorKind::Interface,
                "The connection proxy does not belong to this pool.",
            ));
        }

        let shared = &*self.shared;
        let Some(holder) = conn.holder.as_mut() else {
            return Ok(());
        };

        let mut result = Ok(());
        if holder.is_fresh(shared.generation.load(Ordering::Acquire)) {
            if let Some(hook) = &shared.config.on_release {
                result = run_hook(hook, holder, shared).await;
            }
        }

        if let Some(holder) = conn.holder.take() {
            self.handle.release(holder);
        }
        result
    }

    /// Acquire a connection, run `action` with it and release it.
    pub async fn run<F, T>(&self, action: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut PoolConnection) -> Result<T>,
    {
        let mut conn = self.acquire().await?;
        let result = action(&mut conn).await;
        let released = self.release(&mut conn).await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Mark every open connection as expired.
    ///
    /// Expired connections are replaced when they are next acquired or released.
    pub fn expire_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            queue_length: self.shared.waiting.load(Ordering::Relaxed),
            open_connections: self.shared.open.load(Ordering::Relaxed),
        }
    }

    /// Close the pool gracefully.
    ///
    /// Waits until every acquired connection is released, then closes all
    /// connections. New acquire fails once close is called.
    pub async fn close(&self) -> Result<()> {
        let mut recv = self.handle.close();

        let holders = match tokio::time::timeout(CLOSE_WARNING, &mut recv).await {
            Ok(holders) => holders,
            Err(_) => {
                #[cfg(feature = "log")]
                log::warn!(
                    "pool close is taking more than {}s, some connections are not yet released",
                    CLOSE_WARNING.as_secs(),
                );
                recv.await
            }
        };

        // worker is gone, nothing left to close
        let Ok(holders) = holders else {
            return Ok(());
        };

        for mut holder in holders {
            if let Some(mut conn) = holder.take_conn(&self.shared) {
                if let Err(err) = conn.close().await {
                    self.terminate();
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Close the pool immediately, dropping every idle connection.
    pub fn terminate(&self) {
        self.handle.terminate();
    }
}

/// Returns acquired holder to the pool if the acquire is cancelled.
struct AcquireGuard<'a> {
    handle: &'a WorkerHandle,
    recv: AcquireRecv,
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        self.recv.close();
        if let Ok(Ok(holder)) = self.recv.try_recv() {
            self.handle.release(holder);
        }
    }
}

/// Run a hook, the connection is closed if it fails.
async fn run_hook(hook: &Hook, holder: &mut Holder, shared: &Shared) -> Result<()> {
    let Some(conn) = holder.conn.as_mut() else {
        return Ok(());
    };

    if let Err(err) = hook(conn).await {
        if let Some(mut conn) = holder.take_conn(shared) {
            let _ = conn.close().await;
        }
        return Err(err);
    }

    Ok(())
}

fn detached() -> Error {
    Error::new(ErrorKind::Interface, "The proxy is detached")
}

/// Connection acquired from a [`Pool`].
///
/// The connection is returned to the pool with [`Pool::release`], or on drop.
/// Once released every operation fails.
#[derive(Debug)]
pub struct PoolConnection {
    pool: Pool,
    holder: Option<Holder>,
}

impl PoolConnection {
    /// Returns the [`Pool`] handle.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns the underlying [`RawConnection`].
    pub fn connection(&mut self) -> Result<&mut RawConnection> {
        self.holder
            .as_mut()
            .and_then(|h| h.conn.as_mut())
            .ok_or_else(detached)
    }

    /// Returns `true` if the connection is already released.
    pub fn is_detached(&self) -> bool {
        self.holder.is_none()
    }

    /// Pooled connection can only be released.
    pub async fn close(&mut self) -> Result<()> {
        Err(Error::new(ErrorKind::Interface, "The proxy cannot be closed"))
    }

    /// Return the connection to its pool.
    pub async fn release(mut self) -> Result<()> {
        let pool = self.pool.clone();
        pool.release(&mut self).await
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            self.pool.handle.release(holder);
        }
    }
}

impl Executor for PoolConnection {
    async fn fetch(&mut self, request: Request<'_>) -> Result<Vec<Value>> {
        self.connection()?.fetch(request).await
    }

    async fn execute(&mut self, script: &str) -> Result<()> {
        self.connection()?.execute(script).await
    }
}

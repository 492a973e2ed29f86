//! Retrying client.
use crate::{
    Error, ErrorKind, RawConnection, Result,
    executor::{Executor, Request},
    options::{Options, RetryOptions, Session, TransactionOptions},
    pool::{Pool, PoolConfig, PoolConnection},
    protocol::capabilities,
    transaction::Transaction,
    value::Value,
};

/// Database client over a connection [`Pool`].
///
/// Queries and transactions failing with a transient error are retried
/// according to [`RetryOptions`]. Cloning the client is cheap and shares
/// the pool.
///
/// # Example
///
/// ```no_run
/// use edgero::{Client, Executor};
///
/// # async fn app() -> edgero::Result<()> {
/// let mut client = Client::connect_env().await?;
///
/// let count = client.query_required_single("SELECT count(User)", ()).await?;
///
/// client.transaction(async |tx| {
///     tx.execute("INSERT User { name := 'alice' }").await?;
///     tx.query("SELECT User { name }", ()).await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
    options: Options,
}

/// Where a transaction attempt failed.
enum Failure {
    /// Reported as is, without retry.
    Fatal(Error),
    BeforeCommit(Error),
    Commit(Error),
}

impl Client {
    pub fn new(pool: Pool) -> Client {
        Self { pool, options: Options::default() }
    }

    /// Create a client with the given dsn.
    pub async fn connect(dsn: &str) -> Result<Client> {
        Ok(Self::new(Pool::connect(dsn).await?))
    }

    /// Create a client where connection parameters are resolved from
    /// environment variables.
    pub async fn connect_env() -> Result<Client> {
        Ok(Self::new(Pool::connect_env().await?))
    }

    pub async fn connect_with(config: PoolConfig) -> Result<Client> {
        Ok(Self::new(Pool::create(config).await?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns a client sharing this pool with the given retry options.
    pub fn with_retry_options(&self, retry: RetryOptions) -> Client {
        Self { pool: self.pool.clone(), options: self.options.with_retry_options(retry) }
    }

    /// Returns a client sharing this pool with the given transaction options.
    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Client {
        Self { pool: self.pool.clone(), options: self.options.with_transaction_options(transaction) }
    }

    /// Returns a client sharing this pool with the given session state.
    pub fn with_session(&self, session: Session) -> Client {
        Self { pool: self.pool.clone(), options: self.options.with_session(session) }
    }

    /// Returns a client with module aliases added, see [`Session::with_module_aliases`].
    pub fn with_module_aliases<I, K, V>(&self, aliases: I) -> Client
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with_session(self.options.session.with_module_aliases(aliases))
    }

    /// Returns a client with session config added, values are EdgeQL expressions.
    pub fn with_config<I, K, V>(&self, config: I) -> Client
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with_session(self.options.session.with_config(config))
    }

    /// Returns a client with globals added, values are EdgeQL expressions.
    pub fn with_globals<I, K, V>(&self, globals: I) -> Client
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with_session(self.options.session.with_globals(globals))
    }

    /// Make sure at least one connection can be established.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.pool.acquire().await?.release().await
    }

    /// Close the pool, waiting for every connection to be released.
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }

    /// Close the pool immediately.
    pub fn terminate(&self) {
        self.pool.terminate();
    }

    /// Run `action` in a transaction, retrying the whole action on
    /// transient errors.
    ///
    /// The action may run more than once, it should not have side effects
    /// outside of the transaction.
    ///
    /// A connection error while committing is never retried, since the
    /// transaction may already be committed. Failing to start the
    /// transaction is never retried either.
    pub async fn transaction<F, T>(&self, mut action: F) -> Result<T>
    where
        F: AsyncFnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut conn = self.pool.acquire().await?;
            let result = self.try_transaction(conn.connection()?, &mut action).await;

            let (err, retryable) = match result {
                Ok(value) => {
                    conn.release().await?;
                    return Ok(value);
                }
                Err(Failure::Fatal(err)) => (err, false),
                Err(Failure::BeforeCommit(err)) => {
                    let retryable = err.should_retry();
                    (err, retryable)
                }
                Err(Failure::Commit(err)) => {
                    let retryable = err.should_retry() && !err.is(ErrorKind::ClientConnection);
                    (err, retryable)
                }
            };
            release_quietly(conn).await;

            self.backoff(err, retryable, attempt).await?;
        }
    }

    async fn try_transaction<F, T>(&self, conn: &mut RawConnection, action: &mut F) -> Result<T, Failure>
    where
        F: AsyncFnMut(&mut Transaction<'_>) -> Result<T>,
    {
        conn.apply_session(&self.options.session).await.map_err(Failure::BeforeCommit)?;

        let mut tx = Transaction::new(conn, self.options.transaction);
        tx.start().await.map_err(Failure::Fatal)?;

        let value = match action(&mut tx).await {
            Ok(value) => value,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    if rollback_err.is(ErrorKind::User) || rollback_err.is(ErrorKind::InternalClient) {
                        return Err(Failure::Fatal(rollback_err));
                    }
                    #[cfg(feature = "log")]
                    log::debug!("rollback failed: {rollback_err}");
                }
                return Err(Failure::BeforeCommit(err));
            }
        };

        tx.commit().await.map_err(Failure::Commit)?;
        Ok(value)
    }

    /// Sleep before the next attempt, or return the error if it is final.
    async fn backoff(&self, err: Error, retryable: bool, attempt: u32) -> Result<()> {
        let rule = self.options.retry.rule_for(&err);
        if !retryable || attempt >= rule.attempts {
            return Err(err);
        }

        let delay = rule.delay(attempt);

        #[cfg(feature = "log")]
        log::debug!("retrying after {delay:?}, attempt {attempt}: {err}");

        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn retrying_fetch(&self, request: Request<'_>) -> Result<Vec<Value>> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut conn = self.pool.acquire().await?;
            let raw = conn.connection()?;
            let result = match raw.apply_session(&self.options.session).await {
                Ok(()) => raw.fetch(request.clone()).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(values) => {
                    conn.release().await?;
                    return Ok(values);
                }
                Err(err) => err,
            };

            // unknown capabilities means the query never ran
            let read_only = raw
                .query_capabilities(&request)
                .is_none_or(|caps| caps & capabilities::MODIFICATIONS == 0);
            let retryable = err.should_retry() && (read_only || err.is(ErrorKind::TransactionConflict));
            release_quietly(conn).await;

            self.backoff(err, retryable, attempt).await?;
        }
    }

    async fn retrying_execute(&self, script: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut conn = self.pool.acquire().await?;
            let raw = conn.connection()?;
            let result = match raw.apply_session(&self.options.session).await {
                Ok(()) => raw.execute(script).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(()) => return conn.release().await,
                Err(err) => err,
            };

            // scripts report no capabilities, only conflicts are known to be rolled back
            let retryable = err.is(ErrorKind::TransactionConflict);
            release_quietly(conn).await;

            self.backoff(err, retryable, attempt).await?;
        }
    }
}

/// Release after a failure, the original error is what gets reported.
async fn release_quietly(conn: PoolConnection) {
    if let Err(_err) = conn.release().await {
        #[cfg(feature = "log")]
        log::debug!("failed to release connection: {_err}");
    }
}

impl From<Pool> for Client {
    fn from(pool: Pool) -> Self {
        Client::new(pool)
    }
}

impl Executor for Client {
    async fn fetch(&mut self, request: Request<'_>) -> Result<Vec<Value>> {
        self.retrying_fetch(request).await
    }

    async fn execute(&mut self, script: &str) -> Result<()> {
        self.retrying_execute(script).await
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Barrier;

    use super::*;
    use crate::testing::{MockServer, Reply};

    const SERIALIZATION_ERROR: u32 = 0x0503_0101;

    async fn client(server: &MockServer, max_size: usize) -> Client {
        let pool = PoolConfig::new(server.connect_config())
            .max_size(max_size)
            .connect()
            .await
            .unwrap();
        Client::new(pool).with_retry_options(RetryOptions::new(3, |_| Duration::ZERO))
    }

    #[tokio::test]
    async fn retry_bound() {
        let server = MockServer::start().await;
        let client = client(&server, 1).await.with_retry_options(RetryOptions::new(4, |_| Duration::ZERO));

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |_| -> Result<()> {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::new(ErrorKind::TransactionSerialization, "conflict"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionSerialization);
        assert_eq!(calls.load(Ordering::Relaxed), 4);

        let calls = AtomicUsize::new(0);
        let value = client
            .transaction(async |_| {
                match calls.fetch_add(1, Ordering::Relaxed) {
                    0 => Err(Error::new(ErrorKind::TransactionDeadlock, "deadlock")),
                    _ => Ok(5),
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn user_errors_are_not_retried() {
        let server = MockServer::start().await;
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |_| -> Result<()> {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::new(ErrorKind::User, "nope"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.message(), "nope");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    async fn increment(client: &Client, calls: &AtomicUsize, barrier: &Barrier) -> Result<Value> {
        client
            .transaction(async |tx| {
                let value = tx.query_required_single("INSERT Counter", ()).await?;
                // both first attempts read before either commits
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    barrier.wait().await;
                }
                Ok(value)
            })
            .await
    }

    #[tokio::test]
    async fn concurrent_conflict() {
        let server = MockServer::start().await;
        server.reply("INSERT Counter", Reply::increment());
        let client = client(&server, 2).await;

        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(2);

        let (a, b) = tokio::join!(
            increment(&client, &calls, &barrier),
            increment(&client, &calls, &barrier),
        );
        let mut values = [a.unwrap(), b.unwrap()];
        values.sort_by_key(|v| match v {
            Value::Int64(n) => *n,
            _ => 0,
        });

        assert_eq!(values, [Value::Int64(1), Value::Int64(2)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(server.counter(), Some(2));
    }

    #[tokio::test]
    async fn commit_connection_error_is_not_retried() {
        let server = MockServer::start().await;
        server.reply("COMMIT", Reply::drop());
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |tx| {
                calls.fetch_add(1, Ordering::Relaxed);
                tx.execute("INSERT Counter").await
            })
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::ClientConnection));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn connection_error_before_commit_is_retried() {
        let server = MockServer::start().await;
        server.reply("SELECT broken", Reply::drop());
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |tx| {
                calls.fetch_add(1, Ordering::Relaxed);
                tx.query("SELECT broken", ()).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientConnectionClosed);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(server.accepted(), 3);
    }

    #[tokio::test]
    async fn failed_start_is_not_retried() {
        let server = MockServer::start().await;
        let statement = TransactionOptions::default().start_statement();
        server.reply(&statement, Reply::no_result().failing(1, SERIALIZATION_ERROR));
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionSerialization);
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        // the next transaction starts fine
        client.transaction(async |_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn internal_rollback_error_is_reported() {
        let server = MockServer::start().await;
        server.reply("ROLLBACK", Reply::error(0xff04_0000, "rollback exploded"));
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |_| -> Result<()> {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::new(ErrorKind::TransactionSerialization, "conflict"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalClient);
        assert_eq!(err.message(), "rollback exploded");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn server_rollback_error_is_ignored() {
        let server = MockServer::start().await;
        server.reply("ROLLBACK", Reply::no_result().failing(1, 0x0501_0000));
        let client = client(&server, 1).await;

        let calls = AtomicUsize::new(0);
        let err = client
            .transaction(async |_| -> Result<()> {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::new(ErrorKind::TransactionSerialization, "conflict"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionSerialization);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn read_only_query_is_retried() {
        let server = MockServer::start().await;
        server.reply("SELECT 1", Reply::rows(vec![Value::Int64(1)]).failing(2, SERIALIZATION_ERROR));
        let mut client = client(&server, 1).await;

        let value = client.query_required_single("SELECT 1", ()).await.unwrap();
        assert_eq!(value, Value::Int64(1));
        assert_eq!(server.parse_count("SELECT 1"), 3);
    }

    #[tokio::test]
    async fn dropped_read_only_query_is_retried() {
        let server = MockServer::start().await;
        server.reply("SELECT 1", Reply::rows(vec![Value::Int64(1)]));
        let mut client = client(&server, 1).await;

        client.query("SELECT 1", ()).await.unwrap();
        server.reply("SELECT 1", Reply::drop());

        let err = client.query("SELECT 1", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientConnectionClosed);
        assert_eq!(server.accepted(), 3);
    }

    #[tokio::test]
    async fn dropped_modifying_query_is_not_retried() {
        let server = MockServer::start().await;
        server.reply("UPDATE User", Reply::no_result());
        let mut client = client(&server, 1).await;

        client.query("UPDATE User", ()).await.unwrap();
        server.reply("UPDATE User", Reply::drop());

        let err = client.query("UPDATE User", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientConnectionClosed);
        assert_eq!(server.accepted(), 1);
        assert_eq!(server.parse_count("UPDATE User"), 1);
    }

    #[tokio::test]
    async fn session_follows_the_client() {
        let server = MockServer::start().await;
        server.reply("SELECT 1", Reply::rows(vec![Value::Int64(1)]));
        let mut client = client(&server, 1).await;
        let mut scoped = client.with_module_aliases([("module", "app")]).with_globals([("user", "'alice'")]);
        assert_eq!(scoped.options().session.module(), "app");
        assert!(client.options().session.is_default());

        scoped.query("SELECT 1", ()).await.unwrap();
        scoped.execute("SELECT 1").await.unwrap();
        scoped.transaction(async |tx| tx.query("SELECT 1", ()).await).await.unwrap();
        client.query("SELECT 1", ()).await.unwrap();

        let session_scripts = server
            .scripts()
            .into_iter()
            .filter(|script| script.contains("MODULE") || script.contains("GLOBAL"))
            .collect::<Vec<_>>();
        assert_eq!(
            session_scripts,
            [
                "SET MODULE app;\nSET GLOBAL app::user := 'alice';\n",
                "SET MODULE default;\nRESET GLOBAL app::user;\n",
            ]
        );
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn derived_clients_share_the_pool() {
        let server = MockServer::start().await;
        let client = client(&server, 1).await;
        client.ensure_connected().await.unwrap();

        let readonly = client.with_transaction_options(TransactionOptions::new().readonly(true));
        assert!(readonly.options().transaction.readonly);
        assert!(!client.options().transaction.readonly);

        readonly.transaction(async |_| Ok(())).await.unwrap();
        assert_eq!(server.accepted(), 1);

        client.close().await.unwrap();
        let err = readonly.ensure_connected().await.unwrap_err();
        assert_eq!(err.message(), "The pool is closed");
    }
}

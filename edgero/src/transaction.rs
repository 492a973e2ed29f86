use crate::{
    Error, ErrorKind, RawConnection, Result,
    executor::{Executor, Request},
    options::TransactionOptions,
    protocol::frontend,
    transport::Transport,
    value::Value,
};

const ANOTHER_QUERY: &str =
    "Another query is in progress. Use the query methods on 'Client' to run queries concurrently.";
const STILL_IN_PROGRESS: &str = "A query is still in progress after transaction block has returned.";

/// State of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    New,
    Active,
    Committed,
    RolledBack,
    /// `START` or `COMMIT` failed.
    Failed,
}

/// Database transaction over a single connection.
///
/// Only one query may run at a time. A query whose future is dropped
/// before completion leaves the transaction unusable.
///
/// If the transaction is still active on drop, `ROLLBACK` is queued on the
/// connection and sent with its next request.
///
/// # Example
///
/// ```no_run
/// use edgero::{Executor, RawConnection, TransactionOptions};
///
/// # async fn app(conn: &mut RawConnection) -> edgero::Result<()> {
/// let mut tx = conn.transaction(TransactionOptions::default()).await?;
///
/// tx.execute("INSERT User { name := 'alice' }").await?;
/// tx.query("SELECT User { name }", ()).await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Transaction<'c> {
    conn: &'c mut RawConnection,
    options: TransactionOptions,
    state: TransactionState,
    op_in_progress: bool,
}

impl RawConnection {
    /// Start a transaction on this connection.
    pub async fn transaction(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        let mut tx = Transaction::new(self, options);
        tx.start().await?;
        Ok(tx)
    }
}

impl<'c> Transaction<'c> {
    /// Create a transaction that is not yet started.
    pub fn new(conn: &'c mut RawConnection, options: TransactionOptions) -> Transaction<'c> {
        Self { conn, options, state: TransactionState::New, op_in_progress: false }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Returns `true` if a previous operation was cancelled mid flight.
    pub fn is_op_in_progress(&self) -> bool {
        self.op_in_progress
    }

    /// Send `START TRANSACTION`.
    ///
    /// Any transaction left open on the connection is rolled back first.
    pub async fn start(&mut self) -> Result<()> {
        self.begin_op("start", TransactionState::New, ANOTHER_QUERY)?;
        let result = self.start_flow().await;
        self.op_in_progress = false;
        self.state = match result {
            Ok(()) => TransactionState::Active,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    async fn start_flow(&mut self) -> Result<()> {
        self.conn.reset_state().await?;
        self.conn.enter_transaction()?;
        let statement = self.options.start_statement();
        if let Err(err) = self.conn.execute_script(&statement, None).await {
            self.conn.leave_transaction();
            return Err(err);
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.begin_op("commit", TransactionState::Active, STILL_IN_PROGRESS)?;
        let result = self.conn.execute_script("COMMIT", None).await;
        self.op_in_progress = false;
        self.conn.leave_transaction();
        self.state = match result {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.begin_op("rollback", TransactionState::Active, STILL_IN_PROGRESS)?;
        let result = self.conn.execute_script("ROLLBACK", None).await;
        self.op_in_progress = false;
        self.conn.leave_transaction();
        self.state = match result {
            Ok(()) => TransactionState::RolledBack,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    fn begin_op(&mut self, op: &str, expect: TransactionState, busy: &'static str) -> Result<()> {
        if self.op_in_progress {
            return Err(Error::new(ErrorKind::Interface, busy));
        }
        if self.state != expect {
            return Err(self.state_error(op));
        }
        self.op_in_progress = true;
        Ok(())
    }

    fn state_error(&self, op: &str) -> Error {
        let reason = match self.state {
            TransactionState::New => "is not yet started",
            TransactionState::Active => "is already started",
            TransactionState::Committed => "is already committed",
            TransactionState::RolledBack => "is already rolled back",
            TransactionState::Failed => "is in error state",
        };
        Error::new(ErrorKind::Interface, format!("cannot {op}; the transaction {reason}"))
    }
}

impl Executor for Transaction<'_> {
    async fn fetch(&mut self, request: Request<'_>) -> Result<Vec<Value>> {
        self.begin_op("query", TransactionState::Active, ANOTHER_QUERY)?;
        let result = self.conn.fetch_privileged(&request).await;
        self.op_in_progress = false;
        result
    }

    async fn execute(&mut self, script: &str) -> Result<()> {
        self.begin_op("execute", TransactionState::Active, ANOTHER_QUERY)?;
        let result = self.conn.execute_script(script, None).await;
        self.op_in_progress = false;
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.conn.leave_transaction();
        if self.conn.is_closed() {
            return;
        }
        let rollback = frontend::ExecuteScript { allow_capabilities: None, script: "ROLLBACK" };
        if let Err(_err) = self.conn.send(&rollback) {
            #[cfg(feature = "log")]
            log::error!("failed to queue transaction rollback: {_err}");
            return;
        }
        self.conn.ready_request();
    }
}

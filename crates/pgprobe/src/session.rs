//! Database sessions
//!
//! A [`Session`] owns one server connection and tracks transaction state the
//! way interactive clients do: with autocommit on (the default), every
//! statement commits as it executes; with autocommit off, the first statement
//! opens a transaction that stays open until [`Session::commit`] or
//! [`Session::rollback`], and closing the session discards uncommitted work.
//!
//! Statement execution itself sits behind the [`Executor`] trait so the
//! session logic can be exercised without a server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::config::ConnectConfig;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::results::{CommandStatus, Execution, ResultSet, Row, SqlValue};

/// Executes statements against a backend
///
/// The production implementation is [`PgExecutor`]. Tests substitute a
/// scripted implementation to drive session and probe logic offline.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a statement over the simple-query protocol
    ///
    /// Returns the completion status and, for row-returning statements, the
    /// result set with all values in their text form.
    async fn simple(&self, sql: &str) -> Result<Execution>;

    /// Run a parameterized, row-returning statement
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet>;

    /// Run a parameterized statement and return the affected-row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;
}

#[async_trait]
impl<T: Executor + ?Sized> Executor for Arc<T> {
    async fn simple(&self, sql: &str) -> Result<Execution> {
        (**self).simple(sql).await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        (**self).query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        (**self).execute(sql, params).await
    }
}

/// [`Executor`] backed by a live PostgreSQL connection
pub struct PgExecutor {
    client: Client,
}

impl PgExecutor {
    /// Open a connection described by `config`
    ///
    /// The driver's connection task is spawned onto the current runtime; it
    /// runs until the session drops. Establishment is bounded by the
    /// configured connect timeout.
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let conninfo = config.conninfo();
        let (client, connection) = match timeout(
            config.connect_timeout(),
            tokio_postgres::connect(&conninfo, NoTls),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            // Server-reported failures carry a SQLSTATE and classify
            // through the driver-error conversion.
            Ok(Err(e)) if e.as_db_error().is_some() => return Err(Error::from(e)),
            Ok(Err(e)) => {
                return Err(Error::connection_with_source(
                    format!("failed to connect to {}", config.target()),
                    e,
                ))
            }
            Err(_) => {
                return Err(Error::timeout(format!(
                    "connecting to {} timed out after {}ms",
                    config.target(),
                    config.connect_timeout_ms
                )))
            }
        };

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection task failed");
            }
        });

        info!(target = %config.target(), user = %config.user, "connected to postgres");
        Ok(Self { client })
    }
}

#[async_trait]
impl Executor for PgExecutor {
    async fn simple(&self, sql: &str) -> Result<Execution> {
        debug!(sql, "simple query");
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| Error::from(e).with_sql(sql))?;
        Ok(collect_simple(sql, messages))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        debug!(sql, params = params.len(), "parameterized query");
        let owned = bind_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            owned.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let pg_rows = self
            .client
            .query(sql, &refs)
            .await
            .map_err(|e| Error::from(e).with_sql(sql))?;

        let columns = pg_rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            let mut values = Vec::with_capacity(pg_row.len());
            for index in 0..pg_row.len() {
                values.push(typed_cell(pg_row, index)?);
            }
            rows.push(Row(values));
        }
        Ok(ResultSet { columns, rows })
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(sql, params = params.len(), "parameterized execute");
        let owned = bind_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            owned.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| Error::from(e).with_sql(sql))
    }
}

/// Fold the simple-protocol message stream into an [`Execution`]
fn collect_simple(sql: &str, messages: Vec<SimpleQueryMessage>) -> Execution {
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    let mut affected = 0u64;
    let mut row_returning = false;

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(description) => {
                row_returning = true;
                columns = description.iter().map(|c| c.name().to_string()).collect();
            }
            SimpleQueryMessage::Row(row) => {
                row_returning = true;
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|i| {
                        row.get(i)
                            .map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string()))
                    })
                    .collect();
                rows.push(Row(values));
            }
            SimpleQueryMessage::CommandComplete(count) => affected = count,
            // the driver reserves the right to add message kinds
            _ => {}
        }
    }

    Execution {
        status: CommandStatus::for_statement(sql, affected),
        rows: row_returning.then_some(ResultSet { columns, rows }),
    }
}

/// Convert one cell of a binary-protocol row into an owned [`SqlValue`]
///
/// Columns outside the decoded set produce a query error naming the column
/// and its type. NULL is representable for any type.
fn typed_cell(row: &tokio_postgres::Row, index: usize) -> Result<SqlValue> {
    let ty = row.columns()[index].type_().clone();
    let value = if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(index)?
            .map_or(SqlValue::Null, SqlValue::Bool)
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(index)?
            .map_or(SqlValue::Null, |v| SqlValue::Int(i32::from(v)))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(index)?
            .map_or(SqlValue::Null, SqlValue::Int)
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(index)?
            .map_or(SqlValue::Null, SqlValue::BigInt)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index)?
            .map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v)))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index)?
            .map_or(SqlValue::Null, SqlValue::Float)
    } else if ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(index)?
            .map_or(SqlValue::Null, SqlValue::Bytes)
    } else if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::BPCHAR || ty == Type::NAME {
        row.try_get::<_, Option<String>>(index)?
            .map_or(SqlValue::Null, SqlValue::Text)
    } else if row.try_get::<_, AnyNull>(index).is_ok() {
        SqlValue::Null
    } else {
        return Err(Error::query(format!(
            "column {:?} has unsupported type {ty}",
            row.columns()[index].name()
        )));
    };
    Ok(value)
}

/// Decodes only SQL NULL, for any column type
///
/// Tells NULLs apart from values the typed reader cannot decode.
struct AnyNull;

impl<'a> FromSql<'a> for AnyNull {
    fn from_sql(
        _: &Type,
        _: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Err("non-null value".into())
    }

    fn from_sql_null(
        _: &Type,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(AnyNull)
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Box parameters for the driver's `ToSql` interface
fn bind_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|param| -> Box<dyn ToSql + Sync + Send> {
            match param {
                // NULL binds as integer; the probe's parameters are integers.
                SqlValue::Null => Box::new(Option::<i32>::None),
                SqlValue::Bool(v) => Box::new(*v),
                SqlValue::Int(v) => Box::new(*v),
                SqlValue::BigInt(v) => Box::new(*v),
                SqlValue::Float(v) => Box::new(*v),
                SqlValue::Text(v) => Box::new(v.clone()),
                SqlValue::Bytes(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

/// One logical connection with client-side transaction tracking
pub struct Session {
    executor: Box<dyn Executor>,
    autocommit: AtomicBool,
    tx_open: AtomicBool,
    closed: AtomicBool,
    target: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("autocommit", &self.autocommit())
            .field("in_transaction", &self.in_transaction())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to the server described by `config`
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let executor = PgExecutor::connect(config).await?;
        Ok(Self::from_executor(
            Box::new(executor),
            config.autocommit,
            config.target(),
        ))
    }

    /// Build a session over an arbitrary executor
    ///
    /// This is the seam the tests use; production code goes through
    /// [`Session::connect`].
    pub fn from_executor(
        executor: Box<dyn Executor>,
        autocommit: bool,
        target: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            autocommit: AtomicBool::new(autocommit),
            tx_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            target: target.into(),
        }
    }

    /// The password-free `host:port/dbname` this session talks to
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether statements commit as they execute
    pub fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Relaxed)
    }

    /// Whether a client-opened transaction is in progress
    pub fn in_transaction(&self) -> bool {
        self.tx_open.load(Ordering::Relaxed)
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Switch autocommit on or off
    ///
    /// Rejected while a transaction is open: commit or roll back first.
    pub fn set_autocommit(&self, enabled: bool) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::transaction(
                "cannot change autocommit inside an open transaction",
            ));
        }
        self.autocommit.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Open a scoped cursor over this session
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Run a statement over the simple-query protocol
    ///
    /// With autocommit off, the first statement after connect (or after a
    /// commit or rollback) opens a transaction first.
    pub async fn run_simple(&self, sql: &str) -> Result<Execution> {
        self.ensure_open()?;
        self.begin_if_needed().await?;
        self.executor.simple(sql).await
    }

    /// Run a parameterized, row-returning statement
    pub async fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        self.ensure_open()?;
        self.begin_if_needed().await?;
        self.executor.query(sql, params).await
    }

    /// Run a parameterized statement, returning its completion status
    pub async fn run_execute(&self, sql: &str, params: &[SqlValue]) -> Result<CommandStatus> {
        self.ensure_open()?;
        self.begin_if_needed().await?;
        let affected = self.executor.execute(sql, params).await?;
        Ok(CommandStatus::for_statement(sql, affected))
    }

    /// Commit the open transaction, if any
    pub async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction() {
            return Ok(());
        }
        self.executor.simple("COMMIT").await?;
        self.tx_open.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Roll back the open transaction, if any
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction() {
            return Ok(());
        }
        self.executor.simple("ROLLBACK").await?;
        self.tx_open.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Round-trip to the server, returning the observed latency
    ///
    /// Never opens a transaction, so it is safe to call regardless of the
    /// autocommit setting.
    pub async fn ping(&self) -> Result<Duration> {
        self.ensure_open()?;
        let started = Instant::now();
        self.executor.simple("SELECT 1").await?;
        Ok(started.elapsed())
    }

    /// Close the session
    ///
    /// An open transaction is rolled back, matching what the server does
    /// when a client disconnects mid-transaction. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if self.tx_open.swap(false, Ordering::Relaxed) {
            debug!(target = %self.target, "discarding uncommitted transaction");
            self.executor.simple("ROLLBACK").await?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection(format!(
                "session to {} is closed",
                self.target
            )));
        }
        Ok(())
    }

    async fn begin_if_needed(&self) -> Result<()> {
        if self.autocommit() || self.in_transaction() {
            return Ok(());
        }
        self.executor.simple("BEGIN").await?;
        self.tx_open.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod script {
    //! Scripted executor for offline tests

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Executor that replays canned responses and records every statement
    pub(crate) struct ScriptedExecutor {
        responses: Mutex<HashMap<String, Execution>>,
        failures: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Respond to `sql` with a canned execution
        pub(crate) fn respond(self, sql: &str, execution: Execution) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(sql.to_string(), execution);
            self
        }

        /// Respond to `sql` with a result set of text rows
        pub(crate) fn respond_rows(self, sql: &str, columns: &[&str], rows: &[&[&str]]) -> Self {
            let set = ResultSet {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: rows
                    .iter()
                    .map(|row| {
                        Row(row
                            .iter()
                            .map(|v| SqlValue::Text(v.to_string()))
                            .collect())
                    })
                    .collect(),
            };
            let execution = Execution {
                status: CommandStatus::for_statement(sql, set.rows.len() as u64),
                rows: Some(set),
            };
            self.respond(sql, execution)
        }

        /// Fail `sql` with a query error
        pub(crate) fn fail(self, sql: &str, message: &str) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(sql.to_string(), message.to_string());
            self
        }

        /// Every statement seen so far, in execution order
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, sql: &str) -> Result<()> {
            self.calls.lock().unwrap().push(sql.to_string());
            if let Some(message) = self.failures.lock().unwrap().get(sql) {
                return Err(Error::query(message.clone()).with_sql(sql));
            }
            Ok(())
        }

        fn canned(&self, sql: &str) -> Execution {
            self.responses
                .lock()
                .unwrap()
                .get(sql)
                .cloned()
                .unwrap_or_else(|| Execution::status_only(CommandStatus::for_statement(sql, 0)))
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn simple(&self, sql: &str) -> Result<Execution> {
            self.record(sql)?;
            Ok(self.canned(sql))
        }

        async fn query(&self, sql: &str, _params: &[SqlValue]) -> Result<ResultSet> {
            self.record(sql)?;
            Ok(self.canned(sql).rows.unwrap_or_default())
        }

        async fn execute(&self, sql: &str, _params: &[SqlValue]) -> Result<u64> {
            self.record(sql)?;
            Ok(self.canned(sql).status.affected)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::script::ScriptedExecutor;
    use super::*;
    use crate::error::ErrorCategory;

    fn session_over(executor: ScriptedExecutor, autocommit: bool) -> (Session, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let session = Session::from_executor(
            Box::new(Arc::clone(&executor)),
            autocommit,
            "127.0.0.1:5432/localdb",
        );
        (session, executor)
    }

    #[tokio::test]
    async fn test_autocommit_statements_run_bare() {
        let (session, executor) = session_over(ScriptedExecutor::new(), true);
        session
            .run_simple("INSERT INTO testtable VALUES (1)")
            .await
            .unwrap();
        assert_eq!(executor.calls(), vec!["INSERT INTO testtable VALUES (1)"]);
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_first_statement_opens_transaction_when_autocommit_off() {
        let (session, executor) = session_over(ScriptedExecutor::new(), false);
        session.run_simple("SELECT * FROM testtable").await.unwrap();
        session
            .run_simple("INSERT INTO testtable VALUES (1)")
            .await
            .unwrap();
        assert_eq!(
            executor.calls(),
            vec![
                "BEGIN",
                "SELECT * FROM testtable",
                "INSERT INTO testtable VALUES (1)",
            ]
        );
        assert!(session.in_transaction());
    }

    #[tokio::test]
    async fn test_commit_ends_transaction_and_next_statement_reopens() {
        let (session, executor) = session_over(ScriptedExecutor::new(), false);
        session.run_simple("SELECT 1").await.unwrap();
        session.commit().await.unwrap();
        assert!(!session.in_transaction());
        session.run_simple("SELECT 2").await.unwrap();
        assert_eq!(
            executor.calls(),
            vec!["BEGIN", "SELECT 1", "COMMIT", "BEGIN", "SELECT 2"]
        );
    }

    #[tokio::test]
    async fn test_commit_without_transaction_is_a_noop() {
        let (session, executor) = session_over(ScriptedExecutor::new(), true);
        session.commit().await.unwrap();
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_autocommit_toggle_rejected_inside_transaction() {
        let (session, _executor) = session_over(ScriptedExecutor::new(), false);
        session.run_simple("SELECT 1").await.unwrap();
        let err = session.set_autocommit(true).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transaction);
    }

    #[tokio::test]
    async fn test_close_rolls_back_uncommitted_work_once() {
        let (session, executor) = session_over(ScriptedExecutor::new(), false);
        session.run_simple("SELECT 1").await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(executor.calls(), vec!["BEGIN", "SELECT 1", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_statements() {
        let (session, _executor) = session_over(ScriptedExecutor::new(), true);
        session.close().await.unwrap();
        let err = session.run_simple("SELECT 1").await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[tokio::test]
    async fn test_ping_never_opens_a_transaction() {
        let (session, executor) = session_over(ScriptedExecutor::new(), false);
        session.ping().await.unwrap();
        assert_eq!(executor.calls(), vec!["SELECT 1"]);
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_executor_failure_propagates() {
        let executor = ScriptedExecutor::new().fail("SELECT boom", "synthetic failure");
        let (session, _executor) = session_over(executor, true);
        let err = session.run_simple("SELECT boom").await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Query);
    }

    #[tokio::test]
    async fn test_rollback_discards_open_transaction() {
        let (session, executor) = session_over(ScriptedExecutor::new(), false);
        session
            .run_simple("INSERT INTO testtable VALUES (1)")
            .await
            .unwrap();
        assert!(session.in_transaction());
        session.rollback().await.unwrap();
        assert!(!session.in_transaction());
        assert_eq!(
            executor.calls(),
            vec!["BEGIN", "INSERT INTO testtable VALUES (1)", "ROLLBACK"]
        );
    }

    #[tokio::test]
    async fn test_rollback_without_transaction_is_a_noop() {
        let (session, executor) = session_over(ScriptedExecutor::new(), true);
        session.rollback().await.unwrap();
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_autocommit_toggle_applies_between_transactions() {
        let (session, executor) = session_over(ScriptedExecutor::new(), true);
        session.set_autocommit(false).unwrap();
        assert!(!session.autocommit());
        session.run_simple("SELECT 1").await.unwrap();
        session.commit().await.unwrap();
        session.set_autocommit(true).unwrap();
        assert!(session.autocommit());
        session.run_simple("SELECT 2").await.unwrap();
        assert_eq!(
            executor.calls(),
            vec!["BEGIN", "SELECT 1", "COMMIT", "SELECT 2"]
        );
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_retriable_error() {
        // Port 1 on loopback has no listener, so the failure is local
        // rather than a server-reported SQLSTATE.
        let config = crate::config::ConnectConfig::default()
            .with_host("127.0.0.1")
            .with_port(1)
            .with_connect_timeout_ms(2_000);
        let err = Session::connect(&config).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(matches!(
            err.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout
        ));
    }
}

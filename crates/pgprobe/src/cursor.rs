//! Statement cursors
//!
//! A [`Cursor`] is a short-lived handle scoped to one block of work: execute
//! a statement, read the status message the server reported, fetch the rows.
//! It borrows its [`Session`], so the borrow checker enforces the release
//! discipline that other client libraries leave to `with` blocks or `defer`.
//! The cursor holds no server-side state; dropping it releases everything.

use crate::error::Result;
use crate::results::{CommandStatus, Execution, ResultSet, Row, SqlValue};
use crate::session::Session;

/// A scoped handle for executing statements and reading their results
pub struct Cursor<'a> {
    session: &'a Session,
    last: Option<Execution>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self {
            session,
            last: None,
        }
    }

    /// Execute a statement over the simple-query protocol
    ///
    /// Replaces whatever the cursor held from the previous statement.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.last = Some(self.session.run_simple(sql).await?);
        Ok(())
    }

    /// Execute a parameterized, row-returning statement
    ///
    /// The rows are read back through [`Cursor::fetch_all`] or
    /// [`Cursor::result_set`], like after [`Cursor::execute`].
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<()> {
        let rows = self.session.run_query(sql, params).await?;
        let status = CommandStatus::for_statement(sql, rows.rows.len() as u64);
        self.last = Some(Execution {
            status,
            rows: Some(rows),
        });
        Ok(())
    }

    /// Execute a parameterized statement that returns no rows
    pub async fn execute_params(&mut self, sql: &str, params: &[SqlValue]) -> Result<()> {
        let status = self.session.run_execute(sql, params).await?;
        self.last = Some(Execution::status_only(status));
        Ok(())
    }

    /// The status message of the last statement, e.g. `INSERT 0 1`
    ///
    /// `None` before the first execution.
    pub fn status_message(&self) -> Option<String> {
        self.last.as_ref().map(|e| e.status.to_string())
    }

    /// The result set of the last statement, if it returned rows
    pub fn result_set(&self) -> Option<&ResultSet> {
        self.last.as_ref().and_then(|e| e.rows.as_ref())
    }

    /// All rows of the last statement
    ///
    /// Empty before the first execution and for statements without rows.
    pub fn fetch_all(&self) -> &[Row] {
        self.result_set().map_or(&[], |set| set.rows.as_slice())
    }

    /// The full record of the last execution
    pub fn last(&self) -> Option<&Execution> {
        self.last.as_ref()
    }
}

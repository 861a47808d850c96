//! Probe operations
//!
//! The operations a probe run is made of. [`check`] is the canonical one:
//! insert a marker row, read the table back, and report what the server
//! said at each step. [`ping`], [`insert`] and [`fetch`] expose the
//! individual pieces for scripting.
//!
//! All table names pass [`validate_identifier`] before they are spliced
//! into SQL; values travel as integers or bind parameters.

use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::results::{Row, SqlValue};
use crate::session::Session;

/// Unquoted PostgreSQL identifier: letters, digits, underscore, no leading digit
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"));

/// Server-side limit on identifier length (NAMEDATALEN - 1)
const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `name` is safe to splice into a statement as a table name
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "identifier {name:?} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(Error::config(format!(
            "invalid identifier {name:?}: expected letters, digits or underscores"
        )));
    }
    Ok(())
}

/// Tunable knobs for the probe operations
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Table the probe writes to and reads from
    pub table: String,
    /// Marker value inserted by [`check`] and [`insert`]
    pub value: i32,
    /// Expected column count for [`fetch`], if any
    pub expect_columns: Option<usize>,
    /// Expected row count for [`fetch`], if any
    pub expect_rows: Option<usize>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            table: "testtable".to_string(),
            value: 1,
            expect_columns: None,
            expect_rows: None,
        }
    }
}

impl ProbeOptions {
    /// Set the table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the marker value
    pub fn with_value(mut self, value: i32) -> Self {
        self.value = value;
        self
    }

    /// Expect an exact column count from [`fetch`]
    pub fn with_expect_columns(mut self, count: usize) -> Self {
        self.expect_columns = Some(count);
        self
    }

    /// Expect an exact row count from [`fetch`]
    pub fn with_expect_rows(mut self, count: usize) -> Self {
        self.expect_rows = Some(count);
        self
    }
}

/// Outcome of the insert-then-select round trip
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    /// `host:port/dbname` the probe ran against
    pub target: String,
    /// Table the probe used
    pub table: String,
    /// Status message of the INSERT, e.g. `INSERT 0 1`
    pub insert_status: String,
    /// Status message of the SELECT, e.g. `SELECT 1`
    pub select_status: String,
    /// Column names of the read-back result
    pub columns: Vec<String>,
    /// The read-back rows
    pub rows: Vec<Row>,
    /// Number of read-back rows
    pub row_count: usize,
    /// Whether the marker value appeared in the first column of some row
    pub value_seen: bool,
    /// Whether the round trip held up end to end
    pub passed: bool,
    /// Wall-clock duration of the round trip
    pub elapsed_ms: u64,
}

/// Outcome of a latency probe
#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    /// `host:port/dbname` the probe ran against
    pub target: String,
    /// Observed round-trip latency in milliseconds
    pub latency_ms: f64,
}

/// Outcome of a standalone insert
#[derive(Debug, Clone, Serialize)]
pub struct InsertReport {
    /// `host:port/dbname` the probe ran against
    pub target: String,
    /// Table the row went into
    pub table: String,
    /// The inserted value
    pub value: i32,
    /// Status message reported by the server
    pub status: String,
}

/// One verified expectation of a [`fetch`]
#[derive(Debug, Clone, Serialize)]
pub struct Expectation {
    /// What was checked (`columns` or `rows`)
    pub check: String,
    /// The expected count
    pub expected: usize,
    /// The observed count
    pub actual: usize,
    /// Whether expected and observed agree
    pub passed: bool,
}

/// Outcome of a standalone table read
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    /// `host:port/dbname` the probe ran against
    pub target: String,
    /// Table that was read
    pub table: String,
    /// Status message reported by the server
    pub status: String,
    /// Column names of the result
    pub columns: Vec<String>,
    /// The fetched rows
    pub rows: Vec<Row>,
    /// Number of fetched rows
    pub row_count: usize,
    /// Verified expectations, if any were configured
    pub expectations: Vec<Expectation>,
    /// Whether every configured expectation held
    pub passed: bool,
}

/// Insert the marker value, read the table back, and report both steps
///
/// This is the scripted round trip: one cursor inserts and reports the
/// server's status message, a second cursor selects the whole table. The
/// report passes when the server acknowledged exactly one inserted row and
/// the marker value shows up in the first column of a read-back row.
pub async fn check(session: &Session, options: &ProbeOptions) -> Result<CheckReport> {
    validate_identifier(&options.table)?;
    info!(target = %session.target(), table = %options.table, "running insert/select check");
    let started = Instant::now();

    let (insert_status, inserted) = {
        let mut cursor = session.cursor();
        cursor
            .execute(&format!(
                "INSERT INTO {} VALUES ({})",
                options.table, options.value
            ))
            .await?;
        let affected = cursor
            .last()
            .map(|e| e.status.affected)
            .ok_or_else(|| Error::internal("insert recorded no execution"))?;
        (cursor.status_message().unwrap_or_default(), affected)
    };
    debug!(status = %insert_status, "insert acknowledged");

    let (select_status, columns, rows) = {
        let mut cursor = session.cursor();
        cursor
            .execute(&format!("SELECT * FROM {}", options.table))
            .await?;
        let (columns, rows) = cursor
            .result_set()
            .map(|set| (set.columns.clone(), set.rows.clone()))
            .unwrap_or_default();
        (cursor.status_message().unwrap_or_default(), columns, rows)
    };
    debug!(status = %select_status, rows = rows.len(), "table read back");

    let value_seen = rows
        .iter()
        .any(|row| row.get(0).is_some_and(|cell| cell_matches(cell, options.value)));
    let passed = inserted == 1 && value_seen;
    let row_count = rows.len();

    Ok(CheckReport {
        target: session.target().to_string(),
        table: options.table.clone(),
        insert_status,
        select_status,
        columns,
        rows,
        row_count,
        value_seen,
        passed,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Measure one round trip to the server
pub async fn ping(session: &Session) -> Result<PingReport> {
    let latency = session.ping().await?;
    Ok(PingReport {
        target: session.target().to_string(),
        latency_ms: latency.as_secs_f64() * 1000.0,
    })
}

/// Insert the marker value through a bind parameter
pub async fn insert(session: &Session, options: &ProbeOptions) -> Result<InsertReport> {
    validate_identifier(&options.table)?;
    let mut cursor = session.cursor();
    cursor
        .execute_params(
            &format!("INSERT INTO {} VALUES ($1)", options.table),
            &[SqlValue::Int(options.value)],
        )
        .await?;
    Ok(InsertReport {
        target: session.target().to_string(),
        table: options.table.clone(),
        value: options.value,
        status: cursor.status_message().unwrap_or_default(),
    })
}

/// Read the whole table and verify any configured expectations
pub async fn fetch(session: &Session, options: &ProbeOptions) -> Result<FetchReport> {
    validate_identifier(&options.table)?;
    let mut cursor = session.cursor();
    cursor
        .execute(&format!("SELECT * FROM {}", options.table))
        .await?;
    let (columns, rows) = cursor
        .result_set()
        .map(|set| (set.columns.clone(), set.rows.clone()))
        .unwrap_or_default();
    let status = cursor.status_message().unwrap_or_default();

    let mut expectations = Vec::new();
    if let Some(expected) = options.expect_columns {
        expectations.push(Expectation {
            check: "columns".to_string(),
            expected,
            actual: columns.len(),
            passed: columns.len() == expected,
        });
    }
    if let Some(expected) = options.expect_rows {
        expectations.push(Expectation {
            check: "rows".to_string(),
            expected,
            actual: rows.len(),
            passed: rows.len() == expected,
        });
    }
    let passed = expectations.iter().all(|e| e.passed);
    let row_count = rows.len();

    Ok(FetchReport {
        target: session.target().to_string(),
        table: options.table.clone(),
        status,
        columns,
        rows,
        row_count,
        expectations,
        passed,
    })
}

/// Whether a cell holds the marker value, in either numeric or text form
///
/// The simple protocol reports every value as text, so `1` comes back as
/// `"1"`.
fn cell_matches(cell: &SqlValue, value: i32) -> bool {
    match cell {
        SqlValue::Int(v) => *v == value,
        SqlValue::BigInt(v) => *v == i64::from(value),
        SqlValue::Text(v) => v == &value.to_string(),
        _ => false,
    }
}

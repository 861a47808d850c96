//! Query results
//!
//! Owned, driver-independent representations of what a statement produced:
//! typed cell values, rows, result sets and the libpq-style command status
//! string reported after execution.

use std::fmt;

use serde::Serialize;

/// A single cell value
///
/// Covers the column types the probe works with. The simple protocol
/// reports every value as text; the binary protocol decodes this set and
/// refuses columns outside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// `boolean`
    Bool(bool),
    /// `smallint` / `integer`
    Int(i32),
    /// `bigint`
    BigInt(i64),
    /// `real` / `double precision`
    Float(f64),
    /// Character types
    Text(String),
    /// `bytea`
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Whether this value is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value as a signed integer, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as text, if it is a character type
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Bytes(v) => {
                write!(f, "\\x")?;
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One row of a result set
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    /// The cell values in column order
    pub fn values(&self) -> &[SqlValue] {
        &self.0
    }

    /// The value at a column index
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.0.get(index)
    }

    /// The number of columns in the row
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

/// The complete output of a row-returning statement
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ResultSet {
    /// Column names in result order
    pub columns: Vec<String>,
    /// The fetched rows
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// The number of fetched rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result set has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render the rows one per line, tuple style
    pub fn render(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&row.to_string());
            out.push('\n');
        }
        out
    }
}

/// The driver-reported completion status of a statement
///
/// PostgreSQL reports completion as a command tag such as `INSERT 0 1` or
/// `SELECT 3`. The driver surfaces the verb and the affected-row count
/// separately; this type carries both and renders the canonical tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandStatus {
    /// The uppercased command verb (`INSERT`, `SELECT`, `CREATE TABLE`, …)
    pub verb: String,
    /// Rows affected or returned, as reported by the server
    pub affected: u64,
}

impl CommandStatus {
    /// Build a status from the executed statement and the reported count
    ///
    /// DDL tags name the object kind the way the server does (`CREATE
    /// TABLE`, `DROP INDEX`). Tags for less common statement forms may not
    /// match the server's wording exactly.
    pub fn for_statement(sql: &str, affected: u64) -> Self {
        let mut words = sql.split_whitespace().map(str::to_ascii_uppercase);
        let first = words.next().unwrap_or_default();
        let verb = match first.as_str() {
            // The object kind follows the verb, past any modifiers.
            "CREATE" | "DROP" | "ALTER" => {
                match words.find(|w| {
                    !matches!(
                        w.as_str(),
                        "OR" | "REPLACE" | "UNIQUE" | "TEMP" | "TEMPORARY" | "UNLOGGED"
                    )
                }) {
                    Some(kind) => format!("{first} {kind}"),
                    None => first,
                }
            }
            "TRUNCATE" => "TRUNCATE TABLE".to_string(),
            _ => first,
        };
        Self { verb, affected }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verb.as_str() {
            // INSERT tags carry a legacy OID slot that is always 0 now.
            "INSERT" => write!(f, "INSERT 0 {}", self.affected),
            "SELECT" | "UPDATE" | "DELETE" | "FETCH" | "MOVE" | "COPY" => {
                write!(f, "{} {}", self.verb, self.affected)
            }
            _ => write!(f, "{}", self.verb),
        }
    }
}

/// What executing one statement produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    /// The completion status reported by the server
    pub status: CommandStatus,
    /// The result set, for row-returning statements
    pub rows: Option<ResultSet>,
}

impl Execution {
    /// An execution that produced a status but no rows
    pub fn status_only(status: CommandStatus) -> Self {
        Self { status, rows: None }
    }
}

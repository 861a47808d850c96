//! # pgprobe
//!
//! A small smoke-probe client for PostgreSQL-compatible servers. It connects
//! with ordinary credentials, writes a marker row, reads it back over the
//! wire and reports exactly what the server said, status messages included.
//! The point is not to be a database library but to answer one question
//! fast: does this endpoint behave like PostgreSQL end to end?
//!
//! ## Example
//!
//! ```no_run
//! use pgprobe::{ConnectConfig, ProbeOptions, Session};
//!
//! # #[tokio::main]
//! # async fn main() -> pgprobe::Result<()> {
//! let config = ConnectConfig::default().with_host("127.0.0.1");
//! let session = Session::connect(&config).await?;
//!
//! let report = pgprobe::probe::check(&session, &ProbeOptions::default()).await?;
//! println!("{}", report.insert_status);
//! println!("{} rows read back", report.row_count);
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sessions and cursors
//!
//! A [`Session`] owns one connection and tracks autocommit state the way
//! interactive clients do. Work happens through scoped [`Cursor`]s that
//! borrow the session, so results are released deterministically when the
//! cursor goes out of scope.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod probe;
pub mod results;
pub mod session;

pub use config::ConnectConfig;
pub use cursor::Cursor;
pub use error::{Error, ErrorCategory, Result};
pub use probe::{CheckReport, Expectation, FetchReport, InsertReport, PingReport, ProbeOptions};
pub use results::{CommandStatus, Execution, ResultSet, Row, SqlValue};
pub use session::{Executor, PgExecutor, Session};

/// Common imports for probe consumers
pub mod prelude {
    pub use crate::config::ConnectConfig;
    pub use crate::cursor::Cursor;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::probe::{self, ProbeOptions};
    pub use crate::results::{CommandStatus, ResultSet, Row, SqlValue};
    pub use crate::session::{Executor, Session};
}

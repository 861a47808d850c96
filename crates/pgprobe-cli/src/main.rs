//! pgprobe CLI - smoke-probe a PostgreSQL endpoint from the command line
//!
//! Connects with the configured credentials, runs one of the probe
//! operations and prints the server's answers. Exits non-zero when the
//! probe fails or any expectation does not hold.

use clap::{Args, Parser, Subcommand, ValueEnum};
use pgprobe::{probe, ConnectConfig, ProbeOptions, Session};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pgprobe")]
#[command(about = "Smoke-probe a PostgreSQL endpoint: connect, write a marker row, read it back")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Output format
    #[arg(long, value_enum, global = true, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Connection parameters, shared by every subcommand
///
/// Precedence, lowest to highest: built-in defaults, `PGPROBE_*`
/// environment variables, `--dsn`, individual flags.
#[derive(Args)]
struct ConnectArgs {
    /// Connection DSN: a postgres:// URL or libpq key=value pairs
    #[arg(long, global = true, value_name = "DSN")]
    dsn: Option<String>,

    /// Server host [default: 127.0.0.1]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port [default: 5432]
    #[arg(short = 'p', long, global = true)]
    port: Option<u16>,

    /// Login role [default: tom]
    #[arg(short = 'U', long, global = true)]
    user: Option<String>,

    /// Login password [default: pencil]
    #[arg(long, global = true)]
    password: Option<String>,

    /// Database name [default: localdb]
    #[arg(short = 'd', long, global = true)]
    dbname: Option<String>,

    /// Connection deadline in milliseconds [default: 10000]
    #[arg(long, global = true, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Run statements in an explicit transaction, committed before exit
    #[arg(long, global = true)]
    no_autocommit: bool,
}

impl ConnectArgs {
    fn resolve(&self) -> anyhow::Result<ConnectConfig> {
        let mut config = ConnectConfig::default();
        config.apply_env()?;
        if let Some(dsn) = &self.dsn {
            config.apply_dsn(dsn)?;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(dbname) = &self.dbname {
            config.dbname = dbname.clone();
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if self.no_autocommit {
            config.autocommit = false;
        }
        Ok(config)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable lines
    Text,
    /// Pretty-printed JSON report
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full round trip: insert a marker row, read the table back
    Check {
        /// Table to write to and read back
        #[arg(long, default_value = "testtable")]
        table: String,

        /// Marker value to insert
        #[arg(long, default_value = "1")]
        value: i32,
    },

    /// Measure one round trip to the server
    Ping,

    /// Insert the marker value through a bind parameter
    Insert {
        /// Table to write to
        #[arg(long, default_value = "testtable")]
        table: String,

        /// Value to insert
        #[arg(long, default_value = "1")]
        value: i32,
    },

    /// Read the whole table and print every row
    Fetch {
        /// Table to read
        #[arg(long, default_value = "testtable")]
        table: String,

        /// Fail unless the result has exactly this many columns
        #[arg(long)]
        expect_columns: Option<usize>,

        /// Fail unless the result has exactly this many rows
        #[arg(long)]
        expect_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.connect.resolve()?;
    let session = Session::connect(&config).await?;

    let outcome = run(&session, cli.command, cli.output).await;

    // Persist whatever succeeded before surfacing the outcome.
    if outcome.is_ok() {
        session.commit().await?;
    }
    if let Err(e) = session.close().await {
        warn!(error = %e, "session close failed");
    }
    outcome
}

async fn run(session: &Session, command: Commands, output: OutputFormat) -> anyhow::Result<()> {
    match command {
        Commands::Check { table, value } => {
            let options = ProbeOptions::default().with_table(table).with_value(value);
            let report = probe::check(session, &options).await?;
            emit(output, &report, |report| {
                println!("{}", report.insert_status);
                println!("{}", report.select_status);
                for row in &report.rows {
                    println!("{row}");
                }
                if report.passed {
                    println!(
                        "✓ check passed against {} in {}ms",
                        report.target, report.elapsed_ms
                    );
                } else {
                    println!(
                        "✗ check failed against {} in {}ms",
                        report.target, report.elapsed_ms
                    );
                }
            })?;
            if !report.passed {
                anyhow::bail!("check failed against {}", report.target);
            }
        }

        Commands::Ping => {
            let report = probe::ping(session).await?;
            emit(output, &report, |report| {
                println!("✓ pong from {} in {:.2}ms", report.target, report.latency_ms);
            })?;
        }

        Commands::Insert { table, value } => {
            let options = ProbeOptions::default().with_table(table).with_value(value);
            let report = probe::insert(session, &options).await?;
            emit(output, &report, |report| {
                println!(
                    "✓ inserted {} into '{}' ({})",
                    report.value, report.table, report.status
                );
            })?;
        }

        Commands::Fetch {
            table,
            expect_columns,
            expect_rows,
        } => {
            let mut options = ProbeOptions::default().with_table(table);
            options.expect_columns = expect_columns;
            options.expect_rows = expect_rows;
            let report = probe::fetch(session, &options).await?;
            emit(output, &report, |report| {
                println!("{}", report.status);
                for row in &report.rows {
                    println!("{row}");
                }
                println!("{} row(s) from '{}'", report.row_count, report.table);
                for expectation in &report.expectations {
                    if expectation.passed {
                        println!(
                            "✓ {}: expected {}, got {}",
                            expectation.check, expectation.expected, expectation.actual
                        );
                    } else {
                        println!(
                            "✗ {}: expected {}, got {}",
                            expectation.check, expectation.expected, expectation.actual
                        );
                    }
                }
            })?;
            if !report.passed {
                anyhow::bail!("fetch expectations not met for '{}'", report.table);
            }
        }
    }
    Ok(())
}

/// Print a report as text or JSON
fn emit<R: Serialize>(
    output: OutputFormat,
    report: &R,
    text: impl FnOnce(&R),
) -> anyhow::Result<()> {
    match output {
        OutputFormat::Text => text(report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

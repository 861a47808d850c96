//! PostgreSQL testcontainer setup for probe integration tests

use anyhow::{Context, Result};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

use pgprobe::ConnectConfig;

/// PostgreSQL container provisioned with the probe's role, database and table
pub struct ProbePostgres {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    pub host: String,
    pub port: u16,
}

#[allow(dead_code)]
impl ProbePostgres {
    /// Start a fresh container and provision `tom`/`pencil`/`localdb`
    pub async fn start() -> Result<Self> {
        info!("🐘 starting PostgreSQL testcontainer...");

        let container = Postgres::default()
            .start()
            .await
            .context("failed to start PostgreSQL container")?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        info!("✅ PostgreSQL container started on {}:{}", host, port);

        let harness = Self {
            container,
            host,
            port,
        };

        harness.wait_for_ready().await?;
        harness.provision().await?;

        Ok(harness)
    }

    /// Connection parameters pointing the probe's defaults at this container
    pub fn config(&self) -> ConnectConfig {
        // user, password and dbname stay on their defaults on purpose
        ConnectConfig::default()
            .with_host(&self.host)
            .with_port(self.port)
    }

    /// Create an empty single-column table owned by the probe role
    pub async fn create_table(&self, name: &str) -> Result<()> {
        let client = self.probe_client().await?;
        client
            .simple_query(&format!("CREATE TABLE {name} (id INTEGER)"))
            .await
            .with_context(|| format!("failed to create table {name}"))?;
        debug!("created table {name}");
        Ok(())
    }

    /// Run one statement against localdb as the probe role
    pub async fn run_sql(&self, sql: &str) -> Result<()> {
        let client = self.probe_client().await?;
        client
            .simple_query(sql)
            .await
            .with_context(|| format!("statement failed: {sql}"))?;
        Ok(())
    }

    /// Number of rows currently in a table, counted out of band
    pub async fn count_rows(&self, name: &str) -> Result<i64> {
        let client = self.probe_client().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {name}"), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let conn_str = format!(
            "host={} port={} user=postgres password=postgres dbname=postgres",
            self.host, self.port
        );

        for attempt in 1..=60 {
            match tokio_postgres::connect(&conn_str, NoTls).await {
                Ok(_) => {
                    debug!("PostgreSQL ready after {} attempts", attempt);
                    return Ok(());
                }
                Err(e) => {
                    if attempt % 10 == 0 {
                        info!("waiting for PostgreSQL (attempt {}/60): {}", attempt, e);
                    }
                    sleep(Duration::from_millis(1000)).await;
                }
            }
        }

        anyhow::bail!("PostgreSQL did not become ready in time")
    }

    async fn provision(&self) -> Result<()> {
        let admin = self.admin_client().await?;

        admin
            .simple_query("CREATE ROLE tom WITH LOGIN PASSWORD 'pencil'")
            .await
            .context("failed to create probe role")?;
        admin
            .simple_query("CREATE DATABASE localdb OWNER tom")
            .await
            .context("failed to create probe database")?;

        self.create_table("testtable").await?;

        info!("✅ provisioned role tom and database localdb");
        Ok(())
    }

    async fn admin_client(&self) -> Result<Client> {
        self.client_for("postgres", "postgres", "postgres").await
    }

    async fn probe_client(&self) -> Result<Client> {
        self.client_for("tom", "pencil", "localdb").await
    }

    async fn client_for(&self, user: &str, password: &str, dbname: &str) -> Result<Client> {
        let conn_str = format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, user, password, dbname
        );

        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("harness connection error: {}", e);
            }
        });

        Ok(client)
    }
}

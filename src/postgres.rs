//! PostgreSQL staging store.

use crate::config::PostgresConfig;
use crate::error::{Error, Result, with_timeout};
use crate::schema::{StagingSchema, qualified};
use crate::store::{CommitReport, StagedBatch, StagingStore};
use crate::watermark;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryFutureExt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::Client;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, instrument};

#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(feature = "tls-native")]
use postgres_native_tls::MakeTlsConnector;

/// PostgreSQL store with a bounded set of connections.
///
/// Each unit of work acquires its own connection, so concurrent streams
/// never share a transaction. Every statement runs under its own deadline,
/// so a large batch is bounded per round trip rather than as a whole.
pub struct PostgresStore {
    pg_config: tokio_postgres::Config,
    config: PostgresConfig,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
}

/// A connection checked out for one unit of work.
///
/// Dropping it closes the connection and frees its pool slot.
pub struct PooledClient {
    client: Client,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl PostgresStore {
    /// Create the store. No connection is opened until first use.
    ///
    /// `call_timeout` bounds each statement sent to the server.
    pub fn new(config: PostgresConfig, call_timeout: Duration) -> Result<Self> {
        let pg_config = config.to_pg_config()?;
        let permits = Arc::new(Semaphore::new(config.pool_size as usize));
        Ok(Self {
            pg_config,
            config,
            permits,
            call_timeout,
        })
    }

    /// Staging schema name.
    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    /// Check out a connection, waiting for a free pool slot.
    #[instrument(skip(self), fields(target = %self.config.display_target()))]
    pub async fn acquire(&self) -> Result<PooledClient> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::postgres_connection("Connection pool closed", e))?;

        debug!("Opening PostgreSQL connection");

        #[cfg(feature = "tls-native")]
        let client = {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(self.config.accept_invalid_certs)
                .build()
                .map_err(|e| Error::postgres_connection("TLS setup failed", e))?;
            let connector = MakeTlsConnector::new(connector);
            let (client, connection) = self
                .pg_config
                .connect(connector)
                .await
                .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        };

        #[cfg(not(feature = "tls-native"))]
        let client = {
            let (client, connection) = self
                .pg_config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        };

        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }

    fn settings_table(&self) -> String {
        qualified(&self.config.schema, &self.config.settings_table)
    }
}

#[async_trait]
impl StagingStore for PostgresStore {
    #[instrument(skip(self), fields(schema = %self.config.schema))]
    async fn ensure_schema(&self, tables: &[String]) -> Result<()> {
        let schema = StagingSchema::for_streams(
            &self.config.schema,
            &self.config.settings_table,
            tables.iter().map(String::as_str),
        );

        let client = self.acquire().await?;
        for ddl in schema.ddl_statements() {
            debug!("Executing DDL: {}", ddl);
            let statement = client.batch_execute(&ddl).map_err(|e| {
                Error::schema_with_source(format!("DDL failed in {}", self.config.schema), e)
            });
            with_timeout("create staging schema", self.call_timeout, statement).await?;
        }

        info!(
            "Created/verified staging schema {} with {} tables",
            self.config.schema,
            schema.tables.len()
        );
        Ok(())
    }

    async fn last_batch_date(&self, workflow_key: &str) -> Result<Option<DateTime<Utc>>> {
        let client = self.acquire().await?;
        let settings = self.settings_table();
        let read = watermark::read(&*client, &settings, workflow_key);
        with_timeout("read watermark", self.call_timeout, read).await
    }

    #[instrument(skip(self))]
    async fn advance_watermark(&self, workflow_key: &str, date: DateTime<Utc>) -> Result<()> {
        let client = self.acquire().await?;
        let settings = self.settings_table();
        let write = watermark::upsert(&*client, &settings, workflow_key, date);
        with_timeout("write watermark", self.call_timeout, write).await
    }

    #[instrument(skip(self, batch), fields(workflow_key = %batch.workflow_key, rows = batch.rows.len()))]
    async fn commit_batch(&self, table: &str, batch: &StagedBatch) -> Result<CommitReport> {
        let target = qualified(&self.config.schema, table);
        let deadline = self.call_timeout;
        let mut client = self.acquire().await?;

        // Dropping the transaction without commit rolls it back
        let begin = client
            .transaction()
            .map_err(|e| Error::postgres_query(table, "Begin transaction failed", e));
        let tx = with_timeout("begin batch", deadline, begin).await?;

        let sql = format!(
            "INSERT INTO {} (id, object_value, update_ts) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO NOTHING",
            target
        );
        let prepare = tx
            .prepare(&sql)
            .map_err(|e| Error::postgres_query(table, "Prepare insert failed", e));
        let insert = with_timeout("prepare insert", deadline, prepare).await?;

        let mut report = CommitReport::default();
        for row in &batch.rows {
            let update_ts = row.update_ts.naive_utc();
            let params: [&(dyn ToSql + Sync); 3] = [&row.id, &row.object_value, &update_ts];
            let execute = tx
                .execute(&insert, &params)
                .map_err(|e| Error::postgres_query(table, format!("Insert of '{}' failed", row.id), e));
            let affected = with_timeout("insert row", deadline, execute).await?;
            if affected == 0 {
                report.duplicates += 1;
            } else {
                report.inserted += 1;
            }
        }

        if let Some(date) = batch.watermark {
            let settings = self.settings_table();
            let upsert = watermark::upsert(&tx, &settings, &batch.workflow_key, date);
            with_timeout("write watermark", deadline, upsert).await?;
            report.watermark_advanced = true;
        }

        let commit = tx
            .commit()
            .map_err(|e| Error::postgres_query(table, "Commit failed", e));
        with_timeout("commit batch", deadline, commit).await?;

        debug!(
            "Committed {} rows ({} duplicates) to {}",
            report.inserted, report.duplicates, target
        );
        Ok(report)
    }

    #[instrument(skip(self, sql))]
    async fn apply_script(&self, name: &str, sql: &str) -> Result<()> {
        let mut client = self.acquire().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::postgres_query(name, "Begin transaction failed", e))?;
        tx.batch_execute(sql)
            .await
            .map_err(|e| Error::transform(name, e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| Error::transform(name, format!("Commit failed: {}", e)))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.acquire().await?;
        let ping = client
            .query_one("SELECT 1", &[])
            .map_err(|e| Error::postgres_query("", "Ping failed", e));
        with_timeout("ping staging", self.call_timeout, ping).await?;
        Ok(())
    }
}

//! Configuration types and builders for mongo-stage-sync.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Main configuration for the sync pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    /// Source document store configuration
    #[validate(nested)]
    pub source: SourceConfig,

    /// PostgreSQL staging destination configuration
    #[validate(nested)]
    pub postgres: PostgresConfig,

    /// Sync behavior configuration
    #[validate(nested)]
    #[serde(default)]
    pub sync: SyncBehaviorConfig,

    /// Streams to synchronize
    #[validate(nested)]
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,

    /// Transformation scripts run after every stream succeeded
    #[validate(nested)]
    #[serde(default)]
    pub transforms: Vec<TransformScript>,

    /// Retry configuration
    #[validate(nested)]
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mongo_uri =
            std::env::var("MONGO_URI").map_err(|_| Error::config("MONGO_URI not set"))?;
        let mongo_db = std::env::var("MONGO_DB").map_err(|_| Error::config("MONGO_DB not set"))?;

        let mut builder = Self::builder()
            .mongo_uri(&mongo_uri)
            .mongo_database(&mongo_db);

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.postgres_url(url);
        } else {
            let host = std::env::var("POSTGRES_HOST")
                .map_err(|_| Error::config("DATABASE_URL or POSTGRES_HOST not set"))?;
            let port = match std::env::var("POSTGRES_PORT") {
                Ok(p) => p
                    .parse::<u16>()
                    .map_err(|e| Error::config(format!("Invalid POSTGRES_PORT '{}': {}", p, e)))?,
                Err(_) => default_port(),
            };
            builder = builder
                .postgres_host(host)
                .postgres_port(port)
                .postgres_database(std::env::var("POSTGRES_DATABASE").unwrap_or_default())
                .postgres_user(std::env::var("POSTGRES_USER").unwrap_or_default())
                .postgres_password(std::env::var("POSTGRES_PASSWORD").unwrap_or_default());
        }

        if let Ok(schema) = std::env::var("STAGING_SCHEMA") {
            builder = builder.staging_schema(schema);
        }

        for stream in streams_from_env()? {
            builder = builder.stream(stream);
        }

        builder.build()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path, e)))?;

        Self::from_toml(&content).map_err(|e| match e {
            Error::Config { message, source } => Error::Config {
                message: format!("{}: {}", path, message),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config_with_source("Failed to parse TOML", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|e| Error::validation(format!("Config validation failed: {}", e)))?;

        let mut keys = HashSet::new();
        for stream in &self.streams {
            if !keys.insert(stream.workflow_key.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate workflow_key '{}': each stream owns its watermark",
                    stream.workflow_key
                )));
            }
        }

        let mut tables = HashSet::new();
        for stream in &self.streams {
            if !tables.insert(stream.table_name()) {
                return Err(Error::validation(format!(
                    "Two streams write to staging table '{}'",
                    stream.table_name()
                )));
            }
        }

        if self.sync.batch_timeout_secs < self.sync.timeout_secs {
            return Err(Error::validation(
                "sync.batch_timeout_secs must not be shorter than sync.timeout_secs",
            ));
        }

        if self.streams.iter().any(|s| s.table_name() == self.postgres.settings_table) {
            return Err(Error::validation(format!(
                "Stream table collides with settings table '{}'",
                self.postgres.settings_table
            )));
        }

        Ok(())
    }

    /// Enabled streams, in configuration order.
    pub fn enabled_streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.iter().filter(|s| s.enabled)
    }
}

/// MongoDB source configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourceConfig {
    /// Connection URI
    #[validate(length(min = 1))]
    #[serde(skip_serializing)]
    pub uri: String,

    /// Database name
    #[validate(length(min = 1, max = 64))]
    pub database: String,
}

/// PostgreSQL connection configuration.
///
/// Either `url` or the discrete `host`/`port`/`database`/`user`/`password`
/// fields are used; `url` wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostgresConfig {
    /// Connection URL
    #[serde(default, skip_serializing)]
    pub url: Option<String>,

    /// Host name
    #[serde(default = "default_host")]
    pub host: String,

    /// Port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name
    #[serde(default)]
    pub database: String,

    /// User name
    #[serde(default)]
    pub user: String,

    /// Password
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Staging schema name
    #[validate(length(min = 1, max = 63))]
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Watermark settings table name (inside `schema`)
    #[validate(length(min = 1, max = 63))]
    #[serde(default = "default_settings_table")]
    pub settings_table: String,

    /// Connection pool size
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// SSL mode
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Accept self-signed server certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: default_schema(),
            settings_table: default_settings_table(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_timeout_secs(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
        }
    }
}

impl PostgresConfig {
    /// Build a driver configuration.
    pub fn to_pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut pg = match &self.url {
            Some(url) => url
                .parse::<tokio_postgres::Config>()
                .map_err(|e| Error::config_with_source("Invalid PostgreSQL URL", e))?,
            None => {
                let mut pg = tokio_postgres::Config::new();
                pg.host(&self.host)
                    .port(self.port)
                    .dbname(&self.database)
                    .user(&self.user);
                if !self.password.is_empty() {
                    pg.password(&self.password);
                }
                pg
            }
        };

        pg.connect_timeout(self.connect_timeout())
            .application_name("mongo-stage-sync")
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require => tokio_postgres::config::SslMode::Require,
            });
        Ok(pg)
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Human-readable target for logs, without credentials.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(url) => mask_url(url),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// SSL mode for PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Disable SSL
    Disable,
    /// Prefer SSL (default)
    #[default]
    Prefer,
    /// Require SSL
    Require,
}

/// Sync behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncBehaviorConfig {
    /// Deadline for each network call, in seconds
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Deadline for fetching or committing one whole stream batch, in seconds
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// Auto-create staging schema and tables
    #[serde(default = "default_true")]
    pub auto_create_tables: bool,

    /// Max streams synchronized at once (0 = one worker per stream)
    #[serde(default)]
    pub max_concurrent_streams: usize,
}

impl Default for SyncBehaviorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            batch_timeout_secs: default_batch_timeout_secs(),
            auto_create_tables: true,
            max_concurrent_streams: 0,
        }
    }
}

impl SyncBehaviorConfig {
    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Deadline for a stream's whole fetch or commit.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

/// One source collection paired with its timestamp field and progress key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StreamDescriptor {
    /// Source collection name
    #[validate(length(min = 1, max = 120))]
    pub source: String,

    /// Field holding the record creation timestamp
    #[validate(length(min = 1))]
    pub timestamp_field: String,

    /// Watermark key in the settings table
    #[validate(length(min = 1, max = 128))]
    pub workflow_key: String,

    /// Staging table (defaults to the collection name)
    #[serde(default)]
    pub table: Option<String>,

    /// Field holding the record identity
    #[validate(length(min = 1))]
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StreamDescriptor {
    /// Create a descriptor with default table and identity field.
    pub fn new(
        source: impl Into<String>,
        timestamp_field: impl Into<String>,
        workflow_key: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            timestamp_field: timestamp_field.into(),
            workflow_key: workflow_key.into(),
            table: None,
            id_field: default_id_field(),
            enabled: true,
        }
    }

    /// Set the staging table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Staging table name.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.source)
    }
}

/// A declarative SQL script applied after staging completes.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransformScript {
    /// Script name used in logs and results
    #[validate(length(min = 1))]
    pub name: String,

    /// Path to the SQL file
    pub script: PathBuf,

    /// Stage number; lower stages run first, equal stages run together
    #[serde(default)]
    pub stage: u32,

    /// Enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Max retry attempts after the first one
    #[validate(range(min = 0, max = 10))]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Max backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier (1.0 = fixed delay)
    #[validate(range(min = 1.0, max = 10.0))]
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add jitter
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Get initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get max backoff duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Builder for SyncConfig.
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    mongo_uri: Option<String>,
    mongo_database: Option<String>,
    postgres_url: Option<String>,
    postgres_host: Option<String>,
    postgres_port: Option<u16>,
    postgres_database: Option<String>,
    postgres_user: Option<String>,
    postgres_password: Option<String>,
    postgres_pool_size: Option<u32>,
    staging_schema: Option<String>,
    timeout_secs: Option<u64>,
    batch_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    streams: Vec<StreamDescriptor>,
    transforms: Vec<TransformScript>,
    log_level: Option<String>,
}

impl SyncConfigBuilder {
    /// Set MongoDB connection URI.
    pub fn mongo_uri(mut self, uri: impl Into<String>) -> Self {
        self.mongo_uri = Some(uri.into());
        self
    }

    /// Set MongoDB database name.
    pub fn mongo_database(mut self, db: impl Into<String>) -> Self {
        self.mongo_database = Some(db.into());
        self
    }

    /// Set PostgreSQL connection URL.
    pub fn postgres_url(mut self, url: impl Into<String>) -> Self {
        self.postgres_url = Some(url.into());
        self
    }

    /// Set PostgreSQL host.
    pub fn postgres_host(mut self, host: impl Into<String>) -> Self {
        self.postgres_host = Some(host.into());
        self
    }

    /// Set PostgreSQL port.
    pub fn postgres_port(mut self, port: u16) -> Self {
        self.postgres_port = Some(port);
        self
    }

    /// Set PostgreSQL database.
    pub fn postgres_database(mut self, db: impl Into<String>) -> Self {
        self.postgres_database = Some(db.into());
        self
    }

    /// Set PostgreSQL user.
    pub fn postgres_user(mut self, user: impl Into<String>) -> Self {
        self.postgres_user = Some(user.into());
        self
    }

    /// Set PostgreSQL password.
    pub fn postgres_password(mut self, password: impl Into<String>) -> Self {
        self.postgres_password = Some(password.into());
        self
    }

    /// Set PostgreSQL connection pool size.
    pub fn postgres_pool_size(mut self, size: u32) -> Self {
        self.postgres_pool_size = Some(size);
        self
    }

    /// Set staging schema name.
    pub fn staging_schema(mut self, schema: impl Into<String>) -> Self {
        self.staging_schema = Some(schema.into());
        self
    }

    /// Set per-call deadline in seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set whole-batch deadline in seconds.
    pub fn batch_timeout_secs(mut self, secs: u64) -> Self {
        self.batch_timeout_secs = Some(secs);
        self
    }

    /// Set max retry attempts.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Add a stream.
    pub fn stream(mut self, stream: StreamDescriptor) -> Self {
        self.streams.push(stream);
        self
    }

    /// Add a transformation script.
    pub fn transform(mut self, name: impl Into<String>, script: impl Into<PathBuf>, stage: u32) -> Self {
        self.transforms.push(TransformScript {
            name: name.into(),
            script: script.into(),
            stage,
            enabled: true,
        });
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Build the SyncConfig.
    pub fn build(self) -> Result<SyncConfig> {
        let mongo_uri = self
            .mongo_uri
            .ok_or_else(|| Error::config("mongo_uri required"))?;
        Url::parse(&mongo_uri).map_err(|e| Error::config(format!("Invalid MongoDB URI: {}", e)))?;

        let mongo_database = self
            .mongo_database
            .ok_or_else(|| Error::config("mongo_database required"))?;

        if let Some(ref url) = self.postgres_url {
            Url::parse(url).map_err(|e| Error::config(format!("Invalid PostgreSQL URL: {}", e)))?;
        } else if self.postgres_host.is_none() {
            return Err(Error::config("postgres_url or postgres_host required"));
        }

        let config = SyncConfig {
            source: SourceConfig {
                uri: mongo_uri,
                database: mongo_database,
            },
            postgres: PostgresConfig {
                url: self.postgres_url,
                host: self.postgres_host.unwrap_or_else(default_host),
                port: self.postgres_port.unwrap_or_else(default_port),
                database: self.postgres_database.unwrap_or_default(),
                user: self.postgres_user.unwrap_or_default(),
                password: self.postgres_password.unwrap_or_default(),
                schema: self.staging_schema.unwrap_or_else(default_schema),
                pool_size: self.postgres_pool_size.unwrap_or_else(default_pool_size),
                ..Default::default()
            },
            sync: SyncBehaviorConfig {
                timeout_secs: self.timeout_secs.unwrap_or_else(default_timeout_secs),
                batch_timeout_secs: self
                    .batch_timeout_secs
                    .unwrap_or_else(default_batch_timeout_secs),
                ..Default::default()
            },
            streams: self.streams,
            transforms: self.transforms,
            retry: RetryConfig {
                max_retries: self.max_retries.unwrap_or_else(default_max_retries),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: self.log_level.unwrap_or_else(default_log_level),
                ..Default::default()
            },
        };

        config.validate()?;
        Ok(config)
    }
}

// Defaults
fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    5432
}
fn default_schema() -> String {
    "staging".into()
}
fn default_settings_table() -> String {
    "srv_wf_settings".into()
}
fn default_pool_size() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_batch_timeout_secs() -> u64 {
    3600
}
fn default_id_field() -> String {
    "_id".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    5000
}
fn default_max_backoff_ms() -> u64 {
    60000
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

/// Stream entry accepted in environment JSON.
///
/// Either the compact `["collection", "timestamp_field", "workflow_key"]`
/// triple or a full descriptor object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StreamEntry {
    /// Compact triple
    Triple(String, String, String),
    /// Full descriptor
    Full(StreamDescriptor),
}

impl From<StreamEntry> for StreamDescriptor {
    fn from(entry: StreamEntry) -> Self {
        match entry {
            StreamEntry::Triple(source, field, key) => StreamDescriptor::new(source, field, key),
            StreamEntry::Full(descriptor) => descriptor,
        }
    }
}

/// Wrapper struct for object format: `{"streams": [...]}`
#[derive(Debug, Deserialize)]
struct StreamsWrapper {
    streams: Vec<StreamEntry>,
}

/// Parse a stream list from JSON.
///
/// Supports both formats:
/// - Array format: `[{...}, ["ads", "created_at", "wf_ads"]]`
/// - Object format: `{"streams": [...]}`
pub fn parse_streams_json(json: &str) -> Result<Vec<StreamDescriptor>> {
    match serde_json::from_str::<Vec<StreamEntry>>(json) {
        Ok(entries) => {
            tracing::debug!("Parsed as array format: {} streams", entries.len());
            return Ok(entries.into_iter().map(StreamDescriptor::from).collect());
        }
        Err(e) => {
            tracing::debug!("Array format parse failed: {}", e);
        }
    }

    match serde_json::from_str::<StreamsWrapper>(json) {
        Ok(wrapper) => {
            tracing::debug!("Parsed as object format: {} streams", wrapper.streams.len());
            Ok(wrapper.streams.into_iter().map(StreamDescriptor::from).collect())
        }
        Err(e) => {
            tracing::debug!("Object format parse failed: {}", e);
            Err(Error::config(
                "Failed to parse streams JSON: expected array [...] or object {\"streams\": [...]}",
            ))
        }
    }
}

/// Decode the base64 form used for CI secrets.
pub fn decode_streams_secret(encoded: &str) -> Result<Vec<StreamDescriptor>> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
        Error::config(format!("Failed to decode SYNC_STREAMS_CONFIG base64: {}", e))
    })?;
    let json = String::from_utf8(decoded)
        .map_err(|e| Error::config(format!("SYNC_STREAMS_CONFIG is not valid UTF-8: {}", e)))?;
    parse_streams_json(&json)
}

/// Load streams from `SYNC_STREAMS_CONFIG` (base64 JSON) or
/// `SYNC_STREAMS_JSON` (plain JSON, for local dev).
pub fn streams_from_env() -> Result<Vec<StreamDescriptor>> {
    if let Ok(encoded) = std::env::var("SYNC_STREAMS_CONFIG") {
        return decode_streams_secret(&encoded);
    }
    match std::env::var("SYNC_STREAMS_JSON") {
        Ok(json) => parse_streams_json(&json),
        Err(_) => {
            tracing::warn!("No SYNC_STREAMS_CONFIG or SYNC_STREAMS_JSON found");
            Ok(vec![])
        }
    }
}

/// Mask sensitive parts of a URL for logging.
pub fn mask_url(url: &str) -> String {
    if let Ok(mut parsed) = Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        "[invalid url]".to_string()
    }
}

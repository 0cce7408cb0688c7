//! HTTP fetch client and record-store drivers for isync.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isync_core::{CellValue, ColumnKind, TableSpec};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug_span, warn, Instrument};

pub const CRATE_NAME: &str = "isync-storage";

/// Postgres caps a single statement at this many bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Credentials handle attached to every request against one source.
///
/// `Header` carries a pre-negotiated `Authorization` value (for example an
/// NTLM token obtained by the caller); it is sent verbatim.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
    Header(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Header(_) => f.write_str("Header(<redacted>)"),
        }
    }
}

impl Credentials {
    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Anonymous => builder,
            Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::Header(value) => builder.header(reqwest::header::AUTHORIZATION, value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Failure of one page request. Either variant aborts the remaining pages of
/// the query that raised it.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("credentials rejected by {url}: {detail}")]
    Auth { url: String, detail: String },
    #[error("source unavailable at {url}: {detail}")]
    Unavailable {
        url: String,
        status: Option<u16>,
        detail: String,
    },
}

impl SourceError {
    pub fn auth(url: impl Into<String>, detail: impl Into<String>) -> Self {
        SourceError::Auth {
            url: url.into(),
            detail: detail.into(),
        }
    }

    pub fn unavailable(url: impl Into<String>, detail: impl Into<String>) -> Self {
        SourceError::Unavailable {
            url: url.into(),
            status: None,
            detail: detail.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Auth { .. } => "source_auth",
            SourceError::Unavailable { .. } => "source_unavailable",
        }
    }
}

/// Map a non-success status to the error taxonomy: 401/403 mean the
/// credentials were rejected, anything else means the source is unavailable.
pub fn classify_status(status: StatusCode, url: &str, body_excerpt: &str) -> SourceError {
    let detail = if body_excerpt.is_empty() {
        format!("http status {}", status.as_u16())
    } else {
        format!("http status {}: {}", status.as_u16(), body_excerpt)
    };
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SourceError::Auth {
            url: url.to_string(),
            detail,
        }
    } else {
        SourceError::Unavailable {
            url: url.to_string(),
            status: Some(status.as_u16()),
            detail,
        }
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        credentials: &Credentials,
    ) -> Result<JsonValue, SourceError> {
        let request = credentials.apply(
            self.client
                .get(url)
                .query(query)
                .header(reqwest::header::ACCEPT, "application/json"),
        );
        let response = self.send(request, "GET", url).await?;
        decode_json(response, url).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &[(&str, String)],
        credentials: &Credentials,
    ) -> Result<JsonValue, SourceError> {
        let mut request = self
            .client
            .post(url)
            .json(body)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = self.send(credentials.apply(request), "POST", url).await?;
        decode_json(response, url).await
    }

    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
        credentials: &Credentials,
    ) -> Result<String, SourceError> {
        let request = credentials.apply(self.client.get(url).query(query));
        let response = self.send(request, "GET", url).await?;
        response
            .text()
            .await
            .map_err(|err| SourceError::unavailable(url, format!("reading body: {err}")))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        method: &str,
        url: &str,
    ) -> Result<reqwest::Response, SourceError> {
        let span = debug_span!("http_request", method, url);
        async move {
            let response = request
                .send()
                .await
                .map_err(|err| SourceError::unavailable(url, err.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, url, &excerpt(&body)))
        }
        .instrument(span)
        .await
    }
}

async fn decode_json(response: reqwest::Response, url: &str) -> Result<JsonValue, SourceError> {
    let status = response.status().as_u16();
    response
        .json::<JsonValue>()
        .await
        .map_err(|err| SourceError::Unavailable {
            url: url.to_string(),
            status: Some(status),
            detail: format!("malformed JSON body: {err}"),
        })
}

/// Result of a sync-point lookup. `NoRows` and `TableMissing` both mean no
/// prior sync exists and the next fetch is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPoint {
    At(DateTime<Utc>),
    NoRows,
    TableMissing,
}

impl SyncPoint {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncPoint::At(ts) => Some(*ts),
            SyncPoint::NoRows | SyncPoint::TableMissing => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncPoint::At(_) => "at",
            SyncPoint::NoRows => "no_rows",
            SyncPoint::TableMissing => "table_missing",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to record store: {0}")]
    Connect(#[source] BoxError),
    #[error("creating table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: BoxError,
    },
    #[error("writing to {table}: {source}")]
    Write {
        table: String,
        #[source]
        source: BoxError,
    },
    #[error("querying {table}: {source}")]
    Query {
        table: String,
        #[source]
        source: BoxError,
    },
}

/// Persistence seam of the reconciler. Rows passed to `upsert_rows` are
/// aligned with `table.columns()` (see [`TableSpec::row_values`]).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError>;

    /// Insert-or-overwrite every row in one atomic statement keyed on the
    /// table's key column. Returns the number of rows affected.
    async fn upsert_rows(&self, table: &TableSpec, rows: &[Vec<CellValue>]) -> Result<u64, StoreError>;

    /// Maximum updated-at value among rows of `partition`, or of the whole
    /// table when the partition or the table's partition column is absent.
    async fn max_updated_at(
        &self,
        table: &TableSpec,
        partition: Option<&str>,
    ) -> Result<SyncPoint, StoreError>;

    /// Distinct non-null text values of `column` among rows of `partition`
    /// (table-wide as for `max_updated_at`). Empty when the table is missing.
    async fn distinct_values(
        &self,
        table: &TableSpec,
        column: &str,
        partition: Option<&str>,
    ) -> Result<BTreeSet<String>, StoreError>;
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `ON CONFLICT` tail of the upsert statement: every non-key column is
/// overwritten with the incoming value.
pub fn conflict_clause(table: &TableSpec) -> String {
    let key = quote_ident(table.key_column());
    let updates = table
        .non_key_columns()
        .map(|c| {
            let col = quote_ident(&c.name);
            format!("{col} = EXCLUDED.{col}")
        })
        .collect::<Vec<_>>();
    if updates.is_empty() {
        format!(" ON CONFLICT ({key}) DO NOTHING")
    } else {
        format!(" ON CONFLICT ({key}) DO UPDATE SET {}", updates.join(", "))
    }
}

pub fn is_undefined_table_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

fn push_cell(b: &mut Separated<'_, '_, Postgres, &'static str>, cell: &CellValue, kind: ColumnKind) {
    match (kind, cell) {
        (ColumnKind::Text, CellValue::Text(s)) => b.push_bind(Some(s.clone())),
        (ColumnKind::Text, _) => b.push_bind(None::<String>),
        (ColumnKind::Timestamp, CellValue::Timestamp(ts)) => b.push_bind(Some(*ts)),
        (ColumnKind::Timestamp, _) => b.push_bind(None::<DateTime<Utc>>),
        (ColumnKind::Number, CellValue::Number(n)) => b.push_bind(Some(*n)),
        (ColumnKind::Number, _) => b.push_bind(None::<f64>),
        (ColumnKind::Json, CellValue::Json(v)) => b.push_bind(Some(v.clone())),
        (ColumnKind::Json, _) => b.push_bind(None::<JsonValue>),
    };
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Connect(Box::new(err)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError> {
        sqlx::query(&table.create_table_sql())
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Schema {
                table: table.name().to_string(),
                source: Box::new(err),
            })?;
        Ok(())
    }

    async fn upsert_rows(&self, table: &TableSpec, rows: &[Vec<CellValue>]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let column_list = table
            .columns()
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let kinds = table.columns().iter().map(|c| c.kind).collect::<Vec<_>>();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(table.name()),
            column_list
        ));
        qb.push_values(rows, |mut b, row| {
            for (cell, kind) in row.iter().zip(&kinds) {
                push_cell(&mut b, cell, *kind);
            }
        });
        qb.push(conflict_clause(table));

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Write {
                table: table.name().to_string(),
                source: Box::new(err),
            })?;
        Ok(result.rows_affected())
    }

    async fn max_updated_at(
        &self,
        table: &TableSpec,
        partition: Option<&str>,
    ) -> Result<SyncPoint, StoreError> {
        let updated = quote_ident(table.updated_at_column());
        let name = quote_ident(table.name());
        let scoped = table.partition_column().zip(partition);
        let sql = match scoped {
            Some((column, _)) => format!(
                "SELECT MAX({updated}) FROM {name} WHERE {} = $1",
                quote_ident(column)
            ),
            None => format!("SELECT MAX({updated}) FROM {name}"),
        };

        let mut query = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(&sql);
        if let Some((_, value)) = scoped {
            query = query.bind(value.to_string());
        }

        match query.fetch_one(&self.pool).await {
            Ok(Some(ts)) => Ok(SyncPoint::At(ts)),
            Ok(None) => Ok(SyncPoint::NoRows),
            Err(err) if is_undefined_table_error(&err) => {
                warn!(table = table.name(), "table missing; treating as no prior sync point");
                Ok(SyncPoint::TableMissing)
            }
            Err(err) => Err(StoreError::Query {
                table: table.name().to_string(),
                source: Box::new(err),
            }),
        }
    }

    async fn distinct_values(
        &self,
        table: &TableSpec,
        column: &str,
        partition: Option<&str>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let query_error = |source: BoxError| StoreError::Query {
            table: table.name().to_string(),
            source,
        };
        if table.column(column).is_none() {
            return Err(query_error(format!("column {column} not declared").into()));
        }
        let target = quote_ident(column);
        let name = quote_ident(table.name());
        let scoped = table.partition_column().zip(partition);
        let sql = match scoped {
            Some((partition_column, _)) => format!(
                "SELECT DISTINCT {target}::text FROM {name} WHERE {target} IS NOT NULL AND {} = $1",
                quote_ident(partition_column)
            ),
            None => format!("SELECT DISTINCT {target}::text FROM {name} WHERE {target} IS NOT NULL"),
        };

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if let Some((_, value)) = scoped {
            query = query.bind(value.to_string());
        }

        match query.fetch_all(&self.pool).await {
            Ok(values) => Ok(values.into_iter().collect()),
            Err(err) if is_undefined_table_error(&err) => Ok(BTreeSet::new()),
            Err(err) => Err(query_error(err.into())),
        }
    }
}

/// In-process store with the same upsert and sync-point semantics as the
/// Postgres driver. Tables must be created with `ensure_table` first.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Vec<CellValue>>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table` ordered by key; empty when the table does not exist.
    pub async fn rows(&self, table: &str) -> Vec<Vec<CellValue>> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &str, key: &str) -> Option<Vec<CellValue>> {
        let tables = self.tables.lock().await;
        tables.get(table).and_then(|rows| rows.get(key).cloned())
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }
}

fn column_index(table: &TableSpec, name: &str) -> Option<usize> {
    table.columns().iter().position(|c| c.name == name)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ensure_table(&self, table: &TableSpec) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.entry(table.name().to_string()).or_default();
        Ok(())
    }

    async fn upsert_rows(&self, table: &TableSpec, rows: &[Vec<CellValue>]) -> Result<u64, StoreError> {
        let write_error = |detail: String| StoreError::Write {
            table: table.name().to_string(),
            source: detail.into(),
        };
        let key_idx = column_index(table, table.key_column())
            .ok_or_else(|| write_error("key column not declared".to_string()))?;

        let mut tables = self.tables.lock().await;
        let stored = tables
            .get_mut(table.name())
            .ok_or_else(|| write_error(format!("relation \"{}\" does not exist", table.name())))?;

        // Validate the whole batch before touching state so a failure leaves
        // the table unchanged.
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != table.columns().len() {
                return Err(write_error(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    table.columns().len()
                )));
            }
            match &row[key_idx] {
                CellValue::Text(key) => keyed.push((key.clone(), row.clone())),
                _ => return Err(write_error("null value in key column".to_string())),
            }
        }

        let affected = keyed.len() as u64;
        for (key, row) in keyed {
            stored.insert(key, row);
        }
        Ok(affected)
    }

    async fn max_updated_at(
        &self,
        table: &TableSpec,
        partition: Option<&str>,
    ) -> Result<SyncPoint, StoreError> {
        let tables = self.tables.lock().await;
        let Some(rows) = tables.get(table.name()) else {
            return Ok(SyncPoint::TableMissing);
        };
        let updated_idx = column_index(table, table.updated_at_column()).ok_or_else(|| {
            StoreError::Query {
                table: table.name().to_string(),
                source: "updated-at column not declared".into(),
            }
        })?;
        let partition_filter = table
            .partition_column()
            .and_then(|column| column_index(table, column))
            .zip(partition);

        let max = rows
            .values()
            .filter(|row| match partition_filter {
                Some((idx, wanted)) => matches!(&row[idx], CellValue::Text(p) if p == wanted),
                None => true,
            })
            .filter_map(|row| match &row[updated_idx] {
                CellValue::Timestamp(ts) => Some(*ts),
                _ => None,
            })
            .max();

        Ok(max.map(SyncPoint::At).unwrap_or(SyncPoint::NoRows))
    }

    async fn distinct_values(
        &self,
        table: &TableSpec,
        column: &str,
        partition: Option<&str>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(rows) = tables.get(table.name()) else {
            return Ok(BTreeSet::new());
        };
        let target_idx = column_index(table, column).ok_or_else(|| StoreError::Query {
            table: table.name().to_string(),
            source: format!("column {column} not declared").into(),
        })?;
        let partition_filter = table
            .partition_column()
            .and_then(|column| column_index(table, column))
            .zip(partition);

        Ok(rows
            .values()
            .filter(|row| match partition_filter {
                Some((idx, wanted)) => matches!(&row[idx], CellValue::Text(p) if p == wanted),
                None => true,
            })
            .filter_map(|row| row[target_idx].as_text())
            .collect())
    }
}

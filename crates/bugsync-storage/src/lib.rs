//! Bug table storage + HTTP fetch utilities for bugsync.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bugsync_core::{BugRecord, TrackedFields};
use chrono::NaiveDateTime;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, FromRow};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bugsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("bug #{0} is already stored")]
    DuplicateBugId(i64),
    #[error("database session already closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Access to the single bug table for the lifetime of one database session.
///
/// Every write is durable as soon as the call returns.
#[async_trait]
pub trait BugStore: Send {
    /// All rows, ordered by bug id.
    async fn fetch_all(&mut self) -> Result<Vec<BugRecord>, StoreError>;

    async fn find_by_bug_id(&mut self, bug_id: i64) -> Result<Option<BugRecord>, StoreError>;

    async fn insert(&mut self, record: &BugRecord) -> Result<(), StoreError>;

    /// Overwrite the mutable columns of one row in a single statement, leaving
    /// `created_time` untouched. Returns `false` when no row matched.
    async fn update_fields(
        &mut self,
        bug_id: i64,
        fields: &TrackedFields,
    ) -> Result<bool, StoreError>;

    /// Remove one row. Returns `false` when no row matched. The reconciler
    /// updates rows in place and never calls this.
    async fn delete(&mut self, bug_id: i64) -> Result<bool, StoreError>;

    /// Release the session.
    async fn close(self) -> Result<(), StoreError>;
}

/// Plain or schema-qualified SQL identifier that is safe to splice into statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let raw = raw.trim();
        let parts = raw.split('.').collect::<Vec<_>>();
        if parts.is_empty() || parts.len() > 2 || !parts.iter().all(|p| is_identifier(p)) {
            return Err(StoreError::InvalidTableName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQL text, so reserved words like `user` or
    /// `order` are usable. Parts are lowercased to keep the folding Postgres
    /// applies to unquoted names.
    pub fn quoted(&self) -> String {
        self.0
            .split('.')
            .map(|part| format!("\"{}\"", part.to_ascii_lowercase()))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct PgSessionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl PgSessionConfig {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

#[derive(Debug, FromRow)]
struct BugRow {
    bug_id: i64,
    created_time: NaiveDateTime,
    version: Option<String>,
    target_release: Option<String>,
    component: Option<String>,
    severity: Option<String>,
    assignee: Option<String>,
    qa_contact: Option<String>,
    status: Option<String>,
}

impl From<BugRow> for BugRecord {
    fn from(row: BugRow) -> Self {
        BugRecord {
            bug_id: row.bug_id,
            created_time: row.created_time,
            fields: TrackedFields {
                version: row.version.unwrap_or_default(),
                target_release: row.target_release.unwrap_or_default(),
                component: row.component.unwrap_or_default(),
                severity: row.severity.unwrap_or_default(),
                assignee: row.assignee.unwrap_or_default(),
                qa_contact: row.qa_contact.unwrap_or_default(),
                status: row.status.unwrap_or_default(),
            },
        }
    }
}

const SELECT_COLUMNS: &str =
    "bug_id, created_time, version, target_release, component, severity, assignee, qa_contact, status";

/// One auto-commit PostgreSQL session over the configured bug table.
#[derive(Debug)]
pub struct PgBugStore {
    conn: PgConnection,
    table: TableName,
    relation: String,
}

impl PgBugStore {
    /// Open the session, retrying transient connection failures per `backoff`.
    pub async fn connect(
        config: &PgSessionConfig,
        table: TableName,
        backoff: BackoffPolicy,
    ) -> Result<Self, StoreError> {
        let options = config.connect_options();
        let mut attempt = 0usize;
        loop {
            match PgConnection::connect_with(&options).await {
                Ok(conn) => {
                    info!(host = %config.host, database = %config.database, %table, "database session opened");
                    let relation = table.quoted();
                    return Ok(Self {
                        conn,
                        table,
                        relation,
                    });
                }
                Err(err)
                    if classify_sqlx_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    warn!(attempt, error = %err, "database connect failed; retrying");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl BugStore for PgBugStore {
    async fn fetch_all(&mut self) -> Result<Vec<BugRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM {} ORDER BY bug_id", self.relation);
        let rows = sqlx::query_as::<_, BugRow>(&sql)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows.into_iter().map(BugRecord::from).collect())
    }

    async fn find_by_bug_id(&mut self, bug_id: i64) -> Result<Option<BugRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM {} WHERE bug_id = $1", self.relation);
        let row = sqlx::query_as::<_, BugRow>(&sql)
            .bind(bug_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(BugRecord::from))
    }

    async fn insert(&mut self, record: &BugRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} ({SELECT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.relation
        );
        let f = &record.fields;
        let result = sqlx::query(&sql)
            .bind(record.bug_id)
            .bind(record.created_time)
            .bind(&f.version)
            .bind(&f.target_release)
            .bind(&f.component)
            .bind(&f.severity)
            .bind(&f.assignee)
            .bind(&f.qa_contact)
            .bind(&f.status)
            .execute(&mut self.conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateBugId(record.bug_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_fields(
        &mut self,
        bug_id: i64,
        fields: &TrackedFields,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
               SET version = $2,
                   target_release = $3,
                   component = $4,
                   severity = $5,
                   assignee = $6,
                   qa_contact = $7,
                   status = $8
             WHERE bug_id = $1
            "#,
            self.relation
        );
        let result = sqlx::query(&sql)
            .bind(bug_id)
            .bind(&fields.version)
            .bind(&fields.target_release)
            .bind(&fields.component)
            .bind(&fields.severity)
            .bind(&fields.assignee)
            .bind(&fields.qa_contact)
            .bind(&fields.status)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&mut self, bug_id: i64) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE bug_id = $1", self.relation);
        let result = sqlx::query(&sql)
            .bind(bug_id)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        info!(table = %self.table, "database session closed");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<i64, BugRecord>,
    writes: usize,
    closed: bool,
}

/// In-process bug table. Clones share the same rows, so a handle kept aside
/// can inspect the table after the session has been closed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBugStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBugStore {
    pub fn with_records(records: impl IntoIterator<Item = BugRecord>) -> Self {
        let rows = records.into_iter().map(|r| (r.bug_id, r)).collect();
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                rows,
                ..Default::default()
            })),
        }
    }

    pub async fn records(&self) -> Vec<BugRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn get(&self, bug_id: i64) -> Option<BugRecord> {
        self.state.lock().await.rows.get(&bug_id).cloned()
    }

    /// Number of successful inserts, updates and deletes.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl BugStore for MemoryBugStore {
    async fn fetch_all(&mut self) -> Result<Vec<BugRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state.rows.values().cloned().collect())
    }

    async fn find_by_bug_id(&mut self, bug_id: i64) -> Result<Option<BugRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state.rows.get(&bug_id).cloned())
    }

    async fn insert(&mut self, record: &BugRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        if state.rows.contains_key(&record.bug_id) {
            return Err(StoreError::DuplicateBugId(record.bug_id));
        }
        state.rows.insert(record.bug_id, record.clone());
        state.writes += 1;
        Ok(())
    }

    async fn update_fields(
        &mut self,
        bug_id: i64,
        fields: &TrackedFields,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let Some(row) = state.rows.get_mut(&bug_id) else {
            return Ok(false);
        };
        row.fields = fields.clone();
        state.writes += 1;
        Ok(true)
    }

    async fn delete(&mut self, bug_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let removed = state.rows.remove(&bug_id).is_some();
        if removed {
            state.writes += 1;
        }
        Ok(removed)
    }

    async fn close(self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Only failures to reach the server are retried; auth and SQL errors are final.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying retryable statuses and transport errors with backoff.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, headers).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(url)
                .headers(headers.clone())
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, status = status.as_u16(), "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

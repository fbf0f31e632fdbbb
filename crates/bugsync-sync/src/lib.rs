//! Reconciliation pass: verify stored bugs, then ingest newly created ones.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context, Result};
use bugsync_core::{BugRecord, FieldChange, TrackedFields};
use bugsync_source::{
    load_fixture_snapshot, BugSource, BugzillaConfig, BugzillaSource, FixtureBugSource,
};
use bugsync_storage::{
    BackoffPolicy, BugStore, HttpClientConfig, HttpFetcher, PgBugStore, PgSessionConfig,
    TableName,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bugsync-sync";

pub const ENV_CONFIG_PATH: &str = "BUGSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BugzillaSettings {
    pub url: String,
    pub api_key: String,
    pub recent_window_hours: u32,
    pub recent_query: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for BugzillaSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            recent_window_hours: 24,
            recent_query: None,
            http_timeout_secs: 20,
            user_agent: "bugsync/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub table: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: String::new(),
            user: String::new(),
            password: String::new(),
            table: "customer_bugs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub cron: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cron: "0 0 6 * * *".to_string(),
        }
    }
}

/// Process configuration, resolved once at startup and passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub bugzilla: BugzillaSettings,
    pub database: DatabaseSettings,
    pub reports_dir: Option<PathBuf>,
    pub schedule: ScheduleSettings,
}

impl SyncConfig {
    /// YAML file named by `BUGSYNC_CONFIG` (if set), then environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::from_yaml_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_string(&mut self.bugzilla.url, lookup("BUGZILLA_URL"));
        override_string(&mut self.bugzilla.api_key, lookup("BUGZILLA_API_KEY"));
        if let Some(query) = lookup("BUGZILLA_RECENT_QUERY") {
            self.bugzilla.recent_query = Some(query);
        }
        override_parsed(
            &mut self.bugzilla.recent_window_hours,
            "BUGZILLA_RECENT_WINDOW_HOURS",
            lookup("BUGZILLA_RECENT_WINDOW_HOURS"),
        )?;
        override_parsed(
            &mut self.bugzilla.http_timeout_secs,
            "BUGSYNC_HTTP_TIMEOUT_SECS",
            lookup("BUGSYNC_HTTP_TIMEOUT_SECS"),
        )?;
        override_string(&mut self.bugzilla.user_agent, lookup("BUGSYNC_USER_AGENT"));
        override_string(&mut self.database.host, lookup("PGHOST"));
        override_parsed(&mut self.database.port, "PGPORT", lookup("PGPORT"))?;
        override_string(&mut self.database.name, lookup("PGDATABASE"));
        override_string(&mut self.database.user, lookup("PGUSER"));
        override_string(&mut self.database.password, lookup("PGPASSWORD"));
        override_string(&mut self.database.table, lookup("BUGSYNC_TABLE"));
        if let Some(dir) = lookup("BUGSYNC_REPORTS_DIR") {
            self.reports_dir = Some(PathBuf::from(dir));
        }
        override_string(&mut self.schedule.cron, lookup("BUGSYNC_SYNC_CRON"));
        Ok(())
    }

    /// Checks needed by every pass; the Bugzilla settings are checked separately
    /// because fixture runs do not use them.
    pub fn validate(&self) -> Result<()> {
        if self.database.name.trim().is_empty() {
            bail!("database name is not configured (PGDATABASE)");
        }
        if self.database.user.trim().is_empty() {
            bail!("database user is not configured (PGUSER)");
        }
        if self.bugzilla.recent_window_hours == 0 {
            bail!("recent window must be at least one hour");
        }
        self.table_name()?;
        Ok(())
    }

    pub fn validate_bugzilla(&self) -> Result<()> {
        if self.bugzilla.url.trim().is_empty() {
            bail!("bugzilla url is not configured (BUGZILLA_URL)");
        }
        if self.bugzilla.api_key.trim().is_empty() {
            bail!("bugzilla API key is not configured (BUGZILLA_API_KEY)");
        }
        Ok(())
    }

    pub fn table_name(&self) -> Result<TableName> {
        TableName::parse(&self.database.table).context("validating bug table name")
    }

    pub fn recent_window(&self) -> Duration {
        Duration::hours(i64::from(self.bugzilla.recent_window_hours))
    }

    pub fn pg_session(&self) -> PgSessionConfig {
        PgSessionConfig {
            host: self.database.host.clone(),
            port: self.database.port,
            database: self.database.name.clone(),
            user: self.database.user.clone(),
            password: self.database.password.clone(),
        }
    }

    pub fn bugzilla_config(&self) -> BugzillaConfig {
        BugzillaConfig {
            url: self.bugzilla.url.clone(),
            api_key: self.bugzilla.api_key.clone(),
            recent_query: self.bugzilla.recent_query.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: StdDuration::from_secs(self.bugzilla.http_timeout_secs),
            user_agent: Some(self.bugzilla.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn override_string(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn override_parsed<T>(target: &mut T, key: &str, value: Option<String>) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = value {
        *target = value
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid {key}={value:?}: {err}"))?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugChange {
    pub bug_id: i64,
    pub old: TrackedFields,
    pub new: TrackedFields,
    pub fields: Vec<FieldChange>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifySummary {
    pub checked: usize,
    pub changes: Vec<BugChange>,
    /// Stored ids that no longer resolve at the source.
    pub missing: Vec<i64>,
    /// Stored ids whose lookup failed for any other reason.
    pub failed: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBug {
    pub bug_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub reported: usize,
    pub inserted: Vec<i64>,
    pub already_present: Vec<i64>,
    pub skipped: Vec<SkippedBug>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub verification: VerifySummary,
    pub ingestion: IngestSummary,
}

pub struct Reconciler {
    source: Box<dyn BugSource>,
    window: Duration,
}

impl Reconciler {
    pub fn new(source: Box<dyn BugSource>, window: Duration) -> Self {
        Self { source, window }
    }

    /// Open one database session, run both phases over it, and close it.
    pub async fn run(&self, config: &SyncConfig) -> Result<SyncRunSummary> {
        let store = PgBugStore::connect(
            &config.pg_session(),
            config.table_name()?,
            BackoffPolicy::default(),
        )
        .await
        .context("opening database session")?;
        self.run_session(store).await
    }

    /// Verification then ingestion over `store`. The store is closed exactly once,
    /// whether or not the phases succeed.
    pub async fn run_session<S: BugStore>(&self, store: S) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.name());
        self.run_session_in_span(run_id, store).instrument(span).await
    }

    async fn run_session_in_span<S: BugStore>(
        &self,
        run_id: Uuid,
        mut store: S,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let outcome = self.run_phases(&mut store).await;
        let closed = store.close().await;

        let (verification, ingestion) = match (outcome, closed) {
            (Ok(phases), Ok(())) => phases,
            (Ok(_), Err(err)) => return Err(err).context("closing database session"),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "closing database session after failure");
                return Err(err);
            }
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            verification,
            ingestion,
        })
    }

    async fn run_phases<S: BugStore>(
        &self,
        store: &mut S,
    ) -> Result<(VerifySummary, IngestSummary)> {
        let verification = self.verify_existing(store).await?;
        let ingestion = self.ingest_new(store).await?;
        Ok((verification, ingestion))
    }

    /// Bring every stored row's mutable fields back in line with the source.
    pub async fn verify_existing<S: BugStore>(&self, store: &mut S) -> Result<VerifySummary> {
        let rows = store.fetch_all().await.context("reading stored bugs")?;
        let mut summary = VerifySummary {
            checked: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let bug_id = row.bug_id;
            let bug = match self.source.get_bug(bug_id).await {
                Ok(bug) => bug,
                Err(err) if err.is_fatal() => {
                    return Err(err).with_context(|| format!("fetching stored bug #{bug_id}"));
                }
                Err(err) if err.is_not_found() => {
                    warn!(bug_id, error = %err, "stored bug no longer resolves; row left as is");
                    summary.missing.push(bug_id);
                    continue;
                }
                Err(err) => {
                    warn!(bug_id, error = %err, "fetching stored bug failed; row left as is");
                    summary.failed.push(bug_id);
                    continue;
                }
            };

            let current = bug.tracked_fields();
            if current == row.fields {
                continue;
            }

            let fields = row.fields.diff(&current);
            info!(
                bug_id,
                old = %row.fields,
                new = %current,
                changed = ?fields.iter().map(|c| c.field.as_str()).collect::<Vec<_>>(),
                "change seen in bug"
            );

            let updated = store
                .update_fields(bug_id, &current)
                .await
                .with_context(|| format!("updating bug #{bug_id}"))?;
            if !updated {
                warn!(bug_id, "row vanished before update; re-inserting");
                store
                    .insert(&BugRecord {
                        bug_id,
                        created_time: row.created_time,
                        fields: current.clone(),
                    })
                    .await
                    .with_context(|| format!("re-inserting bug #{bug_id}"))?;
            }

            summary.changes.push(BugChange {
                bug_id,
                old: row.fields,
                new: current,
                fields,
            });
        }

        info!(
            checked = summary.checked,
            changed = summary.changes.len(),
            missing = summary.missing.len(),
            failed = summary.failed.len(),
            "existing data is up to date"
        );
        Ok(summary)
    }

    /// Insert bugs created within the window that are not stored yet.
    pub async fn ingest_new<S: BugStore>(&self, store: &mut S) -> Result<IngestSummary> {
        let recent = self
            .source
            .query_recent(self.window)
            .await
            .context("querying recently created bugs")?;
        let mut summary = IngestSummary {
            reported: recent.len(),
            ..Default::default()
        };
        info!(
            count = recent.len(),
            window_hours = self.window.num_hours(),
            "bugs reported in window"
        );

        if recent.is_empty() {
            info!("no new bugs raised in window; store update skipped");
            return Ok(summary);
        }

        for entry in recent {
            let bug_id = entry.id;
            let existing = store
                .find_by_bug_id(bug_id)
                .await
                .with_context(|| format!("looking up bug #{bug_id}"))?;
            if existing.is_some() {
                info!(bug_id, "record already exists");
                summary.already_present.push(bug_id);
                continue;
            }

            let bug = match self.source.get_bug(bug_id).await {
                Ok(bug) => bug,
                Err(err) if err.is_fatal() => {
                    return Err(err).with_context(|| format!("fetching new bug #{bug_id}"));
                }
                Err(err) => {
                    warn!(bug_id, error = %err, "fetching new bug failed; skipped");
                    summary.skipped.push(SkippedBug {
                        bug_id,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            let record = match BugRecord::from_details(&bug) {
                Ok(record) => record,
                Err(err) => {
                    warn!(bug_id, error = %err, "new bug has malformed creation time; skipped");
                    summary.skipped.push(SkippedBug {
                        bug_id,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            info!(
                bug_id,
                product = %bug.product,
                component = %bug.component,
                status = %bug.status,
                version = %bug.version,
                summary = %bug.summary,
                time = %record.created_time,
                severity = %bug.severity,
                target_release = ?bug.target_release,
                qa_contact = %bug.qa_contact,
                assignee = %bug.assignee,
                "fetched bug"
            );

            store
                .insert(&record)
                .await
                .with_context(|| format!("inserting bug #{bug_id}"))?;
            info!(bug_id, "record inserted");
            summary.inserted.push(bug_id);
        }

        Ok(summary)
    }
}

pub fn build_source(config: &SyncConfig, fixture: Option<&Path>) -> Result<Box<dyn BugSource>> {
    match fixture {
        Some(path) => {
            let snapshot = load_fixture_snapshot(path)?;
            Ok(Box::new(FixtureBugSource::new(snapshot)))
        }
        None => {
            config.validate_bugzilla()?;
            let http = HttpFetcher::new(config.http_client_config())?;
            Ok(Box::new(BugzillaSource::new(&config.bugzilla_config(), http)?))
        }
    }
}

/// One pass against the configured database, writing a report when `reports_dir` is set.
pub async fn run_sync_once(config: &SyncConfig, fixture: Option<&Path>) -> Result<SyncRunSummary> {
    config.validate()?;
    let source = build_source(config, fixture)?;
    let reconciler = Reconciler::new(source, config.recent_window());
    let summary = reconciler.run(config).await?;

    if let Some(dir) = &config.reports_dir {
        let path = write_report(dir, &summary).await?;
        info!(report = %path.display(), "run report written");
    }
    Ok(summary)
}

pub async fn write_report(reports_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("sync_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Scheduler running one live pass per tick of `schedule.cron`. Failed passes are
/// logged and the next tick runs normally.
pub async fn build_scheduler(config: Arc<SyncConfig>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule.cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let config = Arc::clone(&config);
        Box::pin(async move {
            match run_sync_once(&config, None).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    changed = summary.verification.changes.len(),
                    inserted = summary.ingestion.inserted.len(),
                    "scheduled sync complete"
                ),
                Err(err) => error!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bugsync_core::{BugDetails, BugSummary, TRACKED_FIELD_NAMES};
    use bugsync_source::SourceError;
    use bugsync_storage::{FetchError, MemoryBugStore, StoreError};
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn stored_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 10)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn bug(id: i64, status: &str) -> BugDetails {
        BugDetails {
            id,
            version: "7.0".into(),
            target_release: vec!["7.1".into(), "8.0".into()],
            component: "Networking".into(),
            severity: "high".into(),
            assignee: "dev@example.com".into(),
            qa_contact: "qa@example.com".into(),
            status: status.into(),
            creation_time: "20260224T09:15:00".into(),
            product: "Platform".into(),
            summary: format!("bug {id}"),
        }
    }

    fn record(id: i64, status: &str) -> BugRecord {
        BugRecord {
            bug_id: id,
            created_time: stored_time(),
            fields: bug(id, status).tracked_fields(),
        }
    }

    fn reconciler(source: FixtureBugSource) -> Reconciler {
        Reconciler::new(Box::new(source), Duration::hours(24))
    }

    /// Serves bug details but cannot run the recent-bugs search.
    struct SearchDown(FixtureBugSource);

    #[async_trait]
    impl BugSource for SearchDown {
        fn name(&self) -> &str {
            "search-down"
        }

        async fn query_recent(&self, _window: Duration) -> Result<Vec<BugSummary>, SourceError> {
            Err(SourceError::Api {
                code: 32000,
                message: "search unavailable".into(),
            })
        }

        async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError> {
            self.0.get_bug(id).await
        }
    }

    /// Rejects the API key on every call and counts the attempts.
    struct KeyRejected(Arc<AtomicUsize>);

    #[async_trait]
    impl BugSource for KeyRejected {
        fn name(&self) -> &str {
            "key-rejected"
        }

        async fn query_recent(&self, _window: Duration) -> Result<Vec<BugSummary>, SourceError> {
            Ok(vec![BugSummary {
                id: 50,
                summary: "new".into(),
            }])
        }

        async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Fetch(FetchError::HttpStatus {
                status: 401,
                url: format!("https://bz.example.com/rest/bug/{id}"),
                body: r#"{"error":true,"code":306,"message":"api key invalid"}"#.into(),
            }))
        }
    }

    /// Returns an undecodable payload for one id, fixture data otherwise.
    struct Garbled {
        id: i64,
        inner: FixtureBugSource,
    }

    #[async_trait]
    impl BugSource for Garbled {
        fn name(&self) -> &str {
            "garbled"
        }

        async fn query_recent(&self, window: Duration) -> Result<Vec<BugSummary>, SourceError> {
            self.inner.query_recent(window).await
        }

        async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError> {
            if id == self.id {
                return Err(SourceError::Decode("expected value at line 1".into()));
            }
            self.inner.get_bug(id).await
        }
    }

    /// Loses the row between the read and the update, like a concurrent delete.
    struct RowLostOnUpdate(MemoryBugStore);

    #[async_trait]
    impl BugStore for RowLostOnUpdate {
        async fn fetch_all(&mut self) -> Result<Vec<BugRecord>, StoreError> {
            self.0.fetch_all().await
        }

        async fn find_by_bug_id(&mut self, bug_id: i64) -> Result<Option<BugRecord>, StoreError> {
            self.0.find_by_bug_id(bug_id).await
        }

        async fn insert(&mut self, record: &BugRecord) -> Result<(), StoreError> {
            self.0.insert(record).await
        }

        async fn update_fields(
            &mut self,
            bug_id: i64,
            _fields: &TrackedFields,
        ) -> Result<bool, StoreError> {
            self.0.delete(bug_id).await?;
            Ok(false)
        }

        async fn delete(&mut self, bug_id: i64) -> Result<bool, StoreError> {
            self.0.delete(bug_id).await
        }

        async fn close(self) -> Result<(), StoreError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn status_change_updates_row_and_keeps_created_time() {
        let mut store = MemoryBugStore::with_records([record(100, "NEW")]);
        let rec = reconciler(FixtureBugSource::default().with_bug(bug(100, "ASSIGNED")));

        let summary = rec.verify_existing(&mut store).await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.changes.len(), 1);
        let change = &summary.changes[0];
        assert_eq!(change.bug_id, 100);
        assert_eq!(change.old.status, "NEW");
        assert_eq!(change.new.status, "ASSIGNED");
        assert_eq!(change.fields.len(), 1);
        assert_eq!(change.fields[0].field, "status");

        let row = store.get(100).await.unwrap();
        assert_eq!(row.fields.status, "ASSIGNED");
        assert_eq!(row.created_time, stored_time());
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn matching_rows_are_not_written() {
        let mut store = MemoryBugStore::with_records([record(1, "NEW"), record(2, "CLOSED")]);
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(bug(1, "NEW"))
                .with_bug(bug(2, "CLOSED")),
        );

        let summary = rec.verify_existing(&mut store).await.unwrap();
        assert!(summary.changes.is_empty());
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn any_tracked_field_drift_is_detected() {
        for field in TRACKED_FIELD_NAMES {
            let mut current = bug(5, "NEW");
            match field {
                "version" => current.version = "7.5".into(),
                "target_release" => current.target_release = vec!["9.0".into()],
                "component" => current.component = "Storage".into(),
                "severity" => current.severity = "urgent".into(),
                "assignee" => current.assignee = "other@example.com".into(),
                "qa_contact" => current.qa_contact = String::new(),
                _ => current.status = "VERIFIED".into(),
            }
            let mut store = MemoryBugStore::with_records([record(5, "NEW")]);
            let rec = reconciler(FixtureBugSource::default().with_bug(current.clone()));

            let summary = rec.verify_existing(&mut store).await.unwrap();
            assert_eq!(summary.changes.len(), 1, "{field}");
            assert_eq!(summary.changes[0].fields[0].field, field);
            assert_eq!(store.get(5).await.unwrap().fields, current.tracked_fields());
        }
    }

    #[tokio::test]
    async fn second_verification_reports_nothing() {
        let mut store = MemoryBugStore::with_records([record(1, "NEW"), record(2, "NEW")]);
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(bug(1, "ASSIGNED"))
                .with_bug(bug(2, "NEW")),
        );

        let first = rec.verify_existing(&mut store).await.unwrap();
        let after_first = store.records().await;
        let writes = store.write_count().await;
        let second = rec.verify_existing(&mut store).await.unwrap();

        assert_eq!(first.changes.len(), 1);
        assert!(second.changes.is_empty());
        assert_eq!(store.records().await, after_first);
        assert_eq!(store.write_count().await, writes);
    }

    #[tokio::test]
    async fn vanished_bug_is_skipped_and_other_rows_still_checked() {
        let mut store = MemoryBugStore::with_records([record(1, "NEW"), record(2, "NEW")]);
        let rec = reconciler(FixtureBugSource::default().with_bug(bug(2, "POST")));

        let summary = rec.verify_existing(&mut store).await.unwrap();

        assert_eq!(summary.missing, vec![1]);
        assert_eq!(summary.changes.len(), 1);
        assert_eq!(store.get(1).await.unwrap(), record(1, "NEW"));
        assert_eq!(store.get(2).await.unwrap().fields.status, "POST");
    }

    #[tokio::test]
    async fn row_lost_before_update_is_reinserted_with_stored_time() {
        let handle = MemoryBugStore::with_records([record(30, "NEW")]);
        let mut store = RowLostOnUpdate(handle.clone());
        let rec = reconciler(FixtureBugSource::default().with_bug(bug(30, "VERIFIED")));

        let summary = rec.verify_existing(&mut store).await.unwrap();

        assert_eq!(summary.changes.len(), 1);
        let row = handle.get(30).await.unwrap();
        assert_eq!(row.fields, bug(30, "VERIFIED").tracked_fields());
        assert_eq!(row.created_time, stored_time());
    }

    #[tokio::test]
    async fn undecodable_stored_bug_is_recorded_as_failed() {
        let mut store = MemoryBugStore::with_records([record(1, "NEW"), record(2, "NEW")]);
        let rec = Reconciler::new(
            Box::new(Garbled {
                id: 1,
                inner: FixtureBugSource::default()
                    .with_bug(bug(1, "ASSIGNED"))
                    .with_bug(bug(2, "ON_QA")),
            }),
            Duration::hours(24),
        );

        let summary = rec.verify_existing(&mut store).await.unwrap();

        assert_eq!(summary.failed, vec![1]);
        assert!(summary.missing.is_empty());
        assert_eq!(store.get(1).await.unwrap(), record(1, "NEW"));
        assert_eq!(store.get(2).await.unwrap().fields.status, "ON_QA");
    }

    #[tokio::test]
    async fn rejected_api_key_aborts_pass_after_first_lookup() {
        let store = MemoryBugStore::with_records([
            record(1, "NEW"),
            record(2, "NEW"),
            record(3, "NEW"),
        ]);
        let handle = store.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let rec = Reconciler::new(Box::new(KeyRejected(calls.clone())), Duration::hours(24));

        let err = rec.run_session(store).await.unwrap_err();

        assert!(format!("{err:#}").contains("401"), "{err:#}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.records().await.len(), 3);
        assert_eq!(handle.write_count().await, 0);
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn rejected_api_key_aborts_ingestion() {
        let mut store = MemoryBugStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let rec = Reconciler::new(Box::new(KeyRejected(calls.clone())), Duration::hours(24));

        assert!(rec.ingest_new(&mut store).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn new_bug_is_inserted_with_first_target_release_and_parsed_time() {
        let mut store = MemoryBugStore::default();
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(bug(300, "NEW"))
                .with_recent(300, "bug 300"),
        );

        let summary = rec.ingest_new(&mut store).await.unwrap();

        assert_eq!(summary.reported, 1);
        assert_eq!(summary.inserted, vec![300]);
        let row = store.get(300).await.unwrap();
        assert_eq!(row.fields.target_release, "7.1");
        assert_eq!(
            row.created_time,
            NaiveDate::from_ymd_opt(2026, 2, 24)
                .unwrap()
                .and_hms_opt(9, 15, 0)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn known_bugs_are_never_inserted_twice() {
        let mut store = MemoryBugStore::with_records([record(10, "NEW")]);
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(bug(10, "ASSIGNED"))
                .with_bug(bug(11, "NEW"))
                .with_recent(10, "bug 10")
                .with_recent(11, "bug 11")
                .with_recent(11, "bug 11"),
        );

        let summary = rec.ingest_new(&mut store).await.unwrap();

        assert_eq!(summary.inserted, vec![11]);
        assert_eq!(summary.already_present, vec![10, 11]);
        assert_eq!(store.records().await.len(), 2);
        assert_eq!(store.get(10).await.unwrap(), record(10, "NEW"));
    }

    #[tokio::test]
    async fn empty_recent_query_leaves_store_untouched() {
        let mut store = MemoryBugStore::with_records([record(1, "NEW")]);
        let rec = reconciler(FixtureBugSource::default().with_bug(bug(1, "NEW")));

        let summary = rec.ingest_new(&mut store).await.unwrap();

        assert_eq!(summary.reported, 0);
        assert!(summary.inserted.is_empty());
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_creation_time_skips_only_that_bug() {
        let mut broken = bug(21, "NEW");
        broken.creation_time = "last tuesday".into();
        let mut store = MemoryBugStore::default();
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(broken)
                .with_bug(bug(22, "NEW"))
                .with_recent(21, "bug 21")
                .with_recent(22, "bug 22")
                .with_recent(23, "gone before details were fetched"),
        );

        let summary = rec.ingest_new(&mut store).await.unwrap();

        assert_eq!(summary.inserted, vec![22]);
        let skipped = summary.skipped.iter().map(|s| s.bug_id).collect::<Vec<_>>();
        assert_eq!(skipped, vec![21, 23]);
        assert!(summary.skipped[0].reason.contains("last tuesday"));
        assert!(store.get(21).await.is_none());
    }

    #[tokio::test]
    async fn session_closed_when_nothing_new() {
        let store = MemoryBugStore::with_records([record(1, "NEW")]);
        let handle = store.clone();
        let rec = reconciler(FixtureBugSource::default().with_bug(bug(1, "NEW")));

        let summary = rec.run_session(store).await.unwrap();

        assert_eq!(summary.ingestion.reported, 0);
        assert!(summary.verification.changes.is_empty());
        assert!(summary.finished_at >= summary.started_at);
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn full_pass_twice_is_idempotent() {
        let store = MemoryBugStore::with_records([record(1, "NEW")]);
        let handle = store.clone();
        let source = FixtureBugSource::default()
            .with_bug(bug(1, "ON_QA"))
            .with_bug(bug(2, "NEW"))
            .with_recent(2, "bug 2");

        let first = reconciler(source.clone()).run_session(store).await.unwrap();
        assert_eq!(first.verification.changes.len(), 1);
        assert_eq!(first.ingestion.inserted, vec![2]);

        let rows = handle.records().await;
        let reopened = MemoryBugStore::with_records(rows.clone());
        let check = reopened.clone();
        let second = reconciler(source).run_session(reopened).await.unwrap();

        assert!(second.verification.changes.is_empty());
        assert!(second.ingestion.inserted.is_empty());
        assert_eq!(second.ingestion.already_present, vec![2]);
        assert_eq!(check.records().await, rows);
    }

    #[tokio::test]
    async fn failed_search_keeps_verification_and_closes_session() {
        let store = MemoryBugStore::with_records([record(7, "NEW")]);
        let handle = store.clone();
        let rec = Reconciler::new(
            Box::new(SearchDown(FixtureBugSource::default().with_bug(bug(7, "MODIFIED")))),
            Duration::hours(24),
        );

        let err = rec.run_session(store).await.unwrap_err();

        assert!(format!("{err:#}").contains("search unavailable"));
        assert_eq!(handle.get(7).await.unwrap().fields.status, "MODIFIED");
        assert!(handle.is_closed().await);
    }

    #[test]
    fn yaml_config_with_env_overrides() {
        let mut config = SyncConfig::from_yaml_str(
            r#"
bugzilla:
  url: bugzilla.example.com
  api_key: from-file
  recent_query: "product=Platform&keywords=Customer"
database:
  name: qe
  user: sync
  password: hunter2
reports_dir: /var/lib/bugsync/reports
"#,
        )
        .unwrap();
        assert_eq!(config.bugzilla.recent_window_hours, 24);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.table, "customer_bugs");
        assert_eq!(config.schedule.cron, "0 0 6 * * *");

        let env = HashMap::from([
            ("BUGZILLA_API_KEY", "from-env"),
            ("PGPORT", "6543"),
            ("BUGSYNC_TABLE", "qe.customer_bugs"),
        ]);
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.bugzilla.api_key, "from-env");
        assert_eq!(config.bugzilla.url, "bugzilla.example.com");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.table_name().unwrap().as_str(), "qe.customer_bugs");
        assert_eq!(config.recent_window(), Duration::hours(24));
        config.validate().unwrap();
        config.validate_bugzilla().unwrap();
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_err());
        assert!(config.validate_bugzilla().is_err());

        config.database.name = "qe".into();
        config.database.user = "sync".into();
        config.validate().unwrap();

        config.database.table = "bugs; drop table bugs".into();
        assert!(config.validate().is_err());

        config.database.table = "customer_bugs".into();
        config.bugzilla.recent_window_hours = 0;
        assert!(config.validate().is_err());

        let err = config
            .apply_env(|key| (key == "PGPORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PGPORT"));
    }

    #[test]
    fn fixture_runs_do_not_need_bugzilla_credentials() {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = SyncConfig::default();
        let fixture = root.join("fixtures/bugzilla/sample.json");
        let source = build_source(&config, Some(fixture.as_path()));
        assert!(source.is_ok());
        assert!(build_source(&config, None).is_err());
    }

    #[tokio::test]
    async fn report_is_written_under_run_id() {
        let dir = tempdir().expect("tempdir");
        let store = MemoryBugStore::default();
        let rec = reconciler(
            FixtureBugSource::default()
                .with_bug(bug(40, "NEW"))
                .with_recent(40, "bug 40"),
        );
        let summary = rec.run_session(store).await.unwrap();

        let path = write_report(dir.path(), &summary).await.unwrap();

        assert!(path.starts_with(dir.path().join(summary.run_id.to_string())));
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["ingestion"]["inserted"][0], 40);
        assert_eq!(value["verification"]["checked"], 0);
    }
}

//! Bug source contracts + Bugzilla REST and fixture-backed implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bugsync_core::{BugDetails, BugSummary};
use bugsync_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bugsync-source";

pub const API_KEY_HEADER: &str = "x-bugzilla-api-key";

/// Bugzilla fault codes meaning the id does not resolve for this user:
/// 101 (invalid or nonexistent bug) and 102 (access denied).
const NOT_FOUND_CODES: [i64; 2] = [101, 102];

/// Bugzilla fault codes for rejected credentials: 300 (bad login), 301 (account
/// disabled), 306 (invalid API key), 307 (invalid token), 410 (login required).
const AUTH_FAULT_CODES: [i64; 5] = [300, 301, 306, 307, 410];

/// Query keys owned by the client; saved-search copies of these are dropped.
const RESERVED_QUERY_KEYS: [&str; 5] = [
    "include_fields",
    "creation_time",
    "ctype",
    "list_id",
    "query_format",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("bug #{id} does not resolve at the source: {reason}")]
    NotFound { id: i64, reason: String },
    #[error("bugzilla fault {code}: {message}")]
    Api { code: i64, message: String },
    #[error("decoding bugzilla response: {0}")]
    Decode(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }

    /// The source as a whole is unreachable or refuses our credentials, so no
    /// further call can succeed. Transport errors and 5xx/429 statuses only
    /// surface here once the fetcher has used up its retries.
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::Fetch(FetchError::Request(_)) => true,
            SourceError::Fetch(FetchError::HttpStatus { status, .. }) => {
                matches!(*status, 401 | 403 | 429) || *status >= 500
            }
            SourceError::Api { code, .. } => AUTH_FAULT_CODES.contains(code),
            SourceError::NotFound { .. } | SourceError::Decode(_) | SourceError::Anyhow(_) => {
                false
            }
        }
    }
}

#[async_trait]
pub trait BugSource: Send + Sync {
    fn name(&self) -> &str;

    /// Bugs created within the trailing `window`, in source order.
    async fn query_recent(&self, window: Duration) -> Result<Vec<BugSummary>, SourceError>;

    /// Full details for one bug. Fails with [`SourceError::NotFound`] when the id
    /// no longer resolves.
    async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError>;
}

#[derive(Debug, Clone)]
pub struct BugzillaConfig {
    pub url: String,
    pub api_key: String,
    /// Extra search parameters, either a bare query string or a full saved-search URL.
    pub recent_query: Option<String>,
}

#[derive(Debug)]
pub struct BugzillaSource {
    http: HttpFetcher,
    rest_bug_url: Url,
    headers: HeaderMap,
    recent_query: Vec<(String, String)>,
}

impl BugzillaSource {
    pub fn new(config: &BugzillaConfig, http: HttpFetcher) -> Result<Self> {
        let base = normalize_base_url(&config.url)?;
        let rest_bug_url = base
            .join("rest/bug")
            .with_context(|| format!("building REST endpoint from {base}"))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let mut key = HeaderValue::from_str(config.api_key.trim())
            .context("bugzilla API key is not a valid header value")?;
        key.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key);

        let recent_query = match config.recent_query.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_saved_query(raw)?,
            _ => Vec::new(),
        };

        Ok(Self {
            http,
            rest_bug_url,
            headers,
            recent_query,
        })
    }

    pub fn recent_query_url(&self, since: DateTime<Utc>) -> Url {
        let mut url = self.rest_bug_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.recent_query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("include_fields", "id,summary");
            pairs.append_pair(
                "creation_time",
                &since.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            );
        }
        url
    }

    pub fn bug_url(&self, id: i64) -> Url {
        let mut url = self.rest_bug_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(&id.to_string());
        }
        url
    }
}

#[async_trait]
impl BugSource for BugzillaSource {
    fn name(&self) -> &str {
        "bugzilla"
    }

    async fn query_recent(&self, window: Duration) -> Result<Vec<BugSummary>, SourceError> {
        let url = self.recent_query_url(Utc::now() - window);
        debug!(%url, "querying recent bugs");
        let response = self
            .http
            .fetch_bytes(url.as_str(), &self.headers)
            .await
            .map_err(|err| map_fetch_error(None, err))?;
        decode_summaries(&response.body)
    }

    async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError> {
        let url = self.bug_url(id);
        let response = self
            .http
            .fetch_bytes(url.as_str(), &self.headers)
            .await
            .map_err(|err| map_fetch_error(Some(id), err))?;
        decode_bug(id, &response.body)
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let without_endpoint = with_scheme
        .trim_end_matches("/xmlrpc.cgi")
        .trim_end_matches("/rest");
    Url::parse(&format!("{without_endpoint}/"))
        .with_context(|| format!("parsing bugzilla url {raw:?}"))
}

/// Accepts `product=X&keywords=Y` or a full `buglist.cgi?...` URL.
fn parse_saved_query(raw: &str) -> Result<Vec<(String, String)>> {
    let query = raw
        .split_once('?')
        .map(|(_, q)| q)
        .unwrap_or(raw)
        .trim_start_matches('?');
    let holder = Url::parse(&format!("http://saved.query/?{query}"))
        .with_context(|| format!("parsing saved query {raw:?}"))?;
    Ok(holder
        .query_pairs()
        .filter(|(k, _)| !RESERVED_QUERY_KEYS.contains(&&**k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect())
}

#[derive(Debug, Deserialize)]
struct RestFault {
    #[serde(default)]
    error: bool,
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RestList<T> {
    #[serde(default = "Vec::new")]
    bugs: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RestBugSummary {
    id: i64,
    #[serde(default)]
    summary: String,
}

/// Some Bugzilla deployments return multi-valued fields as arrays.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }

    fn into_first(self) -> String {
        self.into_vec().into_iter().next().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RestBug {
    id: i64,
    #[serde(default)]
    version: OneOrMany,
    #[serde(default)]
    target_release: OneOrMany,
    #[serde(default)]
    component: OneOrMany,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    assigned_to: String,
    #[serde(default)]
    qa_contact: Option<String>,
    #[serde(default)]
    status: String,
    creation_time: String,
    #[serde(default)]
    product: String,
    #[serde(default)]
    summary: String,
}

impl From<RestBug> for BugDetails {
    fn from(bug: RestBug) -> Self {
        BugDetails {
            id: bug.id,
            version: bug.version.into_first(),
            target_release: bug.target_release.into_vec(),
            component: bug.component.into_first(),
            severity: bug.severity,
            assignee: bug.assigned_to,
            qa_contact: bug.qa_contact.unwrap_or_default(),
            status: bug.status,
            creation_time: bug.creation_time,
            product: bug.product,
            summary: bug.summary,
        }
    }
}

fn fault_in(body: &[u8]) -> Option<RestFault> {
    serde_json::from_slice::<RestFault>(body)
        .ok()
        .filter(|fault| fault.error)
}

fn fault_to_error(id: Option<i64>, fault: RestFault) -> SourceError {
    let code = fault.code.unwrap_or_default();
    match id {
        Some(id) if NOT_FOUND_CODES.contains(&code) => SourceError::NotFound {
            id,
            reason: fault.message,
        },
        _ => SourceError::Api {
            code,
            message: fault.message,
        },
    }
}

fn map_fetch_error(id: Option<i64>, err: FetchError) -> SourceError {
    if let FetchError::HttpStatus { status, body, .. } = &err {
        if let Some(fault) = fault_in(body.as_bytes()) {
            return fault_to_error(id, fault);
        }
        if let (Some(id), 404) = (id, *status) {
            return SourceError::NotFound {
                id,
                reason: "http 404".to_string(),
            };
        }
    }
    SourceError::Fetch(err)
}

fn decode_summaries(body: &[u8]) -> Result<Vec<BugSummary>, SourceError> {
    if let Some(fault) = fault_in(body) {
        return Err(fault_to_error(None, fault));
    }
    let list: RestList<RestBugSummary> =
        serde_json::from_slice(body).map_err(|err| SourceError::Decode(err.to_string()))?;
    Ok(list
        .bugs
        .into_iter()
        .map(|b| BugSummary {
            id: b.id,
            summary: b.summary,
        })
        .collect())
}

fn decode_bug(id: i64, body: &[u8]) -> Result<BugDetails, SourceError> {
    if let Some(fault) = fault_in(body) {
        return Err(fault_to_error(Some(id), fault));
    }
    let list: RestList<RestBug> =
        serde_json::from_slice(body).map_err(|err| SourceError::Decode(err.to_string()))?;
    list.bugs
        .into_iter()
        .find(|b| b.id == id)
        .map(BugDetails::from)
        .ok_or_else(|| SourceError::NotFound {
            id,
            reason: "empty result".to_string(),
        })
}

/// Captured Bugzilla state: the result of one recent-bugs query plus bug details by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    #[serde(default)]
    pub recent: Vec<BugSummary>,
    #[serde(default)]
    pub bugs: Vec<BugDetails>,
}

/// Source replaying a [`FixtureSnapshot`]. The recent list is returned as captured,
/// regardless of the requested window.
#[derive(Debug, Clone, Default)]
pub struct FixtureBugSource {
    recent: Vec<BugSummary>,
    bugs: BTreeMap<i64, BugDetails>,
}

impl FixtureBugSource {
    pub fn new(snapshot: FixtureSnapshot) -> Self {
        Self {
            recent: snapshot.recent,
            bugs: snapshot.bugs.into_iter().map(|b| (b.id, b)).collect(),
        }
    }

    pub fn with_bug(mut self, bug: BugDetails) -> Self {
        self.bugs.insert(bug.id, bug);
        self
    }

    pub fn with_recent(mut self, id: i64, summary: &str) -> Self {
        self.recent.push(BugSummary {
            id,
            summary: summary.to_string(),
        });
        self
    }

    pub fn without_bug(mut self, id: i64) -> Self {
        self.bugs.remove(&id);
        self
    }
}

pub fn load_fixture_snapshot(path: impl AsRef<Path>) -> Result<FixtureSnapshot> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl BugSource for FixtureBugSource {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn query_recent(&self, _window: Duration) -> Result<Vec<BugSummary>, SourceError> {
        Ok(self.recent.clone())
    }

    async fn get_bug(&self, id: i64) -> Result<BugDetails, SourceError> {
        self.bugs
            .get(&id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                id,
                reason: "not present in fixture".to_string(),
            })
    }
}

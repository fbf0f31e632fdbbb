//! Core domain model for customer bug synchronization.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bugsync-core";

/// Creation-time layout used by Bugzilla's XML-RPC interface (`20240501T12:00:00`).
pub const XMLRPC_TIME_FORMAT: &str = "%Y%m%dT%H:%M:%S";

/// Names of the tracked columns, in comparison order.
pub const TRACKED_FIELD_NAMES: [&str; 7] = [
    "version",
    "target_release",
    "component",
    "severity",
    "assignee",
    "qa_contact",
    "status",
];

/// Result row of a recent-bugs query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugSummary {
    pub id: i64,
    #[serde(default)]
    pub summary: String,
}

/// Full view of a single bug as reported by the bug source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugDetails {
    pub id: i64,
    pub version: String,
    pub target_release: Vec<String>,
    pub component: String,
    pub severity: String,
    pub assignee: String,
    #[serde(default)]
    pub qa_contact: String,
    pub status: String,
    pub creation_time: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub summary: String,
}

impl BugDetails {
    /// Snapshot of the mutable field set. Only the first target release is tracked;
    /// an empty list maps to an empty string.
    pub fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            version: self.version.clone(),
            target_release: self.target_release.first().cloned().unwrap_or_default(),
            component: self.component.clone(),
            severity: self.severity.clone(),
            assignee: self.assignee.clone(),
            qa_contact: self.qa_contact.clone(),
            status: self.status.clone(),
        }
    }

    pub fn created_time(&self) -> Result<NaiveDateTime, TimestampError> {
        parse_creation_time(&self.creation_time)
    }
}

/// The seven columns reconciled against the bug source on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackedFields {
    pub version: String,
    pub target_release: String,
    pub component: String,
    pub severity: String,
    pub assignee: String,
    pub qa_contact: String,
    pub status: String,
}

impl TrackedFields {
    pub fn as_tuple(&self) -> [&str; 7] {
        [
            &self.version,
            &self.target_release,
            &self.component,
            &self.severity,
            &self.assignee,
            &self.qa_contact,
            &self.status,
        ]
    }

    /// Per-field differences between `self` (stored) and `current` (source), in column order.
    pub fn diff(&self, current: &TrackedFields) -> Vec<FieldChange> {
        TRACKED_FIELD_NAMES
            .iter()
            .zip(self.as_tuple().into_iter().zip(current.as_tuple()))
            .filter(|(_, (old, new))| old != new)
            .map(|(name, (old, new))| FieldChange {
                field: (*name).to_string(),
                old: old.to_string(),
                new: new.to_string(),
            })
            .collect()
    }
}

impl std::fmt::Display for TrackedFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.as_tuple().map(|v| format!("'{v}'")).join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

/// One row of the bug table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugRecord {
    pub bug_id: i64,
    pub created_time: NaiveDateTime,
    pub fields: TrackedFields,
}

impl BugRecord {
    pub fn from_details(details: &BugDetails) -> Result<Self, TimestampError> {
        Ok(Self {
            bug_id: details.id,
            created_time: details.created_time()?,
            fields: details.tracked_fields(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized creation timestamp {raw:?}")]
pub struct TimestampError {
    pub raw: String,
}

/// Parse a source creation timestamp into the naive UTC form stored in the table.
///
/// Accepts the XML-RPC layout and RFC 3339; offsets are normalized to UTC.
pub fn parse_creation_time(raw: &str) -> Result<NaiveDateTime, TimestampError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, XMLRPC_TIME_FORMAT) {
        return Ok(parsed);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .map_err(|_| TimestampError {
            raw: raw.to_string(),
        })
}

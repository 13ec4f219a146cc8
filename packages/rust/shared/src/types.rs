//! Core domain types for reference ingestion and knowledge-base builds.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque JSON attributes carried alongside a record (author, tags, ...).
pub type ExtraAttributes = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for build job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A source item selected from the reference store. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub id: String,
    pub title: String,
    /// Raw text, possibly empty.
    #[serde(default)]
    pub content: String,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Forwarded verbatim; never interpreted except for `api_url`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: ExtraAttributes,
}

impl ReferenceRecord {
    /// The attachment URL, treating blank strings as absent.
    pub fn attachment_url(&self) -> Option<&str> {
        self.attachment_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// A record after the enrich and attachment stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    pub record: ReferenceRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Set only by a successful attachment download.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_attachment_path: Option<PathBuf>,
}

impl From<ReferenceRecord> for EnrichedRecord {
    fn from(record: ReferenceRecord) -> Self {
        Self {
            record,
            api_metadata: None,
            summary: None,
            local_attachment_path: None,
        }
    }
}

/// Per-record result of the publish stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { document_id: String },
    Failed { reason: String },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

// ---------------------------------------------------------------------------
// BuildResult
// ---------------------------------------------------------------------------

/// Aggregate outcome of one build run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub message: String,
    pub total_items: usize,
    pub processed_items: usize,
    pub failed_items: usize,
    /// Whether the run stopped early on an external cancellation signal.
    #[serde(default)]
    pub cancelled: bool,
    /// Per-record outcomes keyed by record id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<String, PublishOutcome>,
}

impl BuildResult {
    /// A run that ended before any record was counted.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            success: false,
            dataset_id: None,
            message: message.into(),
            total_items: 0,
            processed_items: 0,
            failed_items: 0,
            cancelled: false,
            outcomes: BTreeMap::new(),
        }
    }

    /// Build the aggregate from per-record outcomes.
    pub fn from_outcomes(
        dataset_id: Option<String>,
        outcomes: BTreeMap<String, PublishOutcome>,
        cancelled: bool,
    ) -> Self {
        let total_items = outcomes.len();
        let processed_items = outcomes.values().filter(|o| o.is_published()).count();
        let failed_items = total_items - processed_items;
        let success = dataset_id.is_some() && total_items > 0 && !cancelled;

        let message = if cancelled {
            format!("build cancelled: {processed_items}/{total_items} documents published")
        } else if failed_items == 0 {
            format!("knowledge base built: {processed_items} documents published")
        } else {
            format!(
                "knowledge base built with failures: {processed_items} published, {failed_items} failed"
            )
        };

        Self {
            success,
            dataset_id,
            message,
            total_items,
            processed_items,
            failed_items,
            cancelled,
            outcomes,
        }
    }
}

// ---------------------------------------------------------------------------
// Query conditions & build request
// ---------------------------------------------------------------------------

/// Inclusive creation-date bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

/// Predicate over the reference store; all present parts are ANDed.
///
/// Wire shape: `{"date_range": {"start", "end"}, "keywords": "...", "<field>": <value>, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Substring matched against title or content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    /// Exact-match fields.
    #[serde(flatten)]
    pub equals: BTreeMap<String, serde_json::Value>,
}

impl QueryConditions {
    pub fn is_empty(&self) -> bool {
        self.date_range.is_none()
            && self.keywords.as_deref().is_none_or(|k| k.trim().is_empty())
            && self.equals.is_empty()
    }
}

/// Parameters for one build run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_conditions: Option<QueryConditions>,
    pub dataset_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Publish into this dataset instead of creating one; enables
    /// update-in-place through the document ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_dataset_id: Option<String>,
}

impl BuildRequest {
    pub fn new(dataset_name: impl Into<String>) -> Self {
        Self {
            report_id: None,
            query_conditions: None,
            dataset_name: dataset_name.into(),
            description: None,
            include_attachments: true,
            batch_size: default_batch_size(),
            existing_dataset_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    50
}

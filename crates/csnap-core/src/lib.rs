//! Core domain model for catalog snapshots: entity views, time-series points,
//! merge outcomes and run issues.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "csnap-core";

/// Epoch milliseconds identifying the run that last touched a row.
pub type SnapshotMarker = i64;

pub const SNAPSHOT_FIELD: &str = "snapshot_at";
pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "_created_at";

/// Fields owned by storage or by the run bookkeeping, never by upstream content.
pub const ADMIN_FIELDS: [&str; 3] = [ID_FIELD, CREATED_AT_FIELD, SNAPSHOT_FIELD];

pub fn is_admin_field(name: &str) -> bool {
    ADMIN_FIELDS.contains(&name)
}

/// A current-state entity stored under a stable natural key.
pub trait ViewRecord: Serialize {
    fn natural_key(&self) -> String;
}

/// A point in an append-mostly series keyed by `(owner, timestamp)`.
pub trait SeriesPoint: Serialize {
    fn owner_key(&self) -> String;
    fn timestamp(&self) -> i64;

    fn series_key(&self) -> String {
        format!("{}@{}", self.owner_key(), self.timestamp())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataPolicy {
    pub training: Option<bool>,
    pub retains_prompts: Option<bool>,
    pub retention_days: Option<u32>,
    pub requires_user_ids: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub slug: String,
    pub display_name: String,
    pub icon_url: Option<String>,
    pub data_policy: DataPolicy,
}

impl ViewRecord for Provider {
    fn natural_key(&self) -> String {
        self.slug.clone()
    }
}

/// Validated model record. `variant` is the pricing/access variant this
/// upstream row described; `variants` is filled in by consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub slug: String,
    pub permaslug: String,
    pub name: String,
    pub short_name: Option<String>,
    pub author_slug: String,
    pub description: Option<String>,
    pub context_length: Option<u64>,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub variant: Option<String>,
    pub variants: Vec<String>,
}

impl ViewRecord for Model {
    fn natural_key(&self) -> String {
        self.slug.clone()
    }
}

impl Model {
    /// Variants to query per-variant endpoints for; unqualified models use `standard`.
    pub fn query_variants(&self) -> Vec<String> {
        if self.variants.is_empty() {
            vec!["standard".to_string()]
        } else {
            self.variants.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
    pub image: Option<f64>,
    pub request: Option<f64>,
    pub web_search: Option<f64>,
    pub internal_reasoning: Option<f64>,
    pub input_cache_read: Option<f64>,
    pub input_cache_write: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub p50_throughput: Option<f64>,
    pub p50_latency: Option<f64>,
    pub request_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub model_permaslug: String,
    pub model_variant: String,
    pub provider_slug: String,
    pub context_length: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub quantization: Option<String>,
    pub pricing: Pricing,
    pub stats: Option<EndpointStats>,
    pub supported_parameters: Vec<String>,
}

impl ViewRecord for Endpoint {
    fn natural_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: u64,
    pub title: Option<String>,
    pub origin_url: String,
    pub created_at: i64,
}

impl ViewRecord for App {
    fn natural_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

impl ViewRecord for Author {
    fn natural_key(&self) -> String {
        self.slug.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimePoint {
    pub endpoint_id: String,
    pub timestamp: i64,
    pub uptime: Option<f64>,
}

impl SeriesPoint for UptimePoint {
    fn owner_key(&self) -> String {
        self.endpoint_id.clone()
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTokenUsage {
    pub model_permaslug: String,
    pub variant: String,
    pub timestamp: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub request_count: u64,
}

impl SeriesPoint for ModelTokenUsage {
    fn owner_key(&self) -> String {
        format!("{}:{}", self.model_permaslug, self.variant)
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppTokenUsage {
    pub app_id: u64,
    pub model_permaslug: String,
    pub variant: String,
    pub timestamp: i64,
    pub total_tokens: u64,
}

impl SeriesPoint for AppTokenUsage {
    fn owner_key(&self) -> String {
        format!("{}:{}:{}", self.app_id, self.model_permaslug, self.variant)
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Transform,
    Schema,
    Sync,
}

impl IssueKind {
    pub fn is_error(self) -> bool {
        matches!(self, IssueKind::Transform | IssueKind::Sync)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub entity: String,
    pub index: Option<usize>,
    /// Upstream request the issue came from, e.g. `permaslug:variant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn transform(entity: &str, index: usize, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Transform,
            entity: entity.to_string(),
            index: Some(index),
            scope: None,
            message: message.into(),
        }
    }

    pub fn schema(entity: &str, index: usize, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Schema,
            entity: entity.to_string(),
            index: Some(index),
            scope: None,
            message: message.into(),
        }
    }

    pub fn sync(entity: &str, message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Sync,
            entity: entity.to_string(),
            index: None,
            scope: None,
            message: message.into(),
        }
    }

    pub fn scoped(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeAction {
    Insert,
    Replace,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub path: String,
    pub before: JsonValue,
    pub after: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub key: String,
    pub action: MergeAction,
    pub changes: Vec<ChangeEntry>,
}

/// Append-only audit row written alongside a view when content changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogRow {
    pub key: String,
    pub snapshot_at: SnapshotMarker,
    pub changes: Vec<ChangeEntry>,
}

pub fn parse_timestamp_millis(input: &str) -> Option<i64> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

pub fn day_start_millis(marker: SnapshotMarker) -> i64 {
    const DAY_MS: i64 = 86_400_000;
    marker - marker.rem_euclid(DAY_MS)
}

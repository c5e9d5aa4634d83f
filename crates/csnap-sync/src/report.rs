use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csnap_core::{Issue, IssueKind, MergeAction, MergeOutcome, SnapshotMarker, SNAPSHOT_FIELD};
use csnap_storage::{ArtifactStore, Document, DocumentStore, RangeQuery, StoredArtifact};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::reconcile::to_document;

pub const REPORTS_TABLE: &str = "sync_reports";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity: String,
    /// Raw records seen upstream, before validation.
    pub fetched: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub stable: usize,
    pub issues: Vec<Issue>,
}

impl EntityReport {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Default::default()
        }
    }

    pub fn record_outcomes(&mut self, outcomes: &[MergeOutcome]) {
        for outcome in outcomes {
            match outcome.action {
                MergeAction::Insert => self.inserted += 1,
                MergeAction::Replace => self.replaced += 1,
                MergeAction::Stable => self.stable += 1,
            }
        }
    }

    pub fn record_issues(&mut self, issues: impl IntoIterator<Item = Issue>) {
        for issue in issues {
            match issue.kind {
                IssueKind::Schema => {
                    warn!(entity = %issue.entity, index = ?issue.index, scope = ?issue.scope, message = %issue.message, "schema drift")
                }
                _ => {
                    warn!(entity = %issue.entity, kind = ?issue.kind, index = ?issue.index, scope = ?issue.scope, message = %issue.message, "sync issue")
                }
            }
            self.issues.push(issue);
        }
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    pub fn merged(&self) -> usize {
        self.inserted + self.replaced + self.stable
    }

    fn absorb(&mut self, other: EntityReport) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.stable += other.stable;
        self.issues.extend(other.issues);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub snapshot_at: SnapshotMarker,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub phase_two_skipped: bool,
    pub entities: BTreeMap<String, EntityReport>,
    pub errors: usize,
    pub warnings: usize,
}

impl RunReport {
    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.get(name)
    }

    /// Compact row stored in [`REPORTS_TABLE`], pointing at the full artifact.
    pub fn summary(&self, report_key: &str) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            snapshot_at: self.snapshot_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            items: self
                .entities
                .iter()
                .map(|(name, report)| (name.clone(), report.merged()))
                .collect(),
            errors: self.errors,
            warnings: self.warnings,
            report_key: report_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub snapshot_at: SnapshotMarker,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub items: BTreeMap<String, usize>,
    pub errors: usize,
    pub warnings: usize,
    pub report_key: String,
}

#[derive(Debug)]
pub struct ReportCollector {
    run_id: Uuid,
    snapshot_at: SnapshotMarker,
    started_at: DateTime<Utc>,
    phase_two_skipped: bool,
    entities: BTreeMap<String, EntityReport>,
}

impl ReportCollector {
    pub fn new(run_id: Uuid, snapshot_at: SnapshotMarker) -> Self {
        Self {
            run_id,
            snapshot_at,
            started_at: Utc::now(),
            phase_two_skipped: false,
            entities: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn absorb(&mut self, report: EntityReport) {
        let name = report.entity.clone();
        self.entities
            .entry(name.clone())
            .or_insert_with(|| EntityReport::new(&name))
            .absorb(report);
    }

    pub fn record_issue(&mut self, issue: Issue) {
        let mut report = EntityReport::new(&issue.entity);
        report.record_issues([issue]);
        self.absorb(report);
    }

    pub fn skip_phase_two(&mut self) {
        self.phase_two_skipped = true;
    }

    pub fn finish(self) -> RunReport {
        let finished_at = Utc::now();
        let issues = self.entities.values().flat_map(|e| e.issues.iter());
        let (mut errors, mut warnings) = (0, 0);
        for issue in issues {
            if issue.kind.is_error() {
                errors += 1;
            } else {
                warnings += 1;
            }
        }
        RunReport {
            run_id: self.run_id,
            snapshot_at: self.snapshot_at,
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds(),
            phase_two_skipped: self.phase_two_skipped,
            entities: self.entities,
            errors,
            warnings,
        }
    }
}

/// Writes the gzip JSON report artifact and its summary row.
pub async fn persist_report(
    report: &RunReport,
    artifacts: &ArtifactStore,
    store: &dyn DocumentStore,
) -> Result<StoredArtifact> {
    let key = ArtifactStore::report_key(report.snapshot_at, report.run_id);
    let body = serde_json::to_vec(report).context("serializing run report")?;
    let stored = artifacts
        .put(&key, &body, true)
        .await
        .with_context(|| format!("storing report artifact {key}"))?;

    let summary: Document = to_document(&report.summary(&stored.key))?;
    store
        .insert(REPORTS_TABLE, &report.run_id.to_string(), summary)
        .await
        .context("writing sync report summary")?;
    info!(
        run_id = %report.run_id,
        key = %stored.key,
        errors = report.errors,
        warnings = report.warnings,
        "run report stored"
    );
    Ok(stored)
}

pub async fn recent_summaries(store: &dyn DocumentStore, limit: usize) -> Result<Vec<RunSummary>> {
    let rows = store
        .range(
            REPORTS_TABLE,
            &RangeQuery::on(SNAPSHOT_FIELD).newest_first().limit(limit),
        )
        .await
        .context("listing sync reports")?;
    rows.into_iter()
        .map(|row| serde_json::from_value(JsonValue::Object(row)).context("decoding sync report row"))
        .collect()
}

pub async fn load_report(artifacts: &ArtifactStore, key: &str) -> Result<RunReport> {
    let bytes = artifacts.read(key).await?;
    serde_json::from_slice(&bytes).with_context(|| format!("decoding report {key}"))
}

//! Snapshot reconciliation: diffing, keyed merges, series backfill, batched
//! dispatch, run orchestration and reporting.

mod batch;
mod config;
mod diff;
mod pipeline;
mod reconcile;
mod report;
mod timeseries;

use anyhow::Result;

pub use batch::{dispatch, merge_views, BulkMerge, ViewMerger};
pub use config::{EntityRegistry, EntitySpec, SyncConfig};
pub use diff::{diff, DiffOptions};
pub use pipeline::{open_source, open_store, RunOptions, SyncPipeline};
pub use reconcile::{merge_record, to_document};
pub use report::{
    load_report, persist_report, recent_summaries, EntityReport, ReportCollector, RunReport,
    RunSummary, REPORTS_TABLE,
};
pub use timeseries::{merge_series, order_points, SeriesMerger};

pub const CRATE_NAME: &str = "csnap-sync";

pub async fn run_sync_once_from_env(options: RunOptions) -> Result<RunReport> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    pipeline.run_once(options).await
}

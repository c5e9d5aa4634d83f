use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use csnap_core::{MergeOutcome, SeriesPoint, SnapshotMarker};
use csnap_storage::DocumentStore;
use tracing::debug;

use crate::batch::{dispatch, BulkMerge};
use crate::config::EntitySpec;
use crate::reconcile::{merge_record, to_document};

/// Orders points by owner, newest first within each owner.
pub fn order_points<T: SeriesPoint>(points: &mut [T]) {
    points.sort_by(|a, b| {
        a.owner_key()
            .cmp(&b.owner_key())
            .then_with(|| b.timestamp().cmp(&a.timestamp()))
    });
}

/// Merges series points newest-first per owner and stops an owner at the
/// first point that is already stored unchanged.
///
/// Older points behind that one are assumed stored too, so a gap left by an
/// earlier partial run is not backfilled.
pub struct SeriesMerger<'a> {
    store: &'a dyn DocumentStore,
    spec: &'a EntitySpec,
    snapshot_at: SnapshotMarker,
    exhausted: HashSet<String>,
}

impl<'a> SeriesMerger<'a> {
    pub fn new(store: &'a dyn DocumentStore, spec: &'a EntitySpec, snapshot_at: SnapshotMarker) -> Self {
        Self {
            store,
            spec,
            snapshot_at,
            exhausted: HashSet::new(),
        }
    }

    pub fn is_exhausted(&self, owner: &str) -> bool {
        self.exhausted.contains(owner)
    }
}

#[async_trait]
impl<'a, T> BulkMerge<T> for SeriesMerger<'a>
where
    T: SeriesPoint + Send + Sync + 'static,
{
    type Output = MergeOutcome;

    async fn merge_batch(&mut self, batch: Vec<T>) -> Result<Vec<MergeOutcome>> {
        let mut out = Vec::new();
        for point in &batch {
            let owner = point.owner_key();
            if self.exhausted.contains(&owner) {
                continue;
            }
            let content = to_document(point)?;
            let outcome =
                merge_record(self.store, self.spec, &point.series_key(), content, self.snapshot_at)
                    .await?;
            if outcome.changes.is_empty() {
                debug!(table = %self.spec.table, owner = %owner, "series caught up");
                self.exhausted.insert(owner);
            }
            out.push(outcome);
        }
        Ok(out)
    }
}

/// Orders `points` and dispatches them through a [`SeriesMerger`]. Only
/// processed points have an outcome.
pub async fn merge_series<T>(
    store: &dyn DocumentStore,
    spec: &EntitySpec,
    mut points: Vec<T>,
    snapshot_at: SnapshotMarker,
) -> Result<Vec<MergeOutcome>>
where
    T: SeriesPoint + Send + Sync + 'static,
{
    order_points(&mut points);
    let mut merger = SeriesMerger::new(store, spec, snapshot_at);
    dispatch(points, spec.batch_size, &mut merger).await
}

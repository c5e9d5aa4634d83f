use anyhow::Result;
use async_trait::async_trait;
use csnap_core::{MergeOutcome, SnapshotMarker, ViewRecord};
use csnap_storage::DocumentStore;
use tracing::debug;

use crate::config::EntitySpec;
use crate::reconcile::{merge_record, to_document};

/// Merges one bounded batch at a time. Implementations may carry state from
/// one batch to the next.
#[async_trait]
pub trait BulkMerge<T: Send + 'static>: Send {
    type Output: Send;

    async fn merge_batch(&mut self, batch: Vec<T>) -> Result<Vec<Self::Output>>;
}

/// Splits `items` into contiguous chunks of at most `max_batch` (zero counts
/// as one) and merges them in order, concatenating the results.
pub async fn dispatch<T, M>(items: Vec<T>, max_batch: usize, merger: &mut M) -> Result<Vec<M::Output>>
where
    T: Send + 'static,
    M: BulkMerge<T>,
{
    let size = max_batch.max(1);
    let total = items.len();
    let mut out = Vec::with_capacity(total);
    let mut items = items.into_iter().peekable();
    let mut batch_no = 0usize;
    while items.peek().is_some() {
        let chunk: Vec<T> = items.by_ref().take(size).collect();
        debug!(batch_no, len = chunk.len(), total, "dispatching batch");
        out.extend(merger.merge_batch(chunk).await?);
        batch_no += 1;
    }
    Ok(out)
}

pub struct ViewMerger<'a> {
    store: &'a dyn DocumentStore,
    spec: &'a EntitySpec,
    snapshot_at: SnapshotMarker,
}

impl<'a> ViewMerger<'a> {
    pub fn new(store: &'a dyn DocumentStore, spec: &'a EntitySpec, snapshot_at: SnapshotMarker) -> Self {
        Self {
            store,
            spec,
            snapshot_at,
        }
    }
}

#[async_trait]
impl<'a, T> BulkMerge<T> for ViewMerger<'a>
where
    T: ViewRecord + Send + Sync + 'static,
{
    type Output = MergeOutcome;

    async fn merge_batch(&mut self, batch: Vec<T>) -> Result<Vec<MergeOutcome>> {
        let mut out = Vec::with_capacity(batch.len());
        for record in &batch {
            let content = to_document(record)?;
            let key = record.natural_key();
            out.push(merge_record(self.store, self.spec, &key, content, self.snapshot_at).await?);
        }
        Ok(out)
    }
}

pub async fn merge_views<T>(
    store: &dyn DocumentStore,
    spec: &EntitySpec,
    records: Vec<T>,
    snapshot_at: SnapshotMarker,
) -> Result<Vec<MergeOutcome>>
where
    T: ViewRecord + Send + Sync + 'static,
{
    let mut merger = ViewMerger::new(store, spec, snapshot_at);
    dispatch(records, spec.batch_size, &mut merger).await
}

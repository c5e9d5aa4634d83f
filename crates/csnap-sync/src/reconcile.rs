use anyhow::{bail, Context, Result};
use csnap_core::{ChangeEntry, MergeAction, MergeOutcome, SnapshotMarker, SNAPSHOT_FIELD};
use csnap_storage::{Document, DocumentStore};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::config::EntitySpec;
use crate::diff::{diff, DiffOptions};

/// Serializes a record into the content half of a stored document.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document> {
    match serde_json::to_value(record).context("serializing record")? {
        JsonValue::Object(map) => Ok(map),
        other => bail!("record serialized to non-object JSON: {other}"),
    }
}

fn stored_marker(doc: &Document) -> Option<SnapshotMarker> {
    doc.get(SNAPSHOT_FIELD).and_then(JsonValue::as_i64)
}

fn change_log_row(key: &str, snapshot_at: SnapshotMarker, changes: &[ChangeEntry]) -> Document {
    let changes: Vec<JsonValue> = changes
        .iter()
        .map(|c| json!({"path": c.path, "before": c.before, "after": c.after}))
        .collect();
    let mut row = Document::new();
    row.insert("key".to_string(), JsonValue::from(key));
    row.insert(SNAPSHOT_FIELD.to_string(), JsonValue::from(snapshot_at));
    row.insert("changes".to_string(), JsonValue::Array(changes));
    row
}

/// Reconciles one validated record against its stored row.
///
/// Inserts unseen keys, replaces rows whose content differs, and otherwise
/// only moves the row's marker forward. A change-log row is appended for every
/// non-empty diff.
pub async fn merge_record(
    store: &dyn DocumentStore,
    spec: &EntitySpec,
    key: &str,
    content: Document,
    snapshot_at: SnapshotMarker,
) -> Result<MergeOutcome> {
    let opts = DiffOptions::for_entity(spec);
    let existing = store
        .get(&spec.table, key)
        .await
        .with_context(|| format!("loading {}/{key}", spec.table))?;

    let (action, changes, marker) = match existing {
        None => {
            let changes = diff(&Document::new(), &content, &opts);
            (MergeAction::Insert, changes, snapshot_at)
        }
        Some(stored) => {
            let changes = diff(&stored, &content, &opts);
            let previous = stored_marker(&stored);
            if changes.is_empty() {
                if previous.map_or(true, |p| p < snapshot_at) {
                    let mut fields = Document::new();
                    fields.insert(SNAPSHOT_FIELD.to_string(), JsonValue::from(snapshot_at));
                    store
                        .patch(&spec.table, key, fields)
                        .await
                        .with_context(|| format!("advancing marker on {}/{key}", spec.table))?;
                }
                return Ok(MergeOutcome {
                    key: key.to_string(),
                    action: MergeAction::Stable,
                    changes,
                });
            }
            let marker = previous.map_or(snapshot_at, |p| p.max(snapshot_at));
            (MergeAction::Replace, changes, marker)
        }
    };

    let mut doc = content;
    doc.insert(SNAPSHOT_FIELD.to_string(), JsonValue::from(marker));
    match action {
        MergeAction::Insert => {
            store
                .insert(&spec.table, key, doc)
                .await
                .with_context(|| format!("inserting {}/{key}", spec.table))?;
        }
        _ => {
            store
                .replace(&spec.table, key, doc)
                .await
                .with_context(|| format!("replacing {}/{key}", spec.table))?;
        }
    }

    if !changes.is_empty() {
        store
            .append(&spec.change_log_table(), change_log_row(key, snapshot_at, &changes))
            .await
            .with_context(|| format!("appending change log for {}/{key}", spec.table))?;
    }
    debug!(table = %spec.table, key, ?action, changes = changes.len(), "merged record");

    Ok(MergeOutcome {
        key: key.to_string(),
        action,
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use csnap_storage::{MemoryStore, RangeQuery};

    fn spec() -> EntitySpec {
        EntitySpec::new("models", 10, &["variants"])
    }

    fn content(name: &str, variants: &[&str]) -> Document {
        to_document(&json!({"slug": "acme/m-1", "name": name, "variants": variants})).expect("doc")
    }

    #[tokio::test]
    async fn first_merge_inserts_and_logs_changes() {
        let store = MemoryStore::new();
        let outcome = merge_record(&store, &spec(), "acme/m-1", content("M1", &["standard"]), 100)
            .await
            .expect("merge");
        assert_eq!(outcome.action, MergeAction::Insert);
        assert_eq!(outcome.changes.len(), 3);

        let row = store.get("models", "acme/m-1").await.expect("get").expect("row");
        assert_eq!(row.get(SNAPSHOT_FIELD), Some(&json!(100)));
        assert_eq!(store.len("models_changes").await, 1);
    }

    #[tokio::test]
    async fn repeated_merge_is_stable_and_only_advances_marker() {
        let store = MemoryStore::new();
        let spec = spec();
        merge_record(&store, &spec, "acme/m-1", content("M1", &["standard", "free"]), 100)
            .await
            .expect("first");
        let writes = store.writes();

        let again = merge_record(&store, &spec, "acme/m-1", content("M1", &["free", "standard"]), 100)
            .await
            .expect("again");
        assert_eq!(again.action, MergeAction::Stable);
        assert!(again.changes.is_empty());
        assert_eq!(store.writes(), writes, "same marker must not write");

        let later = merge_record(&store, &spec, "acme/m-1", content("M1", &["standard", "free"]), 200)
            .await
            .expect("later");
        assert_eq!(later.action, MergeAction::Stable);
        assert_eq!(store.writes(), writes + 1);
        let row = store.get("models", "acme/m-1").await.expect("get").expect("row");
        assert_eq!(row.get(SNAPSHOT_FIELD), Some(&json!(200)));
        assert_eq!(store.len("models_changes").await, 1);
    }

    #[tokio::test]
    async fn changed_content_replaces_and_never_moves_marker_back() {
        let store = MemoryStore::new();
        let spec = spec();
        merge_record(&store, &spec, "acme/m-1", content("M1", &["standard"]), 300)
            .await
            .expect("first");

        let outcome = merge_record(&store, &spec, "acme/m-1", content("M1 Pro", &["standard"]), 200)
            .await
            .expect("replay");
        assert_eq!(outcome.action, MergeAction::Replace);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].path, "name");

        let row = store.get("models", "acme/m-1").await.expect("get").expect("row");
        assert_eq!(row.get("name"), Some(&json!("M1 Pro")));
        assert_eq!(row.get(SNAPSHOT_FIELD), Some(&json!(300)));

        let log = store
            .range("models_changes", &RangeQuery::on(SNAPSHOT_FIELD).matching("key", json!("acme/m-1")))
            .await
            .expect("log");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].get(SNAPSHOT_FIELD), Some(&json!(200)));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::Utc;
use csnap_core::{CREATED_AT_FIELD, ID_FIELD};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A stored JSON object. Reads carry the storage-assigned `_id` and
/// `_created_at` fields; writes ignore them.
pub type Document = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {table}/{key} already exists")]
    Duplicate { table: String, key: String },
    #[error("document {table}/{key} not found")]
    NotFound { table: String, key: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub index: String,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub filter: Option<(String, JsonValue)>,
    pub limit: Option<usize>,
    pub descending: bool,
}

impl RangeQuery {
    pub fn on(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            ..Default::default()
        }
    }

    pub fn since(mut self, from: i64) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, to: i64) -> Self {
        self.to = Some(to);
        self
    }

    pub fn matching(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.filter = Some((field.into(), value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.descending = true;
        self
    }
}

/// Document store addressed by `(table, key)`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Document>, StoreError>;

    async fn insert(&self, table: &str, key: &str, doc: Document) -> Result<String, StoreError>;

    async fn replace(&self, table: &str, key: &str, doc: Document) -> Result<(), StoreError>;

    async fn patch(&self, table: &str, key: &str, fields: Document) -> Result<(), StoreError>;

    async fn append(&self, table: &str, doc: Document) -> Result<String, StoreError>;

    async fn range(&self, table: &str, query: &RangeQuery) -> Result<Vec<Document>, StoreError>;
}

pub(crate) fn strip_storage_fields(mut doc: Document) -> Document {
    doc.remove(ID_FIELD);
    doc.remove(CREATED_AT_FIELD);
    doc
}

pub(crate) fn index_value(doc: &Document, field: &str) -> Option<i64> {
    doc.get(field).and_then(JsonValue::as_i64)
}

#[derive(Debug, Clone)]
struct Row {
    id: Uuid,
    created_at: i64,
    seq: u64,
    body: Document,
}

impl Row {
    fn to_document(&self) -> Document {
        let mut doc = self.body.clone();
        doc.insert(ID_FIELD.to_string(), JsonValue::String(self.id.to_string()));
        doc.insert(CREATED_AT_FIELD.to_string(), JsonValue::from(self.created_at));
        doc
    }
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, BTreeMap<String, Row>>,
    next_seq: u64,
}

impl Tables {
    fn new_row(&mut self, body: Document) -> Row {
        self.next_seq += 1;
        Row {
            id: Uuid::new_v4(),
            created_at: Utc::now().timestamp_millis(),
            seq: self.next_seq,
            body: strip_storage_fields(body),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    pub async fn len(&self, table: &str) -> usize {
        self.inner
            .read()
            .await
            .tables
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(Row::to_document))
    }

    async fn insert(&self, table: &str, key: &str, doc: Document) -> Result<String, StoreError> {
        self.count_write();
        let mut inner = self.inner.write().await;
        if inner
            .tables
            .get(table)
            .is_some_and(|rows| rows.contains_key(key))
        {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        let row = inner.new_row(doc);
        let id = row.id.to_string();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row);
        Ok(id)
    }

    async fn replace(&self, table: &str, key: &str, doc: Document) -> Result<(), StoreError> {
        self.count_write();
        let mut inner = self.inner.write().await;
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;
        row.body = strip_storage_fields(doc);
        Ok(())
    }

    async fn patch(&self, table: &str, key: &str, fields: Document) -> Result<(), StoreError> {
        self.count_write();
        let mut inner = self.inner.write().await;
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;
        row.body.extend(strip_storage_fields(fields));
        Ok(())
    }

    async fn append(&self, table: &str, doc: Document) -> Result<String, StoreError> {
        self.count_write();
        let mut inner = self.inner.write().await;
        let row = inner.new_row(doc);
        let key = row.id.to_string();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), row);
        Ok(key)
    }

    async fn range(&self, table: &str, query: &RangeQuery) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.read().await;
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut hits = rows
            .values()
            .filter_map(|row| {
                let value = index_value(&row.body, &query.index)?;
                let in_range = query.from.map_or(true, |from| value >= from)
                    && query.to.map_or(true, |to| value <= to);
                let matches = query
                    .filter
                    .as_ref()
                    .map_or(true, |(field, expected)| row.body.get(field) == Some(expected));
                (in_range && matches).then_some((value, row))
            })
            .collect::<Vec<_>>();

        hits.sort_by(|(va, ra), (vb, rb)| {
            let ord = va.cmp(vb).then(ra.seq.cmp(&rb.seq));
            if query.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.to_document())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn insert_then_get_decorates_storage_fields() {
        let store = MemoryStore::new();
        let id = store
            .insert("models", "acme/m-1", doc(json!({"name": "M1", "snapshot_at": 1})))
            .await
            .expect("insert");

        let row = store.get("models", "acme/m-1").await.expect("get").expect("row");
        assert_eq!(row.get(ID_FIELD), Some(&JsonValue::String(id)));
        assert!(row.get(CREATED_AT_FIELD).is_some());
        assert_eq!(row.get("name"), Some(&json!("M1")));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store
            .insert("authors", "acme", doc(json!({"name": "Acme"})))
            .await
            .expect("insert");
        let err = store
            .insert("authors", "acme", doc(json!({"name": "Acme"})))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn replace_keeps_identity_and_patch_merges() {
        let store = MemoryStore::new();
        let id = store
            .insert("apps", "7", doc(json!({"title": "a", "snapshot_at": 1})))
            .await
            .expect("insert");

        let mut stored = store.get("apps", "7").await.expect("get").expect("row");
        stored.insert("title".into(), json!("b"));
        store.replace("apps", "7", stored).await.expect("replace");
        store
            .patch("apps", "7", doc(json!({"snapshot_at": 5})))
            .await
            .expect("patch");

        let row = store.get("apps", "7").await.expect("get").expect("row");
        assert_eq!(row.get(ID_FIELD), Some(&JsonValue::String(id)));
        assert_eq!(row.get("title"), Some(&json!("b")));
        assert_eq!(row.get("snapshot_at"), Some(&json!(5)));
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn missing_rows_cannot_be_replaced_or_patched() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.replace("apps", "1", Document::new()).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.patch("apps", "1", Document::new()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn range_filters_orders_and_limits() {
        let store = MemoryStore::new();
        for (key, at) in [("a", 10), ("b", 30), ("a", 20), ("c", 40)] {
            store
                .append("models_changes", doc(json!({"key": key, "snapshot_at": at})))
                .await
                .expect("append");
        }

        let since = store
            .range("models_changes", &RangeQuery::on("snapshot_at").since(20))
            .await
            .expect("range");
        let ats = since
            .iter()
            .map(|d| index_value(d, "snapshot_at").unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ats, vec![20, 30, 40]);

        let only_a = store
            .range(
                "models_changes",
                &RangeQuery::on("snapshot_at")
                    .matching("key", json!("a"))
                    .newest_first()
                    .limit(1),
            )
            .await
            .expect("range");
        assert_eq!(only_a.len(), 1);
        assert_eq!(index_value(&only_a[0], "snapshot_at"), Some(20));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csnap_core::{CREATED_AT_FIELD, ID_FIELD};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::document::{strip_storage_fields, Document, DocumentStore, RangeQuery, StoreError};

/// Postgres-backed store: every table lives in one `documents` relation keyed
/// by `(tbl, key)` with the content in a JSONB `body`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("document store migrations applied");
        Ok(())
    }

    fn row_to_document(row: &PgRow) -> Result<Document, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let Json(body): Json<JsonValue> = row.try_get("body")?;
        let mut doc = match body {
            JsonValue::Object(map) => map,
            _ => Document::new(),
        };
        doc.insert(ID_FIELD.to_string(), JsonValue::String(id.to_string()));
        doc.insert(
            CREATED_AT_FIELD.to_string(),
            JsonValue::from(created_at.timestamp_millis()),
        );
        Ok(doc)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT id, created_at, body FROM documents WHERE tbl = $1 AND key = $2")
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn insert(&self, table: &str, key: &str, doc: Document) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        let body = JsonValue::Object(strip_storage_fields(doc));
        let result = sqlx::query(
            r#"
            INSERT INTO documents (tbl, key, id, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tbl, key) DO NOTHING
            "#,
        )
        .bind(table)
        .bind(key)
        .bind(id)
        .bind(Json(body))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        Ok(id.to_string())
    }

    async fn replace(&self, table: &str, key: &str, doc: Document) -> Result<(), StoreError> {
        let body = JsonValue::Object(strip_storage_fields(doc));
        let result = sqlx::query("UPDATE documents SET body = $3 WHERE tbl = $1 AND key = $2")
            .bind(table)
            .bind(key)
            .bind(Json(body))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn patch(&self, table: &str, key: &str, fields: Document) -> Result<(), StoreError> {
        let fields = JsonValue::Object(strip_storage_fields(fields));
        let result =
            sqlx::query("UPDATE documents SET body = body || $3 WHERE tbl = $1 AND key = $2")
                .bind(table)
                .bind(key)
                .bind(Json(fields))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn append(&self, table: &str, doc: Document) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        let key = id.to_string();
        let body = JsonValue::Object(strip_storage_fields(doc));
        sqlx::query("INSERT INTO documents (tbl, key, id, body) VALUES ($1, $2, $3, $4)")
            .bind(table)
            .bind(&key)
            .bind(id)
            .bind(Json(body))
            .execute(&self.pool)
            .await?;
        Ok(key)
    }

    async fn range(&self, table: &str, query: &RangeQuery) -> Result<Vec<Document>, StoreError> {
        let direction = if query.descending { "DESC" } else { "ASC" };
        let sql = format!(
            r#"
            SELECT id, created_at, body
              FROM documents
             WHERE tbl = $1
               AND body ? $2
               AND ($3::bigint IS NULL OR (body->>$2)::bigint >= $3)
               AND ($4::bigint IS NULL OR (body->>$2)::bigint <= $4)
               AND ($5::text IS NULL OR body->$5 = $6)
             ORDER BY (body->>$2)::bigint {direction}, seq {direction}
             LIMIT $7
            "#
        );
        let (filter_field, filter_value) = match &query.filter {
            Some((field, value)) => (Some(field.clone()), Some(Json(value.clone()))),
            None => (None, None),
        };
        let limit = query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query(&sql)
            .bind(table)
            .bind(&query.index)
            .bind(query.from)
            .bind(query.to)
            .bind(filter_field)
            .bind(filter_value)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_document).collect()
    }
}

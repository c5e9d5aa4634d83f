//! Read-only JSON endpoints over views, change logs and run reports.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use csnap_core::SNAPSHOT_FIELD;
use csnap_storage::{ArtifactStore, DocumentStore, RangeQuery};
use csnap_sync::{
    load_report, open_store, recent_summaries, EntityRegistry, EntitySpec, RunSummary, SyncConfig,
    REPORTS_TABLE,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "csnap-web";

const DEFAULT_REPORT_LIMIT: usize = 20;
const MAX_ROWS: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub artifacts: ArtifactStore,
    pub registry: Arc<EntityRegistry>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, artifacts: ArtifactStore, registry: EntityRegistry) -> Self {
        Self {
            store,
            artifacts,
            registry: Arc::new(registry),
        }
    }

    fn entity(&self, name: &str) -> Result<&EntitySpec, Response> {
        self.registry
            .get(name)
            .ok_or_else(|| not_found(format!("unknown entity {name:?}")))
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReportsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ChangesQuery {
    since: Option<i64>,
    key: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/reports", get(reports_handler))
        .route("/reports/{run_id}", get(report_detail_handler))
        .route("/views/{entity}/{*key}", get(view_handler))
        .route("/changes/{entity}", get(changes_handler))
        .with_state(Arc::new(state))
}

// A memory store opened here would never see a sync run's writes.
fn require_database(config: &SyncConfig) -> anyhow::Result<()> {
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL must be set to serve queries");
    }
    Ok(())
}

pub async fn serve_from_env(bind: Option<String>) -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    require_database(&config)?;
    let registry = EntityRegistry::load(&config.registry_path).await?;
    let store = open_store(&config).await?;
    let state = AppState::new(store, ArtifactStore::new(config.artifacts_dir.clone()), registry);

    let bind = bind
        .or_else(|| std::env::var("CSNAP_WEB_BIND").ok())
        .unwrap_or_else(|| "0.0.0.0:8000".to_string());
    let listener = TcpListener::bind(&bind).await?;
    info!(%bind, "serving query endpoints");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT).clamp(1, MAX_ROWS);
    match recent_summaries(state.store.as_ref(), limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn report_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    let row = match state.store.get(REPORTS_TABLE, &run_id).await {
        Ok(Some(row)) => row,
        Ok(None) => return not_found(format!("no report for run {run_id}")),
        Err(err) => return server_error(err.into()),
    };
    let summary: RunSummary = match serde_json::from_value(JsonValue::Object(row)) {
        Ok(summary) => summary,
        Err(err) => return server_error(err.into()),
    };
    match load_report(&state.artifacts, &summary.report_key).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

async fn view_handler(
    State(state): State<Arc<AppState>>,
    Path((entity, key)): Path<(String, String)>,
) -> Response {
    let spec = match state.entity(&entity) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    match state.store.get(&spec.table, &key).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => not_found(format!("no {entity} row for {key:?}")),
        Err(err) => server_error(err.into()),
    }
}

async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let spec = match state.entity(&entity) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    let mut range = RangeQuery::on(SNAPSHOT_FIELD).limit(query.limit.unwrap_or(MAX_ROWS).min(MAX_ROWS));
    if let Some(since) = query.since {
        range = range.since(since);
    }
    if let Some(key) = query.key {
        range = range.matching("key", JsonValue::String(key));
    }
    match state.store.range(&spec.change_log_table(), &range).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use csnap_storage::{Document, MemoryStore};
    use csnap_sync::{persist_report, EntityReport, ReportCollector};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn doc(value: JsonValue) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn state(store: Arc<MemoryStore>, artifacts: &std::path::Path) -> AppState {
        AppState::new(store, ArtifactStore::new(artifacts), EntityRegistry::default())
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(app(state(Arc::new(MemoryStore::new()), dir.path())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn serving_requires_a_database() {
        let mut config = SyncConfig {
            api_base: "http://catalog.test".into(),
            database_url: None,
            artifacts_dir: "artifacts".into(),
            fixtures_dir: None,
            user_agent: "csnap-test".into(),
            http_timeout_secs: 5,
            registry_path: "catalog.yaml".into(),
        };
        let err = require_database(&config).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        config.database_url = Some("postgres://localhost/csnap".into());
        assert!(require_database(&config).is_ok());
    }

    #[tokio::test]
    async fn views_resolve_slash_keys_and_reject_unknown_entities() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert("models", "acme/m-1", doc(json!({"name": "Acme: M1", "snapshot_at": 5})))
            .await
            .unwrap();
        let app = app(state(store, dir.path()));

        let (status, body) = get_json(app.clone(), "/views/models/acme/m-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Acme: M1");

        let (status, _) = get_json(app.clone(), "/views/models/acme/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app, "/views/widgets/x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn changes_filter_by_marker_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        for (key, at) in [("acme", 1), ("acme", 5), ("nova", 6)] {
            store
                .append("providers_changes", doc(json!({"key": key, "snapshot_at": at, "changes": []})))
                .await
                .unwrap();
        }
        let app = app(state(store, dir.path()));

        let (status, body) = get_json(app.clone(), "/changes/providers?since=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(2));

        let (_, body) = get_json(app, "/changes/providers?key=acme").await;
        let markers: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["snapshot_at"].as_i64().unwrap())
            .collect();
        assert_eq!(markers, vec![1, 5]);
    }

    #[tokio::test]
    async fn reports_list_and_detail() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let artifacts = ArtifactStore::new(dir.path());
        let run_id = uuid::Uuid::new_v4();
        let mut collector = ReportCollector::new(run_id, 1_700_000_000_000);
        let mut providers = EntityReport::new("providers");
        providers.inserted = 2;
        collector.absorb(providers);
        persist_report(&collector.finish(), &artifacts, store.as_ref())
            .await
            .unwrap();
        let app = app(state(store, dir.path()));

        let (status, body) = get_json(app.clone(), "/reports?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["items"]["providers"], 2);

        let (status, body) = get_json(app.clone(), &format!("/reports/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entities"]["providers"]["inserted"], 2);

        let (status, _) = get_json(app, "/reports/not-a-run").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

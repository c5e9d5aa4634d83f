use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use csnap_adapters::schemas::{
    AppContext, AppSchema, AuthorSchema, EndpointContext, EndpointSchema, ModelSchema,
    ModelUsageSchema, ProviderSchema, UptimeContext, UptimeSchema,
};
use csnap_adapters::{
    consolidate_variants, records_at, validate_record, validate_records, CatalogSource,
    FixtureCatalogSource, HttpCatalogSource, RawPayload, RecordSchema, SourceError,
};
use csnap_core::{day_start_millis, Issue, Model, SeriesPoint, SnapshotMarker, ViewRecord};
use csnap_storage::{
    ArtifactStore, DocumentStore, HttpClientConfig, HttpFetcher, MemoryStore, PgDocumentStore,
};
use serde_json::Value as JsonValue;
use tokio::task::JoinError;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::merge_views;
use crate::config::{EntityRegistry, SyncConfig};
use crate::report::{persist_report, EntityReport, ReportCollector, RunReport};
use crate::timeseries::merge_series;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Marker for this run; defaults to the current time in epoch milliseconds.
    pub snapshot_at: Option<SnapshotMarker>,
    pub compress_archives: bool,
}

pub struct SyncPipeline {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn DocumentStore>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<EntityRegistry>,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn DocumentStore>,
        artifacts: ArtifactStore,
        registry: EntityRegistry,
    ) -> Self {
        Self {
            source,
            store,
            artifacts: Arc::new(artifacts),
            registry: Arc::new(registry),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = EntityRegistry::load(&config.registry_path).await?;
        let store = open_store(config).await?;
        let source = open_source(config)?;
        Ok(Self::new(
            source,
            store,
            ArtifactStore::new(config.artifacts_dir.clone()),
            registry,
        ))
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Runs both phases and always returns a persisted report unless the
    /// report itself cannot be written.
    pub async fn run_once(&self, options: RunOptions) -> Result<RunReport> {
        let snapshot_at = options
            .snapshot_at
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let run_id = Uuid::new_v4();
        let ctx = RunContext {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            artifacts: Arc::clone(&self.artifacts),
            registry: Arc::clone(&self.registry),
            snapshot_at,
            compress_archives: options.compress_archives,
        };

        let span = info_span!("sync_run", %run_id, snapshot_at);
        async move {
            let mut collector = ReportCollector::new(run_id, snapshot_at);

            info!("phase one: providers, models");
            let providers = tokio::spawn(
                ctx.clone()
                    .sync_providers()
                    .instrument(info_span!("branch", entity = ProviderSchema::ENTITY)),
            );
            let models = tokio::spawn(
                ctx.clone()
                    .sync_models()
                    .instrument(info_span!("branch", entity = ModelSchema::ENTITY)),
            );
            let (providers, models) = tokio::join!(providers, models);
            settle(&mut collector, ProviderSchema::ENTITY, providers);
            let models = settle(&mut collector, ModelSchema::ENTITY, models).unwrap_or_default();

            if models.is_empty() {
                warn!("no models survived validation; skipping phase two");
                collector.skip_phase_two();
            } else {
                let authors: Vec<String> = models
                    .iter()
                    .map(|m| m.author_slug.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let models = Arc::new(models);

                info!(models = models.len(), authors = authors.len(), "phase two: endpoints, apps, authors");
                let endpoints = tokio::spawn(
                    ctx.clone()
                        .sync_endpoints(Arc::clone(&models))
                        .instrument(info_span!("branch", entity = EndpointSchema::ENTITY)),
                );
                let apps = tokio::spawn(
                    ctx.clone()
                        .sync_apps(Arc::clone(&models))
                        .instrument(info_span!("branch", entity = AppSchema::ENTITY)),
                );
                let authors = tokio::spawn(
                    ctx.clone()
                        .sync_authors(authors)
                        .instrument(info_span!("branch", entity = AuthorSchema::ENTITY)),
                );
                let (endpoints, apps, authors) = tokio::join!(endpoints, apps, authors);
                settle(&mut collector, EndpointSchema::ENTITY, endpoints);
                settle(&mut collector, AppSchema::ENTITY, apps);
                settle(&mut collector, AuthorSchema::ENTITY, authors);
            }

            let report = collector.finish();
            persist_report(&report, &ctx.artifacts, ctx.store.as_ref()).await?;
            info!(
                errors = report.errors,
                warnings = report.warnings,
                duration_ms = report.duration_ms,
                "sync run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise an
/// in-memory store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgDocumentStore::connect(url)
                .await
                .context("connecting to document store")?;
            store.migrate().await.context("migrating document store")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory document store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn open_source(config: &SyncConfig) -> Result<Arc<dyn CatalogSource>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "reading catalog from fixtures");
        return Ok(Arc::new(FixtureCatalogSource::new(dir.clone())));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Arc::new(HttpCatalogSource::new(config.api_base.clone(), http)))
}

struct BranchOutput<T> {
    reports: Vec<EntityReport>,
    value: T,
}

impl BranchOutput<()> {
    fn reports(reports: Vec<EntityReport>) -> Self {
        Self { reports, value: () }
    }
}

/// Folds a joined branch into the collector. Errors and panics become one
/// `sync` issue on the branch's entity.
fn settle<T>(
    collector: &mut ReportCollector,
    entity: &str,
    joined: Result<Result<BranchOutput<T>>, JoinError>,
) -> Option<T> {
    match joined {
        Ok(Ok(output)) => {
            for report in output.reports {
                collector.absorb(report);
            }
            Some(output.value)
        }
        Ok(Err(err)) => {
            collector.record_issue(Issue::sync(entity, format!("{err:#}")));
            None
        }
        Err(err) => {
            let what = if err.is_panic() { "panicked" } else { "was cancelled" };
            collector.record_issue(Issue::sync(entity, format!("branch {what}: {err}")));
            None
        }
    }
}

fn validate_into<S: RecordSchema>(
    records: &[JsonValue],
    ctx: &S::Context,
    report: &mut EntityReport,
    scope: &str,
) -> Vec<S::Output> {
    report.fetched += records.len();
    let validated = validate_records::<S>(records, ctx);
    report.record_issues(validated.issues.into_iter().map(|issue| issue.scoped(scope)));
    validated.items
}

#[derive(Clone)]
struct RunContext {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn DocumentStore>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<EntityRegistry>,
    snapshot_at: SnapshotMarker,
    compress_archives: bool,
}

impl RunContext {
    async fn archive(&self, payload: &RawPayload) {
        let archived = self
            .artifacts
            .archive_raw(self.snapshot_at, payload.entity, &payload.body, self.compress_archives)
            .await;
        if let Err(err) = archived {
            warn!(entity = payload.entity, error = %err, "raw payload archival failed");
        }
    }

    /// Archives and validates one fetched payload. A failed fetch or a payload
    /// without the expected array is recorded as a `sync` issue for `scope`.
    async fn ingest<S: RecordSchema>(
        &self,
        fetched: Result<RawPayload, SourceError>,
        field: Option<&str>,
        ctx: &S::Context,
        report: &mut EntityReport,
        scope: &str,
    ) -> Vec<S::Output> {
        let payload = match fetched {
            Ok(payload) => payload,
            Err(err) => {
                report.record_issues([Issue::sync(S::ENTITY, err.to_string()).scoped(scope)]);
                return Vec::new();
            }
        };
        self.archive(&payload).await;
        match records_at(&payload.data, field) {
            Some(records) => validate_into::<S>(records, ctx, report, scope),
            None => {
                let at = field.unwrap_or("payload root");
                report.record_issues([
                    Issue::sync(S::ENTITY, format!("expected an array at {at}")).scoped(scope)
                ]);
                Vec::new()
            }
        }
    }

    async fn commit_views<T>(&self, report: &mut EntityReport, records: Vec<T>) -> Result<()>
    where
        T: ViewRecord + Send + Sync + 'static,
    {
        let spec = self.registry.spec(&report.entity)?;
        let outcomes = merge_views(self.store.as_ref(), spec, records, self.snapshot_at).await?;
        report.record_outcomes(&outcomes);
        Ok(())
    }

    async fn commit_series<T>(&self, report: &mut EntityReport, points: Vec<T>) -> Result<()>
    where
        T: SeriesPoint + Send + Sync + 'static,
    {
        let spec = self.registry.spec(&report.entity)?;
        let outcomes = merge_series(self.store.as_ref(), spec, points, self.snapshot_at).await?;
        report.record_outcomes(&outcomes);
        Ok(())
    }

    async fn sync_providers(self) -> Result<BranchOutput<()>> {
        let mut report = EntityReport::new(ProviderSchema::ENTITY);
        let fetched = self.source.providers().await;
        let providers = self
            .ingest::<ProviderSchema>(fetched, None, &(), &mut report, "providers")
            .await;
        self.commit_views(&mut report, providers).await?;
        Ok(BranchOutput::reports(vec![report]))
    }

    async fn sync_models(self) -> Result<BranchOutput<Vec<Model>>> {
        let mut report = EntityReport::new(ModelSchema::ENTITY);
        let fetched = self.source.models().await;
        let models = self
            .ingest::<ModelSchema>(fetched, None, &(), &mut report, "models")
            .await;
        let models = consolidate_variants(models);
        self.commit_views(&mut report, models.clone()).await?;
        Ok(BranchOutput {
            reports: vec![report],
            value: models,
        })
    }

    async fn sync_endpoints(self, models: Arc<Vec<Model>>) -> Result<BranchOutput<()>> {
        let mut report = EntityReport::new(EndpointSchema::ENTITY);
        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        for model in models.iter() {
            for variant in model.query_variants() {
                let scope = format!("{}:{variant}", model.permaslug);
                let ctx = EndpointContext {
                    model_permaslug: model.permaslug.clone(),
                    variant: variant.clone(),
                };
                let fetched = self.source.endpoints(&model.permaslug, &variant).await;
                let batch = self
                    .ingest::<EndpointSchema>(fetched, None, &ctx, &mut report, &scope)
                    .await;
                endpoints.extend(batch.into_iter().filter(|e| seen.insert(e.id.clone())));
            }
        }
        let endpoint_ids: Vec<String> = endpoints.iter().map(|e| e.id.clone()).collect();
        self.commit_views(&mut report, endpoints).await?;

        let uptime = self.sync_uptime(&endpoint_ids).await;
        Ok(BranchOutput::reports(vec![report, uptime]))
    }

    /// Uptime is isolated from its parent branch: every failure lands on the
    /// `endpoint_uptime` report and endpoint results are kept.
    async fn sync_uptime(&self, endpoint_ids: &[String]) -> EntityReport {
        let mut report = EntityReport::new(UptimeSchema::ENTITY);
        let mut points = Vec::new();
        for endpoint_id in endpoint_ids {
            let ctx = UptimeContext {
                endpoint_id: endpoint_id.clone(),
            };
            let fetched = self.source.uptime(endpoint_id).await;
            points.extend(
                self.ingest::<UptimeSchema>(fetched, Some("history"), &ctx, &mut report, endpoint_id)
                    .await,
            );
        }
        if let Err(err) = self.commit_series(&mut report, points).await {
            report.record_issues([Issue::sync(UptimeSchema::ENTITY, format!("{err:#}"))]);
        }
        report
    }

    async fn sync_apps(self, models: Arc<Vec<Model>>) -> Result<BranchOutput<()>> {
        let mut apps_report = EntityReport::new(AppSchema::ENTITY);
        let mut usage_report = EntityReport::new("app_token_usage");
        let day = day_start_millis(self.snapshot_at);
        let mut seen = HashSet::new();
        let mut apps = Vec::new();
        let mut usage = Vec::new();
        for model in models.iter() {
            for variant in model.query_variants() {
                let scope = format!("{}:{variant}", model.permaslug);
                let ctx = AppContext {
                    model_permaslug: model.permaslug.clone(),
                    variant: variant.clone(),
                    day,
                };
                let fetched = self.source.apps(&model.permaslug, &variant).await;
                let entries = self
                    .ingest::<AppSchema>(fetched, None, &ctx, &mut apps_report, &scope)
                    .await;
                for entry in entries {
                    if seen.insert(entry.app.id) {
                        apps.push(entry.app);
                    }
                    usage.push(entry.usage);
                }
            }
        }
        // every raw app entry carries one usage total
        usage_report.fetched = apps_report.fetched;
        self.commit_views(&mut apps_report, apps).await?;
        self.commit_series(&mut usage_report, usage).await?;
        Ok(BranchOutput::reports(vec![apps_report, usage_report]))
    }

    async fn sync_authors(self, slugs: Vec<String>) -> Result<BranchOutput<()>> {
        let mut authors_report = EntityReport::new(AuthorSchema::ENTITY);
        let mut usage_report = EntityReport::new(ModelUsageSchema::ENTITY);
        let mut authors = Vec::new();
        let mut usage = Vec::new();
        for slug in &slugs {
            let payload = match self.source.author(slug).await {
                Ok(payload) => payload,
                Err(err) => {
                    authors_report.record_issues([Issue::sync(AuthorSchema::ENTITY, err.to_string()).scoped(slug)]);
                    continue;
                }
            };
            self.archive(&payload).await;

            match payload.data.get("author") {
                Some(raw) => {
                    authors_report.fetched += 1;
                    let (author, issues) = validate_record::<AuthorSchema>(0, raw, &());
                    authors_report.record_issues(issues.into_iter().map(|issue| issue.scoped(slug)));
                    authors.extend(author);
                }
                None => authors_report.record_issues([
                    Issue::sync(AuthorSchema::ENTITY, "payload has no author object").scoped(slug)
                ]),
            }
            match records_at(&payload.data, Some("analytics")) {
                Some(records) => {
                    usage.extend(validate_into::<ModelUsageSchema>(records, &(), &mut usage_report, slug))
                }
                None => usage_report.record_issues([
                    Issue::sync(ModelUsageSchema::ENTITY, "expected an array at analytics").scoped(slug)
                ]),
            }
        }
        self.commit_views(&mut authors_report, authors).await?;
        self.commit_series(&mut usage_report, usage).await?;
        Ok(BranchOutput::reports(vec![authors_report, usage_report]))
    }
}

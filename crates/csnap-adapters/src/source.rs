use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csnap_storage::{FetchError, HttpFetcher, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// One upstream payload: the bytes as received (archived verbatim) and the
/// unwrapped `data` value handed to validation.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub entity: &'static str,
    pub body: Vec<u8>,
    pub data: JsonValue,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid catalog url {url}: {message}")]
    Url { url: String, message: String },
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
    #[error("no {entity} fixture for {key}")]
    MissingFixture { entity: &'static str, key: String },
}

/// Where catalog payloads come from. Every call returns one raw payload; the
/// caller validates it.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn providers(&self) -> Result<RawPayload, SourceError>;
    async fn models(&self) -> Result<RawPayload, SourceError>;
    async fn endpoints(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError>;
    async fn uptime(&self, endpoint_id: &str) -> Result<RawPayload, SourceError>;
    async fn apps(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError>;
    async fn author(&self, slug: &str) -> Result<RawPayload, SourceError>;
}

#[derive(Debug)]
pub struct HttpCatalogSource {
    base_url: String,
    http: HttpFetcher,
}

impl HttpCatalogSource {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, SourceError> {
        let raw = format!("{}/{}", self.base_url, path);
        Url::parse_with_params(&raw, params).map_err(|err| SourceError::Url {
            url: raw,
            message: err.to_string(),
        })
    }

    async fn get(&self, entity: &'static str, url: Url) -> Result<RawPayload, SourceError> {
        let fetched = self.http.fetch_json(entity, url.as_str()).await?;
        Ok(RawPayload {
            entity,
            body: fetched.body,
            data: fetched.data,
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn providers(&self) -> Result<RawPayload, SourceError> {
        let url = self.url("providers", &[])?;
        self.get("providers", url).await
    }

    async fn models(&self) -> Result<RawPayload, SourceError> {
        let url = self.url("models", &[])?;
        self.get("models", url).await
    }

    async fn endpoints(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError> {
        let url = self.url(
            "stats/endpoint",
            &[("permaslug", permaslug), ("variant", variant)],
        )?;
        self.get("endpoints", url).await
    }

    async fn uptime(&self, endpoint_id: &str) -> Result<RawPayload, SourceError> {
        let url = self.url("stats/uptime-recent", &[("id", endpoint_id)])?;
        self.get("endpoint_uptime", url).await
    }

    async fn apps(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError> {
        let url = self.url("stats/app", &[("permaslug", permaslug), ("variant", variant)])?;
        self.get("apps", url).await
    }

    async fn author(&self, slug: &str) -> Result<RawPayload, SourceError> {
        let url = self.url("author", &[("slug", slug)])?;
        self.get("authors", url).await
    }
}

/// Offline source backed by a directory of captured payloads.
///
/// `providers.json` and `models.json` hold the API envelope as served.
/// `endpoints.json` and `apps.json` map `"permaslug:variant"` to the `data`
/// value, `uptime.json` maps endpoint ids, and `authors.json` maps slugs.
#[derive(Debug, Clone)]
pub struct FixtureCatalogSource {
    root: PathBuf,
}

impl FixtureCatalogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn enveloped(&self, entity: &'static str, file: &str) -> Result<RawPayload, SourceError> {
        let path = self.root.join(file);
        let mut value: JsonValue = read_json_file(&path)?;
        let data = value
            .get_mut("data")
            .map(JsonValue::take)
            .ok_or_else(|| SourceError::Fixture {
                path: path.display().to_string(),
                message: "missing `data` envelope".to_string(),
            })?;
        payload(entity, data)
    }

    fn keyed(&self, entity: &'static str, file: &str, key: &str) -> Result<RawPayload, SourceError> {
        let path = self.root.join(file);
        let mut entries: BTreeMap<String, JsonValue> = read_json_file(&path)?;
        let data = entries
            .remove(key)
            .ok_or_else(|| SourceError::MissingFixture {
                entity,
                key: key.to_string(),
            })?;
        debug!(entity, key, "serving fixture payload");
        payload(entity, data)
    }
}

fn payload(entity: &'static str, data: JsonValue) -> Result<RawPayload, SourceError> {
    let body = serde_json::to_vec(&serde_json::json!({ "data": &data })).map_err(|err| {
        SourceError::Fixture {
            path: entity.to_string(),
            message: err.to_string(),
        }
    })?;
    Ok(RawPayload { entity, body, data })
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let data = fs::read_to_string(path).map_err(|err| SourceError::Fixture {
        path: path.display().to_string(),
        message: format!("reading: {err}"),
    })?;
    serde_json::from_str(&data).map_err(|err| SourceError::Fixture {
        path: path.display().to_string(),
        message: format!("parsing: {err}"),
    })
}

fn variant_key(permaslug: &str, variant: &str) -> String {
    format!("{permaslug}:{variant}")
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    async fn providers(&self) -> Result<RawPayload, SourceError> {
        self.enveloped("providers", "providers.json")
    }

    async fn models(&self) -> Result<RawPayload, SourceError> {
        self.enveloped("models", "models.json")
    }

    async fn endpoints(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError> {
        self.keyed("endpoints", "endpoints.json", &variant_key(permaslug, variant))
    }

    async fn uptime(&self, endpoint_id: &str) -> Result<RawPayload, SourceError> {
        self.keyed("endpoint_uptime", "uptime.json", endpoint_id)
    }

    async fn apps(&self, permaslug: &str, variant: &str) -> Result<RawPayload, SourceError> {
        self.keyed("apps", "apps.json", &variant_key(permaslug, variant))
    }

    async fn author(&self, slug: &str) -> Result<RawPayload, SourceError> {
        self.keyed("authors", "authors.json", slug)
    }
}

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: String,
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub registry_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("CSNAP_API_BASE")
                .unwrap_or_else(|_| "https://openrouter.ai/api/frontend".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            fixtures_dir: std::env::var("CSNAP_FIXTURES_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("CSNAP_USER_AGENT")
                .unwrap_or_else(|_| "csnap-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("CSNAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            registry_path: std::env::var("CSNAP_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./catalog.yaml")),
        }
    }
}

/// Storage and merge settings for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub changes_table: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Array fields compared by membership rather than position.
    #[serde(default)]
    pub set_fields: Vec<String>,
}

fn default_batch_size() -> usize {
    100
}

impl EntitySpec {
    pub fn new(name: &str, batch_size: usize, set_fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: name.to_string(),
            changes_table: None,
            batch_size,
            set_fields: set_fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn change_log_table(&self) -> String {
        self.changes_table
            .clone()
            .unwrap_or_else(|| format!("{}_changes", self.table))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRegistry {
    pub entities: Vec<EntitySpec>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            entities: vec![
                EntitySpec::new("providers", 100, &[]),
                EntitySpec::new("models", 100, &["input_modalities", "output_modalities", "variants"]),
                EntitySpec::new("endpoints", 100, &["supported_parameters"]),
                EntitySpec::new("endpoint_uptime", 200, &[]),
                EntitySpec::new("apps", 100, &[]),
                EntitySpec::new("app_token_usage", 200, &[]),
                EntitySpec::new("authors", 100, &[]),
                EntitySpec::new("model_token_usage", 200, &[]),
            ],
        }
    }
}

impl EntityRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing entity registry")
    }

    /// Loads the registry at `path`, falling back to the built-in one when the
    /// file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "entity registry not found; using built-in defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn spec(&self, name: &str) -> Result<&EntitySpec> {
        self.get(name)
            .ok_or_else(|| anyhow!("entity {name:?} is not registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_registry_matches_builtin() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml");
        let text = std::fs::read_to_string(path).expect("catalog.yaml");
        let registry = EntityRegistry::from_yaml_str(&text).expect("registry");
        assert_eq!(registry, EntityRegistry::default());
    }

    #[test]
    fn change_log_table_defaults_to_suffix() {
        let registry = EntityRegistry::from_yaml_str(
            "entities:\n  - name: apps\n    table: apps_v2\n  - name: authors\n    table: authors\n    changes_table: author_audit\n",
        )
        .expect("registry");
        let apps = registry.spec("apps").expect("apps");
        assert_eq!(apps.change_log_table(), "apps_v2_changes");
        assert_eq!(apps.batch_size, 100);
        assert_eq!(registry.spec("authors").expect("authors").change_log_table(), "author_audit");
        assert!(registry.spec("models").is_err());
    }

    #[tokio::test]
    async fn missing_registry_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = EntityRegistry::load(&dir.path().join("absent.yaml"))
            .await
            .expect("registry");
        assert_eq!(registry.entities.len(), 8);
    }
}

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub key: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub compressed: bool,
    pub deduplicated: bool,
}

/// Write-once blob store rooted at a directory. Keys are relative slash paths;
/// a `.gz` suffix marks gzip content and is decoded transparently on read.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn gzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).context("gzip encoding")?;
        encoder.finish().context("finishing gzip stream")
    }

    pub fn gunzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).context("gzip decoding")?;
        Ok(out)
    }

    /// Key for a run report: `reports/{snapshot_at}/{run_id}.json.gz`.
    pub fn report_key(snapshot_at: i64, run_id: Uuid) -> String {
        format!("reports/{snapshot_at}/{run_id}.json.gz")
    }

    /// Archives a raw upstream payload under a content-addressed key so
    /// re-fetching identical bytes within a snapshot is a no-op.
    pub async fn archive_raw(
        &self,
        snapshot_at: i64,
        entity: &str,
        bytes: &[u8],
        compress: bool,
    ) -> anyhow::Result<StoredArtifact> {
        let hash = Self::sha256_hex(bytes);
        let ext = if compress { "json.gz" } else { "json" };
        let key = format!("raw/{snapshot_at}/{entity}/{hash}.{ext}");
        self.put(&key, bytes, compress).await
    }

    /// Stores `bytes` under `key`, gzip-compressing first when asked.
    pub async fn put(&self, key: &str, bytes: &[u8], compress: bool) -> anyhow::Result<StoredArtifact> {
        if compress {
            let encoded = Self::gzip(bytes)?;
            let mut stored = self.store_bytes(key, &encoded).await?;
            stored.compressed = true;
            Ok(stored)
        } else {
            self.store_bytes(key, bytes).await
        }
    }

    pub async fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading artifact {}", path.display()))?;
        if key.ends_with(".gz") {
            Self::gunzip(&bytes)
        } else {
            Ok(bytes)
        }
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid artifact key {key:?}");
        }
        Ok(self.root.join(relative))
    }

    /// Writes immutably via a temp file and atomic rename; an existing key is left untouched.
    async fn store_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.resolve(key)?;
        let stored = |deduplicated| StoredArtifact {
            key: key.to_string(),
            content_hash: content_hash.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            compressed: false,
            deduplicated,
        };

        let Some(parent) = absolute_path.parent() else {
            bail!("artifact key {key:?} has no parent directory");
        };
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn raw_archives_deduplicate_by_content() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .archive_raw(1_700_000_000_000, "models", br#"{"data":[]}"#, false)
            .await
            .expect("first archive");
        let second = store
            .archive_raw(1_700_000_000_000, "models", br#"{"data":[]}"#, false)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.key, second.key);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn compressed_artifacts_read_back_transparently() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let key = ArtifactStore::report_key(42, Uuid::new_v4());

        let stored = store
            .put(&key, br#"{"ok":true}"#, true)
            .await
            .expect("put");
        assert!(stored.compressed);
        assert_ne!(
            std::fs::read(&stored.absolute_path).expect("raw bytes"),
            br#"{"ok":true}"#.to_vec()
        );
        assert_eq!(store.read(&key).await.expect("read"), br#"{"ok":true}"#.to_vec());
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(store.put("../outside.json", b"x", false).await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());
    }
}

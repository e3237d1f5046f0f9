//! Snapshot storage plus the rate-limited upstream fetch and pagination layer.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod fetch;
pub mod paginate;

pub use fetch::{
    detect_throttle, FetchError, GraphqlRequest, GraphqlTransport, HttpClientConfig,
    RateLimitHeaders, RateLimitedClient, ReqwestTransport, ThrottlePolicy, ThrottleReason,
    ThrottleSignal, TransportResponse,
};
pub use paginate::{read_connection, ConnectionQuery, Page};

pub const CRATE_NAME: &str = "ghmirror-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
    pub reused: bool,
}

/// Content-addressed, write-once store for backup snapshots. Files land under
/// `<root>/<YYYYmmdd_HHMMSS>/<label>-<sha256>.<ext>` and are never rewritten.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        &self,
        taken_at: DateTime<Utc>,
        label: &str,
        sha256: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(taken_at.format("%Y%m%d_%H%M%S").to_string())
            .join(format!("{label}-{sha256}.{ext}"))
    }

    /// Writes through a temp file and renames into place so readers never see a
    /// partially written snapshot.
    pub async fn put(
        &self,
        taken_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = self.relative_path_for(taken_at, label, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let Some(dir) = absolute_path.parent().map(Path::to_path_buf) else {
            bail!("snapshot path {} has no parent", absolute_path.display());
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

        let stored = |reused| StoredSnapshot {
            sha256: sha256.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len() as u64,
            reused,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(stored(true));
            }
            return Err(err).with_context(|| {
                format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(stored(false))
    }

    /// Reads a snapshot back and refuses it if the content no longer hashes to
    /// the digest recorded when it was written.
    pub async fn read_verified(
        &self,
        relative_path: &Path,
        expected_sha256: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let actual = Self::sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            bail!(
                "snapshot {} is corrupt: expected sha256 {expected_sha256}, found {actual}",
                path.display()
            );
        }
        Ok(bytes)
    }

    /// Finds the snapshot written under `label` in one generation directory and
    /// returns its relative path with the digest recovered from the file name.
    pub async fn find_labeled(
        &self,
        generation: &Path,
        label: &str,
    ) -> anyhow::Result<Option<(PathBuf, String)>> {
        let dir = self.root.join(generation);
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let prefix = format!("{label}-");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let sha256 = rest.split('.').next().unwrap_or_default();
            if sha256.len() == 64 && sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(Some((generation.join(&name), sha256.to_string())));
            }
        }
        Ok(None)
    }

    /// Snapshot directories, newest first. Directory names sort chronologically.
    pub async fn list_generations(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                out.push(PathBuf::from(entry.file_name()));
            }
        }
        out.sort();
        out.reverse();
        Ok(out)
    }
}

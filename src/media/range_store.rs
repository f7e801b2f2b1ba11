use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ByteSource;
use crate::error::RangeFetchError;

const SOURCE_FILE: &str = "source.json";

#[derive(Debug, Serialize, Deserialize)]
struct SourceRecord {
    url: String,
    size: u64,
}

/// Persists fetched byte ranges on disk, keyed by `(url, start, end)`.
///
/// Layout: `<data_dir>/<url_key(url)>/source.json` holds the probed size and
/// every range lives in `<start>_<end>.bin` next to it.
pub struct PersistentRangeCache<S> {
    inner: S,
    data_dir: PathBuf,
}

impl<S: ByteSource> PersistentRangeCache<S> {
    pub fn new(inner: S, data_dir: PathBuf) -> Self {
        Self { inner, data_dir }
    }

    fn source_dir(&self, url: &str) -> PathBuf {
        self.data_dir.join(url_key(url))
    }

    fn range_path(&self, url: &str, start: u64, end: u64) -> PathBuf {
        self.source_dir(url).join(format!("{}_{}.bin", start, end))
    }

    async fn read_record(&self, url: &str) -> Option<u64> {
        let path = self.source_dir(url).join(SOURCE_FILE);
        let content = tokio::fs::read(&path).await.ok()?;
        let record: SourceRecord = serde_json::from_slice(&content).ok()?;
        // Guard against hash collisions.
        (record.url == url).then_some(record.size)
    }

    async fn write_record(&self, url: &str, size: u64) {
        let dir = self.source_dir(url);
        let record = SourceRecord {
            url: url.to_string(),
            size,
        };
        let content = match serde_json::to_vec(&record) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "failed to encode source record");
                return;
            }
        };
        if let Err(e) = write_file(&dir, &dir.join(SOURCE_FILE), &content).await {
            tracing::warn!(url = %url, error = %e, "failed to persist source record");
        }
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for PersistentRangeCache<S> {
    async fn probe_size(&self, url: &str) -> Result<u64, RangeFetchError> {
        if let Some(size) = self.read_record(url).await {
            tracing::trace!(url = %url, size, "size served from range store");
            return Ok(size);
        }
        let size = self.inner.probe_size(url).await?;
        self.write_record(url, size).await;
        Ok(size)
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
        let path = self.range_path(url, start, end);
        if self.read_record(url).await.is_some() {
            if let Ok(data) = tokio::fs::read(&path).await {
                if data.len() as u64 == end.saturating_sub(start) {
                    tracing::trace!(url = %url, start, end, "range served from range store");
                    return Ok(Bytes::from(data));
                }
            }
        }

        let data = self.inner.fetch_range(url, start, end).await?;

        let dir = self.source_dir(url);
        match write_file(&dir, &path, &data).await {
            Ok(()) => {
                tracing::trace!(
                    url = %url,
                    path = %path.display(),
                    bytes = data.len(),
                    "persisted range"
                );
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    path = %path.display(),
                    error = %e,
                    "failed to persist range"
                );
            }
        }

        Ok(data)
    }
}

async fn write_file(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    // Write to a temp name first so a crash never leaves a truncated range behind.
    let mut temp = path.to_path_buf();
    temp.set_extension("tmp");
    tokio::fs::write(&temp, data).await?;
    tokio::fs::rename(&temp, path).await
}

/// First 16 hex chars of the SHA-256 of `url`.
fn url_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

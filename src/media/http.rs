use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::ByteSource;
use crate::error::RangeFetchError;

/// Byte source for `http(s)://` URLs, with `file://` URLs and bare paths read
/// from the local filesystem.
#[derive(Clone, Default)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn probe_remote(&self, url: &str) -> Result<u64, RangeFetchError> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        if let Some(len) = header_u64(response.headers().get(CONTENT_LENGTH)) {
            return Ok(len);
        }

        // Some servers omit Content-Length on HEAD; ask for one byte instead.
        tracing::debug!(url = %url, "HEAD without length, probing with range request");
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?
            .error_for_status()?;

        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|total| total.parse().ok())
            .or_else(|| header_u64(response.headers().get(CONTENT_LENGTH)))
            .ok_or(RangeFetchError::MissingLength)
    }

    async fn fetch_remote(&self, url: &str, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => exact_range(response.bytes().await?, start, end),
            StatusCode::OK => {
                // Range ignored by the server, cut the window out of the full body.
                let body = response.bytes().await?;
                let size = body.len() as u64;
                if end > size {
                    return Err(RangeFetchError::OutOfBounds { start, end, size });
                }
                Ok(body.slice(start as usize..end as usize))
            }
            status => Err(RangeFetchError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn probe_size(&self, url: &str) -> Result<u64, RangeFetchError> {
        match local_path(url) {
            Some(path) => Ok(tokio::fs::metadata(path).await?.len()),
            None => self.probe_remote(url).await,
        }
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
        if end <= start {
            return Ok(Bytes::new());
        }
        match local_path(url) {
            Some(path) => read_file_range(path, start, end).await,
            None => self.fetch_remote(url, start, end).await,
        }
    }
}

fn local_path(url: &str) -> Option<&Path> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(Path::new(path));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return None;
    }
    Some(Path::new(url))
}

async fn read_file_range(path: &Path, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if end > size {
        return Err(RangeFetchError::OutOfBounds { start, end, size });
    }
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// A partial response must carry exactly `[start, end)`.
fn exact_range(body: Bytes, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
    let expected = end - start;
    let actual = body.len() as u64;
    if actual != expected {
        return Err(RangeFetchError::ShortRead { expected, actual });
    }
    Ok(body)
}

fn header_u64(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.parse().ok()
}

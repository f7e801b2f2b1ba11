use thiserror::Error;

/// Failure of a size probe or byte-range fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeFetchError {
    #[error("http error: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("server did not report a content length")]
    MissingLength,
    #[error("range {start}..{end} is outside of {size} bytes")]
    OutOfBounds { start: u64, end: u64, size: u64 },
    #[error("expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },
}

impl From<std::io::Error> for RangeFetchError {
    fn from(e: std::io::Error) -> Self {
        RangeFetchError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for RangeFetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => RangeFetchError::Status(status.as_u16()),
            None => RangeFetchError::Http(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DemuxError {
    #[error("no transport stream sync byte found")]
    NotTransportStream,
    #[error("no program map table found")]
    MissingProgramMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("file has neither a decodable video nor audio track")]
    NoTracks,
    #[error("video track has no keyframes")]
    NoKeyframes,
}

/// Terminal failure of the file-level metadata load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaLoadError {
    #[error("size probe failed: {0}")]
    Probe(RangeFetchError),
    #[error("header fetch failed: {0}")]
    Fetch(RangeFetchError),
    #[error("demux failed: {0}")]
    Demux(#[from] DemuxError),
    #[error("indexing failed: {0}")]
    Index(#[from] IndexError),
}

/// Failure to decode a single GOP. Other GOPs of the file stay usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("range fetch failed: {0}")]
    Fetch(#[from] RangeFetchError),
    #[error("decoder not found: {0}")]
    BackendNotFound(String),
    #[error("decoder failed: {0}")]
    Backend(String),
    #[error("decoder produced no frames")]
    NoFrames,
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Backend(e.to_string())
    }
}

/// Errors surfaced to consumers through `DecoderEvent::Error` and
/// `DecodeScheduler::open`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to load {url}: {source}")]
    MetaLoad { url: String, source: MetaLoadError },
    #[error("failed to decode gop {index}: {source}")]
    Decode { index: usize, source: DecodeError },
    #[error("decode context has shut down")]
    ContextClosed,
}

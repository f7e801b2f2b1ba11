//! Collaborators consumed by the cache: byte sources, demuxing and decoding.

mod ffmpeg;
mod frame;
mod http;
mod range_store;
mod ts;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DecodeError, DemuxError, RangeFetchError};

pub use ffmpeg::FfmpegCodec;
pub use frame::{AudioBuffer, FramePool, VideoFrame};
pub use http::HttpSource;
pub use range_store::PersistentRangeCache;
pub use ts::TsDemuxer;

pub type Micros = i64;

pub const MICROS_PER_MS: Micros = 1_000;
pub const MICROS_PER_SEC: Micros = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub kind: TrackKind,
    pub pid: u16,
    pub stream_type: u8,
    pub start: Micros,
    pub duration: Micros,
}

impl TrackInfo {
    pub fn end(&self) -> Micros {
        self.start + self.duration
    }
}

/// Position and timing of one access unit in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub timestamp: Micros,
    pub duration: Micros,
    pub sequence: u64,
    pub byte_offset: u64,
    pub is_keyframe: bool,
}

/// Everything the indexer needs from a demuxed file.
#[derive(Debug, Clone, Default)]
pub struct Demuxed {
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
    pub video_packets: Vec<PacketInfo>,
    pub audio_packets: Vec<PacketInfo>,
    /// Bytes that must precede any GOP slice for it to decode standalone.
    pub stream_header: Bytes,
}

impl Demuxed {
    pub fn duration(&self) -> Micros {
        let video = self.video.as_ref().map(TrackInfo::end).unwrap_or(0);
        let audio = self.audio.as_ref().map(TrackInfo::end).unwrap_or(0);
        video.max(audio)
    }
}

/// File-level metadata shared with every consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMeta {
    pub duration: Micros,
    pub file_size: u64,
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
    pub stream_header: Bytes,
}

/// Time span and byte range handed to the codec for one GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopSpan {
    pub timestamp: Micros,
    pub duration: Micros,
    pub audio_timestamp: Micros,
    pub audio_duration: Micros,
}

#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn probe_size(&self, url: &str) -> Result<u64, RangeFetchError>;

    /// Fetch `[start, end)`.
    async fn fetch_range(&self, url: &str, start: u64, end: u64)
        -> Result<Bytes, RangeFetchError>;
}

/// Incremental demuxer fed with consecutive chunks of the file.
pub trait Demuxer: Send {
    fn feed(&mut self, offset: u64, chunk: &[u8]);

    fn finish(self: Box<Self>) -> Result<Demuxed, DemuxError>;
}

pub trait Codec: Send + Sync {
    fn demuxer(&self) -> Box<dyn Demuxer>;

    fn decode_video(
        &self,
        track: &TrackInfo,
        span: &GopSpan,
        data: &[u8],
    ) -> Result<Vec<VideoFrame>, DecodeError>;

    fn decode_audio(
        &self,
        track: &TrackInfo,
        span: &GopSpan,
        data: &[u8],
    ) -> Result<AudioBuffer, DecodeError>;

    /// Whether audio of a single GOP can be decoded on its own. When false
    /// audio is extracted once per GOP and kept across video evictions.
    fn incremental_audio(&self) -> bool {
        true
    }
}

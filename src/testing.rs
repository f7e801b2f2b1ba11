//! In-memory collaborators for the context and scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::CacheConfig;
use crate::error::{DecodeError, DemuxError, RangeFetchError};
use crate::media::{
    AudioBuffer, ByteSource, Codec, Demuxed, Demuxer, FramePool, GopSpan, Micros, PacketInfo,
    TrackInfo, TrackKind, VideoFrame, MICROS_PER_MS,
};

pub(crate) fn test_config() -> CacheConfig {
    CacheConfig {
        decode_debounce_ms: 0,
        ..CacheConfig::default()
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}

/// Video-only file with a keyframe at each of `keyframes_ms`, 1000 bytes per keyframe.
pub(crate) fn keyframe_demux(keyframes_ms: &[i64], duration_ms: i64) -> Demuxed {
    let video_packets = keyframes_ms
        .iter()
        .enumerate()
        .map(|(i, ms)| PacketInfo {
            timestamp: ms * MICROS_PER_MS,
            duration: 40 * MICROS_PER_MS,
            sequence: i as u64,
            byte_offset: i as u64 * 1000,
            is_keyframe: true,
        })
        .collect();
    Demuxed {
        video: Some(TrackInfo {
            kind: TrackKind::Video,
            pid: 0x100,
            stream_type: 0x1B,
            start: 0,
            duration: duration_ms * MICROS_PER_MS,
        }),
        audio: None,
        video_packets,
        audio_packets: Vec::new(),
        stream_header: Bytes::from_static(&[0x47; 4]),
    }
}

/// Adds an audio track covering the same duration as the video.
pub(crate) fn with_audio(mut demuxed: Demuxed) -> Demuxed {
    let duration = demuxed.duration();
    demuxed.audio = Some(TrackInfo {
        kind: TrackKind::Audio,
        pid: 0x101,
        stream_type: 0x0F,
        start: 0,
        duration,
    });
    demuxed
}

#[derive(Clone, Default)]
pub(crate) struct FakeSource {
    files: Arc<Mutex<HashMap<String, u64>>>,
    probes: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: &str, size: u64) -> Self {
        self.add_file(url, size);
        self
    }

    pub fn add_file(&self, url: &str, size: u64) {
        self.files.lock().unwrap().insert(url.to_string(), size);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn size(&self, url: &str) -> Result<u64, RangeFetchError> {
        self.files
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .ok_or(RangeFetchError::Status(404))
    }
}

#[async_trait]
impl ByteSource for FakeSource {
    async fn probe_size(&self, url: &str) -> Result<u64, RangeFetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.size(url)
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, RangeFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let size = self.size(url)?;
        if start > end || end > size {
            return Err(RangeFetchError::OutOfBounds { start, end, size });
        }
        Ok(Bytes::from(vec![0u8; (end - start) as usize]))
    }
}

/// Blocks decoder threads until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct CodecCounters {
    video: AtomicUsize,
    audio: AtomicUsize,
    fed: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct FakeCodec {
    demuxed: Demuxed,
    frames_per_gop: usize,
    fail_at: Option<Micros>,
    incremental_audio: bool,
    gate: Option<Arc<Gate>>,
    pool: FramePool,
    counters: Arc<CodecCounters>,
}

impl FakeCodec {
    pub fn new(demuxed: Demuxed) -> Self {
        Self {
            demuxed,
            frames_per_gop: 4,
            fail_at: None,
            incremental_audio: true,
            gate: None,
            pool: FramePool::new(),
            counters: Arc::default(),
        }
    }

    /// Decodes block until [`FakeCodec::open_gate`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::default());
        self
    }

    /// The GOP starting at `ms` fails to decode.
    pub fn failing_at(mut self, ms: i64) -> Self {
        self.fail_at = Some(ms * MICROS_PER_MS);
        self
    }

    pub fn audio_once(mut self) -> Self {
        self.incremental_audio = false;
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.open();
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn frames_per_gop(&self) -> usize {
        self.frames_per_gop
    }

    pub fn decodes(&self) -> usize {
        self.counters.video.load(Ordering::SeqCst)
    }

    pub fn audio_decodes(&self) -> usize {
        self.counters.audio.load(Ordering::SeqCst)
    }

    pub fn fed_bytes(&self) -> u64 {
        self.counters.fed.load(Ordering::SeqCst)
    }
}

struct FakeDemuxer {
    demuxed: Demuxed,
    counters: Arc<CodecCounters>,
}

impl Demuxer for FakeDemuxer {
    fn feed(&mut self, _offset: u64, chunk: &[u8]) {
        self.counters.fed.fetch_add(chunk.len() as u64, Ordering::SeqCst);
    }

    fn finish(self: Box<Self>) -> Result<Demuxed, DemuxError> {
        Ok(self.demuxed)
    }
}

impl Codec for FakeCodec {
    fn demuxer(&self) -> Box<dyn Demuxer> {
        Box::new(FakeDemuxer {
            demuxed: self.demuxed.clone(),
            counters: Arc::clone(&self.counters),
        })
    }

    fn decode_video(
        &self,
        _track: &TrackInfo,
        span: &GopSpan,
        _data: &[u8],
    ) -> Result<Vec<VideoFrame>, DecodeError> {
        self.counters.video.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.fail_at == Some(span.timestamp) {
            return Err(DecodeError::Backend("corrupt GOP".into()));
        }
        let step = span.duration / self.frames_per_gop as i64;
        Ok((0..self.frames_per_gop)
            .map(|i| {
                let ts = span.timestamp + i as i64 * step;
                self.pool.frame(ts, step, 2, 2, self.pool.buffer(12))
            })
            .collect())
    }

    fn decode_audio(
        &self,
        _track: &TrackInfo,
        span: &GopSpan,
        _data: &[u8],
    ) -> Result<AudioBuffer, DecodeError> {
        self.counters.audio.fetch_add(1, Ordering::SeqCst);
        Ok(AudioBuffer {
            timestamp: span.audio_timestamp,
            duration: span.audio_duration,
            sample_rate: 48_000,
            channels: vec![vec![0.0; 16]; 2],
        })
    }

    fn incremental_audio(&self) -> bool {
        self.incremental_audio
    }
}

use crate::config::CacheConfig;
use crate::error::IndexError;
use crate::media::{Demuxed, GopSpan, Micros, PacketInfo, TrackInfo};

/// An independently decodable span of the file. Immutable once indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopDescriptor {
    pub index: usize,
    pub sequence: u64,
    pub timestamp: Micros,
    pub duration: Micros,
    pub audio_timestamp: Micros,
    pub audio_duration: Micros,
    pub byte_start: u64,
    pub byte_end: u64,
}

impl GopDescriptor {
    fn open(index: usize, sequence: u64, timestamp: Micros, byte_start: u64) -> Self {
        Self {
            index,
            sequence,
            timestamp,
            duration: 0,
            audio_timestamp: timestamp,
            audio_duration: 0,
            byte_start,
            byte_end: byte_start,
        }
    }

    pub fn end(&self) -> Micros {
        self.timestamp + self.duration
    }

    pub fn span(&self) -> GopSpan {
        GopSpan {
            timestamp: self.timestamp,
            duration: self.duration,
            audio_timestamp: self.audio_timestamp,
            audio_duration: self.audio_duration,
        }
    }

    /// Closes the span at the next GOP's start.
    fn finalize(&mut self, end: Micros, byte_end: u64) {
        self.duration = (end - self.timestamp).max(0);
        self.byte_end = byte_end.max(self.byte_start);
    }
}

/// Builds the GOP list of a demuxed file.
#[derive(Debug, Clone, Copy)]
pub struct GopIndexer {
    min_duration: Micros,
    audio_segment: Micros,
}

impl GopIndexer {
    pub fn new(min_duration: Micros, audio_segment: Micros) -> Self {
        Self {
            min_duration: min_duration.max(0),
            audio_segment: audio_segment.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.gop_min(), config.audio_segment())
    }

    pub fn index(&self, demuxed: &Demuxed, file_size: u64) -> Result<Vec<GopDescriptor>, IndexError> {
        let total = demuxed.duration();

        let mut gops = if demuxed.video.is_some() {
            let mut keyframes: Vec<PacketInfo> = demuxed
                .video_packets
                .iter()
                .filter(|p| p.is_keyframe)
                .copied()
                .collect();
            if keyframes.is_empty() {
                return Err(IndexError::NoKeyframes);
            }
            keyframes.sort_by_key(|p| p.timestamp);
            index_keyframes(&keyframes, total, file_size, self.min_duration)
        } else if demuxed.audio.is_some() {
            partition_audio(&demuxed.audio_packets, total, file_size, self.audio_segment)
        } else {
            return Err(IndexError::NoTracks);
        };

        if let Some(audio) = &demuxed.audio {
            assign_audio_spans(&mut gops, audio);
        }

        tracing::debug!(
            gops = gops.len(),
            duration_ms = total / 1000,
            audio_only = demuxed.video.is_none(),
            "indexed file"
        );
        Ok(gops)
    }
}

/// Opens a GOP per keyframe, merging keyframes that land within
/// `min_duration` of the open GOP's start into it. The first GOP always
/// starts at 0 and the last one runs to `total_duration`.
pub fn index_keyframes(
    keyframes: &[PacketInfo],
    total_duration: Micros,
    file_size: u64,
    min_duration: Micros,
) -> Vec<GopDescriptor> {
    let mut gops: Vec<GopDescriptor> = Vec::new();

    for keyframe in keyframes {
        let Some(open) = gops.last_mut() else {
            gops.push(GopDescriptor::open(0, keyframe.sequence, 0, 0));
            continue;
        };

        if keyframe.timestamp - open.timestamp <= min_duration {
            tracing::trace!(
                timestamp = keyframe.timestamp,
                gop = open.index,
                "keyframe merged into open GOP"
            );
            continue;
        }

        open.finalize(keyframe.timestamp, keyframe.byte_offset);
        let index = gops.len();
        gops.push(GopDescriptor::open(
            index,
            keyframe.sequence,
            keyframe.timestamp,
            keyframe.byte_offset,
        ));
    }

    if let Some(last) = gops.last_mut() {
        last.finalize(total_duration, file_size);
    }
    for gop in &mut gops {
        gop.audio_timestamp = gop.timestamp;
        gop.audio_duration = gop.duration;
    }
    gops
}

/// Fixed-length partition for files without video.
fn partition_audio(
    packets: &[PacketInfo],
    total_duration: Micros,
    file_size: u64,
    segment: Micros,
) -> Vec<GopDescriptor> {
    let mut gops: Vec<GopDescriptor> = Vec::new();
    let mut start = 0;

    while start < total_duration || gops.is_empty() {
        let pos = packets.partition_point(|p| p.timestamp < start);
        let (byte_start, sequence) = match packets.get(pos) {
            Some(p) => (p.byte_offset, p.sequence),
            None => (file_size, packets.len() as u64),
        };

        if let Some(prev) = gops.last_mut() {
            prev.finalize(start, byte_start);
        }
        let index = gops.len();
        let byte_start = if index == 0 { 0 } else { byte_start };
        gops.push(GopDescriptor::open(index, sequence, start, byte_start));
        start += segment;
    }

    if let Some(last) = gops.last_mut() {
        last.finalize(total_duration, file_size);
    }
    for gop in &mut gops {
        gop.audio_timestamp = gop.timestamp;
        gop.audio_duration = gop.duration;
    }
    gops
}

/// Audio follows the video spans except at the edges of the file, where the
/// audio track may start later or end later than the video.
fn assign_audio_spans(gops: &mut [GopDescriptor], audio: &TrackInfo) {
    if let Some(first) = gops.first_mut() {
        let end = first.audio_timestamp + first.audio_duration;
        first.audio_timestamp = audio.start.clamp(first.timestamp, end);
        first.audio_duration = end - first.audio_timestamp;
    }
    if let Some(last) = gops.last_mut() {
        let end = (last.audio_timestamp + last.audio_duration).max(audio.end());
        last.audio_duration = end - last.audio_timestamp;
    }
}

use bytes::Bytes;

use super::{Demuxed, Demuxer, Micros, PacketInfo, TrackInfo, TrackKind, MICROS_PER_SEC};
use crate::error::DemuxError;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PTS_CLOCK: i64 = 90_000;

const STREAM_MPEG1_VIDEO: u8 = 0x01;
const STREAM_MPEG2_VIDEO: u8 = 0x02;
const STREAM_MP3: u8 = 0x03;
const STREAM_MP2_AUDIO: u8 = 0x04;
const STREAM_AAC: u8 = 0x0F;
const STREAM_AAC_LATM: u8 = 0x11;
const STREAM_H264: u8 = 0x1B;
const STREAM_HEVC: u8 = 0x24;
const STREAM_AC3: u8 = 0x81;

/// Raw PES start as seen in the stream, before rebasing.
struct PesStart {
    pts: i64,
    byte_offset: u64,
    is_keyframe: bool,
}

struct ElementaryStream {
    pid: u16,
    stream_type: u8,
    starts: Vec<PesStart>,
}

impl ElementaryStream {
    fn new(pid: u16, stream_type: u8) -> Self {
        Self {
            pid,
            stream_type,
            starts: Vec::new(),
        }
    }
}

/// Streaming MPEG-TS demuxer that records where every PES of the primary
/// video and audio streams begins.
pub struct TsDemuxer {
    carry: Vec<u8>,
    carry_offset: u64,
    packets_seen: u64,
    pmt_pid: Option<u16>,
    video: Option<ElementaryStream>,
    audio: Option<ElementaryStream>,
    pat_packet: Option<Vec<u8>>,
    pmt_packet: Option<Vec<u8>>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            carry: Vec::new(),
            carry_offset: 0,
            packets_seen: 0,
            pmt_pid: None,
            video: None,
            audio: None,
            pat_packet: None,
            pmt_packet: None,
        }
    }

    fn parse_packet(&mut self, packet: &[u8], byte_offset: u64) {
        self.packets_seen += 1;

        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let payload_start = (packet[1] & 0x40) != 0;
        let has_adaptation = (packet[3] & 0x20) != 0;
        let has_payload = (packet[3] & 0x10) != 0;

        let mut payload_offset = 4;
        let mut random_access = false;

        if has_adaptation {
            let adaptation_len = packet[4] as usize;
            if adaptation_len > 0 && adaptation_len < 184 {
                // random_access_indicator
                random_access = (packet[5] & 0x40) != 0;
            }
            payload_offset = 5 + adaptation_len;
        }

        if !has_payload || payload_offset >= TS_PACKET_SIZE {
            return;
        }

        let payload = &packet[payload_offset..];

        if pid == 0 {
            if payload_start && self.pmt_pid.is_none() {
                self.parse_pat(payload);
                self.pat_packet = Some(packet.to_vec());
            }
            return;
        }

        if Some(pid) == self.pmt_pid {
            if payload_start && self.pmt_packet.is_none() {
                self.parse_pmt(payload);
                self.pmt_packet = Some(packet.to_vec());
            }
            return;
        }

        if !payload_start {
            return;
        }

        for stream in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if stream.pid != pid {
                continue;
            }
            let Some((pts, es_start)) = parse_pes_header(payload) else {
                return;
            };
            let es = payload.get(es_start..).unwrap_or(&[]);
            let is_keyframe = match stream.stream_type {
                STREAM_H264 => random_access || contains_h264_idr(es),
                STREAM_HEVC => random_access || contains_hevc_irap(es),
                STREAM_MPEG1_VIDEO | STREAM_MPEG2_VIDEO => random_access,
                // every audio frame is independently decodable
                _ => true,
            };
            stream.starts.push(PesStart {
                pts,
                byte_offset,
                is_keyframe,
            });
            return;
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(table) = section(payload) else {
            return;
        };
        if table.first() != Some(&0x00) || table.len() < 8 {
            return;
        }

        let section_len = section_length(table);
        let end = (3 + section_len).saturating_sub(4).min(table.len());
        let mut pos = 8;
        while pos + 4 <= end {
            let program = ((table[pos] as u16) << 8) | table[pos + 1] as u16;
            let pid = ((table[pos + 2] as u16 & 0x1F) << 8) | table[pos + 3] as u16;
            // program 0 is the network information table
            if program != 0 {
                tracing::trace!(pmt_pid = pid, "found PMT PID in PAT");
                self.pmt_pid = Some(pid);
                return;
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some(table) = section(payload) else {
            return;
        };
        if table.first() != Some(&0x02) || table.len() < 12 {
            return;
        }

        let section_len = section_length(table);
        let end = (3 + section_len).saturating_sub(4).min(table.len());
        let program_info_len = ((table[10] as usize & 0x0F) << 8) | table[11] as usize;

        let mut pos = 12 + program_info_len;
        while pos + 5 <= end {
            let stream_type = table[pos];
            let elem_pid = ((table[pos + 1] as u16 & 0x1F) << 8) | table[pos + 2] as u16;
            let es_info_len = ((table[pos + 3] as usize & 0x0F) << 8) | table[pos + 4] as usize;

            match stream_type {
                STREAM_MPEG1_VIDEO | STREAM_MPEG2_VIDEO | STREAM_H264 | STREAM_HEVC
                    if self.video.is_none() =>
                {
                    tracing::debug!(video_pid = elem_pid, stream_type, "detected video PID");
                    self.video = Some(ElementaryStream::new(elem_pid, stream_type));
                }
                STREAM_MP3 | STREAM_MP2_AUDIO | STREAM_AAC | STREAM_AAC_LATM | STREAM_AC3
                    if self.audio.is_none() =>
                {
                    tracing::debug!(audio_pid = elem_pid, stream_type, "detected audio PID");
                    self.audio = Some(ElementaryStream::new(elem_pid, stream_type));
                }
                _ => {}
            }

            pos += 5 + es_info_len;
        }
    }
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer for TsDemuxer {
    fn feed(&mut self, offset: u64, chunk: &[u8]) {
        if self.carry.is_empty() || self.carry_offset + self.carry.len() as u64 != offset {
            self.carry.clear();
            self.carry_offset = offset;
        }
        self.carry.extend_from_slice(chunk);

        let data = std::mem::take(&mut self.carry);
        let mut pos = 0;
        while pos + TS_PACKET_SIZE <= data.len() {
            if data[pos] != SYNC_BYTE {
                // lost sync, scan forward
                pos += 1;
                continue;
            }
            self.parse_packet(&data[pos..pos + TS_PACKET_SIZE], self.carry_offset + pos as u64);
            pos += TS_PACKET_SIZE;
        }

        self.carry = data[pos..].to_vec();
        self.carry_offset += pos as u64;
    }

    fn finish(self: Box<Self>) -> Result<Demuxed, DemuxError> {
        if self.packets_seen == 0 {
            return Err(DemuxError::NotTransportStream);
        }
        if self.video.is_none() && self.audio.is_none() && self.pmt_packet.is_none() {
            return Err(DemuxError::MissingProgramMap);
        }

        let base = [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|s| s.starts.iter().map(|p| p.pts).min())
            .min()
            .unwrap_or(0);

        let (video, video_packets) = build_track(self.video, TrackKind::Video, base);
        let (audio, audio_packets) = build_track(self.audio, TrackKind::Audio, base);

        let mut header = Vec::with_capacity(2 * TS_PACKET_SIZE);
        if let Some(pat) = self.pat_packet {
            header.extend_from_slice(&pat);
        }
        if let Some(pmt) = self.pmt_packet {
            header.extend_from_slice(&pmt);
        }

        Ok(Demuxed {
            video,
            audio,
            video_packets,
            audio_packets,
            stream_header: Bytes::from(header),
        })
    }
}

fn build_track(
    stream: Option<ElementaryStream>,
    kind: TrackKind,
    base: i64,
) -> (Option<TrackInfo>, Vec<PacketInfo>) {
    let Some(stream) = stream else {
        return (None, Vec::new());
    };
    if stream.starts.is_empty() {
        return (None, Vec::new());
    }

    let frame_duration = typical_frame_duration(&stream.starts);
    let packets: Vec<PacketInfo> = stream
        .starts
        .iter()
        .enumerate()
        .map(|(sequence, start)| PacketInfo {
            timestamp: pts_to_micros(start.pts - base),
            duration: frame_duration,
            sequence: sequence as u64,
            byte_offset: start.byte_offset,
            is_keyframe: start.is_keyframe,
        })
        .collect();

    let first = packets.iter().map(|p| p.timestamp).min().unwrap_or(0);
    let last = packets.iter().map(|p| p.timestamp).max().unwrap_or(0);

    let track = TrackInfo {
        kind,
        pid: stream.pid,
        stream_type: stream.stream_type,
        start: first,
        duration: last - first + frame_duration,
    };
    (Some(track), packets)
}

/// Median of the positive presentation deltas, robust against B-frame reordering.
fn typical_frame_duration(starts: &[PesStart]) -> Micros {
    let mut pts: Vec<i64> = starts.iter().map(|s| s.pts).collect();
    pts.sort_unstable();
    let mut deltas: Vec<i64> = pts.windows(2).map(|w| w[1] - w[0]).filter(|d| *d > 0).collect();
    if deltas.is_empty() {
        return 0;
    }
    let mid = deltas.len() / 2;
    let (_, median, _) = deltas.select_nth_unstable(mid);
    pts_to_micros(*median)
}

fn pts_to_micros(pts: i64) -> Micros {
    pts * MICROS_PER_SEC / PTS_CLOCK
}

fn section(payload: &[u8]) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    payload.get(1 + pointer..)
}

fn section_length(table: &[u8]) -> usize {
    ((table[1] as usize & 0x0F) << 8) | table[2] as usize
}

/// Returns the PTS and the offset of the elementary stream data.
fn parse_pes_header(payload: &[u8]) -> Option<(i64, usize)> {
    if payload.len() < 9 || payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
        return None;
    }
    let pts_dts_flags = (payload[7] >> 6) & 0x03;
    let header_len = payload[8] as usize;
    if pts_dts_flags < 2 || payload.len() < 14 {
        return None;
    }
    Some((parse_pts(&payload[9..14]), 9 + header_len))
}

fn parse_pts(data: &[u8]) -> i64 {
    (((data[0] as i64 >> 1) & 0x07) << 30)
        | ((data[1] as i64) << 22)
        | (((data[2] as i64 >> 1) & 0x7F) << 15)
        | ((data[3] as i64) << 7)
        | ((data[4] as i64 >> 1) & 0x7F)
}

fn nal_headers(es: &[u8]) -> impl Iterator<Item = u8> + '_ {
    es.windows(4)
        .filter(|w| w[0] == 0x00 && w[1] == 0x00 && w[2] == 0x01)
        .map(|w| w[3])
}

/// IDR slice (5) or SPS (7).
fn contains_h264_idr(es: &[u8]) -> bool {
    nal_headers(es).any(|b| matches!(b & 0x1F, 5 | 7))
}

/// IRAP slices (16..=21) or VPS (32).
fn contains_hevc_irap(es: &[u8]) -> bool {
    nal_headers(es).any(|b| matches!((b >> 1) & 0x3F, 16..=21 | 32))
}

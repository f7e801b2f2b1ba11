use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use super::{
    AudioBuffer, Codec, Demuxer, FramePool, GopSpan, TrackInfo, TsDemuxer, VideoFrame,
};
use crate::config::DecoderConfig;
use crate::error::DecodeError;

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: usize = 2;
const BYTES_PER_PIXEL: usize = 3;

/// Decodes MPEG-TS GOP slices by piping them through an `ffmpeg` child process.
pub struct FfmpegCodec {
    binary: String,
    width: u32,
    height: u32,
    pool: FramePool,
}

impl FfmpegCodec {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            binary: config.ffmpeg.clone(),
            width: config.width,
            height: config.height,
            pool: FramePool::new(),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Feed `input` to ffmpeg and hand its stdout to `read`.
    fn run<T>(
        &self,
        args: &[&str],
        input: &[u8],
        read: impl FnOnce(&mut dyn Read) -> std::io::Result<T>,
    ) -> Result<T, DecodeError> {
        let mut child = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-f", "mpegts", "-i", "pipe:0"])
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DecodeError::BackendNotFound(self.binary.clone())
                } else {
                    DecodeError::Backend(e.to_string())
                }
            })?;

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DecodeError::Backend("failed to capture ffmpeg pipes".to_string()));
        };

        // Writer thread so a full stdout pipe can never stall stdin.
        let data = input.to_vec();
        let writer = thread::spawn(move || {
            let _ = stdin.write_all(&data);
            // stdin dropped here so ffmpeg sees EOF
        });
        let diagnostics = thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let output = read(&mut stdout);
        if output.is_err() {
            // Unblock the writer if ffmpeg stopped consuming input.
            let _ = child.kill();
        }

        let _ = writer.join();
        let status = child.wait()?;
        let diagnostics = diagnostics.join().unwrap_or_default();

        let output = output?;
        if !status.success() {
            return Err(DecodeError::Backend(format!(
                "ffmpeg exited with {}: {}",
                status,
                diagnostics.trim()
            )));
        }
        Ok(output)
    }
}

impl Codec for FfmpegCodec {
    fn demuxer(&self) -> Box<dyn Demuxer> {
        Box::new(TsDemuxer::new())
    }

    fn decode_video(
        &self,
        _track: &TrackInfo,
        span: &GopSpan,
        data: &[u8],
    ) -> Result<Vec<VideoFrame>, DecodeError> {
        let scale = format!("scale={}:{}", self.width, self.height);
        let frame_size = self.frame_size();
        let pool = self.pool.clone();

        let buffers = self.run(
            &["-an", "-vf", &scale, "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"],
            data,
            |stdout| {
                let mut buffers = Vec::new();
                loop {
                    let mut buf = pool.buffer(frame_size);
                    match stdout.read_exact(&mut buf) {
                        Ok(()) => buffers.push(buf),
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(buffers)
            },
        )?;

        if buffers.is_empty() {
            return Err(DecodeError::NoFrames);
        }

        let count = buffers.len() as i64;
        let frame_duration = span.duration / count;
        let frames = buffers
            .into_iter()
            .enumerate()
            .map(|(i, buf)| {
                let timestamp = span.timestamp + span.duration * i as i64 / count;
                self.pool
                    .frame(timestamp, frame_duration, self.width, self.height, buf)
            })
            .collect::<Vec<_>>();

        tracing::trace!(
            frames = frames.len(),
            timestamp = span.timestamp,
            bytes = data.len(),
            "decoded video span"
        );
        Ok(frames)
    }

    fn decode_audio(
        &self,
        _track: &TrackInfo,
        span: &GopSpan,
        data: &[u8],
    ) -> Result<AudioBuffer, DecodeError> {
        let rate = AUDIO_SAMPLE_RATE.to_string();
        let channels = AUDIO_CHANNELS.to_string();

        let raw = self.run(
            &["-vn", "-f", "f32le", "-ac", &channels, "-ar", &rate, "pipe:1"],
            data,
            |stdout| {
                let mut raw = Vec::new();
                stdout.read_to_end(&mut raw)?;
                Ok(raw)
            },
        )?;

        let samples: Vec<f32> = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(AudioBuffer::from_interleaved(
            span.audio_timestamp,
            span.audio_duration,
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            &samples,
        ))
    }
}

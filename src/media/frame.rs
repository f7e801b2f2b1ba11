use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::Micros;

const DEFAULT_MAX_FREE: usize = 64;

/// Recycles decoded frame buffers and keeps exact count of the ones in use.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_free: usize,
    outstanding: AtomicUsize,
    released: AtomicUsize,
}

impl FramePool {
    pub fn new() -> Self {
        Self::with_max_free(DEFAULT_MAX_FREE)
    }

    pub fn with_max_free(max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                max_free,
                outstanding: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a zeroed buffer of `size` bytes, reusing a released one if possible.
    pub fn buffer(&self, size: usize) -> Vec<u8> {
        let recycled = self.inner.free.lock().ok().and_then(|mut free| free.pop());
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(size, 0);
                buf
            }
            None => vec![0u8; size],
        }
    }

    /// Wrap a buffer into a frame whose release returns the buffer here.
    pub fn frame(
        &self,
        timestamp: Micros,
        duration: Micros,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> VideoFrame {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        VideoFrame {
            timestamp,
            duration,
            width,
            height,
            data,
            pool: Some(self.clone()),
        }
    }

    /// Frames handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Total number of releases seen by this pool.
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    fn recycle(&self, buf: Vec<u8>) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.inner.released.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut free) = self.inner.free.lock() {
            if free.len() < self.inner.max_free {
                free.push(buf);
            }
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded picture. The backing buffer goes back to its pool exactly once,
/// either through [`VideoFrame::release`] or when the frame is dropped.
pub struct VideoFrame {
    pub timestamp: Micros,
    pub duration: Micros,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
    pool: Option<FramePool>,
}

impl VideoFrame {
    /// A frame not backed by any pool.
    pub fn unpooled(
        timestamp: Micros,
        duration: Micros,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            timestamp,
            duration,
            width,
            height,
            data,
            pool: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn end(&self) -> Micros {
        self.timestamp + self.duration
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Decoded audio covering a GOP's audio span, one sample vector per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub timestamp: Micros,
    pub duration: Micros,
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Split interleaved samples into per-channel buffers.
    pub fn from_interleaved(
        timestamp: Micros,
        duration: Micros,
        sample_rate: u32,
        channel_count: usize,
        samples: &[f32],
    ) -> Self {
        let channel_count = channel_count.max(1);
        let frames = samples.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in samples.chunks_exact(channel_count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
        Self {
            timestamp,
            duration,
            sample_rate,
            channels,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }
}

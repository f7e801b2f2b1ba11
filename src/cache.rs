//! Per-source cache of the GOP index and decode state, shared by every
//! scheduler viewing the same URL.
//!
//! Only the execution context writes to a [`SharedMediaCache`]; schedulers
//! get a [`CacheHandle`] and read through it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::context::{MessageId, MetaReply};
use crate::error::{CacheError, DecodeError};
use crate::gop::{
    frame_at_time, Acquire, Completion, ConsumerId, DecodeState, DecodedGop, GopDecodeState,
    GopDescriptor, Release,
};
use crate::media::{AudioBuffer, GopSpan, MediaMeta, Micros, TrackInfo, VideoFrame};
use crate::scheduler::DecoderEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    None,
    LoadingMeta,
    Meta,
    Error,
}

pub(crate) struct ConsumerSlot {
    events: mpsc::UnboundedSender<DecoderEvent>,
    active_gop: Option<usize>,
}

pub(crate) struct MetaWaiter {
    pub message_id: MessageId,
    pub reply: oneshot::Sender<Result<MetaReply, CacheError>>,
}

/// Inputs of one GOP decode, detached from the cache lock.
pub(crate) struct DecodeJob {
    pub descriptor: GopDescriptor,
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
    pub stream_header: Bytes,
    /// GOP bytes when the whole file is held in memory.
    pub preloaded: Option<Bytes>,
}

impl DecodeJob {
    pub fn span(&self) -> GopSpan {
        self.descriptor.span()
    }
}

pub struct SharedMediaCache {
    url: Arc<str>,
    epoch: u64,
    state: CacheState,
    meta: Option<Arc<MediaMeta>>,
    gop_list: Arc<[GopDescriptor]>,
    gops: Vec<GopDecodeState>,
    error: Option<CacheError>,
    preload: Option<Bytes>,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
    waiters: Vec<MetaWaiter>,
    audio_store: HashMap<usize, Arc<AudioBuffer>>,
}

impl SharedMediaCache {
    pub(crate) fn new(url: Arc<str>, epoch: u64) -> Self {
        Self {
            url,
            epoch,
            state: CacheState::None,
            meta: None,
            gop_list: Arc::from(Vec::new()),
            gops: Vec::new(),
            error: None,
            preload: None,
            consumers: HashMap::new(),
            waiters: Vec::new(),
            audio_store: HashMap::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn meta(&self) -> Option<&Arc<MediaMeta>> {
        self.meta.as_ref()
    }

    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_ref()
    }

    pub fn gop_list(&self) -> &Arc<[GopDescriptor]> {
        &self.gop_list
    }

    pub fn gop(&self, index: usize) -> Option<&GopDecodeState> {
        self.gops.get(index)
    }

    /// Number of registered consumers; the entry is destroyed when it hits zero.
    pub fn ref_count(&self) -> usize {
        self.consumers.len()
    }

    /// GOPs currently holding decoded frames.
    pub fn decoded_count(&self) -> usize {
        self.gops
            .iter()
            .filter(|g| g.state() == DecodeState::Decoded)
            .count()
    }

    pub(crate) fn attach(&mut self, consumer: ConsumerId, events: mpsc::UnboundedSender<DecoderEvent>) {
        self.consumers.insert(
            consumer,
            ConsumerSlot {
                events,
                active_gop: None,
            },
        );
    }

    /// Drop every reference `consumer` holds. Returns the number of frames released.
    pub(crate) fn detach(&mut self, consumer: ConsumerId) -> usize {
        self.consumers.remove(&consumer);
        self.gops
            .iter_mut()
            .map(|gop| match gop.release(consumer) {
                Release::Evicted { frames } => frames,
                _ => 0,
            })
            .sum()
    }

    pub(crate) fn begin_meta(&mut self) {
        self.state = CacheState::LoadingMeta;
    }

    pub(crate) fn push_waiter(&mut self, waiter: MetaWaiter) {
        self.waiters.push(waiter);
    }

    /// Switch to `Meta` and return the waiters to answer.
    pub(crate) fn install_meta(
        &mut self,
        meta: MediaMeta,
        gops: Vec<GopDescriptor>,
        preload: Option<Bytes>,
    ) -> Vec<MetaWaiter> {
        let meta = Arc::new(meta);
        self.gops = gops.iter().copied().map(GopDecodeState::new).collect();
        self.gop_list = Arc::from(gops);
        self.meta = Some(Arc::clone(&meta));
        self.preload = preload;
        self.state = CacheState::Meta;

        for slot in self.consumers.values() {
            let _ = slot.events.send(DecoderEvent::Meta(Arc::clone(&meta)));
        }
        std::mem::take(&mut self.waiters)
    }

    /// Switch to the terminal `Error` state and return the waiters to answer.
    pub(crate) fn fail_meta(&mut self, error: CacheError) -> Vec<MetaWaiter> {
        self.state = CacheState::Error;
        for slot in self.consumers.values() {
            let _ = slot.events.send(DecoderEvent::Error(error.clone()));
        }
        self.error = Some(error);
        std::mem::take(&mut self.waiters)
    }

    /// Send the current meta outcome to one consumer that arrived late.
    pub(crate) fn replay_meta(&self, consumer: ConsumerId) {
        let event = match (&self.meta, &self.error) {
            (Some(meta), _) => DecoderEvent::Meta(Arc::clone(meta)),
            (None, Some(error)) => DecoderEvent::Error(error.clone()),
            (None, None) => return,
        };
        self.notify(consumer, event);
    }

    pub(crate) fn acquire(&mut self, consumer: ConsumerId, index: usize, active: usize) -> Option<Acquire> {
        if let Some(slot) = self.consumers.get_mut(&consumer) {
            slot.active_gop = Some(active);
        }
        let outcome = self.gops.get_mut(index)?.acquire(consumer);
        match outcome {
            Acquire::Ready => self.notify(consumer, DecoderEvent::CanPlay(index)),
            Acquire::Failed => {
                let source = self.gops[index]
                    .error()
                    .cloned()
                    .unwrap_or(DecodeError::NoFrames);
                self.notify(consumer, DecoderEvent::Error(CacheError::Decode { index, source }));
            }
            Acquire::Start { .. } | Acquire::Joined => {}
        }
        Some(outcome)
    }

    pub(crate) fn set_active(&mut self, consumer: ConsumerId, active: Option<usize>) {
        if let Some(slot) = self.consumers.get_mut(&consumer) {
            slot.active_gop = active;
        }
    }

    pub(crate) fn release(&mut self, consumer: ConsumerId, index: usize) -> Option<Release> {
        Some(self.gops.get_mut(index)?.release(consumer))
    }

    pub(crate) fn should_start(&self, index: usize, generation: u64) -> bool {
        self.gops
            .get(index)
            .is_some_and(|gop| gop.should_start(generation))
    }

    /// Build the decode inputs for `index`. `want_audio` is false when muted;
    /// audio already extracted once is not decoded again.
    pub(crate) fn decode_job(&self, index: usize, want_audio: bool) -> Option<DecodeJob> {
        let gop = self.gops.get(index)?;
        let meta = self.meta.as_ref()?;
        let descriptor = *gop.descriptor();

        let audio = meta
            .audio
            .clone()
            .filter(|_| want_audio && !self.audio_store.contains_key(&index));

        let preloaded = self.preload.as_ref().map(|bytes| {
            let len = bytes.len() as u64;
            let start = descriptor.byte_start.min(len) as usize;
            let end = descriptor.byte_end.min(len) as usize;
            bytes.slice(start..end.max(start))
        });

        Some(DecodeJob {
            descriptor,
            video: meta.video.clone(),
            audio,
            stream_header: meta.stream_header.clone(),
            preloaded,
        })
    }

    /// Install or discard a decode result. With `keep_audio` the audio buffer
    /// outlives video eviction so it is extracted only once per GOP.
    pub(crate) fn complete(
        &mut self,
        index: usize,
        generation: u64,
        mut decoded: DecodedGop,
        keep_audio: bool,
    ) -> Option<Completion> {
        if decoded.audio.is_none() {
            decoded.audio = self.audio_store.get(&index).cloned();
        } else if keep_audio {
            if let Some(audio) = &decoded.audio {
                self.audio_store.insert(index, Arc::clone(audio));
            }
        }

        let gop = self.gops.get_mut(index)?;
        let completion = gop.complete(generation, decoded);
        if completion != Completion::Installed {
            return Some(completion);
        }

        let has_audio = gop.audio().is_some();
        let users: Vec<ConsumerId> = gop.users().iter().copied().collect();
        for consumer in users {
            self.notify(consumer, DecoderEvent::CanPlay(index));
        }
        if has_audio {
            // consumers still playing earlier GOPs can mix this audio ahead of time
            for slot in self.consumers.values() {
                if slot.active_gop.is_some_and(|active| active < index) {
                    let _ = slot.events.send(DecoderEvent::AudioBuffer(index));
                }
            }
        }
        Some(completion)
    }

    /// Record a failed decode and notify the consumers that were waiting for it.
    pub(crate) fn fail(&mut self, index: usize, generation: u64, source: DecodeError) -> bool {
        let Some(gop) = self.gops.get_mut(index) else {
            return false;
        };
        let Some(users) = gop.fail(generation, source.clone()) else {
            return false;
        };
        for consumer in users {
            self.notify(
                consumer,
                DecoderEvent::Error(CacheError::Decode {
                    index,
                    source: source.clone(),
                }),
            );
        }
        true
    }

    /// Release every payload. Returns the number of frames released.
    pub(crate) fn teardown(&mut self) -> usize {
        self.preload = None;
        self.audio_store.clear();
        self.consumers.clear();
        self.gops.iter_mut().map(GopDecodeState::teardown).sum()
    }

    fn notify(&self, consumer: ConsumerId, event: DecoderEvent) {
        if let Some(slot) = self.consumers.get(&consumer) {
            let _ = slot.events.send(event);
        }
    }
}

/// Shared, read-mostly view of a [`SharedMediaCache`].
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<RwLock<SharedMediaCache>>,
}

impl CacheHandle {
    pub(crate) fn new(cache: SharedMediaCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SharedMediaCache> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SharedMediaCache> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CacheState {
        self.read().state()
    }

    pub fn gop_state(&self, index: usize) -> Option<DecodeState> {
        self.read().gop(index).map(GopDecodeState::state)
    }

    /// Run `f` on the frame of GOP `index` shown at time `t`, if decoded.
    /// The frame never leaves the cache.
    pub fn with_frame<R>(&self, index: usize, t: Micros, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        let cache = self.read();
        let gop = cache.gop(index)?;
        if gop.state() != DecodeState::Decoded {
            return None;
        }
        let frame = frame_at_time(gop.frames(), t)?;
        Some(f(&gop.frames()[frame]))
    }

    pub fn audio(&self, index: usize) -> Option<Arc<AudioBuffer>> {
        let cache = self.read();
        let gop = cache.gop(index)?;
        if gop.state() != DecodeState::Decoded {
            return None;
        }
        gop.audio().cloned()
    }

    #[cfg(test)]
    pub(crate) fn same_entry(&self, other: &CacheHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

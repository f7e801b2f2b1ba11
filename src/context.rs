//! Serialized execution context. One task owns the `url -> cache` registry
//! and applies every state mutation in arrival order; schedulers talk to it
//! over an unbounded channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::cache::{CacheHandle, CacheState, DecodeJob, MetaWaiter, SharedMediaCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, DecodeError, MetaLoadError};
use crate::gop::{Acquire, Completion, ConsumerId, DecodedGop, GopDescriptor, GopIndexer, Release};
use crate::media::{ByteSource, Codec, MediaMeta};
use crate::scheduler::DecoderEvent;

pub type MessageId = u64;

/// Answer to a `Meta` request.
#[derive(Clone)]
pub struct MetaReply {
    pub message_id: MessageId,
    pub meta: Arc<MediaMeta>,
    pub gops: Arc<[GopDescriptor]>,
    pub cache: CacheHandle,
}

/// Counters reported by [`DecodeContext::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub sources: usize,
    pub consumers: usize,
    pub decoded_gops: usize,
    pub decodes_started: u64,
    pub decodes_dropped: u64,
    pub decodes_discarded: u64,
}

pub(crate) struct Envelope {
    url: Arc<str>,
    consumer: ConsumerId,
    message_id: MessageId,
    request: Request,
}

pub(crate) enum Request {
    Meta {
        events: mpsc::UnboundedSender<DecoderEvent>,
        reply: oneshot::Sender<Result<MetaReply, CacheError>>,
    },
    Decode {
        index: usize,
        active: usize,
    },
    Release {
        index: usize,
    },
    /// Cursor moved to another GOP, or out of range when `None`.
    Active {
        active: Option<usize>,
    },
    Detach,
}

enum Message {
    Request(Envelope),
    Stats(oneshot::Sender<ContextStats>),
    MetaLoaded {
        url: Arc<str>,
        epoch: u64,
        result: Result<LoadedMeta, MetaLoadError>,
    },
    DebounceElapsed {
        url: Arc<str>,
        epoch: u64,
        index: usize,
        generation: u64,
    },
    DecodeFinished {
        url: Arc<str>,
        epoch: u64,
        index: usize,
        generation: u64,
        result: Result<DecodedGop, DecodeError>,
    },
}

struct LoadedMeta {
    meta: MediaMeta,
    gops: Vec<GopDescriptor>,
    preload: Option<Bytes>,
}

/// Cloneable handle to the execution context.
#[derive(Clone)]
pub struct DecodeContext {
    tx: mpsc::UnboundedSender<Message>,
    ids: Arc<Ids>,
    config: Arc<CacheConfig>,
}

#[derive(Default)]
struct Ids {
    message: AtomicU64,
    consumer: AtomicU64,
}

impl DecodeContext {
    /// Spawn the context on the current tokio runtime.
    pub fn spawn(source: Arc<dyn ByteSource>, codec: Arc<dyn Codec>, config: CacheConfig) -> Self {
        let (handle, worker) = Self::build(source, codec, config);
        tokio::spawn(worker.run());
        handle
    }

    /// Spawn the context on its own thread with a current-thread runtime.
    pub fn spawn_dedicated(
        source: Arc<dyn ByteSource>,
        codec: Arc<dyn Codec>,
        config: CacheConfig,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (handle, worker) = Self::build(source, codec, config);
        std::thread::Builder::new()
            .name("gop-decode".into())
            .spawn(move || runtime.block_on(worker.run()))?;
        Ok(handle)
    }

    fn build(
        source: Arc<dyn ByteSource>,
        codec: Arc<dyn Codec>,
        config: CacheConfig,
    ) -> (Self, ContextWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let worker = ContextWorker {
            source,
            codec,
            config: Arc::clone(&config),
            registry: HashMap::new(),
            next_epoch: 0,
            stats: ContextStats::default(),
            tx: tx.downgrade(),
            rx,
        };
        let handle = Self {
            tx,
            ids: Arc::new(Ids::default()),
            config,
        };
        (handle, worker)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn next_consumer(&self) -> ConsumerId {
        self.ids.consumer.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, url: &Arc<str>, consumer: ConsumerId, request: Request) -> Result<MessageId, CacheError> {
        let message_id = self.ids.message.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx
            .send(Message::Request(Envelope {
                url: Arc::clone(url),
                consumer,
                message_id,
                request,
            }))
            .map_err(|_| CacheError::ContextClosed)?;
        Ok(message_id)
    }

    /// Register `consumer` for `url` and wait for the file metadata.
    pub(crate) async fn meta(
        &self,
        url: &Arc<str>,
        consumer: ConsumerId,
        events: mpsc::UnboundedSender<DecoderEvent>,
    ) -> Result<MetaReply, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.send(url, consumer, Request::Meta { events, reply })?;
        rx.await.map_err(|_| CacheError::ContextClosed)?
    }

    pub(crate) fn decode(&self, url: &Arc<str>, consumer: ConsumerId, index: usize, active: usize) -> bool {
        self.send(url, consumer, Request::Decode { index, active }).is_ok()
    }

    pub(crate) fn release(&self, url: &Arc<str>, consumer: ConsumerId, index: usize) -> bool {
        self.send(url, consumer, Request::Release { index }).is_ok()
    }

    pub(crate) fn set_active(&self, url: &Arc<str>, consumer: ConsumerId, active: Option<usize>) -> bool {
        self.send(url, consumer, Request::Active { active }).is_ok()
    }

    pub(crate) fn detach(&self, url: &Arc<str>, consumer: ConsumerId) {
        let _ = self.send(url, consumer, Request::Detach);
    }

    pub async fn stats(&self) -> Result<ContextStats, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Stats(reply))
            .map_err(|_| CacheError::ContextClosed)?;
        rx.await.map_err(|_| CacheError::ContextClosed)
    }
}

struct ContextWorker {
    source: Arc<dyn ByteSource>,
    codec: Arc<dyn Codec>,
    config: Arc<CacheConfig>,
    registry: HashMap<Arc<str>, CacheHandle>,
    next_epoch: u64,
    stats: ContextStats,
    tx: mpsc::WeakUnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ContextWorker {
    async fn run(mut self) {
        tracing::debug!("decode context started");
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Request(envelope) => self.handle_request(envelope),
                Message::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Message::MetaLoaded { url, epoch, result } => self.on_meta_loaded(url, epoch, result),
                Message::DebounceElapsed {
                    url,
                    epoch,
                    index,
                    generation,
                } => self.on_debounce_elapsed(url, epoch, index, generation),
                Message::DecodeFinished {
                    url,
                    epoch,
                    index,
                    generation,
                    result,
                } => self.on_decode_finished(&url, epoch, index, generation, result),
            }
        }
        let frames: usize = self
            .registry
            .drain()
            .map(|(_, handle)| handle.write().teardown())
            .sum();
        tracing::debug!(frames, "decode context stopped");
    }

    fn snapshot(&self) -> ContextStats {
        let mut stats = self.stats;
        stats.sources = self.registry.len();
        for handle in self.registry.values() {
            let cache = handle.read();
            stats.consumers += cache.ref_count();
            stats.decoded_gops += cache.decoded_count();
        }
        stats
    }

    /// Entry for `url`, but only if it is the same entry that `epoch` refers to.
    fn entry(&self, url: &str, epoch: u64) -> Option<&CacheHandle> {
        self.registry
            .get(url)
            .filter(|handle| handle.read().epoch() == epoch)
    }

    fn post(&self, message: Message) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(message);
        }
    }

    fn handle_request(&mut self, envelope: Envelope) {
        let Envelope {
            url,
            consumer,
            message_id,
            request,
        } = envelope;

        match request {
            Request::Meta { events, reply } => self.on_meta(url, consumer, message_id, events, reply),
            Request::Decode { index, active } => {
                let Some(handle) = self.registry.get(&url) else {
                    tracing::debug!(url = %url, consumer, message_id, "decode for unknown source");
                    return;
                };
                let (outcome, epoch) = {
                    let mut cache = handle.write();
                    (cache.acquire(consumer, index, active), cache.epoch())
                };
                tracing::trace!(url = %url, consumer, message_id, gop = index, ?outcome, "decode request");
                if let Some(Acquire::Start { generation }) = outcome {
                    self.schedule_decode(url, epoch, index, generation);
                }
            }
            Request::Release { index } => {
                let Some(handle) = self.registry.get(&url) else {
                    return;
                };
                let outcome = handle.write().release(consumer, index);
                match outcome {
                    Some(Release::Evicted { frames }) => {
                        tracing::debug!(url = %url, gop = index, frames, "evicted decoded GOP")
                    }
                    Some(Release::Cancelled) => {
                        tracing::debug!(url = %url, gop = index, "released GOP while decoding")
                    }
                    _ => {}
                }
            }
            Request::Active { active } => {
                if let Some(handle) = self.registry.get(&url) {
                    handle.write().set_active(consumer, active);
                    tracing::trace!(url = %url, consumer, message_id, ?active, "active GOP changed");
                }
            }
            Request::Detach => {
                let Some(handle) = self.registry.get(&url) else {
                    return;
                };
                let (frames, remaining) = {
                    let mut cache = handle.write();
                    (cache.detach(consumer), cache.ref_count())
                };
                tracing::debug!(url = %url, consumer, frames, remaining, "consumer detached");
                if remaining == 0 {
                    if let Some(handle) = self.registry.remove(&url) {
                        let frames = handle.write().teardown();
                        tracing::info!(url = %url, frames, "cache entry destroyed");
                    }
                }
            }
        }
    }

    fn on_meta(
        &mut self,
        url: Arc<str>,
        consumer: ConsumerId,
        message_id: MessageId,
        events: mpsc::UnboundedSender<DecoderEvent>,
        reply: oneshot::Sender<Result<MetaReply, CacheError>>,
    ) {
        if !self.registry.contains_key(&url) {
            self.next_epoch += 1;
            let cache = SharedMediaCache::new(Arc::clone(&url), self.next_epoch);
            self.registry.insert(Arc::clone(&url), CacheHandle::new(cache));
        }
        let Some(handle) = self.registry.get(&url).cloned() else {
            return;
        };

        let mut cache = handle.write();
        cache.attach(consumer, events);
        match cache.state() {
            CacheState::None => {
                cache.begin_meta();
                cache.push_waiter(MetaWaiter { message_id, reply });
                let epoch = cache.epoch();
                drop(cache);
                self.spawn_meta_load(url, epoch);
            }
            CacheState::LoadingMeta => cache.push_waiter(MetaWaiter { message_id, reply }),
            CacheState::Meta => {
                cache.replay_meta(consumer);
                let answer = cache.meta().cloned().map(|meta| MetaReply {
                    message_id,
                    meta,
                    gops: Arc::clone(cache.gop_list()),
                    cache: handle.clone(),
                });
                let _ = reply.send(answer.ok_or(CacheError::ContextClosed));
            }
            CacheState::Error => {
                cache.replay_meta(consumer);
                let error = cache.error().cloned().unwrap_or(CacheError::ContextClosed);
                let _ = reply.send(Err(error));
            }
        }
    }

    fn spawn_meta_load(&self, url: Arc<str>, epoch: u64) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let source = Arc::clone(&self.source);
        let codec = Arc::clone(&self.codec);
        let config = Arc::clone(&self.config);
        tracing::info!(url = %url, preload = config.preload_all, "loading metadata");

        tokio::spawn(async move {
            let result = load_meta(source.as_ref(), codec.as_ref(), &url, &config).await;
            let _ = tx.send(Message::MetaLoaded { url, epoch, result });
        });
    }

    fn on_meta_loaded(&mut self, url: Arc<str>, epoch: u64, result: Result<LoadedMeta, MetaLoadError>) {
        let Some(handle) = self.entry(&url, epoch).cloned() else {
            tracing::debug!(url = %url, epoch, "metadata for a destroyed cache entry");
            return;
        };

        match result {
            Ok(loaded) => {
                tracing::info!(
                    url = %url,
                    gops = loaded.gops.len(),
                    duration_ms = loaded.meta.duration / 1000,
                    file_size = loaded.meta.file_size,
                    "metadata ready"
                );
                let waiters = handle
                    .write()
                    .install_meta(loaded.meta, loaded.gops, loaded.preload);
                let (meta, gops) = {
                    let cache = handle.read();
                    (cache.meta().cloned(), Arc::clone(cache.gop_list()))
                };
                let Some(meta) = meta else {
                    return;
                };
                for waiter in waiters {
                    let _ = waiter.reply.send(Ok(MetaReply {
                        message_id: waiter.message_id,
                        meta: Arc::clone(&meta),
                        gops: Arc::clone(&gops),
                        cache: handle.clone(),
                    }));
                }
            }
            Err(source) => {
                tracing::warn!(url = %url, error = %source, "metadata load failed");
                let error = CacheError::MetaLoad {
                    url: url.to_string(),
                    source,
                };
                let waiters = handle.write().fail_meta(error.clone());
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(error.clone()));
                }
            }
        }
    }

    fn schedule_decode(&mut self, url: Arc<str>, epoch: u64, index: usize, generation: u64) {
        let delay = self.config.decode_debounce();
        if delay.is_zero() {
            self.on_debounce_elapsed(url, epoch, index, generation);
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::DebounceElapsed {
                url,
                epoch,
                index,
                generation,
            });
        });
    }

    fn on_debounce_elapsed(&mut self, url: Arc<str>, epoch: u64, index: usize, generation: u64) {
        let job = {
            let Some(handle) = self.entry(&url, epoch) else {
                return;
            };
            let cache = handle.read();
            if !cache.should_start(index, generation) {
                None
            } else {
                cache.decode_job(index, !self.config.mute)
            }
        };
        let Some(job) = job else {
            self.stats.decodes_dropped += 1;
            tracing::debug!(url = %url, gop = index, generation, "dropped abandoned decode request");
            return;
        };

        self.stats.decodes_started += 1;
        tracing::debug!(
            url = %url,
            gop = index,
            generation,
            bytes = job.descriptor.byte_end - job.descriptor.byte_start,
            "decoding GOP"
        );

        let source = Arc::clone(&self.source);
        let codec = Arc::clone(&self.codec);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = run_decode(source, codec, &url, job).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::DecodeFinished {
                    url,
                    epoch,
                    index,
                    generation,
                    result,
                });
            }
        });
    }

    fn on_decode_finished(
        &mut self,
        url: &Arc<str>,
        epoch: u64,
        index: usize,
        generation: u64,
        result: Result<DecodedGop, DecodeError>,
    ) {
        let Some(handle) = self.entry(url, epoch).cloned() else {
            if let Ok(decoded) = result {
                for frame in decoded.frames {
                    frame.release();
                }
            }
            self.stats.decodes_discarded += 1;
            tracing::debug!(url = %url, gop = index, "decode finished after cache entry was destroyed");
            return;
        };

        match result {
            Ok(decoded) => {
                let frames = decoded.frames.len();
                let keep_audio = !self.codec.incremental_audio();
                let completion = handle.write().complete(index, generation, decoded, keep_audio);
                match completion {
                    Some(Completion::Installed) => {
                        tracing::debug!(url = %url, gop = index, frames, "GOP decoded")
                    }
                    Some(Completion::Stale { frames }) => {
                        self.stats.decodes_discarded += 1;
                        tracing::debug!(url = %url, gop = index, frames, "discarded stale decode");
                    }
                    None => {}
                }
            }
            Err(e) => {
                if handle.write().fail(index, generation, e.clone()) {
                    tracing::warn!(url = %url, gop = index, error = %e, "GOP decode failed");
                } else {
                    tracing::debug!(url = %url, gop = index, error = %e, "ignored failure of a stale decode");
                }
            }
        }
    }
}

async fn load_meta(
    source: &dyn ByteSource,
    codec: &dyn Codec,
    url: &str,
    config: &CacheConfig,
) -> Result<LoadedMeta, MetaLoadError> {
    let file_size = source.probe_size(url).await.map_err(MetaLoadError::Probe)?;
    let mut demuxer = codec.demuxer();

    let preload = if config.preload_all {
        let bytes = source
            .fetch_range(url, 0, file_size)
            .await
            .map_err(MetaLoadError::Fetch)?;
        demuxer.feed(0, &bytes);
        Some(bytes)
    } else {
        let window = config.range_window_bytes.max(188);
        let mut offset = 0;
        while offset < file_size {
            let end = (offset + window).min(file_size);
            let chunk = source
                .fetch_range(url, offset, end)
                .await
                .map_err(MetaLoadError::Fetch)?;
            demuxer.feed(offset, &chunk);
            offset = end;
        }
        None
    };

    let demuxed = demuxer.finish()?;
    let gops = GopIndexer::from_config(config).index(&demuxed, file_size)?;
    let meta = MediaMeta {
        duration: demuxed.duration(),
        file_size,
        video: demuxed.video,
        audio: demuxed.audio,
        stream_header: demuxed.stream_header,
    };
    Ok(LoadedMeta {
        meta,
        gops,
        preload,
    })
}

async fn run_decode(
    source: Arc<dyn ByteSource>,
    codec: Arc<dyn Codec>,
    url: &str,
    job: DecodeJob,
) -> Result<DecodedGop, DecodeError> {
    let body = match &job.preloaded {
        Some(bytes) => bytes.clone(),
        None => {
            source
                .fetch_range(url, job.descriptor.byte_start, job.descriptor.byte_end)
                .await?
        }
    };

    let mut input = BytesMut::with_capacity(job.stream_header.len() + body.len());
    input.put_slice(&job.stream_header);
    input.put_slice(&body);
    let input = input.freeze();

    tokio::task::spawn_blocking(move || {
        let span = job.span();
        let frames = match &job.video {
            Some(track) => codec.decode_video(track, &span, &input)?,
            None => Vec::new(),
        };
        let audio = match &job.audio {
            Some(track) => Some(Arc::new(codec.decode_audio(track, &span, &input)?)),
            None => None,
        };
        Ok::<_, DecodeError>(DecodedGop { frames, audio })
    })
    .await
    .map_err(|e| DecodeError::Backend(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{keyframe_demux, test_config, wait_until, FakeCodec, FakeSource};
    use crate::gop::DecodeState;

    fn context(source: &FakeSource, codec: &FakeCodec, config: CacheConfig) -> DecodeContext {
        DecodeContext::spawn(Arc::new(source.clone()), Arc::new(codec.clone()), config)
    }

    async fn register(
        ctx: &DecodeContext,
        url: &Arc<str>,
    ) -> (ConsumerId, MetaReply, mpsc::UnboundedReceiver<DecoderEvent>) {
        let consumer = ctx.next_consumer();
        let (tx, rx) = mpsc::unbounded_channel();
        let reply = ctx.meta(url, consumer, tx).await.unwrap();
        (consumer, reply, rx)
    }

    #[tokio::test]
    async fn test_concurrent_meta_loads_once() {
        let source = FakeSource::new().with_file("a.ts", 10_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000, 2000], 3000));
        let ctx = context(&source, &codec, test_config());
        let url: Arc<str> = Arc::from("a.ts");

        let (a, b) = tokio::join!(register(&ctx, &url), register(&ctx, &url));
        assert_eq!(source.probes(), 1);
        assert!(a.1.cache.same_entry(&b.1.cache));
        assert_eq!(a.1.gops.len(), 3);
        assert_ne!(a.1.message_id, b.1.message_id);

        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.sources, 1);
        assert_eq!(stats.consumers, 2);
    }

    #[tokio::test]
    async fn test_meta_error_is_sticky_until_teardown() {
        let source = FakeSource::new();
        let codec = FakeCodec::new(keyframe_demux(&[0], 1000));
        let ctx = context(&source, &codec, test_config());
        let url: Arc<str> = Arc::from("missing.ts");

        let first = ctx.next_consumer();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ctx.meta(&url, first, tx).await.err().unwrap();
        assert!(matches!(err, CacheError::MetaLoad { .. }));

        // second caller gets the same error without a new probe
        let second = ctx.next_consumer();
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert_eq!(ctx.meta(&url, second, tx).await.err(), Some(err));
        assert_eq!(source.probes(), 1);

        ctx.detach(&url, first);
        ctx.detach(&url, second);
        source.add_file("missing.ts", 5_000);

        let third = ctx.next_consumer();
        let (tx, _rx3) = mpsc::unbounded_channel();
        assert!(ctx.meta(&url, third, tx).await.is_ok());
        assert_eq!(source.probes(), 2);
    }

    #[tokio::test]
    async fn test_debounced_decode_dropped_after_release() {
        let source = FakeSource::new().with_file("a.ts", 4_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000, 2000, 3000], 4000));
        let mut config = test_config();
        config.decode_debounce_ms = 50;
        let ctx = context(&source, &codec, config);
        let url: Arc<str> = Arc::from("a.ts");
        let (consumer, reply, _rx) = register(&ctx, &url).await;

        assert!(ctx.decode(&url, consumer, 2, 2));
        assert!(ctx.release(&url, consumer, 2));

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 0);
        assert_eq!(stats.decodes_dropped, 1);
        assert_eq!(codec.decodes(), 0);
        assert_eq!(reply.cache.gop_state(2), Some(DecodeState::None));
    }

    #[tokio::test]
    async fn test_stale_decode_result_is_released() {
        let source = FakeSource::new().with_file("a.ts", 2_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000], 2000)).gated();
        let ctx = context(&source, &codec, test_config());
        let url: Arc<str> = Arc::from("a.ts");
        let (consumer, reply, mut rx) = register(&ctx, &url).await;

        ctx.decode(&url, consumer, 1, 1);
        wait_until(|| codec.decodes() == 1).await;
        ctx.release(&url, consumer, 1);
        wait_until(|| reply.cache.gop_state(1) == Some(DecodeState::None)).await;

        codec.open_gate();
        wait_until(|| codec.pool().released() == codec.frames_per_gop()).await;
        assert_eq!(reply.cache.gop_state(1), Some(DecodeState::None));
        assert_eq!(codec.pool().outstanding(), 0);
        assert_eq!(ctx.stats().await.unwrap().decodes_discarded, 1);

        // only the Meta event, never CanPlay
        assert!(matches!(rx.try_recv(), Ok(DecoderEvent::Meta(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_detach_destroys_entry() {
        let source = FakeSource::new().with_file("a.ts", 2_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000], 2000));
        let ctx = context(&source, &codec, test_config());
        let url: Arc<str> = Arc::from("a.ts");
        let (consumer, reply, mut rx) = register(&ctx, &url).await;

        ctx.decode(&url, consumer, 0, 0);
        assert!(matches!(rx.recv().await, Some(DecoderEvent::Meta(_))));
        assert!(matches!(rx.recv().await, Some(DecoderEvent::CanPlay(0))));
        assert_eq!(codec.pool().outstanding(), codec.frames_per_gop());

        ctx.detach(&url, consumer);
        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.sources, 0);
        assert_eq!(codec.pool().outstanding(), 0);
        assert_eq!(reply.cache.gop_state(0), Some(DecodeState::None));
    }

    #[tokio::test]
    async fn test_preload_fetches_file_once() {
        let source = FakeSource::new().with_file("a.ts", 3_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000, 2000], 3000));
        let mut config = test_config();
        config.preload_all = true;
        let ctx = context(&source, &codec, config);
        let url: Arc<str> = Arc::from("a.ts");
        let (consumer, _reply, mut rx) = register(&ctx, &url).await;

        for index in 0..3 {
            ctx.decode(&url, consumer, index, 0);
        }
        let mut ready = Vec::new();
        while ready.len() < 3 {
            if let Some(DecoderEvent::CanPlay(index)) = rx.recv().await {
                ready.push(index);
            }
        }
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_windowed_scan_fetches_in_chunks() {
        let source = FakeSource::new().with_file("a.ts", 10_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000], 2000));
        let mut config = test_config();
        config.range_window_bytes = 4_000;
        let ctx = context(&source, &codec, config);
        let url: Arc<str> = Arc::from("a.ts");
        register(&ctx, &url).await;

        assert_eq!(source.fetches(), 3);
        assert_eq!(codec.fed_bytes(), 10_000);
    }

    #[tokio::test]
    async fn test_gop_failure_notifies_holders_only() {
        let source = FakeSource::new().with_file("a.ts", 3_000);
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000, 2000], 3000)).failing_at(1000);
        let ctx = context(&source, &codec, test_config());
        let url: Arc<str> = Arc::from("a.ts");
        let (a, _, mut rx_a) = register(&ctx, &url).await;
        let (b, _, mut rx_b) = register(&ctx, &url).await;

        ctx.decode(&url, a, 1, 1);
        ctx.decode(&url, b, 0, 0);
        assert!(matches!(rx_a.recv().await, Some(DecoderEvent::Meta(_))));
        assert!(matches!(
            rx_a.recv().await,
            Some(DecoderEvent::Error(CacheError::Decode { index: 1, .. }))
        ));
        assert!(matches!(rx_b.recv().await, Some(DecoderEvent::Meta(_))));
        assert!(matches!(rx_b.recv().await, Some(DecoderEvent::CanPlay(0))));
    }

    #[test]
    fn test_dedicated_thread_context() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let source = FakeSource::new().with_file("a.ts", 2_000);
            let codec = FakeCodec::new(keyframe_demux(&[0, 1000], 2000));
            let ctx = DecodeContext::spawn_dedicated(
                Arc::new(source.clone()),
                Arc::new(codec.clone()),
                test_config(),
            )
            .unwrap();
            let url: Arc<str> = Arc::from("a.ts");
            let (consumer, _reply, mut rx) = register(&ctx, &url).await;
            ctx.decode(&url, consumer, 1, 1);
            assert!(matches!(rx.recv().await, Some(DecoderEvent::Meta(_))));
            assert!(matches!(rx.recv().await, Some(DecoderEvent::CanPlay(1))));
        });
    }
}

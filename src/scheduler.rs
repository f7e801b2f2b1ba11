//! Per-viewer windowed decode policy.
//!
//! A [`DecodeScheduler`] keeps the GOPs around the playback cursor
//! referenced: everything from the active GOP up to `decode_next` ahead is
//! requested, anything ending more than `release_prev` behind the cursor
//! (or starting past the look-ahead) is released. Retained decode state is
//! bounded by the window, not by the file length.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::CacheHandle;
use crate::context::DecodeContext;
use crate::error::CacheError;
use crate::gop::{nearest_preceding_gop, ConsumerId, DecodeState, GopDescriptor};
use crate::media::{AudioBuffer, MediaMeta, Micros, VideoFrame};

/// Notifications delivered in order to one scheduler.
#[derive(Debug, Clone)]
pub enum DecoderEvent {
    Meta(Arc<MediaMeta>),
    Error(CacheError),
    CanPlay(usize),
    AudioBuffer(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub decode_requests: u64,
    pub release_requests: u64,
}

pub struct DecodeScheduler {
    context: DecodeContext,
    url: Arc<str>,
    consumer: ConsumerId,
    meta: Arc<MediaMeta>,
    gops: Arc<[GopDescriptor]>,
    cache: CacheHandle,
    events: mpsc::UnboundedReceiver<DecoderEvent>,
    decode_next: Micros,
    release_prev: Micros,
    time: Option<Micros>,
    active: Option<usize>,
    held: BTreeSet<usize>,
    stats: SchedulerStats,
    detached: bool,
}

impl DecodeScheduler {
    /// Register with the shared cache for `url` and wait for its metadata.
    /// A failed metadata load is returned as is; the registration is undone.
    pub async fn open(context: &DecodeContext, url: &str) -> Result<Self, CacheError> {
        let url: Arc<str> = Arc::from(url);
        let consumer = context.next_consumer();
        let (tx, events) = mpsc::unbounded_channel();

        let reply = match context.meta(&url, consumer, tx).await {
            Ok(reply) => reply,
            Err(e) => {
                context.detach(&url, consumer);
                return Err(e);
            }
        };

        let config = context.config();
        tracing::debug!(
            url = %url,
            consumer,
            message_id = reply.message_id,
            gops = reply.gops.len(),
            "scheduler opened"
        );
        Ok(Self {
            context: context.clone(),
            url,
            consumer,
            meta: reply.meta,
            gops: reply.gops,
            cache: reply.cache,
            events,
            decode_next: config.decode_next(),
            release_prev: config.release_prev(),
            time: None,
            active: None,
            held: BTreeSet::new(),
            stats: SchedulerStats::default(),
            detached: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    pub fn meta(&self) -> &Arc<MediaMeta> {
        &self.meta
    }

    pub fn gops(&self) -> &[GopDescriptor] {
        &self.gops
    }

    pub fn time(&self) -> Option<Micros> {
        self.time
    }

    pub fn active_gop(&self) -> Option<usize> {
        self.active
    }

    /// GOP indices this scheduler currently references, ascending.
    pub fn held(&self) -> Vec<usize> {
        self.held.iter().copied().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Move the playback cursor. Cheap to call every frame; repeating the
    /// same time sends nothing.
    pub fn set_time(&mut self, t: Micros) {
        if self.time == Some(t) {
            return;
        }
        self.time = Some(t);

        let duration = self.meta.duration;
        if t < -self.decode_next || t > duration + self.decode_next {
            tracing::trace!(url = %self.url, consumer = self.consumer, t, "cursor out of range");
            self.set_active(None);
            self.release_all();
            return;
        }

        let Some(active) = nearest_preceding_gop(&self.gops, t, duration) else {
            return;
        };
        self.set_active(Some(active));

        let behind = t - self.release_prev;
        let ahead = t + self.decode_next;
        let gops = Arc::clone(&self.gops);

        let outside: Vec<usize> = self
            .held
            .iter()
            .copied()
            .filter(|&i| i != active && (gops[i].end() < behind || gops[i].timestamp > ahead))
            .collect();
        for index in outside {
            self.release(index);
        }

        self.acquire(active, active);
        for gop in gops[active + 1..].iter().take_while(|g| g.timestamp <= ahead) {
            self.acquire(gop.index, active);
        }
    }

    fn set_active(&mut self, active: Option<usize>) {
        if self.active != active {
            self.active = active;
            self.context.set_active(&self.url, self.consumer, active);
        }
    }

    fn acquire(&mut self, index: usize, active: usize) {
        if self.held.insert(index) && self.context.decode(&self.url, self.consumer, index, active) {
            self.stats.decode_requests += 1;
        }
    }

    fn release(&mut self, index: usize) {
        if self.held.remove(&index) && self.context.release(&self.url, self.consumer, index) {
            self.stats.release_requests += 1;
        }
    }

    fn release_all(&mut self) {
        let held: Vec<usize> = self.held.iter().copied().collect();
        for index in held {
            self.release(index);
        }
    }

    /// Next notification, or `None` once the context has shut down.
    pub async fn next_event(&mut self) -> Option<DecoderEvent> {
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    pub fn try_next_event(&mut self) -> Option<DecoderEvent> {
        let event = self.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// A failed GOP no longer counts this consumer as a user, so it is
    /// dropped from `held` and requested again (and fails again) the next
    /// time the window covers it.
    fn observe(&mut self, event: &DecoderEvent) {
        if let DecoderEvent::Error(CacheError::Decode { index, .. }) = event {
            self.held.remove(index);
        }
    }

    /// Run `f` on the frame shown at `t`, if its GOP is decoded.
    pub fn with_frame_at<R>(&self, t: Micros, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        let index = nearest_preceding_gop(&self.gops, t, self.meta.duration)?;
        self.cache.with_frame(index, t, f)
    }

    pub fn audio_buffer(&self, index: usize) -> Option<Arc<AudioBuffer>> {
        self.cache.audio(index)
    }

    pub fn gop_state(&self, index: usize) -> Option<DecodeState> {
        self.cache.gop_state(index)
    }

    /// Drop every reference and unregister from the shared cache.
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.held.clear();
        self.context.detach(&self.url, self.consumer);
        tracing::debug!(
            url = %self.url,
            consumer = self.consumer,
            decode_requests = self.stats.decode_requests,
            release_requests = self.stats.release_requests,
            "scheduler detached"
        );
    }
}

impl Drop for DecodeScheduler {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::media::MICROS_PER_MS;
    use crate::testing::{
        keyframe_demux, test_config, wait_until, with_audio, FakeCodec, FakeSource,
    };

    fn ms(v: i64) -> Micros {
        v * MICROS_PER_MS
    }

    fn setup(keyframes_ms: &[i64], duration_ms: i64, config: CacheConfig) -> (DecodeContext, FakeSource, FakeCodec) {
        setup_with(FakeCodec::new(keyframe_demux(keyframes_ms, duration_ms)), keyframes_ms.len(), config)
    }

    fn setup_with(codec: FakeCodec, gops: usize, config: CacheConfig) -> (DecodeContext, FakeSource, FakeCodec) {
        let source = FakeSource::new().with_file("clip.ts", gops as u64 * 1000);
        let ctx = DecodeContext::spawn(Arc::new(source.clone()), Arc::new(codec.clone()), config);
        (ctx, source, codec)
    }

    /// Wait until every GOP in `indices` is reported playable.
    async fn wait_can_play(scheduler: &mut DecodeScheduler, indices: &[usize]) {
        let mut pending: BTreeSet<usize> = indices.iter().copied().collect();
        let waited = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !pending.is_empty() {
                match scheduler.next_event().await {
                    Some(DecoderEvent::CanPlay(index)) => {
                        pending.remove(&index);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        assert!(waited.is_ok(), "GOPs {pending:?} never became playable");
    }

    #[tokio::test]
    async fn test_window_follows_cursor() {
        let mut config = test_config();
        config.decode_next_ms = 1500;
        config.release_prev_ms = 500;
        let (ctx, _source, _codec) = setup(&[0, 1000, 2000, 3000, 4000, 5000], 6000, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(ms(200));
        assert_eq!(scheduler.active_gop(), Some(0));
        assert_eq!(scheduler.held(), vec![0, 1]);

        scheduler.set_time(ms(1600));
        assert_eq!(scheduler.active_gop(), Some(1));
        // GOP 0 ended 600ms ago, past the look-behind
        assert_eq!(scheduler.held(), vec![1, 2, 3]);

        scheduler.set_time(ms(2400));
        // GOP 1 ended 400ms ago and is still retained
        assert_eq!(scheduler.held(), vec![1, 2, 3]);

        scheduler.set_time(ms(300));
        assert_eq!(scheduler.held(), vec![0, 1]);
        assert_eq!(scheduler.stats().release_requests, 3);
    }

    #[tokio::test]
    async fn test_set_time_is_idempotent() {
        let (ctx, _source, _codec) = setup(&[0, 1000, 2000, 3000], 4000, test_config());
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(ms(1200));
        let first = scheduler.stats();
        assert!(first.decode_requests > 0);

        scheduler.set_time(ms(1200));
        scheduler.set_time(ms(1200));
        assert_eq!(scheduler.stats(), first);
    }

    #[tokio::test]
    async fn test_cursor_before_start_releases_everything() {
        let mut config = test_config();
        config.decode_next_ms = 200;
        let (ctx, _source, _codec) = setup(&[0, 1000, 2000], 3000, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(ms(-500));
        assert!(scheduler.held().is_empty());
        assert_eq!(scheduler.stats(), SchedulerStats::default());

        scheduler.set_time(ms(100));
        assert_eq!(scheduler.held(), vec![0]);
        scheduler.set_time(ms(-500));
        assert!(scheduler.held().is_empty());
        assert_eq!(scheduler.stats().decode_requests, 1);
        assert_eq!(scheduler.stats().release_requests, 1);
    }

    #[tokio::test]
    async fn test_cursor_near_end_keeps_last_gop() {
        let mut config = test_config();
        config.decode_next_ms = 200;
        let (ctx, _source, _codec) = setup(&[0, 1000, 2000], 3000, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(ms(3100));
        assert_eq!(scheduler.active_gop(), Some(2));
        assert_eq!(scheduler.held(), vec![2]);

        scheduler.set_time(ms(3300));
        assert_eq!(scheduler.active_gop(), None);
        assert!(scheduler.held().is_empty());
    }

    #[tokio::test]
    async fn test_shared_gop_survives_first_release() {
        let mut config = test_config();
        config.decode_next_ms = 0;
        config.release_prev_ms = 0;
        let (ctx, _source, codec) = setup(&[0, 1000, 2000, 3000, 4000], 5000, config);
        let mut a = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();
        let mut b = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        a.set_time(ms(3500));
        b.set_time(ms(3500));
        wait_can_play(&mut a, &[3]).await;
        wait_can_play(&mut b, &[3]).await;
        assert_eq!(codec.decodes(), 1);
        assert_eq!(a.gop_state(3), Some(DecodeState::Decoded));

        a.close();
        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.consumers, 1);
        assert_eq!(b.gop_state(3), Some(DecodeState::Decoded));
        assert_eq!(codec.pool().outstanding(), codec.frames_per_gop());

        b.set_time(ms(-5000));
        ctx.stats().await.unwrap();
        assert_eq!(b.gop_state(3), Some(DecodeState::None));
        assert_eq!(codec.pool().outstanding(), 0);
        assert_eq!(codec.pool().released(), codec.frames_per_gop());
    }

    #[tokio::test]
    async fn test_scrub_past_gop_drops_debounced_decode() {
        let mut config = test_config();
        config.decode_debounce_ms = 40;
        config.decode_next_ms = 0;
        config.release_prev_ms = 0;
        let (ctx, _source, codec) = setup(&[0, 1000, 2000, 3000], 4000, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        for t in [500, 1500, 2500] {
            scheduler.set_time(ms(t));
        }
        wait_can_play(&mut scheduler, &[2]).await;

        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 1);
        assert_eq!(stats.decodes_dropped, 2);
        assert_eq!(codec.decodes(), 1);
    }

    #[tokio::test]
    async fn test_frame_lookup_through_scheduler() {
        let (ctx, _source, codec) = setup(&[0, 1000], 2000, test_config());
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();
        assert!(scheduler.with_frame_at(ms(1300), |f| f.timestamp).is_none());

        scheduler.set_time(ms(1300));
        wait_can_play(&mut scheduler, &[1]).await;

        // four frames of 250ms each across [1000, 2000)
        assert_eq!(scheduler.with_frame_at(ms(1300), |f| f.timestamp), Some(ms(1250)));
        assert_eq!(scheduler.with_frame_at(ms(1999), |f| f.timestamp), Some(ms(1750)));
        // GOP 0 is behind the cursor and was never requested
        assert_eq!(codec.pool().outstanding(), codec.frames_per_gop());
    }

    #[tokio::test]
    async fn test_audio_decoded_once_across_evictions() {
        let mut config = test_config();
        config.decode_next_ms = 0;
        config.release_prev_ms = 0;
        let codec = FakeCodec::new(with_audio(keyframe_demux(&[0, 1000, 2000], 3000))).audio_once();
        let (ctx, _source, codec) = setup_with(codec, 3, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(ms(500));
        wait_can_play(&mut scheduler, &[0]).await;
        assert!(scheduler.audio_buffer(0).is_some());

        scheduler.set_time(ms(1500));
        wait_can_play(&mut scheduler, &[1]).await;
        wait_until(|| scheduler.gop_state(0) == Some(DecodeState::None)).await;

        scheduler.set_time(ms(500));
        wait_can_play(&mut scheduler, &[0]).await;
        assert_eq!(codec.decodes(), 3);
        assert_eq!(codec.audio_decodes(), 2);
        assert!(scheduler.audio_buffer(0).is_some());
    }

    #[tokio::test]
    async fn test_mute_skips_audio() {
        let mut config = test_config();
        config.mute = true;
        let codec = FakeCodec::new(with_audio(keyframe_demux(&[0, 1000], 2000)));
        let (ctx, _source, codec) = setup_with(codec, 2, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(0);
        wait_can_play(&mut scheduler, &[0, 1]).await;
        assert_eq!(codec.audio_decodes(), 0);
        assert!(scheduler.audio_buffer(0).is_none());
    }

    #[tokio::test]
    async fn test_audio_notices_follow_cursor() {
        let mut config = test_config();
        config.decode_next_ms = 10_000;
        config.release_prev_ms = 10_000;
        config.decode_debounce_ms = 80;
        let codec = FakeCodec::new(with_audio(keyframe_demux(&[0, 1000, 2000], 3000)));
        let (ctx, _source, _codec) = setup_with(codec, 3, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(0);
        assert_eq!(scheduler.held(), vec![0, 1, 2]);
        // no new acquire here, only the active GOP moves
        scheduler.set_time(ms(2500));
        assert_eq!(scheduler.active_gop(), Some(2));
        assert_eq!(scheduler.stats().decode_requests, 3);

        let mut ready = BTreeSet::new();
        let mut audio = Vec::new();
        let waited = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while ready.len() < 3 {
                match scheduler.next_event().await {
                    Some(DecoderEvent::CanPlay(index)) => {
                        ready.insert(index);
                    }
                    Some(DecoderEvent::AudioBuffer(index)) => audio.push(index),
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        assert!(waited.is_ok());
        assert!(audio.is_empty(), "audio announced for GOPs behind the cursor: {audio:?}");
    }

    #[tokio::test]
    async fn test_failed_gop_requested_again_when_in_window() {
        let mut config = test_config();
        config.decode_next_ms = 1500;
        let codec = FakeCodec::new(keyframe_demux(&[0, 1000, 2000], 3000)).failing_at(1000);
        let (ctx, _source, codec) = setup_with(codec, 3, config);
        let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();

        scheduler.set_time(0);
        assert_eq!(scheduler.held(), vec![0, 1]);
        let (mut played, mut failed) = (false, false);
        let waited = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !(played && failed) {
                match scheduler.next_event().await {
                    Some(DecoderEvent::CanPlay(0)) => played = true,
                    Some(DecoderEvent::Error(CacheError::Decode { index: 1, .. })) => failed = true,
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        assert!(waited.is_ok());
        assert_eq!(scheduler.held(), vec![0]);

        scheduler.set_time(ms(10));
        assert_eq!(scheduler.held(), vec![0, 1]);
        assert_eq!(scheduler.stats().decode_requests, 3);
        let again = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Some(DecoderEvent::Error(CacheError::Decode { index: 1, .. })) =
                    scheduler.next_event().await
                {
                    break;
                }
            }
        })
        .await;
        assert!(again.is_ok());
        assert_eq!(scheduler.held(), vec![0]);
        // the error is sticky, no second decode
        assert_eq!(codec.decodes(), 2);
    }

    #[tokio::test]
    async fn test_open_fails_with_meta_error() {
        let (ctx, source, _codec) = setup(&[0], 1000, test_config());
        let err = DecodeScheduler::open(&ctx, "missing.ts").await.err();
        assert!(matches!(err, Some(CacheError::MetaLoad { .. })));

        // the failed registration was undone, so a retry probes again
        DecodeScheduler::open(&ctx, "missing.ts").await.err();
        assert_eq!(source.probes(), 2);
        assert_eq!(ctx.stats().await.unwrap().sources, 0);
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let (ctx, _source, codec) = setup(&[0, 1000], 2000, test_config());
        {
            let mut scheduler = DecodeScheduler::open(&ctx, "clip.ts").await.unwrap();
            scheduler.set_time(0);
            wait_can_play(&mut scheduler, &[0, 1]).await;
            assert_eq!(ctx.stats().await.unwrap().consumers, 1);
        }
        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.sources, 0);
        assert_eq!(codec.pool().outstanding(), 0);
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use gopcache::media::{ByteSource, FfmpegCodec, HttpSource, PersistentRangeCache, MICROS_PER_MS};
use gopcache::{Config, DecodeContext, DecodeScheduler, DecoderEvent, SourceConfig};

const TICK: Duration = Duration::from_millis(40);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gopcache=debug".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!("loaded {} source(s)", config.sources.len());

    let source: Arc<dyn ByteSource> = if config.cache.persist_ranges {
        tracing::info!(data_dir = %config.cache.data_dir.display(), "persisting fetched ranges");
        Arc::new(PersistentRangeCache::new(
            HttpSource::new(),
            config.cache.data_dir.clone(),
        ))
    } else {
        Arc::new(HttpSource::new())
    };
    let codec = Arc::new(FfmpegCodec::new(&config.decoder));
    let pool = codec.pool().clone();
    let context = DecodeContext::spawn(source, codec, config.cache.clone());

    let mut handles = Vec::new();
    for source_config in config.sources {
        for viewer in 0..source_config.viewers {
            let context = context.clone();
            let source_config = source_config.clone();
            let url = source_config.url.clone();
            let handle = tokio::spawn(async move {
                run_viewer(context, source_config, viewer).await;
            });
            handles.push((url, handle));
        }
    }

    let status_context = context.clone();
    let status_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let Ok(stats) = status_context.stats().await else {
                break;
            };
            tracing::info!(
                sources = stats.sources,
                consumers = stats.consumers,
                decoded_gops = stats.decoded_gops,
                started = stats.decodes_started,
                dropped = stats.decodes_dropped,
                discarded = stats.decodes_discarded,
                frames_outstanding = pool.outstanding(),
                "cache stats"
            );
        }
    });

    let mut remaining = handles.into_iter();
    for (url, handle) in remaining.by_ref() {
        tokio::select! {
            result = handle => {
                if let Err(e) = result {
                    tracing::error!(url = %url, "viewer task failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }
    for (_, handle) in remaining {
        handle.abort();
    }

    status_handle.abort();
    if let Ok(stats) = context.stats().await {
        tracing::info!(
            sources = stats.sources,
            decodes_started = stats.decodes_started,
            "final cache stats"
        );
    }
    tracing::info!("shutdown complete");

    Ok(())
}

/// Plays `source` from its configured start, looping at the end.
async fn run_viewer(context: DecodeContext, source: SourceConfig, viewer: usize) {
    let mut scheduler = match DecodeScheduler::open(&context, &source.url).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(url = %source.url, viewer, "failed to open source: {}", e);
            return;
        }
    };

    let duration = scheduler.meta().duration;
    let step = (TICK.as_micros() as f64 * source.rate) as i64;
    let mut cursor = source.start_ms * MICROS_PER_MS;
    let mut ticker = tokio::time::interval(TICK);
    let (mut shown, mut missed) = (0u64, 0u64);

    tracing::info!(
        url = %source.url,
        viewer,
        duration_ms = duration / MICROS_PER_MS,
        gops = scheduler.gops().len(),
        "viewer started"
    );

    loop {
        ticker.tick().await;
        scheduler.set_time(cursor);

        while let Some(event) = scheduler.try_next_event() {
            match event {
                DecoderEvent::Error(e) => {
                    tracing::warn!(url = %source.url, viewer, "decoder error: {}", e)
                }
                DecoderEvent::CanPlay(index) => {
                    tracing::trace!(url = %source.url, viewer, gop = index, "can play")
                }
                DecoderEvent::AudioBuffer(index) => {
                    tracing::trace!(url = %source.url, viewer, gop = index, "audio ready")
                }
                DecoderEvent::Meta(_) => {}
            }
        }

        if scheduler.with_frame_at(cursor, |frame| frame.width).is_some() {
            shown += 1;
        } else {
            missed += 1;
        }

        cursor += step;
        if cursor > duration {
            tracing::info!(url = %source.url, viewer, shown, missed, "reached end, looping");
            cursor = 0;
            shown = 0;
            missed = 0;
        }
    }
}

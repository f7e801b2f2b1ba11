//! Playback-oriented GOP decode cache.
//!
//! A file is indexed into GOPs once per URL and shared by every
//! [`DecodeScheduler`] viewing it. Each scheduler keeps a window of GOPs
//! around its cursor decoded; all state changes go through one serialized
//! [`DecodeContext`].

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod gop;
pub mod media;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheHandle, CacheState, SharedMediaCache};
pub use config::{CacheConfig, Config, DecoderConfig, SourceConfig};
pub use context::{ContextStats, DecodeContext, MessageId};
pub use error::{CacheError, DecodeError, MetaLoadError, RangeFetchError};
pub use gop::{DecodeState, GopDescriptor};
pub use scheduler::{DecodeScheduler, DecoderEvent, SchedulerStats};

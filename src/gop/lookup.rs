//! Binary searches over time-ordered spans.

use super::GopDescriptor;
use crate::media::{Micros, VideoFrame, MICROS_PER_MS};

/// Slack at the end of the file for cursor drift past the last boundary.
pub const END_EPSILON: Micros = MICROS_PER_MS;

/// Index of the last item whose key is `<= t`, or 0 when `t` precedes every
/// item. `None` only for an empty slice.
pub fn preceding_index<T>(items: &[T], t: Micros, key: impl Fn(&T) -> Micros) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    // items[..pp] all have key <= t
    let pp = items.partition_point(|item| key(item) <= t);
    Some(pp.saturating_sub(1))
}

/// GOP whose span contains `t`, clamped to the first and last GOP.
pub fn nearest_preceding_gop(
    gops: &[GopDescriptor],
    t: Micros,
    total_duration: Micros,
) -> Option<usize> {
    if gops.is_empty() {
        return None;
    }
    if t <= 0 || gops.len() == 1 {
        return Some(0);
    }
    if t >= total_duration - END_EPSILON {
        return Some(gops.len() - 1);
    }
    preceding_index(gops, t, |g| g.timestamp)
}

/// Frame whose `[timestamp, timestamp + duration)` contains `t`, otherwise
/// the nearest frame before `t` (or the first frame if `t` precedes all).
pub fn frame_at_time(frames: &[VideoFrame], t: Micros) -> Option<usize> {
    preceding_index(frames, t, |f| f.timestamp)
}

mod index;
mod lookup;
mod state;

pub use index::{index_keyframes, GopDescriptor, GopIndexer};
pub use lookup::{frame_at_time, nearest_preceding_gop, preceding_index, END_EPSILON};
pub use state::{
    Acquire, Completion, ConsumerId, DecodeState, DecodedGop, GopDecodeState, Release,
};

use std::collections::BTreeSet;
use std::sync::Arc;

use super::GopDescriptor;
use crate::error::DecodeError;
use crate::media::{AudioBuffer, VideoFrame};

pub type ConsumerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    None,
    Decoding,
    Decoded,
    Error,
}

/// What the caller must do after [`GopDecodeState::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// First user: a decode must be issued for this generation.
    Start { generation: u64 },
    /// A decode is already in flight.
    Joined,
    /// Already decoded, the consumer can play right away.
    Ready,
    /// The GOP failed to decode earlier.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    NotHeld,
    Retained,
    Evicted { frames: usize },
    /// Last user left while decoding; the in-flight result will be discarded.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Installed,
    Stale { frames: usize },
}

/// Output of one GOP decode.
#[derive(Debug, Default)]
pub struct DecodedGop {
    pub frames: Vec<VideoFrame>,
    pub audio: Option<Arc<AudioBuffer>>,
}

impl DecodedGop {
    fn release(self) -> usize {
        let count = self.frames.len();
        for frame in self.frames {
            frame.release();
        }
        count
    }
}

/// Decode state and payload of one GOP, reference counted by consumer id.
///
/// Frames are only ever held while `Decoded`; a GOP whose users set empties
/// goes back to `None` and releases everything it owned.
#[derive(Debug)]
pub struct GopDecodeState {
    descriptor: GopDescriptor,
    state: DecodeState,
    frames: Vec<VideoFrame>,
    audio: Option<Arc<AudioBuffer>>,
    users: BTreeSet<ConsumerId>,
    decoded_once: bool,
    generation: u64,
    error: Option<DecodeError>,
}

impl GopDecodeState {
    pub fn new(descriptor: GopDescriptor) -> Self {
        Self {
            descriptor,
            state: DecodeState::None,
            frames: Vec::new(),
            audio: None,
            users: BTreeSet::new(),
            decoded_once: false,
            generation: 0,
            error: None,
        }
    }

    pub fn descriptor(&self) -> &GopDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn users(&self) -> &BTreeSet<ConsumerId> {
        &self.users
    }

    pub fn frames(&self) -> &[VideoFrame] {
        &self.frames
    }

    pub fn audio(&self) -> Option<&Arc<AudioBuffer>> {
        self.audio.as_ref()
    }

    pub fn decoded_once(&self) -> bool {
        self.decoded_once
    }

    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn acquire(&mut self, consumer: ConsumerId) -> Acquire {
        match self.state {
            DecodeState::Error => Acquire::Failed,
            DecodeState::None => {
                self.users.insert(consumer);
                self.generation += 1;
                self.state = DecodeState::Decoding;
                Acquire::Start {
                    generation: self.generation,
                }
            }
            DecodeState::Decoding => {
                self.users.insert(consumer);
                Acquire::Joined
            }
            DecodeState::Decoded => {
                self.users.insert(consumer);
                Acquire::Ready
            }
        }
    }

    pub fn release(&mut self, consumer: ConsumerId) -> Release {
        if !self.users.remove(&consumer) {
            return Release::NotHeld;
        }
        if !self.users.is_empty() {
            return Release::Retained;
        }
        match self.state {
            DecodeState::Decoded => Release::Evicted {
                frames: self.evict(),
            },
            DecodeState::Decoding => {
                self.state = DecodeState::None;
                Release::Cancelled
            }
            DecodeState::None | DecodeState::Error => Release::Retained,
        }
    }

    /// True while `generation` is the decode this GOP is waiting for.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state == DecodeState::Decoding && self.generation == generation
    }

    /// Whether a debounced decode of `generation` should still run.
    pub fn should_start(&self, generation: u64) -> bool {
        self.is_current(generation) && !self.users.is_empty()
    }

    /// Install a finished decode, or release it if nobody wants it anymore.
    pub fn complete(&mut self, generation: u64, decoded: DecodedGop) -> Completion {
        if !self.should_start(generation) {
            return Completion::Stale {
                frames: decoded.release(),
            };
        }
        self.frames = decoded.frames;
        self.audio = decoded.audio;
        self.state = DecodeState::Decoded;
        self.decoded_once = true;
        Completion::Installed
    }

    /// Mark the GOP failed. Returns the users to notify, or `None` when the
    /// failure belongs to a decode nobody waits for anymore.
    pub fn fail(&mut self, generation: u64, error: DecodeError) -> Option<Vec<ConsumerId>> {
        if !self.is_current(generation) {
            return None;
        }
        self.state = DecodeState::Error;
        self.error = Some(error);
        Some(std::mem::take(&mut self.users).into_iter().collect())
    }

    /// Release the payload and return to `None`. Returns the number of frames released.
    pub fn evict(&mut self) -> usize {
        let released = DecodedGop {
            frames: std::mem::take(&mut self.frames),
            audio: self.audio.take(),
        }
        .release();
        if self.state != DecodeState::Error {
            self.state = DecodeState::None;
        }
        released
    }

    /// Drop every user and payload, used when the owning cache is destroyed.
    pub fn teardown(&mut self) -> usize {
        self.users.clear();
        self.evict()
    }
}

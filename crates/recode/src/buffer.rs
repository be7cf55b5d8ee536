//! Bounded-memory accumulation with a one-way switch to streaming.
//!
//! [`AdaptiveBuffer`] holds decoded chunks until either the input ends, in
//! which case the whole body is handed back as one buffer, or the running
//! total reaches the threshold, in which case the held chunks are released in
//! order and every later chunk passes straight through.
//!
//! The switch is inclusive: a body of exactly `threshold` bytes is streamed.

use bytes::{Bytes, BytesMut};
use std::mem;
use tracing::debug;

/// Default buffering threshold, 16 MiB.
pub const DEFAULT_THRESHOLD: usize = 16 * 1024 * 1024;

#[derive(Debug)]
enum Mode {
    Buffering { pending: Vec<Bytes>, total: usize },
    Streaming,
    Finished,
}

/// What the caller has to do after feeding a chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The chunk was held; nothing to emit.
    Buffered,
    /// The threshold was just reached. The head must be finalized for
    /// streaming before these chunks, which are everything seen so far in
    /// input order, are forwarded. Produced at most once.
    StreamStarted(Vec<Bytes>),
    /// Already streaming: forward the chunk as is.
    Passthrough(Bytes),
}

/// What the caller gets once the input has ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Finish {
    /// The input ended below the threshold; this is the entire body.
    BufferReady(Bytes),
    /// The buffer had already switched to streaming; nothing is left.
    StreamEnded,
}

#[derive(Debug)]
pub struct AdaptiveBuffer {
    threshold: usize,
    mode: Mode,
}

impl AdaptiveBuffer {
    pub fn new(threshold: usize) -> Self {
        Self { threshold, mode: Mode::Buffering { pending: Vec::new(), total: 0 } }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.mode, Mode::Streaming)
    }

    /// Bytes currently held, zero once streaming.
    pub fn buffered_len(&self) -> usize {
        match &self.mode {
            Mode::Buffering { total, .. } => *total,
            Mode::Streaming | Mode::Finished => 0,
        }
    }

    /// Feeds the next chunk of input.
    pub fn push(&mut self, chunk: Bytes) -> Step {
        match &mut self.mode {
            Mode::Buffering { pending, total } => {
                *total += chunk.len();
                pending.push(chunk);
                if *total < self.threshold {
                    return Step::Buffered;
                }

                debug!(buffered = *total, threshold = self.threshold, "buffer threshold reached, switch to streaming");
                let pending = mem::take(pending);
                self.mode = Mode::Streaming;
                Step::StreamStarted(pending)
            }
            // pushing after finish is a caller bug; the bytes still flow rather than vanish
            Mode::Streaming | Mode::Finished => Step::Passthrough(chunk),
        }
    }

    /// Signals the end of input.
    pub fn finish(&mut self) -> Finish {
        match mem::replace(&mut self.mode, Mode::Finished) {
            Mode::Buffering { pending, total } => Finish::BufferReady(concat(pending, total)),
            Mode::Streaming | Mode::Finished => Finish::StreamEnded,
        }
    }
}

fn concat(mut chunks: Vec<Bytes>, total: usize) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

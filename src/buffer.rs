//! Per-session outgoing write buffer.
//!
//! A FIFO of write segments, named after the teacher's own read-side
//! `Buffer` (`examples/ryanseipp-rask-old/src/first/buffer.rs`) but
//! reshaped for the write path: rather than one contiguous ring, the spec
//! calls for discrete segments that individually carry an ownership flag
//! (`isfree`), so a `VecDeque<Segment>` models it more directly than the
//! teacher's raw-pointer ring buffer.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;

/// A pending outgoing payload.
///
/// `Owned` is memory the caller handed off on `send(..., isfree = true)`;
/// the layer releases it once fully written or the session dies. `Shared`
/// backs broadcast fan-out, where one allocation is sent to many sessions
/// without copying.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Buffer taken over by the write buffer; copied once by the caller.
    Owned(Vec<u8>),
    /// Reference-counted buffer shared across sessions, e.g. broadcast.
    Shared(Arc<[u8]>),
}

impl Payload {
    /// Takes ownership of an already-allocated buffer without copying —
    /// the `isfree = true` path of `send`.
    pub fn owned(bytes: Vec<u8>) -> Self {
        Payload::Owned(bytes)
    }

    /// Copies `bytes` now, leaving the caller free to reuse its buffer —
    /// the `isfree = false` path of `send`.
    pub fn copied(bytes: &[u8]) -> Self {
        Payload::Owned(bytes.to_vec())
    }

    /// Wraps a reference-counted buffer for cheap fan-out to many
    /// sessions, e.g. `broadcast`/`broadcast2`.
    pub fn shared(bytes: Arc<[u8]>) -> Self {
        Payload::Shared(bytes)
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v.as_slice(),
            Payload::Shared(s) => s.as_ref(),
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

struct Segment {
    payload: Payload,
    sent: usize,
}

impl Segment {
    fn remaining(&self) -> &[u8] {
        &self.payload.as_slice()[self.sent..]
    }
}

/// FIFO of pending write segments for one session.
#[derive(Default)]
pub struct WriteBuffer {
    segments: VecDeque<Segment>,
    queued_bytes: usize,
}

impl WriteBuffer {
    /// An empty write buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether there is nothing left to write.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total unsent bytes currently queued, across all segments.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Appends a payload to the back of the queue.
    pub fn push(&mut self, payload: Payload) {
        self.queued_bytes += payload.len();
        self.segments.push_back(Segment { payload, sent: 0 });
    }

    /// Drains as many bytes as the writer accepts, in FIFO order. Fully-sent
    /// segments are dropped, releasing owned memory. Returns the total bytes
    /// written.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while let Some(segment) = self.segments.front_mut() {
            let remaining = segment.remaining();
            if remaining.is_empty() {
                self.segments.pop_front();
                continue;
            }
            match writer.write(remaining) {
                Ok(0) => break,
                Ok(n) => {
                    segment.sent += n;
                    self.queued_bytes -= n;
                    total += n;
                    if segment.sent >= segment.payload.len() {
                        self.segments.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Drops all queued segments without writing them, e.g. on forced
    /// session destruction. Owned buffers are simply dropped; shared
    /// buffers decrement their reference count.
    pub fn discard(&mut self) {
        self.segments.clear();
        self.queued_bytes = 0;
    }
}

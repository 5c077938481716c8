//! Blocking FIFO of PCM chunks
//!
//! `AudioQueue` is the hand-off point between the engines and whatever sits
//! between them (the echo pump today, VAD/STT stages later). It is unbounded
//! by default; producers are expected to be paced by the device.
//!
//! Blocked waiters can be woken with [`AudioQueue::interrupt`]. Only waiters
//! that are blocked at that moment are cancelled, later calls behave normally.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::QueueError;

/// One or more whole PCM frames. Immutable once created.
pub type AudioChunk = Bytes;

struct QueueState {
    chunks: VecDeque<AudioChunk>,
    /// Bumped on every interrupt; waiters compare against the value they entered with
    interrupts: u64,
}

/// Thread-safe FIFO of audio chunks
pub struct AudioQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl AudioQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue holding at most `capacity` chunks
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                interrupts: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append a chunk, blocking while a bounded queue is full
    pub fn put(&self, chunk: AudioChunk) -> Result<(), QueueError> {
        let mut state = self.state.lock();

        if let Some(capacity) = self.capacity {
            let epoch = state.interrupts;
            while state.chunks.len() >= capacity {
                self.not_full.wait(&mut state);
                if state.interrupts != epoch {
                    return Err(QueueError::Cancelled);
                }
            }
        }

        state.chunks.push_back(chunk);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append a chunk without blocking. Hands the chunk back if the queue is full.
    pub fn offer(&self, chunk: AudioChunk) -> Result<(), AudioChunk> {
        let mut state = self.state.lock();
        if matches!(self.capacity, Some(capacity) if state.chunks.len() >= capacity) {
            return Err(chunk);
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest chunk, blocking until one is available
    pub fn take(&self) -> Result<AudioChunk, QueueError> {
        let mut state = self.state.lock();
        let epoch = state.interrupts;

        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                drop(state);
                self.notify_space();
                return Ok(chunk);
            }

            self.not_empty.wait(&mut state);

            if state.interrupts != epoch {
                // Pass on a wakeup we may have absorbed from a concurrent put
                if !state.chunks.is_empty() {
                    self.not_empty.notify_one();
                }
                return Err(QueueError::Cancelled);
            }
        }
    }

    /// Remove the oldest chunk if one is queued
    pub fn poll(&self) -> Option<AudioChunk> {
        let chunk = self.state.lock().chunks.pop_front();
        if chunk.is_some() {
            self.notify_space();
        }
        chunk
    }

    /// Remove the oldest chunk, waiting at most `timeout` for one to arrive
    pub fn poll_timeout(&self, timeout: Duration) -> Option<AudioChunk> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let epoch = state.interrupts;

        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                drop(state);
                self.notify_space();
                return Some(chunk);
            }

            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                let chunk = state.chunks.pop_front();
                drop(state);
                if chunk.is_some() {
                    self.notify_space();
                }
                return chunk;
            }

            if state.interrupts != epoch {
                if !state.chunks.is_empty() {
                    self.not_empty.notify_one();
                }
                return None;
            }
        }
    }

    /// Discard every queued chunk, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.chunks.len();
        state.chunks.clear();
        drop(state);
        if dropped > 0 && self.capacity.is_some() {
            self.not_full.notify_all();
        }
        dropped
    }

    /// Wake every blocked `put`, `take` and `poll_timeout` caller
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Maximum number of chunks, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn notify_space(&self) {
        if self.capacity.is_some() {
            self.not_full.notify_one();
        }
    }
}

impl Default for AudioQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue handle shared between an engine and its consumers
pub type SharedAudioQueue = Arc<AudioQueue>;

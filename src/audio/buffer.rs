//! Lock-free sample ring between a cpal callback and a device line
//!
//! The audio callback side never blocks or locks. The line side does its
//! own waiting by polling with short sleeps.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-capacity ring of interleaved i16 samples.
///
/// Samples go in and come out in whole frames so a reader never starts
/// mid-frame. There must be a single producer and a single consumer.
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    /// Samples per frame (the channel count)
    frame: usize,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a ring of `capacity` samples, rounded down to whole frames of `channels`
    pub fn new(capacity: usize, channels: usize) -> Self {
        let frame = channels.max(1);
        let capacity = (capacity / frame).max(1) * frame;
        Self {
            queue: ArrayQueue::new(capacity),
            frame,
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Samples per frame
    pub fn frame_len(&self) -> usize {
        self.frame
    }

    /// Push every whole frame that fits. Frames that don't fit are dropped and
    /// counted as overflow; a trailing partial frame is ignored.
    /// Returns how many samples were accepted.
    pub fn push_slice(&self, samples: &[i16]) -> usize {
        let mut accepted = 0;
        for frame in samples.chunks_exact(self.frame) {
            if self.push_frame(frame) {
                accepted += frame.len();
            } else {
                self.overflow_count.fetch_add(frame.len(), Ordering::Relaxed);
            }
        }
        accepted
    }

    /// Push one frame if all of it fits. Does not count overflow, for writers that retry.
    pub fn push_frame(&self, frame: &[i16]) -> bool {
        debug_assert_eq!(frame.len(), self.frame);
        if self.free() < frame.len() {
            return false;
        }
        // The consumer only frees space, so the room checked above stays available
        for &sample in frame {
            let _ = self.queue.push(sample);
        }
        true
    }

    /// Pop whole frames into `out`, returning the number of samples written
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let ready = self.queue.len() / self.frame;
        let wanted = (out.len() / self.frame).min(ready) * self.frame;

        let mut n = 0;
        while n < wanted {
            match self.queue.pop() {
                Some(sample) => {
                    out[n] = sample;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Pop into `out`, filling the remainder with silence and counting an underrun
    pub fn pop_or_silence(&self, out: &mut [i16]) {
        let n = self.pop_into(out);
        if n < out.len() {
            out[n..].fill(0);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every complete buffered frame, returning how many samples were dropped.
    /// A frame still being pushed is left for the producer to finish.
    pub fn clear(&self) -> usize {
        let buffered = self.queue.len() / self.frame * self.frame;
        let mut dropped = 0;
        while dropped < buffered && self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free space in samples
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;

/// Decode little-endian 16-bit PCM bytes into samples. A trailing odd byte is ignored.
pub fn decode_le(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}

/// Encode samples as little-endian 16-bit PCM into `out`, which must hold `2 * samples.len()` bytes
pub fn encode_le(samples: &[i16], out: &mut [u8]) {
    for (sample, dst) in samples.iter().zip(out.chunks_exact_mut(2)) {
        dst.copy_from_slice(&sample.to_le_bytes());
    }
}

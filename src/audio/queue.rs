//! Bounded audio frame queue with drop-oldest overflow behavior
//!
//! Producers (the capture worker, the upstream receive loop) must never
//! block on a slow consumer, so `push` is synchronous and evicts the oldest
//! frame when the queue is full. Consumers await frames asynchronously.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::audio::frame::AudioFrame;

/// Result of pushing a frame onto the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Frame was enqueued without evicting anything
    Accepted,
    /// Queue was full; the oldest frame was dropped to make room
    DroppedOldest,
    /// Queue has been closed; the frame was discarded
    Closed,
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<AudioFrame>,
    closed: bool,
    overruns: u64,
}

/// Bounded FIFO of audio frames
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (at least 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                overruns: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create a queue sized to hold roughly `seconds` of audio at the given
    /// sample rate and frame size
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_duration(seconds: f64, sample_rate: u32, chunk_size: usize) -> Self {
        let total_samples = (seconds * f64::from(sample_rate)).ceil() as usize;
        Self::new(total_samples.div_ceil(chunk_size.max(1)))
    }

    /// Enqueue a frame without blocking.
    ///
    /// On overflow the oldest frame is evicted and the overrun counter is
    /// incremented. Frames pushed after `close` are discarded.
    pub fn push(&self, frame: AudioFrame) -> PushResult {
        let result = {
            let mut inner = self.lock();
            if inner.closed {
                return PushResult::Closed;
            }
            let result = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.overruns += 1;
                PushResult::DroppedOldest
            } else {
                PushResult::Accepted
            };
            inner.frames.push_back(frame);
            result
        };
        self.notify.notify_one();
        result
    }

    /// Dequeue the oldest frame, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            // register interest before checking, so a push between the check
            // and the await cannot be missed
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue the oldest frame if one is immediately available
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.lock().frames.pop_front()
    }

    /// Discard all queued frames, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.frames.len();
        inner.frames.clear();
        dropped
    }

    /// Close the queue. Idempotent; wakes all waiting consumers.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of frames currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Whether the queue is currently empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Maximum number of frames the queue holds
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted due to overflow since creation
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.lock().overruns
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // mutex is only held for short non-panicking sections
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::CAPTURE_SAMPLE_RATE;

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 4], CAPTURE_SAMPLE_RATE)
    }

    #[test]
    fn push_within_capacity_accepts() {
        let queue = FrameQueue::new(2);
        assert_eq!(queue.push(frame(1)), PushResult::Accepted);
        assert_eq!(queue.push(frame(2)), PushResult::Accepted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.push(frame(3)), PushResult::DroppedOldest);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.overruns(), 1);
        let first = queue.try_pop().unwrap();
        assert_eq!(first.samples()[0], 2);
    }

    #[test]
    fn close_is_idempotent_and_rejects_pushes() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.close();
        queue.close();
        assert_eq!(queue.push(frame(2)), PushResult::Closed);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn with_duration_sizes_from_rate_and_chunk() {
        let queue = FrameQueue::with_duration(2.0, 16_000, 512);
        // 32000 samples / 512 per frame
        assert_eq!(queue.capacity(), 63);
    }

    #[tokio::test]
    async fn pop_drains_then_returns_none_after_close() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(frame(7));
        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.samples()[0], 7);
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers() {
        let queue = std::sync::Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[test]
    fn clear_reports_dropped_count() {
        let queue = FrameQueue::new(8);
        for i in 0..5 {
            queue.push(frame(i));
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
    }
}

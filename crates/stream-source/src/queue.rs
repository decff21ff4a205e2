//! Thread-safe bounded queue for interleaved audio samples.
//!
//! Connects a background feeding thread (decoder, network receiver) to a
//! [`crate::live::LiveProducer`]:
//! - the feeding thread pushes with back-pressure (`push_interleaved_blocking`)
//! - the stream source drains without ever waiting (`pop_nonblocking`)
//!
//! `close()` makes shutdown deterministic: pushes stop, buffered audio can still be drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProducerError;

/// Bounded multi-producer/multi-consumer queue of interleaved `f32` samples.
///
/// A `done` flag is stored under the same mutex as the queue to avoid races.
/// The `channels` count is fixed for the lifetime of the queue.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
    error: Option<ProducerError>,
}

/// Compute a queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// Non-finite or non-positive `buffer_seconds` falls back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `max_buffered_samples` is a cap in samples, not frames.
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
                error: None,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum buffered frames (capacity) for this queue.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        let g = self.lock();
        g.queue.len() / self.channels
    }

    /// Whether the feeding side has closed the queue. Buffered samples may remain.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Closed and nothing left to drain.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.done && g.queue.len() < self.channels
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Close the queue and record why the feeding side stopped.
    ///
    /// The error is reported once by [`SharedAudio::take_error`] after buffered audio drains.
    pub fn close_with_error(&self, error: ProducerError) {
        let mut g = self.lock();
        g.done = true;
        g.error.get_or_insert(error);
        drop(g);
        self.cv.notify_all();
    }

    /// Take the recorded feeding-side error, if any.
    pub fn take_error(&self) -> Option<ProducerError> {
        self.lock().error.take()
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was accepted; the
    /// remaining samples are dropped.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.done {
                return false;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Move up to `max_frames` whole frames into `out` without waiting.
    ///
    /// Returns the number of samples appended (zero when currently empty).
    pub fn pop_nonblocking(&self, max_frames: usize, out: &mut Vec<f32>) -> usize {
        let mut g = self.lock();

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return 0;
        }

        out.extend(g.queue.drain(..take_samples));
        let queued = g.queue.len();

        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(queued);
        take_samples
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::info!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "audio queue low watermark"
                );
            }
        }
    }

    /// Wait up to `timeout` for at least `frames` frames (or for close).
    ///
    /// Returns `true` if the requested amount is buffered when the wait ends.
    pub fn wait_for_frames(&self, frames: usize, timeout: Duration) -> bool {
        let want = frames.max(1).saturating_mul(self.channels).min(self.max_buffered_samples);
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |inner| inner.queue.len() < want && !inner.done)
            .unwrap_or_else(PoisonError::into_inner);
        g.queue.len() >= want
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::INFINITY), 192_000);
    }

    #[test]
    fn pop_nonblocking_empty() {
        let q = SharedAudio::new(2, 16);
        let mut out = Vec::new();
        assert_eq!(q.pop_nonblocking(4, &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn pop_nonblocking_returns_whole_frames() {
        let q = SharedAudio::new(2, 64);
        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = Vec::new();
        assert_eq!(q.pop_nonblocking(8, &mut out), 4);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 0);
    }

    #[test]
    fn pop_nonblocking_respects_max_frames() {
        let q = SharedAudio::new(2, 64);
        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut out = Vec::new();
        assert_eq!(q.pop_nonblocking(2, &mut out), 4);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn push_blocks_until_drained() {
        let q = Arc::new(SharedAudio::new(1, 4));
        let q_push = q.clone();

        let handle = thread::spawn(move || q_push.push_interleaved_blocking(&[0.0; 10]));

        let mut out = Vec::new();
        while out.len() < 10 {
            q.pop_nonblocking(4, &mut out);
            thread::yield_now();
        }
        assert!(handle.join().unwrap());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn close_releases_blocked_pusher() {
        let q = Arc::new(SharedAudio::new(1, 2));
        let q_push = q.clone();

        let handle = thread::spawn(move || q_push.push_interleaved_blocking(&[0.0; 8]));
        while q.len_frames() < 2 {
            thread::yield_now();
        }
        q.close();

        assert!(!handle.join().unwrap());
        assert!(q.is_done());
        assert!(!q.is_drained());
    }

    #[test]
    fn is_drained_after_close_and_pop() {
        let q = SharedAudio::new(2, 16);
        q.push_interleaved_blocking(&[1.0, 2.0]);
        q.close();
        let mut out = Vec::new();
        q.pop_nonblocking(4, &mut out);
        assert!(q.is_drained());
    }

    #[test]
    fn close_with_error_is_reported_once() {
        let q = SharedAudio::new(2, 16);
        q.close_with_error(ProducerError::Decode("bad frame".to_string()));
        q.close_with_error(ProducerError::Other("second".to_string()));
        assert!(q.is_done());
        assert!(matches!(q.take_error(), Some(ProducerError::Decode(msg)) if msg == "bad frame"));
        assert!(q.take_error().is_none());
    }

    #[test]
    fn wait_for_frames_returns_true_when_data_arrives() {
        let q = Arc::new(SharedAudio::new(2, 64));
        let q_push = q.clone();

        let handle = thread::spawn(move || {
            q_push.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0]);
        });

        assert!(q.wait_for_frames(2, Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_frames_returns_false_on_timeout() {
        let q = SharedAudio::new(2, 64);
        assert!(!q.wait_for_frames(1, Duration::from_millis(10)));
    }
}

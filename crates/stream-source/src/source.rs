//! The stream source: a producer plus a read cursor, pulled by a playback engine.
//!
//! ## Locking
//! Two mutexes, always taken in the order `producer` → `state`:
//! - `producer` is held for the duration of producer I/O (read/seek/close/replace)
//! - `state` (cursor, flags, producer bounds, end signal) is held only to read or update
//!   those fields
//!
//! So an engine polling [`StreamSource::position`] never waits on producer I/O, and the
//! cursor is always updated in the same critical section as the producer call it reflects.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::StreamConfig;
use crate::error::{ConfigurationError, FillError, ProducerError, ReplaceError, SeekError};
use crate::format::AudioFormat;
use crate::producer::Producer;
use crate::status::{StreamStats, StreamStatus};

/// A batch of interleaved PCM samples returned by [`StreamSource::fill_chunk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    samples: Vec<i16>,
    continuation: bool,
}

impl Chunk {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// More data may follow. `false` means the stream reached its end.
    pub fn continuation(&self) -> bool {
        self.continuation
    }
}

/// Result of [`StreamSource::fill_into`]: how much of the caller's buffer was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filled {
    pub len: usize,
    pub continuation: bool,
}

#[derive(Debug)]
struct CursorState {
    cursor: u64,
    exhausted: bool,
    closed: bool,
    seekable: bool,
    total_samples: Option<u64>,
    /// Dropped when the stream ends, which disconnects every `end_rx` clone.
    end_tx: Option<Sender<()>>,
    end_rx: Receiver<()>,
}

impl CursorState {
    fn new(seekable: bool, total_samples: Option<u64>) -> Self {
        let (end_tx, end_rx) = crossbeam_channel::bounded(0);
        Self {
            cursor: 0,
            exhausted: false,
            closed: false,
            seekable,
            total_samples,
            end_tx: Some(end_tx),
            end_rx,
        }
    }

    fn mark_exhausted(&mut self) {
        self.exhausted = true;
        self.end_tx = None;
    }

    /// Leave the exhausted state; a fresh end signal is armed if the old one fired.
    fn resume(&mut self) {
        self.exhausted = false;
        if self.end_tx.is_none() && !self.closed {
            let (end_tx, end_rx) = crossbeam_channel::bounded(0);
            self.end_tx = Some(end_tx);
            self.end_rx = end_rx;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pull-based PCM source with a fixed [`AudioFormat`].
///
/// The engine calls [`fill_chunk`](Self::fill_chunk) (or the allocation-free
/// [`fill_into`](Self::fill_into)) from its audio thread and [`seek_to`](Self::seek_to)
/// between pulls. Chunks always hold whole frames.
///
/// Dropping the source closes its producer.
pub struct StreamSource {
    format: AudioFormat,
    config: StreamConfig,
    producer: Mutex<Box<dyn Producer>>,
    state: Mutex<CursorState>,
    stats: StreamStats,
}

impl StreamSource {
    /// Create a source over `producer` with the given format.
    ///
    /// Fails when the producer reports a native format that differs from `format`.
    pub fn open(
        producer: Box<dyn Producer>,
        format: AudioFormat,
        config: StreamConfig,
    ) -> Result<Self, ConfigurationError> {
        check_format(&*producer, format)?;

        let seekable = producer.is_seekable();
        let total_samples = producer.total_samples();
        tracing::info!(
            format = %format,
            seekable,
            total_samples = ?total_samples,
            "stream source opened"
        );

        Ok(Self {
            format,
            config,
            producer: Mutex::new(producer),
            state: Mutex::new(CursorState::new(seekable, total_samples)),
            stats: StreamStats::default(),
        })
    }

    /// Like [`open`](Self::open), validating raw channel count and sample rate first.
    pub fn create(
        producer: Box<dyn Producer>,
        channels: u16,
        sample_rate: u32,
        config: StreamConfig,
    ) -> Result<Self, ConfigurationError> {
        let format = AudioFormat::new(channels, sample_rate)?;
        Self::open(producer, format, config)
    }

    /// Pull up to `capacity` samples (rounded down to whole frames).
    ///
    /// Returns promptly: a starved producer yields a short or empty chunk with
    /// `continuation == true`. Once the stream is exhausted every call returns an empty,
    /// non-continuing chunk until the next successful seek.
    ///
    /// The chunk buffer is sized by what the stream can still deliver (or by
    /// [`StreamConfig::chunk_frames`] when that is larger or unknown), not by `capacity`.
    pub fn fill_chunk(&self, capacity: usize) -> Result<Chunk, FillError> {
        let channels = self.format.channels();
        if capacity < channels as usize {
            return Err(FillError::Capacity { capacity, channels });
        }
        let mut samples = vec![0i16; self.format.align_samples(capacity.min(self.chunk_bound()))];
        let filled = self.fill_into(&mut samples)?;
        samples.truncate(filled.len);
        Ok(Chunk {
            samples,
            continuation: filled.continuation,
        })
    }

    /// Largest buffer `fill_chunk` allocates: the samples left in a bounded stream, but
    /// never less than one configured chunk.
    fn chunk_bound(&self) -> usize {
        let floor = self
            .config
            .chunk_frames
            .max(1)
            .saturating_mul(self.format.channels() as usize);
        let st = lock(&self.state);
        match st.total_samples {
            Some(total) => {
                let remaining = total.saturating_sub(st.cursor);
                usize::try_from(remaining).unwrap_or(usize::MAX).max(floor)
            }
            None => floor,
        }
    }

    /// Allocation-free variant of [`fill_chunk`](Self::fill_chunk) writing into `out`.
    pub fn fill_into(&self, out: &mut [i16]) -> Result<Filled, FillError> {
        let want = self.format.align_samples(out.len());
        if want == 0 {
            return Err(FillError::Capacity {
                capacity: out.len(),
                channels: self.format.channels(),
            });
        }

        let mut producer = lock(&self.producer);
        {
            let st = lock(&self.state);
            if st.closed {
                return Err(FillError::Closed);
            }
            if st.exhausted {
                self.stats.record_chunk(0, want, false);
                return Ok(Filled {
                    len: 0,
                    continuation: false,
                });
            }
        }

        let read = match producer.read(&mut out[..want]) {
            Ok(r) => r,
            Err(e) => {
                self.stats.record_producer_error();
                tracing::warn!(error = %e, "producer read failed");
                return Err(e.into());
            }
        };
        if read.len > want || self.format.align_samples(read.len) != read.len {
            self.stats.record_producer_error();
            tracing::warn!(len = read.len, want, "producer broke the whole-frame contract");
            return Err(ProducerError::Other(format!(
                "producer returned {} samples for a request of {want}; not whole {} frames",
                read.len, self.format
            ))
            .into());
        }
        let len = read.len;
        let continuation = !read.end_of_data;

        let mut st = lock(&self.state);
        st.cursor += len as u64;
        if len == 0 && read.end_of_data {
            st.mark_exhausted();
            tracing::info!(cursor = st.cursor, "stream exhausted");
        }
        drop(st);
        drop(producer);

        self.stats.record_chunk(len, want, continuation);
        tracing::trace!(len, want, continuation, "chunk filled");
        Ok(Filled { len, continuation })
    }

    /// Reposition the cursor to `timestamp` and clear the exhausted state.
    ///
    /// The target is rounded to the nearest whole frame. For bounded producers a target
    /// past the end is clamped when [`StreamConfig::clamp_seek`] is set, otherwise
    /// rejected. On any error the cursor and exhausted state are left unchanged.
    pub fn seek_to(&self, timestamp: Duration) -> Result<(), SeekError> {
        let mut producer = lock(&self.producer);
        let (seekable, total_samples) = {
            let st = lock(&self.state);
            if st.closed {
                return Err(SeekError::Closed);
            }
            (st.seekable, st.total_samples)
        };
        if !seekable {
            return Err(SeekError::Unsupported);
        }

        let mut target = self.format.duration_to_samples(timestamp);
        if let Some(total) = total_samples {
            let end = self.format.frames_to_samples(self.format.samples_to_frames(total));
            if target > end {
                if !self.config.clamp_seek {
                    return Err(SeekError::OutOfRange {
                        requested: timestamp,
                        max: self.format.samples_to_duration(end),
                    });
                }
                target = end;
            }
        }

        if let Err(e) = producer.seek(target) {
            self.stats.record_producer_error();
            tracing::warn!(error = %e, target, "producer seek failed");
            return Err(e.into());
        }

        let mut st = lock(&self.state);
        st.cursor = target;
        st.resume();
        drop(st);
        drop(producer);

        self.stats.record_seek();
        tracing::info!(
            target,
            position_ms = self.format.samples_to_duration(target).as_millis() as u64,
            "stream seek"
        );
        Ok(())
    }

    /// Switch to `producer` without tearing down the source.
    ///
    /// With `keep_position` the new producer is sought to the current cursor (clamped to its
    /// end), otherwise playback restarts at zero. The exhausted state is cleared and the old
    /// producer is closed. On error the current producer stays in place and `producer` is
    /// closed.
    pub fn replace_producer(
        &self,
        mut producer: Box<dyn Producer>,
        keep_position: bool,
    ) -> Result<(), ReplaceError> {
        let mut current = lock(&self.producer);
        let res = self.prepare_replacement(&mut *producer, keep_position);
        let target = match res {
            Ok(target) => target,
            Err(e) => {
                if let Err(close_err) = producer.close() {
                    tracing::debug!(error = %close_err, "rejected producer close failed");
                }
                return Err(e);
            }
        };

        let seekable = producer.is_seekable();
        let total_samples = producer.total_samples();
        let mut old = std::mem::replace(&mut *current, producer);

        let mut st = lock(&self.state);
        st.cursor = target;
        st.seekable = seekable;
        st.total_samples = total_samples;
        st.resume();
        drop(st);
        drop(current);

        self.stats.record_switch();
        tracing::info!(
            target,
            seekable,
            total_samples = ?total_samples,
            "stream producer replaced"
        );
        if let Err(e) = old.close() {
            tracing::warn!(error = %e, "replaced producer close failed");
        }
        Ok(())
    }

    /// Validate `producer` and move it to the resume position. Called with the producer
    /// lock held.
    fn prepare_replacement(
        &self,
        producer: &mut dyn Producer,
        keep_position: bool,
    ) -> Result<u64, ReplaceError> {
        check_format(producer, self.format)?;
        let cursor = {
            let st = lock(&self.state);
            if st.closed {
                return Err(ReplaceError::Closed);
            }
            st.cursor
        };
        if !keep_position || cursor == 0 {
            return Ok(0);
        }
        if !producer.is_seekable() {
            return Err(ReplaceError::NotSeekable { position: cursor });
        }
        let target = match producer.total_samples() {
            Some(total) => {
                let end = self.format.frames_to_samples(self.format.samples_to_frames(total));
                cursor.min(end)
            }
            None => cursor,
        };
        producer.seek(target)?;
        Ok(target)
    }

    /// Close the producer. Idempotent: later calls are no-ops returning `Ok(())`.
    ///
    /// The producer's close error, if any, is reported by the first call only.
    pub fn close(&self) -> Result<(), ProducerError> {
        let mut producer = lock(&self.producer);
        {
            let mut st = lock(&self.state);
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.end_tx = None;
        }
        let res = producer.close();
        tracing::info!(ok = res.is_ok(), "stream source closed");
        res
    }

    /// A receiver that disconnects once the stream is exhausted or closed.
    ///
    /// Nothing is ever sent: `recv` blocks while the stream runs and returns `Err` when it
    /// ends. A seek or producer replacement after the end arms a new signal, so ask again
    /// afterwards.
    pub fn end_signal(&self) -> Receiver<()> {
        lock(&self.state).end_rx.clone()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_seekable(&self) -> bool {
        lock(&self.state).seekable
    }

    /// Cursor as an interleaved sample index.
    pub fn cursor(&self) -> u64 {
        lock(&self.state).cursor
    }

    pub fn position(&self) -> Duration {
        self.format.samples_to_duration(self.cursor())
    }

    /// Total duration for bounded producers.
    pub fn duration(&self) -> Option<Duration> {
        lock(&self.state)
            .total_samples
            .map(|total| self.format.samples_to_duration(total))
    }

    pub fn is_exhausted(&self) -> bool {
        lock(&self.state).exhausted
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn stats(&self) -> StreamStatus {
        let mut status = self.stats.snapshot();
        let (cursor, exhausted) = {
            let st = lock(&self.state);
            (st.cursor, st.exhausted)
        };
        status.position_ms = Some(self.format.samples_to_duration(cursor).as_millis() as u64);
        status.duration_ms = self.duration().map(|d| d.as_millis() as u64);
        status.exhausted = exhausted;
        status
    }
}

fn check_format(producer: &dyn Producer, format: AudioFormat) -> Result<(), ConfigurationError> {
    match producer.native_format() {
        Some(native) if native != format => Err(ConfigurationError::FormatMismatch {
            requested: format,
            producer: native,
        }),
        _ => Ok(()),
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "producer close failed on drop");
        }
    }
}

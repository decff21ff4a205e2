//! Playback stage (CPAL output stream).
//!
//! Builds the CPAL output stream and provides the real-time audio callback.
//! The callback:
//! - pulls whole-frame chunks from the [`StreamSource`] into a preallocated buffer
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `i16` samples to the device sample format
//!
//! End of stream is reported once per exhaustion through a [`PlaybackEvent`] channel; the
//! callback writes silence until the source delivers again (after a seek or a producer
//! replacement). Repeated producer errors fail playback for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;
use crossbeam_channel::Sender;
use stream_source::sample::map_sample;
use stream_source::{FillError, StreamSource};

/// Consecutive producer errors tolerated before playback gives up.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 8;

/// Something the main thread needs to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The source is exhausted and every sample was written. Playback resumes if the
    /// source is sought or given a new producer.
    Ended,
    /// A producer error was forwarded; playback continues with silence for this period.
    ProducerError(String),
    /// Playback cannot continue.
    Failed(String),
}

/// Counts consecutive failures and trips after `max` of them.
#[derive(Debug)]
pub struct ErrorBudget {
    max: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            consecutive: 0,
        }
    }

    /// Record a failure. Returns `true` when the budget is spent.
    pub fn record_error(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.max
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Configuration for the playback stage (CPAL output callback).
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Frames pulled from the source per refill.
    pub chunk_frames: usize,

    pub max_consecutive_errors: u32,

    /// Incremented by the number of output frames produced from source data.
    pub played_frames: Arc<AtomicU64>,

    /// Incremented when the callback has to output silence while the stream continues.
    pub underrun_frames: Arc<AtomicU64>,
    pub underrun_events: Arc<AtomicU64>,

    pub events: Sender<PlaybackEvent>,
}

/// Build a CPAL output stream that plays audio from `source`.
///
/// The device must run at the source's sample rate; only the channel count may differ.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    source: &Arc<StreamSource>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    let source_rate = source.format().sample_rate();
    if config.sample_rate != source_rate {
        return Err(anyhow!(
            "device rate {} Hz does not match source rate {source_rate} Hz",
            config.sample_rate
        ));
    }
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, source, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, source, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, source, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, source, cfg),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    source: &Arc<StreamSource>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let channels_out = config.channels as usize;
    let mut state = PlaybackState::new(source.clone(), &cfg);

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let filled = state.render(data.len() / channels_out, channels_out, |idx, s| {
                data[idx] = <T as cpal::Sample>::from_sample::<i16>(s);
            });
            let silent_from = filled * channels_out;
            for out in &mut data[silent_from..] {
                *out = <T as cpal::Sample>::from_sample::<i16>(0);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Callback-owned state: the refill buffer plus bookkeeping.
struct PlaybackState {
    source: Arc<StreamSource>,
    src_channels: usize,
    buf: Vec<i16>,
    pos: usize,
    len: usize,
    ended: bool,
    failed: bool,
    budget: ErrorBudget,
    played_frames: Arc<AtomicU64>,
    underrun_frames: Arc<AtomicU64>,
    underrun_events: Arc<AtomicU64>,
    events: Sender<PlaybackEvent>,
}

impl PlaybackState {
    fn new(source: Arc<StreamSource>, cfg: &PlaybackConfig) -> Self {
        let src_channels = source.format().channels() as usize;
        let buf = vec![0i16; cfg.chunk_frames.max(1) * src_channels];
        Self {
            source,
            src_channels,
            buf,
            pos: 0,
            len: 0,
            ended: false,
            failed: false,
            budget: ErrorBudget::new(cfg.max_consecutive_errors),
            played_frames: cfg.played_frames.clone(),
            underrun_frames: cfg.underrun_frames.clone(),
            underrun_events: cfg.underrun_events.clone(),
            events: cfg.events.clone(),
        }
    }

    /// Write up to `frames` output frames through `write(index, sample)`.
    ///
    /// Returns the number of frames written; the caller fills the rest with silence.
    fn render(
        &mut self,
        frames: usize,
        channels_out: usize,
        mut write: impl FnMut(usize, i16),
    ) -> usize {
        let mut filled = 0usize;
        while filled < frames {
            if self.pos >= self.len && !self.refill() {
                if !self.ended && !self.failed {
                    self.underrun_events.fetch_add(1, Ordering::Relaxed);
                    self.underrun_frames
                        .fetch_add((frames - filled) as u64, Ordering::Relaxed);
                }
                break;
            }
            let frame = &self.buf[self.pos..self.pos + self.src_channels];
            for ch in 0..channels_out {
                write(filled * channels_out + ch, map_sample(frame, channels_out, ch));
            }
            self.pos += self.src_channels;
            filled += 1;
        }
        if filled > 0 {
            self.played_frames.fetch_add(filled as u64, Ordering::Relaxed);
        }
        filled
    }

    /// Pull the next chunk. Returns `false` when nothing is available for this period.
    fn refill(&mut self) -> bool {
        if self.failed {
            return false;
        }
        self.pos = 0;
        self.len = 0;
        match self.source.fill_into(&mut self.buf) {
            Ok(filled) if filled.len > 0 => {
                self.ended = false;
                self.budget.reset();
                self.len = filled.len;
                true
            }
            Ok(filled) => {
                if !filled.continuation && !self.ended {
                    self.ended = true;
                    let _ = self.events.try_send(PlaybackEvent::Ended);
                }
                false
            }
            Err(FillError::Producer(e)) => {
                if self.budget.record_error() {
                    self.fail(format!("producer failed: {e}"));
                } else {
                    let _ = self.events.try_send(PlaybackEvent::ProducerError(e.to_string()));
                }
                false
            }
            Err(e) => {
                self.fail(e.to_string());
                false
            }
        }
    }

    fn fail(&mut self, msg: String) {
        self.failed = true;
        let _ = self.events.try_send(PlaybackEvent::Failed(msg));
    }
}

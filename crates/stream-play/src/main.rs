//! stream-play: drive a pull-based `StreamSource` from a CPAL output callback or an
//! offline WAV renderer.
//!
//! ## Engines
//! - `play`: the CPAL callback pulls whole-frame chunks from the source and writes them to
//!   the device. With `--live`, a background thread decodes into a bounded queue and the
//!   source reads from it without blocking (non-seekable).
//! - `render`: pulls the source to completion and writes a 16-bit WAV file.
//!
//! `--then` queues more files: when the source ends, the next file's producer replaces the
//! exhausted one and the engine keeps pulling from the same source.
//!
//! Both engines print the source's final status counters as JSON on stdout.

mod cli;
mod device;
mod playback;
mod render;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cpal::traits::{DeviceTrait, StreamTrait};
use stream_source::decode::{DecodeProducer, start_streaming_decode};
use stream_source::live::LiveProducer;
use stream_source::sample::SampleConversion;
use stream_source::{AudioFormat, Producer, StreamConfig, StreamSource};
use tracing_subscriber::EnvFilter;

use playback::{DEFAULT_MAX_CONSECUTIVE_ERRORS, PlaybackConfig, PlaybackEvent};

/// How long a live source may take to prebuffer before playback starts anyway.
const PREBUFFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Time left for the device to play out its last buffer after the source ends.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_play=info,stream_source=info")
        }))
        .init();

    let config = load_config(&args)?;
    tracing::debug!(?config, "stream config");

    match &args.cmd {
        cli::Command::Devices => {
            let host = cpal::default_host();
            device::list_devices(&host)?;
        }
        cli::Command::Play {
            path,
            seek_ms,
            live,
            then,
        } => {
            let source = open_source(path, &config, *live, None)?;
            seek_if_requested(&source, *seek_ms)?;
            let next = NextFiles::new(then, &config, *live, None);
            play(&args, source, next)?;
        }
        cli::Command::Render {
            path,
            out,
            seek_ms,
            channels,
            then,
        } => {
            let source = open_source(path, &config, false, *channels)?;
            seek_if_requested(&source, *seek_ms)?;
            let channels = source.format().channels();
            let mut next = NextFiles::new(then, &config, false, Some(channels));
            let summary = render::render_to_wav(
                &source,
                out,
                channels,
                DEFAULT_MAX_CONSECUTIVE_ERRORS,
                || next.open_next(),
            )?;
            source.close().context("close source")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", serde_json::to_string_pretty(&source.stats())?);
        }
    }

    Ok(())
}

/// File config first, then command-line overrides.
fn load_config(args: &cli::Args) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    if let Some(frames) = args.chunk_frames {
        config.chunk_frames = frames.max(1);
    }
    if let Some(secs) = args.buffer_seconds {
        config.buffer_seconds = secs;
    }
    if args.no_clamp_seek {
        config.clamp_seek = false;
    }
    if args.soft_limit {
        config.conversion = SampleConversion::SoftLimit;
    }
    Ok(config)
}

fn open_source(
    path: &Path,
    config: &StreamConfig,
    live: bool,
    channels: Option<u16>,
) -> Result<Arc<StreamSource>> {
    let (producer, format) = open_producer(path, config, live, channels)?;
    Ok(Arc::new(StreamSource::open(producer, format, config.clone())?))
}

/// Build the producer for `path`: a background decode behind a live queue, or a seekable
/// decoder (optionally remapped to `channels`).
fn open_producer(
    path: &Path,
    config: &StreamConfig,
    live: bool,
    channels: Option<u16>,
) -> Result<(Box<dyn Producer>, AudioFormat)> {
    if live {
        let (format, queue, info) = start_streaming_decode(path, config.buffer_seconds)?;
        tracing::info!(
            codec = info.codec.as_deref().unwrap_or("unknown"),
            duration_ms = ?info.duration_ms,
            "live decode started"
        );
        let prebuffer_frames = (format.sample_rate() as f32 * config.buffer_seconds * 0.5) as usize;
        if !queue.wait_for_frames(prebuffer_frames.min(queue.max_frames()), PREBUFFER_TIMEOUT) {
            tracing::warn!(
                buffered_frames = queue.len_frames(),
                "prebuffer timed out; starting anyway"
            );
        }
        let producer = LiveProducer::new(format, queue, config.conversion);
        Ok((Box::new(producer), format))
    } else {
        let mut producer = DecodeProducer::open(path)?.with_conversion(config.conversion);
        if let Some(channels) = channels {
            producer = producer.with_output_channels(channels)?;
        }
        let format = producer.format();
        Ok((Box::new(producer), format))
    }
}

/// Files queued with `--then`, opened one at a time as the source runs out.
struct NextFiles {
    paths: VecDeque<PathBuf>,
    config: StreamConfig,
    live: bool,
    channels: Option<u16>,
}

impl NextFiles {
    fn new(paths: &[PathBuf], config: &StreamConfig, live: bool, channels: Option<u16>) -> Self {
        Self {
            paths: paths.iter().cloned().collect(),
            config: config.clone(),
            live,
            channels,
        }
    }

    fn open_next(&mut self) -> Result<Option<Box<dyn Producer>>> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        tracing::info!(path = ?path, remaining = self.paths.len(), "next source");
        let (producer, _) = open_producer(&path, &self.config, self.live, self.channels)
            .with_context(|| format!("open {path:?}"))?;
        Ok(Some(producer))
    }
}

fn seek_if_requested(source: &StreamSource, seek_ms: Option<u64>) -> Result<()> {
    if let Some(ms) = seek_ms {
        source
            .seek_to(Duration::from_millis(ms))
            .with_context(|| format!("seek to {ms} ms"))?;
        tracing::info!(position_ms = source.position().as_millis() as u64, "seeked");
    }
    Ok(())
}

fn play(args: &cli::Args, source: Arc<StreamSource>, mut next: NextFiles) -> Result<()> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, args.device.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");

    let supported = device::pick_output_config(&device, source.format())?;
    let sample_format = supported.sample_format();
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    if let Some(buf) = device::pick_buffer_size(&supported, source.config().chunk_frames) {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        source = %source.format(),
        output_channels = stream_config.channels,
        output_rate_hz = stream_config.sample_rate,
        buffer_size = ?stream_config.buffer_size,
        "device output config"
    );

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let played_frames = Arc::new(AtomicU64::new(0));
    let underrun_frames = Arc::new(AtomicU64::new(0));
    let underrun_events = Arc::new(AtomicU64::new(0));

    let stream = playback::build_output_stream(
        &device,
        &stream_config,
        sample_format,
        &source,
        PlaybackConfig {
            chunk_frames: source.config().chunk_frames,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            played_frames: played_frames.clone(),
            underrun_frames: underrun_frames.clone(),
            underrun_events: underrun_events.clone(),
            events: events_tx,
        },
    )?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    stream.play()?;

    let outcome = loop {
        crossbeam_channel::select! {
            recv(events_rx) -> ev => match ev {
                Ok(PlaybackEvent::Ended) => match next.open_next() {
                    Ok(Some(producer)) => {
                        if let Err(e) = source.replace_producer(producer, false) {
                            break Err(e).context("switch to next source");
                        }
                    }
                    Ok(None) => {
                        std::thread::sleep(DRAIN_GRACE);
                        tracing::info!("playback finished");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
                Ok(PlaybackEvent::ProducerError(msg)) => {
                    tracing::warn!(error = %msg, "producer error");
                }
                Ok(PlaybackEvent::Failed(msg)) => break Err(anyhow!(msg)),
                Err(_) => break Err(anyhow!("playback callback went away")),
            },
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                break Ok(());
            }
            default(Duration::from_secs(1)) => {
                tracing::info!(
                    position_ms = source.position().as_millis() as u64,
                    duration_ms = ?source.duration().map(|d| d.as_millis() as u64),
                    underruns = underrun_events.load(Ordering::Relaxed),
                    "playing"
                );
            }
        }
    };

    drop(stream);
    source.close().context("close source")?;
    tracing::info!(
        played_frames = played_frames.load(Ordering::Relaxed),
        underrun_frames = underrun_frames.load(Ordering::Relaxed),
        underrun_events = underrun_events.load(Ordering::Relaxed),
        "playback stats"
    );
    println!("{}", serde_json::to_string_pretty(&source.stats())?);
    outcome
}

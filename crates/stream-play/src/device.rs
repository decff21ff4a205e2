//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting the default device, a device by its `#N` listing index, or by name substring
//! - choosing an output config that can play a stream format as-is

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait};
use stream_source::AudioFormat;

/// How `--device` names an output device.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DeviceSelector {
    /// Position in the `devices` listing (`#2` or `2`).
    Index(usize),
    /// Case-insensitive substring of the device name.
    Name(String),
}

impl DeviceSelector {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("empty device selector");
        }
        let digits = raw.strip_prefix('#').unwrap_or(raw);
        match digits.parse::<usize>() {
            Ok(index) => Ok(Self::Index(index)),
            Err(_) if raw.starts_with('#') => bail!("invalid device index: {raw}"),
            Err(_) => Ok(Self::Name(raw.to_lowercase())),
        }
    }

    /// Position of the selected device among `names`, in listing order.
    fn position(&self, names: &[String]) -> Option<usize> {
        match self {
            Self::Index(i) => (*i < names.len()).then_some(*i),
            Self::Name(needle) => names.iter().position(|n| n.to_lowercase().contains(needle)),
        }
    }
}

/// Pick the output device named by `selector`, or the host default when there is none.
pub fn pick_device(host: &cpal::Host, selector: Option<&str>) -> Result<cpal::Device> {
    let Some(raw) = selector else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };
    let selector = DeviceSelector::parse(raw)?;

    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();
    let names: Vec<String> = devices
        .iter()
        .map(|d| d.description().map(|desc| desc.name().to_string()).unwrap_or_default())
        .collect();

    match selector.position(&names) {
        Some(i) => Ok(devices.swap_remove(i)),
        None => bail!("No output device matched {raw:?} ({} devices listed)", names.len()),
    }
}

/// Choose an output config that plays `format` without resampling.
///
/// The sample rate must be supported exactly. Among matching configs, prefer the stream's
/// channel count, then the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    format: AudioFormat,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let target = format.sample_rate();
    let mut best: Option<(bool, u8, cpal::SupportedStreamConfig)> = None;
    let mut nearest = None;

    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target);
        if rate != target {
            nearest = Some(rate);
            continue;
        }
        let channels_match = range.channels() == format.channels();
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_match, b_rank, _)) => {
                is_better_candidate(channels_match, format_rank, *b_match, *b_rank)
            }
        };
        if replace {
            best = Some((channels_match, format_rank, range.with_sample_rate(rate)));
        }
    }

    match best {
        Some((_, _, cfg)) => Ok(cfg),
        None => bail!(
            "device cannot play {target} Hz (nearest supported: {}); resampling is not supported",
            nearest.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string())
        ),
    }
}

/// Device buffer size for pulling `chunk_frames` per callback.
///
/// Asks for one source chunk per period, moved into the device's supported range.
/// `None` leaves the choice to the backend.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    chunk_frames: usize,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => Some(cpal::BufferSize::Fixed(
            buffer_frames_within(*min, *max, chunk_frames),
        )),
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn buffer_frames_within(min: u32, max: u32, chunk_frames: usize) -> u32 {
    let wanted = u32::try_from(chunk_frames).unwrap_or(u32::MAX);
    wanted.clamp(min, max.max(min))
}

/// Print available output devices to stdout.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(channels_match: bool, rank: u8, best_match: bool, best_rank: u8) -> bool {
    if channels_match != best_match {
        channels_match
    } else {
        rank < best_rank
    }
}

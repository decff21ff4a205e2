//! Symphonia-backed producers.
//!
//! Two ways to turn a container/codec into PCM:
//! - [`DecodeProducer`] decodes synchronously, on demand, inside `read` (seekable)
//! - [`start_streaming_decode`] decodes on a background thread into a bounded
//!   [`SharedAudio`] queue, drained by a [`crate::live::LiveProducer`]

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::ProducerError;
use crate::format::AudioFormat;
use crate::producer::{Producer, ProducerRead};
use crate::queue::{SharedAudio, calc_max_buffered_samples};
use crate::sample::{SampleConversion, remap_channels};

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Container/extension hint (best-effort).
    pub container: Option<String>,
    /// Total duration in milliseconds when the container reports it.
    pub duration_ms: Option<u64>,
}

struct Probed {
    reader: Box<dyn FormatReader>,
    track_id: u32,
    codec_params: CodecParameters,
    format: AudioFormat,
    info: SourceInfo,
    seekable: bool,
}

fn probe_media_source(
    source: Box<dyn MediaSource>,
    hint: Hint,
    container: Option<String>,
) -> Result<Probed> {
    let seekable = source.is_seekable();
    let mss = MediaSourceStream::new(source, Default::default());

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channels = u16::try_from(channels).context("channel count")?;
    let format = AudioFormat::new(channels, rate)?;

    let codec_params = track.codec_params.clone();
    let info = SourceInfo {
        codec: codec_name_from_params(&codec_params),
        bit_depth: codec_params
            .bits_per_sample
            .or(codec_params.bits_per_coded_sample)
            .and_then(|v| u16::try_from(v).ok()),
        container,
        duration_ms: duration_ms_from_codec_params(&codec_params),
    };

    Ok(Probed {
        track_id: track.id,
        reader,
        codec_params,
        format,
        info,
        seekable,
    })
}

fn open_file(path: &Path) -> Result<Probed> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    let ext = path.extension().and_then(|e| e.to_str());
    if let Some(ext) = ext {
        hint.with_extension(ext);
    }
    probe_media_source(Box::new(file), hint, ext.map(str::to_string))
        .with_context(|| format!("probe {:?}", path))
}

/// Open decoder state; dropped on close to release the underlying file or socket.
struct DecodeState {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
}

/// Seekable producer that decodes packets on demand.
///
/// Packets are decoded to `f32`, converted to `i16` with the configured [`SampleConversion`]
/// and, when an output channel count is requested, remapped (mono↔stereo, best-effort
/// otherwise). The sample rate is never changed.
pub struct DecodeProducer {
    state: Option<DecodeState>,
    track_id: u32,
    time_base: Option<TimeBase>,
    native: AudioFormat,
    output: AudioFormat,
    total_frames: Option<u64>,
    seekable: bool,
    info: SourceInfo,
    conversion: SampleConversion,
    converted: Vec<i16>,
    pending: Vec<i16>,
    pending_pos: usize,
    skip_frames: u64,
    eof: bool,
    deferred_error: Option<ProducerError>,
}

impl DecodeProducer {
    /// Open and probe a local file. The extension is used as a container hint.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_probed(open_file(path)?)
    }

    /// Open any Symphonia [`MediaSource`] (seekable or not).
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        Self::from_probed(probe_media_source(source, hint, None)?)
    }

    fn from_probed(probed: Probed) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(&probed.codec_params, &DecoderOptions::default())?;

        tracing::info!(
            format = %probed.format,
            codec = probed.info.codec.as_deref().unwrap_or("unknown"),
            duration_ms = ?probed.info.duration_ms,
            seekable = probed.seekable,
            "decoder opened"
        );

        Ok(Self {
            state: Some(DecodeState {
                reader: probed.reader,
                decoder,
            }),
            track_id: probed.track_id,
            time_base: probed.codec_params.time_base,
            native: probed.format,
            output: probed.format,
            total_frames: probed.codec_params.n_frames,
            seekable: probed.seekable,
            info: probed.info,
            conversion: SampleConversion::default(),
            converted: Vec::new(),
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            eof: false,
            deferred_error: None,
        })
    }

    /// Emit `channels` channels instead of the source layout.
    pub fn with_output_channels(mut self, channels: u16) -> Result<Self> {
        self.output = AudioFormat::new(channels, self.native.sample_rate())?;
        Ok(self)
    }

    /// Use `conversion` for `f32` → `i16` (defaults to [`SampleConversion::Clamp`]).
    pub fn with_conversion(mut self, conversion: SampleConversion) -> Self {
        self.conversion = conversion;
        self
    }

    /// Output format of this producer (after channel remapping).
    pub fn format(&self) -> AudioFormat {
        self.output
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Decode the next packet of our track into `pending`.
    ///
    /// Returns `Ok(false)` at end of stream.
    fn decode_next(&mut self) -> Result<bool, ProducerError> {
        let state = self.state.as_mut().ok_or(ProducerError::Closed)?;
        loop {
            let packet = match state.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = state.decoder.decode(&packet)?;
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let spec = *decoded.spec();
            let src_channels = spec.channels.count();
            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let mut samples = sample_buf.samples();
            if self.skip_frames > 0 {
                let skip = self.skip_frames.min(frames as u64);
                self.skip_frames -= skip;
                samples = &samples[(skip as usize * src_channels).min(samples.len())..];
                if samples.is_empty() {
                    continue;
                }
            }

            self.converted.resize(samples.len(), 0);
            self.conversion.convert_into(samples, &mut self.converted);
            self.pending =
                remap_channels(&self.converted, src_channels, self.output.channels() as usize);
            self.pending_pos = 0;
            return Ok(true);
        }
    }

    fn frames_between(&self, from_ts: u64, to_ts: u64) -> u64 {
        let delta = to_ts.saturating_sub(from_ts);
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(delta);
                let rate = self.native.sample_rate() as u64;
                time.seconds * rate + (time.frac * rate as f64) as u64
            }
            None => delta,
        }
    }
}

impl Producer for DecodeProducer {
    fn read(&mut self, out: &mut [i16]) -> Result<ProducerRead, ProducerError> {
        if self.state.is_none() {
            return Err(ProducerError::Closed);
        }
        if let Some(err) = self.deferred_error.take() {
            return Err(err);
        }

        let want = self.output.align_samples(out.len());
        let mut written = 0;
        while written < want {
            if self.pending_pos < self.pending.len() {
                let n = (self.pending.len() - self.pending_pos).min(want - written);
                out[written..written + n]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                written += n;
                continue;
            }
            if self.eof {
                break;
            }
            match self.decode_next() {
                Ok(true) => {}
                Ok(false) => self.eof = true,
                // Hand out what we have; report the failure on the next read.
                Err(e) if written > 0 => {
                    self.deferred_error = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if self.eof && self.pending_pos >= self.pending.len() {
            Ok(ProducerRead::end(written))
        } else {
            Ok(ProducerRead::data(written))
        }
    }

    fn seek(&mut self, sample: u64) -> Result<(), ProducerError> {
        let frame = self.output.samples_to_frames(sample);
        self.pending.clear();
        self.pending_pos = 0;
        self.deferred_error = None;
        self.skip_frames = 0;

        if self.total_frames.is_some_and(|total| frame >= total) {
            self.eof = true;
            return Ok(());
        }

        let rate = self.native.sample_rate() as u64;
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);
        let track_id = self.track_id;
        let state = self.state.as_mut().ok_or(ProducerError::Closed)?;
        let seeked = state.reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track_id),
            },
        )?;
        state.decoder.reset();

        self.skip_frames = self.frames_between(seeked.actual_ts, seeked.required_ts);
        self.eof = false;
        tracing::debug!(
            frame,
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            skip_frames = self.skip_frames,
            "decoder seek"
        );
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn total_samples(&self) -> Option<u64> {
        self.total_frames.map(|f| self.output.frames_to_samples(f))
    }

    fn native_format(&self) -> Option<AudioFormat> {
        Some(self.output)
    }

    fn close(&mut self) -> Result<(), ProducerError> {
        if self.state.take().is_some() {
            tracing::debug!(track_id = self.track_id, "decoder closed");
        }
        self.pending.clear();
        Ok(())
    }
}

/// Start a background decoder thread that streams interleaved `f32` samples from `path`.
///
/// Returns the source format, the queue, and captured source metadata.
pub fn start_streaming_decode(
    path: &Path,
    buffer_seconds: f32,
) -> Result<(AudioFormat, Arc<SharedAudio>, SourceInfo)> {
    start_streaming_decode_probed(open_file(path)?, buffer_seconds)
}

/// Start decoding from an arbitrary Symphonia [`MediaSource`] on a background thread.
///
/// The queue is closed on EOF, closed with an error on failure, and the thread exits early
/// when the consuming side closes the queue.
pub fn start_streaming_decode_from_media_source(
    source: Box<dyn MediaSource>,
    hint: Hint,
    buffer_seconds: f32,
) -> Result<(AudioFormat, Arc<SharedAudio>, SourceInfo)> {
    start_streaming_decode_probed(probe_media_source(source, hint, None)?, buffer_seconds)
}

fn start_streaming_decode_probed(
    probed: Probed,
    buffer_seconds: f32,
) -> Result<(AudioFormat, Arc<SharedAudio>, SourceInfo)> {
    let decoder = symphonia::default::get_codecs()
        .make(&probed.codec_params, &DecoderOptions::default())?;

    let format = probed.format;
    let channels = format.channels() as usize;
    let max_buffered_samples =
        calc_max_buffered_samples(format.sample_rate(), channels, buffer_seconds);
    let shared = Arc::new(SharedAudio::new(channels, max_buffered_samples));

    let shared_for_thread = shared.clone();
    let track_id = probed.track_id;
    let reader = probed.reader;

    thread::Builder::new()
        .name("stream-decode".to_string())
        .spawn(move || match decode_format_loop(reader, decoder, track_id, &shared_for_thread) {
            Ok(()) => shared_for_thread.close(),
            Err(e) => {
                tracing::error!(error = %e, "decoder thread error");
                shared_for_thread.close_with_error(e);
            }
        })
        .context("spawn decoder thread")?;

    Ok((format, shared, probed.info))
}

/// Undecodable packets in a row before the background decoder gives up.
const MAX_SKIPPED_PACKETS: u32 = 16;

/// Decode packets from a probed `FormatReader` and push interleaved `f32` into `shared`.
///
/// Isolated corrupt packets are skipped; a run of [`MAX_SKIPPED_PACKETS`] fails with
/// [`ProducerError::Decode`] so the consumer sees the kind of failure.
fn decode_format_loop(
    mut reader: Box<dyn FormatReader>,
    mut decoder: Box<dyn Decoder>,
    track_id: u32,
    shared: &Arc<SharedAudio>,
) -> Result<(), ProducerError> {
    let mut skipped = 0u32;
    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => {
                skipped += 1;
                if skipped >= MAX_SKIPPED_PACKETS {
                    return Err(ProducerError::Decode(format!(
                        "{skipped} undecodable packets in a row: {msg}"
                    )));
                }
                tracing::warn!(error = msg, skipped, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        skipped = 0;
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        if !shared.push_interleaved_blocking(sample_buf.samples()) {
            tracing::debug!("decode queue closed by consumer");
            break;
        }
    }

    Ok(())
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used in logs and status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

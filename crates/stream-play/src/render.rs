//! Offline engine: pull a stream source to completion and write a 16-bit WAV file.
//!
//! When the source runs out, the caller may hand over the next producer and rendering
//! carries on into the same file.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use stream_source::sample::remap_channels;
use stream_source::{FillError, Producer, StreamSource};

use crate::playback::ErrorBudget;

/// Back-off while a live source has nothing buffered yet.
const STARVED_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RenderSummary {
    pub frames: u64,
    pub chunks: u64,
    pub producer_errors: u64,
    /// Producers rendered after the first one.
    pub sources: u64,
}

/// Drain `source` into `out`, remapping to `channels` output channels.
///
/// `next_producer` is asked for a replacement each time the source ends; `None` finishes
/// the render.
pub fn render_to_wav(
    source: &StreamSource,
    out: &Path,
    channels: u16,
    max_consecutive_errors: u32,
    mut next_producer: impl FnMut() -> Result<Option<Box<dyn Producer>>>,
) -> Result<RenderSummary> {
    let format = source.format();
    let spec = hound::WavSpec {
        channels,
        sample_rate: format.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(out, spec).with_context(|| format!("create {:?}", out))?;

    let src_channels = format.channels() as usize;
    let capacity = source.config().chunk_frames.max(1) * src_channels;
    let mut budget = ErrorBudget::new(max_consecutive_errors);
    let mut summary = RenderSummary::default();

    loop {
        let chunk = match source.fill_chunk(capacity) {
            Ok(chunk) => chunk,
            Err(FillError::Producer(e)) => {
                summary.producer_errors += 1;
                if budget.record_error() {
                    bail!("giving up after {} producer errors: {e}", summary.producer_errors);
                }
                tracing::warn!(error = %e, "producer error; retrying");
                continue;
            }
            Err(e) => return Err(e).context("fill chunk"),
        };
        budget.reset();

        if chunk.is_empty() {
            if !chunk.continuation() {
                match next_producer()? {
                    Some(producer) => {
                        source
                            .replace_producer(producer, false)
                            .context("switch to next source")?;
                        summary.sources += 1;
                        continue;
                    }
                    None => break,
                }
            }
            thread::sleep(STARVED_BACKOFF);
            continue;
        }

        summary.chunks += 1;
        let samples = remap_channels(chunk.samples(), src_channels, channels as usize);
        summary.frames += (samples.len() / channels as usize) as u64;
        for s in samples {
            writer.write_sample(s)?;
        }
    }

    writer.finalize().context("finalize wav")?;
    tracing::info!(
        path = ?out,
        frames = summary.frames,
        chunks = summary.chunks,
        "render complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use stream_source::error::ProducerError;
    use stream_source::{AudioFormat, MemoryProducer, Producer, ProducerRead, StreamConfig};

    fn out_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stream-play-{}-{name}.wav", std::process::id()))
    }

    fn memory_source(channels: u16, samples: Vec<i16>, chunk_frames: usize) -> StreamSource {
        let format = AudioFormat::new(channels, 8000).unwrap();
        let config = StreamConfig {
            chunk_frames,
            ..StreamConfig::default()
        };
        StreamSource::open(Box::new(MemoryProducer::new(format, samples)), format, config).unwrap()
    }

    fn no_more() -> Result<Option<Box<dyn Producer>>> {
        Ok(None)
    }

    fn read_back(path: &Path) -> (hound::WavSpec, Vec<i16>) {
        let mut reader = hound::WavReader::open(path).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn renders_every_sample_in_order() {
        let source = memory_source(2, (0..100).collect(), 7);
        let path = out_path("ordered");

        let summary = render_to_wav(&source, &path, 2, 4, no_more).unwrap();
        let (spec, samples) = read_back(&path);
        let _ = std::fs::remove_file(&path);

        assert_eq!(summary.frames, 50);
        assert_eq!(summary.chunks, 8);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(samples, (0..100).collect::<Vec<i16>>());
        assert!(source.is_exhausted());
    }

    #[test]
    fn renders_from_seek_position() {
        let source = memory_source(1, (0..100).collect(), 16);
        source.seek_to(Duration::from_micros(6_250)).unwrap();
        let path = out_path("seeked");

        render_to_wav(&source, &path, 1, 4, no_more).unwrap();
        let (_, samples) = read_back(&path);
        let _ = std::fs::remove_file(&path);

        assert_eq!(samples, (50..100).collect::<Vec<i16>>());
    }

    #[test]
    fn downmixes_stereo_to_mono() {
        let source = memory_source(2, vec![10, 20, 30, 40], 8);
        let path = out_path("downmix");

        render_to_wav(&source, &path, 1, 4, no_more).unwrap();
        let (spec, samples) = read_back(&path);
        let _ = std::fs::remove_file(&path);

        assert_eq!(spec.channels, 1);
        assert_eq!(samples, vec![15, 35]);
    }

    #[test]
    fn next_producers_are_rendered_back_to_back() {
        let format = AudioFormat::new(1, 8000).unwrap();
        let source = memory_source(1, vec![1, 2, 3], 2);
        let mut queue: Vec<Box<dyn Producer>> = vec![
            Box::new(MemoryProducer::new(format, vec![7, 8])),
            Box::new(MemoryProducer::new(format, vec![4, 5, 6])),
        ];
        let path = out_path("chained");

        let summary = render_to_wav(&source, &path, 1, 4, || Ok(queue.pop())).unwrap();
        let (_, samples) = read_back(&path);
        let _ = std::fs::remove_file(&path);

        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(summary.frames, 8);
        assert_eq!(summary.sources, 2);
        assert_eq!(source.stats().switches, 2);
    }

    #[test]
    fn next_producer_with_other_format_fails_render() {
        let source = memory_source(1, vec![1, 2], 4);
        let stereo = AudioFormat::new(2, 8000).unwrap();
        let mut next = Some(Box::new(MemoryProducer::new(stereo, vec![0; 4])) as Box<dyn Producer>);
        let path = out_path("mismatch");

        let err = render_to_wav(&source, &path, 1, 4, || Ok(next.take())).unwrap_err();
        let _ = std::fs::remove_file(&path);

        assert!(err.to_string().contains("switch to next source"));
    }

    struct AlwaysFails;

    impl Producer for AlwaysFails {
        fn read(&mut self, _out: &mut [i16]) -> Result<ProducerRead, ProducerError> {
            Err(ProducerError::Other("device unplugged".to_string()))
        }
        fn seek(&mut self, _sample: u64) -> Result<(), ProducerError> {
            Ok(())
        }
        fn is_seekable(&self) -> bool {
            false
        }
        fn total_samples(&self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn persistent_producer_errors_abort_render() {
        let format = AudioFormat::new(1, 8000).unwrap();
        let source =
            StreamSource::open(Box::new(AlwaysFails), format, StreamConfig::default()).unwrap();
        let path = out_path("fails");

        let err = render_to_wav(&source, &path, 1, 3, no_more).unwrap_err();
        let _ = std::fs::remove_file(&path);

        assert!(err.to_string().contains("3 producer errors"));
    }
}

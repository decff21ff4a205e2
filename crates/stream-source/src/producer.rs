//! Audio data producers.
//!
//! A [`Producer`] is whatever actually owns the samples: an in-memory buffer, a decoder, a
//! network-fed queue. The stream source owns exactly one producer and is the only caller.

use crate::error::ProducerError;
use crate::format::AudioFormat;
use crate::sample::SampleConversion;

/// Outcome of a single [`Producer::read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProducerRead {
    /// Samples written to the front of the output slice.
    pub len: usize,
    /// No more data will follow from the current position.
    pub end_of_data: bool,
}

impl ProducerRead {
    pub fn data(len: usize) -> Self {
        Self {
            len,
            end_of_data: false,
        }
    }

    pub fn end(len: usize) -> Self {
        Self {
            len,
            end_of_data: true,
        }
    }
}

/// Source of interleaved `i16` samples.
///
/// `read` must return within bounded time. A producer that is temporarily starved returns
/// `len == 0` with `end_of_data == false` instead of waiting.
pub trait Producer: Send {
    /// Fill the front of `out`. Implementations write whole frames only.
    fn read(&mut self, out: &mut [i16]) -> Result<ProducerRead, ProducerError>;

    /// Reposition to the frame-aligned interleaved sample index `sample`.
    fn seek(&mut self, sample: u64) -> Result<(), ProducerError>;

    fn is_seekable(&self) -> bool;

    /// Total length in samples when bounded.
    fn total_samples(&self) -> Option<u64>;

    /// The producer's own format, when it has one.
    fn native_format(&self) -> Option<AudioFormat> {
        None
    }

    /// Release underlying handles. Called once by the owning stream source.
    fn close(&mut self) -> Result<(), ProducerError> {
        Ok(())
    }
}

/// Bounded, seekable producer over interleaved samples held in memory.
pub struct MemoryProducer {
    format: AudioFormat,
    samples: Vec<i16>,
    pos: usize,
}

impl MemoryProducer {
    /// Trailing samples that do not form a whole frame are dropped.
    pub fn new(format: AudioFormat, mut samples: Vec<i16>) -> Self {
        samples.truncate(format.align_samples(samples.len()));
        Self {
            format,
            samples,
            pos: 0,
        }
    }

    /// Build from interleaved `f32` samples in `[-1.0, 1.0]`.
    pub fn from_f32(format: AudioFormat, samples: &[f32], conversion: SampleConversion) -> Self {
        let converted = samples.iter().map(|v| conversion.to_i16(*v)).collect();
        Self::new(format, converted)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }
}

impl Producer for MemoryProducer {
    fn read(&mut self, out: &mut [i16]) -> Result<ProducerRead, ProducerError> {
        let want = self.format.align_samples(out.len());
        let end = (self.pos + want).min(self.samples.len());
        let n = end - self.pos;
        out[..n].copy_from_slice(&self.samples[self.pos..end]);
        self.pos = end;
        if self.pos >= self.samples.len() {
            Ok(ProducerRead::end(n))
        } else {
            Ok(ProducerRead::data(n))
        }
    }

    fn seek(&mut self, sample: u64) -> Result<(), ProducerError> {
        let sample = usize::try_from(sample).unwrap_or(usize::MAX);
        self.pos = sample.min(self.samples.len());
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn total_samples(&self) -> Option<u64> {
        Some(self.samples.len() as u64)
    }

    fn native_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }
}

//! Live (unbounded, non-seekable) producer fed through a [`SharedAudio`] queue.

use std::sync::Arc;

use crate::error::ProducerError;
use crate::format::AudioFormat;
use crate::producer::{Producer, ProducerRead};
use crate::queue::SharedAudio;
use crate::sample::SampleConversion;

/// Drains a queue filled by some other thread.
///
/// Reads never wait: when the feeding thread falls behind, the read is short or empty and
/// more data may still follow. End of data is reported once the queue is closed and drained.
pub struct LiveProducer {
    format: AudioFormat,
    queue: Arc<SharedAudio>,
    conversion: SampleConversion,
    scratch: Vec<f32>,
}

impl LiveProducer {
    /// The queue's channel count must match `format`.
    pub fn new(format: AudioFormat, queue: Arc<SharedAudio>, conversion: SampleConversion) -> Self {
        Self {
            format,
            queue,
            conversion,
            scratch: Vec::new(),
        }
    }

    pub fn queue(&self) -> &Arc<SharedAudio> {
        &self.queue
    }
}

impl Producer for LiveProducer {
    fn read(&mut self, out: &mut [i16]) -> Result<ProducerRead, ProducerError> {
        let channels = self.format.channels() as usize;
        let max_frames = out.len() / channels;

        self.scratch.clear();
        let n = self.queue.pop_nonblocking(max_frames, &mut self.scratch);
        self.conversion.convert_into(&self.scratch[..n], out);

        if n == 0 && self.queue.is_drained() {
            if let Some(err) = self.queue.take_error() {
                return Err(err);
            }
            return Ok(ProducerRead::end(0));
        }
        Ok(ProducerRead::data(n))
    }

    fn seek(&mut self, _sample: u64) -> Result<(), ProducerError> {
        Err(ProducerError::Other("live producer is not seekable".to_string()))
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn total_samples(&self) -> Option<u64> {
        None
    }

    fn native_format(&self) -> Option<AudioFormat> {
        u16::try_from(self.queue.channels())
            .ok()
            .and_then(|ch| AudioFormat::new(ch, self.format.sample_rate()).ok())
    }

    /// Closing the queue releases a feeding thread blocked on back-pressure.
    fn close(&mut self) -> Result<(), ProducerError> {
        self.queue.close();
        Ok(())
    }
}

//! Pull-based PCM stream source.
//!
//! A playback engine drives a [`StreamSource`] from its own audio thread:
//! - [`StreamSource::fill_chunk`] returns the next batch of interleaved `i16` samples
//! - [`StreamSource::seek_to`] repositions the read cursor
//! - [`StreamSource::replace_producer`] switches to another producer mid-stream
//! - [`StreamSource::end_signal`] lets a control thread wait for the end of the stream
//!
//! Audio data comes from a [`Producer`] owned by the source (an in-memory buffer,
//! a Symphonia decoder, or a live queue fed by a background thread).

pub mod config;
pub mod decode;
pub mod error;
pub mod format;
pub mod live;
pub mod producer;
pub mod queue;
pub mod sample;
pub mod source;
pub mod status;

pub use config::StreamConfig;
pub use error::{ConfigurationError, FillError, ProducerError, ReplaceError, SeekError};
pub use format::AudioFormat;
pub use producer::{MemoryProducer, Producer, ProducerRead};
pub use source::{Chunk, StreamSource};

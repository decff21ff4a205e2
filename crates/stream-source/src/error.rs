//! Error taxonomy for stream sources.
//!
//! Producer failures are wrapped and forwarded to the engine unchanged; the source never
//! retries or swallows them.

use std::time::Duration;

use thiserror::Error;

use crate::format::AudioFormat;

/// Failure reported by the underlying data producer.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("producer decode error: {0}")]
    Decode(String),
    #[error("producer is closed")]
    Closed,
    #[error("producer error: {0}")]
    Other(String),
}

impl From<symphonia::core::errors::Error> for ProducerError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error;
        match err {
            Error::IoError(e) => ProducerError::Io(e),
            Error::DecodeError(msg) => ProducerError::Decode(msg.to_string()),
            other => ProducerError::Other(other.to_string()),
        }
    }
}

/// Failure of [`crate::StreamSource::seek_to`]. None of these are fatal to the source.
#[derive(Error, Debug)]
pub enum SeekError {
    #[error("producer is not seekable")]
    Unsupported,
    #[error("seek target {requested:?} exceeds stream duration {max:?}")]
    OutOfRange { requested: Duration, max: Duration },
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("stream source is closed")]
    Closed,
}

/// Failure of [`crate::StreamSource::fill_chunk`].
#[derive(Error, Debug)]
pub enum FillError {
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("capacity {capacity} is smaller than one frame of {channels} channels")]
    Capacity { capacity: usize, channels: u16 },
    #[error("stream source is closed")]
    Closed,
}

/// Failure of [`crate::StreamSource::replace_producer`]. The current producer stays in place.
#[derive(Error, Debug)]
pub enum ReplaceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("replacement producer cannot resume at sample {position}: not seekable")]
    NotSeekable { position: u64 },
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("stream source is closed")]
    Closed,
}

/// Invalid construction parameters. Construction fails; there is no partial source.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("channel count must be positive")]
    ZeroChannels,
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("producer format {producer} does not match requested format {requested}")]
    FormatMismatch {
        requested: AudioFormat,
        producer: AudioFormat,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symphonia_decode_error_maps_to_decode() {
        let err: ProducerError = symphonia::core::errors::Error::DecodeError("bad frame").into();
        assert!(matches!(err, ProducerError::Decode(msg) if msg == "bad frame"));
    }

    #[test]
    fn symphonia_io_error_maps_to_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: ProducerError = symphonia::core::errors::Error::IoError(io).into();
        assert!(matches!(err, ProducerError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn producer_error_is_transparent_in_seek_error() {
        let err = SeekError::from(ProducerError::Decode("x".to_string()));
        assert_eq!(err.to_string(), "producer decode error: x");
    }
}

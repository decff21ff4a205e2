use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the stream source on every call.
///
/// Lock-free so an engine's status thread can read them while the audio thread pulls.
#[derive(Debug, Default)]
pub struct StreamStats {
    chunks: AtomicU64,
    samples: AtomicU64,
    starved_chunks: AtomicU64,
    producer_errors: AtomicU64,
    seeks: AtomicU64,
    switches: AtomicU64,
}

impl StreamStats {
    pub(crate) fn record_chunk(&self, len: usize, requested: usize, continuation: bool) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(len as u64, Ordering::Relaxed);
        if continuation && len < requested {
            self.starved_chunks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_producer_error(&self) {
        self.producer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatus {
        StreamStatus {
            chunks: self.chunks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            starved_chunks: self.starved_chunks.load(Ordering::Relaxed),
            producer_errors: self.producer_errors.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            position_ms: None,
            duration_ms: None,
            exhausted: false,
        }
    }
}

/// Point-in-time status of a stream source.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StreamStatus {
    /// Chunks delivered (including empty ones).
    pub chunks: u64,
    /// Samples delivered across all chunks.
    pub samples: u64,
    /// Chunks shorter than requested while more data was still expected.
    pub starved_chunks: u64,
    /// Producer errors forwarded to the engine.
    pub producer_errors: u64,
    /// Successful seeks.
    pub seeks: u64,
    /// Producer replacements.
    pub switches: u64,
    /// Cursor position in milliseconds.
    pub position_ms: Option<u64>,
    /// Total duration in milliseconds when the producer is bounded.
    pub duration_ms: Option<u64>,
    pub exhausted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_continuing_chunk_counts_as_starved() {
        let stats = StreamStats::default();
        stats.record_chunk(10, 10, true);
        stats.record_chunk(4, 10, true);
        stats.record_chunk(4, 10, false);

        let snap = stats.snapshot();
        assert_eq!(snap.chunks, 3);
        assert_eq!(snap.samples, 18);
        assert_eq!(snap.starved_chunks, 1);
    }

    #[test]
    fn snapshot_serializes_to_snake_case_json_fields() {
        let stats = StreamStats::default();
        stats.record_seek();
        stats.record_producer_error();
        stats.record_switch();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["seeks"], 1);
        assert_eq!(json["producer_errors"], 1);
        assert_eq!(json["switches"], 1);
        assert!(json["position_ms"].is_null());
    }
}

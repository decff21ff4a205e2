//! Stream source configuration.
//!
//! Loaded from TOML; every field is optional and falls back to [`StreamConfig::default`].

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sample::SampleConversion;

/// Tuning parameters shared by the stream source and the engines that drive it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Clamp out-of-range seek targets to the stream end instead of failing.
    pub clamp_seek: bool,
    /// Frames requested per `fill_chunk` by the bundled engines.
    pub chunk_frames: usize,
    /// Buffer duration for live (queue-fed) producers.
    pub buffer_seconds: f32,
    /// `f32` → `i16` conversion for producers that decode to float.
    pub conversion: SampleConversion,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            clamp_seek: true,
            chunk_frames: 2048,
            buffer_seconds: 2.0,
            conversion: SampleConversion::Clamp,
        }
    }
}

impl StreamConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<StreamConfig>(raw)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        assert_eq!(StreamConfig::parse("").unwrap(), StreamConfig::default());
    }

    #[test]
    fn parse_overrides_fields() {
        let cfg = StreamConfig::parse(
            r#"
            clamp_seek = false
            chunk_frames = 512
            conversion = "soft_limit"
            "#,
        )
        .unwrap();
        assert!(!cfg.clamp_seek);
        assert_eq!(cfg.chunk_frames, 512);
        assert_eq!(cfg.buffer_seconds, 2.0);
        assert_eq!(cfg.conversion, SampleConversion::SoftLimit);
    }

    #[test]
    fn parse_rejects_unknown_conversion() {
        assert!(StreamConfig::parse(r#"conversion = "dither""#).is_err());
    }

    #[test]
    fn load_reports_path_on_missing_file() {
        let err = StreamConfig::load(Path::new("/nonexistent/stream.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}

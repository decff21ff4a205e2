use std::fmt;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Fixed PCM format of a stream: channel count and sample rate.
///
/// Samples are interleaved: `frame0[ch0], frame0[ch1], ..., frame1[ch0], ...`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    channels: u16,
    sample_rate: u32,
}

impl AudioFormat {
    /// Validate and build a format. Both values must be positive.
    pub fn new(channels: u16, sample_rate: u32) -> Result<Self, ConfigurationError> {
        if channels == 0 {
            return Err(ConfigurationError::ZeroChannels);
        }
        if sample_rate == 0 {
            return Err(ConfigurationError::ZeroSampleRate);
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved sample index of the first sample of `frame`.
    pub fn frames_to_samples(&self, frames: u64) -> u64 {
        frames.saturating_mul(self.channels as u64)
    }

    pub fn samples_to_frames(&self, samples: u64) -> u64 {
        samples / self.channels as u64
    }

    /// Frame index nearest to `time`.
    ///
    /// Inverse of [`frames_to_duration`](Self::frames_to_duration): a duration produced from
    /// a frame count converts back to the same count.
    pub fn duration_to_frames(&self, time: Duration) -> u64 {
        let rate = self.sample_rate as u128;
        let frames = (time.as_nanos().saturating_mul(rate) + 500_000_000) / 1_000_000_000;
        u64::try_from(frames).unwrap_or(u64::MAX)
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        let nanos = (frames as u128).saturating_mul(1_000_000_000) / self.sample_rate as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Frame-aligned interleaved sample index at `time`.
    pub fn duration_to_samples(&self, time: Duration) -> u64 {
        self.frames_to_samples(self.duration_to_frames(time))
    }

    pub fn samples_to_duration(&self, samples: u64) -> Duration {
        self.frames_to_duration(self.samples_to_frames(samples))
    }

    /// Round a sample count down to whole frames.
    pub fn align_samples(&self, samples: usize) -> usize {
        samples - samples % self.channels as usize
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch@{}Hz", self.channels, self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_zero_values() {
        assert_eq!(AudioFormat::new(0, 44_100), Err(ConfigurationError::ZeroChannels));
        assert_eq!(AudioFormat::new(2, 0), Err(ConfigurationError::ZeroSampleRate));
    }

    #[test]
    fn duration_conversions_are_frame_aligned() {
        let fmt = AudioFormat::new(2, 48_000).unwrap();
        assert_eq!(fmt.duration_to_frames(Duration::from_millis(500)), 24_000);
        assert_eq!(fmt.duration_to_samples(Duration::from_millis(500)), 48_000);
        assert_eq!(fmt.samples_to_duration(96_001), Duration::from_secs(1));
    }

    #[test]
    fn frame_duration_round_trip_is_exact() {
        for rate in [8_000, 11_025, 22_050, 44_100, 48_000, 96_000, 192_000] {
            let fmt = AudioFormat::new(2, rate).unwrap();
            for frames in [0, 1, 49, 50, 441, 44_099, 1_000_003, 86_400 * rate as u64] {
                let d = fmt.frames_to_duration(frames);
                assert_eq!(fmt.duration_to_frames(d), frames, "{frames} frames at {rate} Hz");
            }
        }
    }

    #[test]
    fn duration_to_frames_rounds_to_nearest() {
        let fmt = AudioFormat::new(1, 1_000).unwrap();
        assert_eq!(fmt.duration_to_frames(Duration::from_micros(1_499)), 1);
        assert_eq!(fmt.duration_to_frames(Duration::from_micros(1_500)), 2);
    }

    #[test]
    fn align_samples_rounds_down() {
        let fmt = AudioFormat::new(2, 44_100).unwrap();
        assert_eq!(fmt.align_samples(61), 60);
        assert_eq!(fmt.align_samples(1), 0);
        let mono = AudioFormat::new(1, 44_100).unwrap();
        assert_eq!(mono.align_samples(61), 61);
    }

    #[test]
    fn display_is_compact() {
        let fmt = AudioFormat::new(2, 44_100).unwrap();
        assert_eq!(fmt.to_string(), "2ch@44100Hz");
    }
}

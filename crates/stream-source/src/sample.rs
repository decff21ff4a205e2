//! Sample conversion and channel mapping helpers.

use serde::{Deserialize, Serialize};

/// How `f32` samples are turned into `i16`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleConversion {
    /// Scale by 32768 and saturate to the `i16` range. Exact for samples that
    /// started out as `i16`.
    #[default]
    Clamp,
    /// Soft limiter `v / (1 + |v|)`; never clips, but attenuates everything.
    SoftLimit,
}

impl SampleConversion {
    pub fn to_i16(self, v: f32) -> i16 {
        match self {
            SampleConversion::Clamp => clamp_to_i16(v),
            SampleConversion::SoftLimit => soft_limit_to_i16(v),
        }
    }

    /// Convert `src` into the front of `dst`; returns the number of samples written.
    pub fn convert_into(self, src: &[f32], dst: &mut [i16]) -> usize {
        let n = src.len().min(dst.len());
        for (d, s) in dst[..n].iter_mut().zip(src) {
            *d = self.to_i16(*s);
        }
        n
    }
}

fn clamp_to_i16(v: f32) -> i16 {
    if v.is_nan() {
        return 0;
    }
    (v * 32_768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn soft_limit_to_i16(v: f32) -> i16 {
    if v.is_nan() {
        return 0;
    }
    (i16::MAX as f32 * v / (1.0 + v.abs())) as i16
}

/// Map interleaved frames from `src_channels` to `dst_channels`.
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - equal counts: pass-through
/// - other layouts: best-effort “clamp to available channels”
pub fn remap_channels(src: &[i16], src_channels: usize, dst_channels: usize) -> Vec<i16> {
    if src_channels == dst_channels || src_channels == 0 || dst_channels == 0 {
        return src.to_vec();
    }
    let frames = src.len() / src_channels;
    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in src.chunks_exact(src_channels) {
        for ch in 0..dst_channels {
            out.push(map_sample(frame, dst_channels, ch));
        }
    }
    out
}

/// Read one output sample for `dst_ch` out of a single source frame.
pub fn map_sample(frame: &[i16], dst_channels: usize, dst_ch: usize) -> i16 {
    let get = |ch: usize| frame.get(ch).copied().unwrap_or(0);
    match (frame.len(), dst_channels) {
        (2, 1) => ((get(0) as i32 + get(1) as i32) / 2) as i16,
        (1, _) => get(0),
        (n, _) => get(dst_ch.min(n.saturating_sub(1))),
    }
}

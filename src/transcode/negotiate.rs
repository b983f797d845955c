//! Format negotiation against codec capability tables
//!
//! Capabilities are plain read-only data handed to whoever negotiates; the
//! selection functions are pure and deterministic (ties resolve to the
//! earlier entry of the supported list).

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::{Sample, Type};

use crate::ffmpeg::helpers;
use crate::ffmpeg::utils::{layout_channels, layout_for_channels};
use crate::types::FormatDescriptor;

/// Sample formats preferred when the exact one is unsupported.
pub const COMMON_SAMPLE_FORMATS: [Sample; 4] = [
    Sample::U8(Type::Packed),
    Sample::I16(Type::Packed),
    Sample::I32(Type::Packed),
    Sample::F32(Type::Planar),
];

/// Sample rates preferred when the exact one is unsupported.
pub const COMMON_SAMPLE_RATES: [u32; 3] = [44100, 48000, 32000];

/// What a codec (or a filter sink) accepts. An empty list means any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecCapabilities {
    pub sample_formats: Vec<Sample>,
    pub sample_rates: Vec<u32>,
    pub channel_layouts: Vec<ChannelLayout>,
}

impl CodecCapabilities {
    /// Read the capability tables FFmpeg declares for `codec`.
    pub fn query(codec: &ffmpeg::codec::Codec) -> Self {
        Self {
            sample_formats: helpers::codec_sample_formats(codec),
            sample_rates: helpers::codec_sample_rates(codec),
            channel_layouts: helpers::codec_channel_layouts(codec),
        }
    }

    /// Accept exactly one format.
    pub fn exactly(format: &FormatDescriptor) -> Self {
        Self {
            sample_formats: vec![format.format],
            sample_rates: vec![format.rate],
            channel_layouts: vec![format.layout],
        }
    }

    pub fn accepts(&self, format: &FormatDescriptor) -> bool {
        (self.sample_formats.is_empty() || self.sample_formats.contains(&format.format))
            && (self.sample_rates.is_empty() || self.sample_rates.contains(&format.rate))
            && (self.channel_layouts.is_empty() || self.channel_layouts.contains(&format.layout))
    }

    /// Pick the supported triple closest to the preferred one.
    pub fn negotiate(
        &self,
        preferred_format: Sample,
        preferred_rate: u32,
        preferred_channels: usize,
    ) -> FormatDescriptor {
        FormatDescriptor {
            format: find_best_sample_format(&self.sample_formats, preferred_format),
            rate: find_best_sample_rate(&self.sample_rates, preferred_rate),
            layout: find_best_channel_layout(&self.channel_layouts, preferred_channels),
        }
    }

    /// Keep `preferred` wherever it is already acceptable, negotiate the rest.
    ///
    /// Unlike [`negotiate`](Self::negotiate), an accepted layout is kept even
    /// when another layout has the same channel count.
    pub fn resolve(&self, preferred: &FormatDescriptor) -> FormatDescriptor {
        let layout = if self.channel_layouts.is_empty()
            || self.channel_layouts.contains(&preferred.layout)
        {
            preferred.layout
        } else {
            find_best_channel_layout(&self.channel_layouts, preferred.channels())
        };
        FormatDescriptor {
            format: find_best_sample_format(&self.sample_formats, preferred.format),
            rate: find_best_sample_rate(&self.sample_rates, preferred.rate),
            layout,
        }
    }
}

/// Choose a sample format.
///
/// Exact match wins; then the common format with the closest byte width;
/// then any format with the closest byte width.
pub fn find_best_sample_format(supported: &[Sample], preferred: Sample) -> Sample {
    if supported.is_empty() || supported.contains(&preferred) {
        return preferred;
    }
    let width_diff = |s: &Sample| s.bytes().abs_diff(preferred.bytes());

    let common = supported
        .iter()
        .filter(|s| COMMON_SAMPLE_FORMATS.contains(s))
        .min_by_key(|s| width_diff(s));
    if let Some(s) = common {
        return *s;
    }
    supported
        .iter()
        .min_by_key(|s| width_diff(s))
        .copied()
        .unwrap_or(preferred)
}

/// Choose a sample rate.
///
/// Exact match wins; then the common rate closest to the preferred one; then
/// the numerically closest rate.
pub fn find_best_sample_rate(supported: &[u32], preferred: u32) -> u32 {
    if supported.is_empty() || supported.contains(&preferred) {
        return preferred;
    }
    let diff = |r: &u32| r.abs_diff(preferred);

    let common = supported
        .iter()
        .filter(|r| COMMON_SAMPLE_RATES.contains(r))
        .min_by_key(|r| diff(r));
    if let Some(r) = common {
        return *r;
    }
    supported
        .iter()
        .min_by_key(|r| diff(r))
        .copied()
        .unwrap_or(preferred)
}

/// Choose a channel layout.
///
/// A layout with exactly the preferred channel count wins; then the closest
/// layout with fewer channels; then the closest with more; then the first.
pub fn find_best_channel_layout(supported: &[ChannelLayout], preferred_channels: usize) -> ChannelLayout {
    if supported.is_empty() {
        return layout_for_channels(preferred_channels);
    }
    if let Some(l) = supported
        .iter()
        .find(|l| layout_channels(**l) == preferred_channels)
    {
        return *l;
    }

    // Strict comparisons keep the earliest layout on ties.
    let mut below: Option<ChannelLayout> = None;
    let mut above: Option<ChannelLayout> = None;
    for l in supported {
        let n = layout_channels(*l);
        if n < preferred_channels {
            if below.map_or(true, |b| n > layout_channels(b)) {
                below = Some(*l);
            }
        } else if above.map_or(true, |a| n < layout_channels(a)) {
            above = Some(*l);
        }
    }
    below.or(above).unwrap_or(supported[0])
}

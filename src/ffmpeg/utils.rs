//! FFmpeg utility functions

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::Sample;

/// Convert timestamps from one timebase to another
pub fn rescale_ts(ts: i64, from: ffmpeg::Rational, to: ffmpeg::Rational) -> i64 {
    unsafe { ffmpeg::ffi::av_rescale_q(ts, from.into(), to.into()) }
}

/// Microsecond time base used for stream-independent seek positions.
pub fn microseconds() -> ffmpeg::Rational {
    ffmpeg::Rational::new(1, 1_000_000)
}

/// Get the media type name
pub fn media_type_name(media_type: ffmpeg::media::Type) -> &'static str {
    match media_type {
        ffmpeg::media::Type::Video => "video",
        ffmpeg::media::Type::Audio => "audio",
        ffmpeg::media::Type::Subtitle => "subtitle",
        ffmpeg::media::Type::Data => "data",
        ffmpeg::media::Type::Attachment => "attachment",
        _ => "unknown",
    }
}

/// Named layouts, in the spelling FFmpeg's option parser accepts.
const NAMED_LAYOUTS: &[(ChannelLayout, &str)] = &[
    (ChannelLayout::MONO, "mono"),
    (ChannelLayout::STEREO, "stereo"),
    (ChannelLayout::_2POINT1, "2.1"),
    (ChannelLayout::SURROUND, "3.0"),
    (ChannelLayout::_4POINT0, "4.0"),
    (ChannelLayout::QUAD, "quad"),
    (ChannelLayout::_5POINT0, "5.0(side)"),
    (ChannelLayout::_5POINT0_BACK, "5.0"),
    (ChannelLayout::_5POINT1, "5.1(side)"),
    (ChannelLayout::_5POINT1_BACK, "5.1"),
    (ChannelLayout::_6POINT1, "6.1"),
    (ChannelLayout::_7POINT1, "7.1"),
];

/// Number of channels in a native-order layout mask.
pub fn layout_channels(layout: ChannelLayout) -> usize {
    layout.bits().count_ones() as usize
}

/// The layout FFmpeg picks by default for a bare channel count.
pub fn layout_for_channels(channels: usize) -> ChannelLayout {
    match channels {
        0 => ChannelLayout::empty(),
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        3 => ChannelLayout::SURROUND,
        4 => ChannelLayout::_4POINT0,
        5 => ChannelLayout::_5POINT0_BACK,
        6 => ChannelLayout::_5POINT1_BACK,
        7 => ChannelLayout::_6POINT1,
        8 => ChannelLayout::_7POINT1,
        n => ChannelLayout::from_bits_truncate((1u64 << n.min(63)) - 1),
    }
}

/// Layout as an option string: a known name, else the hex mask.
pub fn layout_name(layout: ChannelLayout) -> String {
    NAMED_LAYOUTS
        .iter()
        .find(|(l, _)| *l == layout)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("0x{:x}", layout.bits()))
}

/// Parse a layout name, a hex mask (`0x3`) or a channel count (`2c`).
pub fn parse_layout(name: &str) -> Option<ChannelLayout> {
    let name = name.trim();
    if let Some((layout, _)) = NAMED_LAYOUTS.iter().find(|(_, n)| *n == name) {
        return Some(*layout);
    }
    if let Some(hex) = name
        .strip_prefix("0x")
        .or_else(|| name.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16)
            .ok()
            .map(ChannelLayout::from_bits_truncate)
            .filter(|l| !l.is_empty());
    }
    if let Some(count) = name.strip_suffix('c') {
        return count
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(layout_for_channels);
    }
    None
}

/// Parse a sample format name such as `fltp` or `s16`.
pub fn parse_sample_format(name: &str) -> Option<Sample> {
    let name = std::ffi::CString::new(name.trim()).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of
    // the call; av_get_sample_fmt only reads it.
    let fmt = unsafe { ffmpeg::ffi::av_get_sample_fmt(name.as_ptr()) };
    match Sample::from(fmt) {
        Sample::None => None,
        sample => Some(sample),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::util::format::sample::Type;

    #[test]
    fn test_rescale_ts() {
        let from = ffmpeg::Rational::new(1, 48000);
        let to = ffmpeg::Rational::new(1, 1000);
        assert_eq!(rescale_ts(48000, from, to), 1000);
        assert_eq!(rescale_ts(0, from, to), 0);
    }

    #[test]
    fn test_layout_channels() {
        assert_eq!(layout_channels(ChannelLayout::MONO), 1);
        assert_eq!(layout_channels(ChannelLayout::STEREO), 2);
        assert_eq!(layout_channels(ChannelLayout::_5POINT1_BACK), 6);
    }

    #[test]
    fn test_layout_for_channels_roundtrips_count() {
        for n in 1..=8 {
            assert_eq!(layout_channels(layout_for_channels(n)), n);
        }
    }

    #[test]
    fn test_layout_names() {
        assert_eq!(layout_name(ChannelLayout::STEREO), "stereo");
        assert_eq!(layout_name(ChannelLayout::_5POINT1_BACK), "5.1");
        assert_eq!(parse_layout("stereo"), Some(ChannelLayout::STEREO));
        assert_eq!(parse_layout("0x4"), Some(ChannelLayout::from_bits_truncate(0x4)));
        assert_eq!(parse_layout("1c"), Some(ChannelLayout::MONO));
        assert_eq!(parse_layout("0x0"), None);
        assert_eq!(parse_layout("bogus"), None);
    }

    #[test]
    fn test_parse_sample_format() {
        assert_eq!(parse_sample_format("fltp"), Some(Sample::F32(Type::Planar)));
        assert_eq!(parse_sample_format("s16"), Some(Sample::I16(Type::Packed)));
        assert_eq!(parse_sample_format("nope"), None);
    }

    #[test]
    fn test_media_type_name() {
        assert_eq!(media_type_name(ffmpeg::media::Type::Audio), "audio");
    }
}

//! Safe wrappers around FFmpeg FFI calls.
//!
//! Every function in this module is `pub` and **safe** to call.  All `unsafe`
//! blocks are contained here with explicit safety arguments.  Callers outside
//! this module should never need to write `unsafe` for routine FFmpeg access.

use std::ffi::{c_int, c_void};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::Sample;

use crate::error::{Result, TranscodeError};
use crate::ffmpeg::utils::layout_for_channels;

// ── Codec-parameter field accessors ─────────────────────────────────────────

/// Read `sample_rate` from an `AVCodecParameters` struct.
///
/// `ffmpeg-next` does not expose this field through a safe accessor.
pub fn codec_params_sample_rate(params: &ffmpeg::codec::Parameters) -> u32 {
    // SAFETY: `params.as_ptr()` returns a valid non-null pointer for the
    // lifetime of `params`.  `sample_rate` is a plain i32 field with no
    // ownership semantics.
    unsafe { (*params.as_ptr()).sample_rate.max(0) as u32 }
}

/// Read `ch_layout.nb_channels` from an `AVCodecParameters` struct.
pub fn codec_params_channels(params: &ffmpeg::codec::Parameters) -> u16 {
    // SAFETY: same as `codec_params_sample_rate`.
    unsafe { (*params.as_ptr()).ch_layout.nb_channels.max(0) as u16 }
}

/// Allocate a fresh `AVCodecParameters`, copy the encoder context into it,
/// and return it as a safe `ffmpeg::codec::Parameters`.
///
/// Used to extract codec parameters from an encoder for muxer stream setup.
pub fn encoder_codec_parameters(
    encoder: &ffmpeg::codec::encoder::Audio,
) -> Result<ffmpeg::codec::Parameters> {
    use std::ops::Deref;
    use std::rc::Rc;
    let ctx: &ffmpeg::codec::Context = encoder.deref();
    // SAFETY: the allocation is checked for null before use.
    // `avcodec_parameters_from_context` copies fields from a live, open
    // encoder context into the freshly allocated struct.
    unsafe {
        let params = ffmpeg::ffi::avcodec_parameters_alloc();
        if params.is_null() {
            return Err(TranscodeError::OutOfMemory(
                "avcodec_parameters_alloc returned null".into(),
            ));
        }
        let ret = ffmpeg::ffi::avcodec_parameters_from_context(params, ctx.as_ptr());
        let params = ffmpeg::codec::Parameters::wrap(params, None::<Rc<dyn std::any::Any>>);
        if ret < 0 {
            return Err(TranscodeError::Codec(format!(
                "avcodec_parameters_from_context failed: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(params)
    }
}

// ── Codec capability tables ──────────────────────────────────────────────────

/// Fetch one of the codec's supported-configuration arrays.
///
/// Returns an empty slice when the codec places no restriction.
///
/// # Safety
/// `T` must match the element type FFmpeg documents for `config`.
unsafe fn supported_config<T: Copy>(
    codec: &ffmpeg::codec::Codec,
    config: ffmpeg::ffi::AVCodecConfig,
) -> Vec<T> {
    let mut out: *const c_void = std::ptr::null();
    let mut count: c_int = 0;
    let ret = ffmpeg::ffi::avcodec_get_supported_config(
        std::ptr::null(),
        codec.as_ptr(),
        config,
        0,
        &mut out,
        &mut count,
    );
    if ret < 0 || out.is_null() || count <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(out as *const T, count as usize).to_vec()
}

/// Sample formats the codec accepts (empty = unrestricted).
pub fn codec_sample_formats(codec: &ffmpeg::codec::Codec) -> Vec<Sample> {
    // SAFETY: AV_CODEC_CONFIG_SAMPLE_FORMAT yields `enum AVSampleFormat`.
    let raw: Vec<ffmpeg::ffi::AVSampleFormat> = unsafe {
        supported_config(
            codec,
            ffmpeg::ffi::AVCodecConfig::AV_CODEC_CONFIG_SAMPLE_FORMAT,
        )
    };
    raw.into_iter().map(Sample::from).collect()
}

/// Sample rates the codec accepts (empty = unrestricted).
pub fn codec_sample_rates(codec: &ffmpeg::codec::Codec) -> Vec<u32> {
    // SAFETY: AV_CODEC_CONFIG_SAMPLE_RATE yields `int`.
    let raw: Vec<c_int> = unsafe {
        supported_config(codec, ffmpeg::ffi::AVCodecConfig::AV_CODEC_CONFIG_SAMPLE_RATE)
    };
    raw.into_iter()
        .filter(|r| *r > 0)
        .map(|r| r as u32)
        .collect()
}

/// Channel layouts the codec accepts (empty = unrestricted).
///
/// Layouts not expressed as a native-order mask are reported as the default
/// layout for their channel count.
pub fn codec_channel_layouts(codec: &ffmpeg::codec::Codec) -> Vec<ChannelLayout> {
    // SAFETY: AV_CODEC_CONFIG_CHANNEL_LAYOUT yields `AVChannelLayout`
    // values; we only read `order`, `nb_channels` and the `mask` member of
    // the union, which is the active member for native order.
    let raw: Vec<ffmpeg::ffi::AVChannelLayout> = unsafe {
        supported_config(
            codec,
            ffmpeg::ffi::AVCodecConfig::AV_CODEC_CONFIG_CHANNEL_LAYOUT,
        )
    };
    raw.iter()
        .map(|l| unsafe {
            if l.order == ffmpeg::ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
                ChannelLayout::from_bits_truncate(l.u.mask)
            } else {
                layout_for_channels(l.nb_channels.max(0) as usize)
            }
        })
        .filter(|l| !l.is_empty())
        .collect()
}

// ── Audio frame planes ───────────────────────────────────────────────────────

/// Give a frame with an unspecified channel order the default layout for
/// its channel count.
pub fn normalize_frame_layout(frame: &mut ffmpeg::util::frame::Audio) {
    if frame.channel_layout().bits() == 0 {
        let channels = frame.channels() as usize;
        frame.set_channel_layout(layout_for_channels(channels));
    }
}

/// Extract an audio plane slice from an `AVFrame`.
///
/// Works around a bug in `ffmpeg-next`'s `Audio::data(index)` method where it
/// stops counting planes if `linesize[1] == 0`. In FFmpeg, planar audio frames
/// often only populate `linesize[0]` to represent the size of *every* plane.
pub fn audio_plane_data(frame: &ffmpeg::util::frame::Audio, index: usize) -> &[u8] {
    unsafe {
        let f = frame.as_ptr();
        let channels = (*f).ch_layout.nb_channels as usize;

        // Packed audio has only one data plane.
        let is_planar = frame.format().is_planar();
        if is_planar {
            if index >= channels {
                return &[];
            }
        } else if index > 0 {
            return &[];
        }

        let ptrs = (*f).extended_data;
        if ptrs.is_null() {
            return &[];
        }

        let plane_ptr = *ptrs.add(index);
        if plane_ptr.is_null() {
            return &[];
        }

        let size = (*f).linesize[0] as usize;
        std::slice::from_raw_parts(plane_ptr, size)
    }
}

/// Mutable version of `audio_plane_data`.
pub fn audio_plane_data_mut(frame: &mut ffmpeg::util::frame::Audio, index: usize) -> &mut [u8] {
    unsafe {
        let f = frame.as_mut_ptr();
        let channels = (*f).ch_layout.nb_channels as usize;

        let is_planar = frame.format().is_planar();
        if is_planar {
            if index >= channels {
                return &mut [];
            }
        } else if index > 0 {
            return &mut [];
        }

        let ptrs = (*f).extended_data;
        if ptrs.is_null() {
            return &mut [];
        }

        let plane_ptr = *ptrs.add(index);
        if plane_ptr.is_null() {
            return &mut [];
        }

        let size = (*f).linesize[0] as usize;
        std::slice::from_raw_parts_mut(plane_ptr, size)
    }
}

// ── Buffer source / sink ─────────────────────────────────────────────────────

// From libavfilter/buffersrc.h.
const BUFFERSRC_FLAG_PUSH: c_int = 4;
const BUFFERSRC_FLAG_KEEP_REF: c_int = 8;

/// Feed a frame (or end-of-stream when `None`) into an `abuffer` filter.
///
/// The caller keeps ownership of `frame`; FFmpeg takes a new reference.
pub fn buffersrc_add_frame(
    ctx: &mut ffmpeg::filter::Context,
    frame: Option<&ffmpeg::util::frame::Audio>,
) -> std::result::Result<(), ffmpeg::Error> {
    // SAFETY: `ctx` is a live `abuffer` instance owned by its graph. With
    // KEEP_REF FFmpeg never modifies the passed frame, so casting the const
    // pointer is sound. A null frame is the documented EOF marker.
    let ret = unsafe {
        match frame {
            Some(frame) => ffmpeg::ffi::av_buffersrc_add_frame_flags(
                ctx.as_mut_ptr(),
                frame.as_ptr() as *mut _,
                BUFFERSRC_FLAG_KEEP_REF,
            ),
            None => ffmpeg::ffi::av_buffersrc_add_frame_flags(
                ctx.as_mut_ptr(),
                std::ptr::null_mut(),
                BUFFERSRC_FLAG_PUSH,
            ),
        }
    };
    if ret < 0 {
        Err(ffmpeg::Error::from(ret))
    } else {
        Ok(())
    }
}

/// Time base of the frames an `abuffersink` emits.
pub fn buffersink_time_base(ctx: &ffmpeg::filter::Context) -> ffmpeg::Rational {
    // SAFETY: `ctx` is a configured `abuffersink` owned by its graph.
    unsafe { ffmpeg::Rational::from(ffmpeg::ffi::av_buffersink_get_time_base(ctx.as_ptr())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::util::format::sample::Type;

    #[test]
    fn test_pcm_s16_capabilities() {
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::PCM_S16LE).unwrap();
        let formats = codec_sample_formats(&codec);
        assert_eq!(formats, vec![Sample::I16(Type::Packed)]);
        assert!(codec_sample_rates(&codec).is_empty());
    }

    #[test]
    fn test_plane_access_planar() {
        let mut frame =
            ffmpeg::util::frame::Audio::new(Sample::F32(Type::Planar), 256, ChannelLayout::STEREO);
        audio_plane_data_mut(&mut frame, 1)[0] = 7;
        assert!(audio_plane_data(&frame, 0).len() >= 256 * 4);
        assert_eq!(audio_plane_data(&frame, 1)[0], 7);
        assert!(audio_plane_data(&frame, 2).is_empty());
    }

    #[test]
    fn test_plane_access_packed() {
        let frame =
            ffmpeg::util::frame::Audio::new(Sample::I16(Type::Packed), 100, ChannelLayout::STEREO);
        assert!(audio_plane_data(&frame, 0).len() >= 100 * 4);
        assert!(audio_plane_data(&frame, 1).is_empty());
    }

    #[test]
    fn test_normalize_frame_layout_keeps_known_layout() {
        let mut frame =
            ffmpeg::util::frame::Audio::new(Sample::F32(Type::Planar), 16, ChannelLayout::MONO);
        normalize_frame_layout(&mut frame);
        assert_eq!(frame.channel_layout(), ChannelLayout::MONO);
    }
}

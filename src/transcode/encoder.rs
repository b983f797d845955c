//! Audio encoder for the write path
//!
//! Negotiates the closest supported format against the codec's capability
//! tables, then encodes fixed-size PCM frames through the send/receive
//! contract.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::util::format::sample::Sample;

use crate::error::{map_alloc_error, Result, TranscodeError};
use crate::ffmpeg::helpers::encoder_codec_parameters;
use crate::transcode::negotiate::CodecCapabilities;
use crate::types::{EncodedPacket, FormatDescriptor, Pull, Push};

/// Frame size used when the codec accepts any size.
pub const DEFAULT_FRAME_SIZE: usize = 1024;

/// The encoder stage as seen by the writer.
pub trait FrameEncoder {
    /// The negotiated input format. Fixed once the encoder is open.
    fn output_format(&self) -> FormatDescriptor;

    /// Samples per channel every frame but the last must carry.
    fn frame_size(&self) -> usize;

    /// Time base of frame and packet timestamps.
    fn time_base(&self) -> ffmpeg::Rational;

    /// Send a frame, or `None` to start draining.
    fn send_frame(&mut self, frame: Option<&ffmpeg::util::frame::Audio>) -> Result<Push>;

    fn receive_packet(&mut self) -> Result<Pull<EncodedPacket>>;

    /// Parameters for the muxer stream.
    fn codec_parameters(&self) -> Result<codec::Parameters>;
}

/// Look up an encoder by name, falling back to `default`.
pub fn find_encoder(name: Option<&str>, default: codec::Id) -> Result<codec::Codec> {
    match name {
        Some(name) => ffmpeg::encoder::find_by_name(name)
            .ok_or_else(|| TranscodeError::EncoderNotFound(format!("no encoder named '{}'", name))),
        None if default == codec::Id::None => Err(TranscodeError::EncoderNotFound(
            "container has no default audio codec".into(),
        )),
        None => ffmpeg::encoder::find(default).ok_or_else(|| {
            TranscodeError::EncoderNotFound(format!("no encoder for codec {}", default.name()))
        }),
    }
}

/// FFmpeg-backed audio encoder.
pub struct AudioEncoder {
    encoder: ffmpeg::encoder::audio::Encoder,
    format: FormatDescriptor,
    frame_size: usize,
    /// Whether the codec requires exactly `frame_size` samples per frame.
    fixed_frame_size: bool,
    short_frame_sent: bool,
    time_base: ffmpeg::Rational,
    next_pts: i64,
}

impl AudioEncoder {
    /// Open `codec`, negotiating against the capabilities it declares.
    pub fn open(
        codec: codec::Codec,
        preferred_format: Sample,
        preferred_rate: u32,
        preferred_channels: usize,
        bitrate: u64,
        global_header: bool,
    ) -> Result<Self> {
        let caps = CodecCapabilities::query(&codec);
        Self::open_with(
            codec,
            &caps,
            FormatDescriptor::new(
                preferred_format,
                preferred_rate,
                crate::ffmpeg::utils::layout_for_channels(preferred_channels),
            ),
            bitrate,
            global_header,
        )
    }

    /// Open `codec` with caller-supplied capability tables.
    pub fn open_with(
        codec: codec::Codec,
        caps: &CodecCapabilities,
        preferred: FormatDescriptor,
        bitrate: u64,
        global_header: bool,
    ) -> Result<Self> {
        let chosen = caps.negotiate(preferred.format, preferred.rate, preferred.channels());
        let time_base = chosen.sample_time_base();

        let mut context = codec::Context::new_with_codec(codec);
        context.set_time_base(time_base);

        let mut audio_enc = context.encoder().audio().map_err(|e| {
            map_alloc_error(e, |e| {
                TranscodeError::EncoderNotFound(format!("Cannot get audio encoder handle: {}", e))
            })
        })?;

        audio_enc.set_rate(chosen.rate as i32);
        audio_enc.set_format(chosen.format);
        audio_enc.set_channel_layout(chosen.layout);
        if bitrate > 0 {
            audio_enc.set_bit_rate(bitrate as usize);
        }
        // Must be set before opening; the codec writes extradata on open.
        if global_header {
            audio_enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let encoder = audio_enc.open_as(codec).map_err(|e| {
            map_alloc_error(e, |e| {
                TranscodeError::EncoderNotFound(format!(
                    "Failed to open {} encoder with {}: {}",
                    codec.name(),
                    chosen,
                    e
                ))
            })
        })?;

        let reported = encoder.frame_size() as usize;
        let frame_size = if reported == 0 {
            DEFAULT_FRAME_SIZE
        } else {
            reported
        };

        tracing::info!(
            codec = codec.name(),
            preferred = %preferred,
            negotiated = %chosen,
            frame_size,
            bitrate,
            global_header,
            "Opened encoder"
        );

        Ok(Self {
            encoder,
            format: chosen,
            frame_size,
            fixed_frame_size: reported > 0,
            short_frame_sent: false,
            time_base,
            next_pts: 0,
        })
    }

    pub fn codec_name(&self) -> &'static str {
        self.encoder.id().name()
    }

    fn check_frame(&self, frame: &ffmpeg::util::frame::Audio) -> Result<()> {
        let actual = FormatDescriptor::of_frame(frame);
        if actual.format != self.format.format || actual.channels() != self.format.channels() {
            return Err(TranscodeError::InvalidInput(format!(
                "frame format {} does not match encoder format {}",
                actual, self.format
            )));
        }
        if !self.fixed_frame_size {
            return Ok(());
        }
        if frame.samples() > self.frame_size {
            return Err(TranscodeError::InvalidInput(format!(
                "frame of {} samples exceeds encoder frame size {}",
                frame.samples(),
                self.frame_size
            )));
        }
        if self.short_frame_sent {
            return Err(TranscodeError::InvalidInput(
                "only the final frame may be shorter than the encoder frame size".into(),
            ));
        }
        Ok(())
    }
}

impl FrameEncoder for AudioEncoder {
    fn output_format(&self) -> FormatDescriptor {
        self.format
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn time_base(&self) -> ffmpeg::Rational {
        self.time_base
    }

    fn send_frame(&mut self, frame: Option<&ffmpeg::util::frame::Audio>) -> Result<Push> {
        let result = match frame {
            Some(frame) => {
                self.check_frame(frame)?;
                self.encoder.send_frame(frame)
            }
            None => self.encoder.send_eof(),
        };
        match result {
            Ok(()) => {
                if let Some(frame) = frame {
                    if frame.samples() < self.frame_size {
                        self.short_frame_sent = true;
                    }
                }
                Ok(Push::Accepted)
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(Push::Full),
            Err(ffmpeg::Error::Eof) => Ok(Push::Closed),
            Err(e) => Err(map_alloc_error(e, |e| {
                TranscodeError::Codec(format!("{} encoder send_frame error: {}", self.codec_name(), e))
            })),
        }
    }

    fn receive_packet(&mut self) -> Result<Pull<EncodedPacket>> {
        let mut packet = ffmpeg::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => {
                let pts = match packet.pts() {
                    Some(pts) => pts,
                    None => {
                        packet.set_pts(Some(self.next_pts));
                        packet.set_dts(Some(self.next_pts));
                        self.next_pts
                    }
                };
                let duration = if packet.duration() > 0 {
                    packet.duration()
                } else {
                    self.frame_size as i64
                };
                self.next_pts = pts + duration;
                Ok(Pull::Ready(EncodedPacket {
                    packet,
                    time_base: self.time_base,
                }))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(Pull::NeedMoreInput)
            }
            Err(ffmpeg::Error::Eof) => Ok(Pull::EndOfStream),
            Err(e) => Err(map_alloc_error(e, |e| {
                TranscodeError::Codec(format!(
                    "{} encoder receive_packet error: {}",
                    self.codec_name(),
                    e
                ))
            })),
        }
    }

    fn codec_parameters(&self) -> Result<codec::Parameters> {
        encoder_codec_parameters(&self.encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::helpers::audio_plane_data_mut;
    use ffmpeg_next::util::channel_layout::ChannelLayout;
    use ffmpeg_next::util::format::sample::Type;

    fn silent_frame(format: FormatDescriptor, samples: usize, pts: i64) -> ffmpeg::util::frame::Audio {
        let mut frame = ffmpeg::util::frame::Audio::new(format.format, samples, format.layout);
        frame.set_rate(format.rate);
        frame.set_pts(Some(pts));
        for plane in 0..format.planes() {
            audio_plane_data_mut(&mut frame, plane).fill(0);
        }
        frame
    }

    fn pcm_encoder() -> AudioEncoder {
        let codec = find_encoder(Some("pcm_s16le"), codec::Id::None).unwrap();
        AudioEncoder::open(codec, Sample::F32(Type::Planar), 48000, 2, 0, false).unwrap()
    }

    #[test]
    fn test_find_encoder() {
        assert!(matches!(
            find_encoder(Some("no_such_encoder"), codec::Id::None),
            Err(TranscodeError::EncoderNotFound(_))
        ));
        assert!(matches!(
            find_encoder(None, codec::Id::None),
            Err(TranscodeError::EncoderNotFound(_))
        ));
        assert!(find_encoder(None, codec::Id::PCM_S16LE).is_ok());
    }

    #[test]
    fn test_pcm_negotiation() {
        let enc = pcm_encoder();
        assert_eq!(
            enc.output_format(),
            FormatDescriptor::new(Sample::I16(Type::Packed), 48000, ChannelLayout::STEREO)
        );
        assert_eq!(enc.frame_size(), DEFAULT_FRAME_SIZE);
        assert_eq!(enc.time_base(), ffmpeg::Rational::new(1, 48000));
        assert!(enc.codec_parameters().is_ok());
    }

    #[test]
    fn test_pcm_encode_and_drain() {
        let mut enc = pcm_encoder();
        let format = enc.output_format();
        let mut pts = Vec::new();

        for i in 0..2 {
            let frame = silent_frame(format, 1024, i * 1024);
            assert_eq!(enc.send_frame(Some(&frame)).unwrap(), Push::Accepted);
            while let Pull::Ready(packet) = enc.receive_packet().unwrap() {
                pts.push(packet.packet.pts());
            }
        }
        enc.send_frame(None).unwrap();
        loop {
            match enc.receive_packet().unwrap() {
                Pull::Ready(packet) => pts.push(packet.packet.pts()),
                Pull::NeedMoreInput => panic!("drain stalled"),
                Pull::EndOfStream => break,
            }
        }
        assert_eq!(pts, vec![Some(0), Some(1024)]);
    }

    #[test]
    fn test_rejects_wrong_format() {
        let mut enc = pcm_encoder();
        let wrong = silent_frame(
            FormatDescriptor::new(Sample::F32(Type::Planar), 48000, ChannelLayout::STEREO),
            1024,
            0,
        );
        assert!(matches!(
            enc.send_frame(Some(&wrong)),
            Err(TranscodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_aac_short_frame_only_last() {
        let codec = match find_encoder(None, codec::Id::AAC) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping AAC frame size check, no AAC encoder");
                return;
            }
        };
        let mut enc =
            AudioEncoder::open(codec, Sample::I16(Type::Packed), 44100, 2, 128_000, false).unwrap();
        assert_eq!(enc.output_format().format, Sample::F32(Type::Planar));
        assert_eq!(enc.frame_size(), 1024);

        let format = enc.output_format();
        let short = silent_frame(format, 512, 0);
        assert_eq!(enc.send_frame(Some(&short)).unwrap(), Push::Accepted);
        let next = silent_frame(format, 1024, 512);
        assert!(matches!(
            enc.send_frame(Some(&next)),
            Err(TranscodeError::InvalidInput(_))
        ));
    }
}

//! Audio decoder for the transcoding pipeline
//!
//! Wraps an FFmpeg `AVCodecContext` to decode compressed audio packets
//! (AAC, Opus, MP3, FLAC, PCM, …) into raw `AVFrame`s through the
//! send/receive contract.

use ffmpeg_next as ffmpeg;

use crate::error::{map_alloc_error, Result, TranscodeError};
use crate::ffmpeg::helpers::normalize_frame_layout;
use crate::types::{FormatDescriptor, Pull, Push};

/// Decoder state for one stream.
pub struct MediaDecoder {
    decoder: ffmpeg::decoder::Audio,
    time_base: ffmpeg::Rational,
    /// Fixed by the first decoded frame.
    format: Option<FormatDescriptor>,
    frames: u64,
}

impl MediaDecoder {
    /// Open a decoder matching the codec id in `parameters`.
    ///
    /// `time_base` is the stream time base packets and frames are stamped in.
    pub fn open(parameters: ffmpeg::codec::Parameters, time_base: ffmpeg::Rational) -> Result<Self> {
        let codec_id = parameters.id();
        if ffmpeg::codec::decoder::find(codec_id).is_none() {
            return Err(TranscodeError::DecoderNotFound(format!(
                "no decoder for codec {}",
                codec_id.name()
            )));
        }

        let mut context = ffmpeg::codec::Context::from_parameters(parameters).map_err(|e| {
            map_alloc_error(e, |e| {
                TranscodeError::DecoderNotFound(format!(
                    "cannot create codec context for {}: {}",
                    codec_id.name(),
                    e
                ))
            })
        })?;
        context.set_time_base(time_base);

        let decoder = context.decoder().audio().map_err(|e| {
            map_alloc_error(e, |e| {
                TranscodeError::DecoderNotFound(format!(
                    "cannot open audio decoder for {}: {}",
                    codec_id.name(),
                    e
                ))
            })
        })?;

        tracing::debug!(codec = codec_id.name(), time_base = %time_base, "Opened decoder");

        Ok(Self {
            decoder,
            time_base,
            format: None,
            frames: 0,
        })
    }

    /// Feed one compressed packet, or end-of-stream when `None`.
    pub fn send(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<Push> {
        let result = match packet {
            Some(packet) => self.decoder.send_packet(packet),
            None => self.decoder.send_eof(),
        };
        match result {
            Ok(()) => Ok(Push::Accepted),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(Push::Full),
            Err(ffmpeg::Error::Eof) => Ok(Push::Closed),
            Err(ffmpeg::Error::InvalidData) => Err(TranscodeError::MalformedData(format!(
                "decoder rejected packet at pts {:?}",
                packet.and_then(|p| p.pts())
            ))),
            Err(e) => Err(TranscodeError::Codec(format!("decoder send failed: {}", e))),
        }
    }

    /// Pull the next decoded frame.
    pub fn receive(&mut self) -> Result<Pull<ffmpeg::util::frame::Audio>> {
        let mut frame = ffmpeg::util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                normalize_frame_layout(&mut frame);
                if frame.pts().is_none() {
                    frame.set_pts(frame.timestamp());
                }
                if self.format.is_none() {
                    let format = FormatDescriptor::of_frame(&frame);
                    tracing::debug!(format = %format, "Decoder output format fixed");
                    self.format = Some(format);
                }
                self.frames += 1;
                Ok(Pull::Ready(frame))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(Pull::NeedMoreInput)
            }
            Err(ffmpeg::Error::Eof) => Ok(Pull::EndOfStream),
            Err(ffmpeg::Error::InvalidData) => Err(TranscodeError::MalformedData(
                "decoder produced invalid data".into(),
            )),
            Err(e) => Err(TranscodeError::Codec(format!("decoder receive failed: {}", e))),
        }
    }

    /// Discard buffered state after a discontinuity. The negotiated format
    /// is kept.
    pub fn flush(&mut self) {
        self.decoder.flush();
        tracing::debug!(frames = self.frames, "Decoder flushed");
    }

    /// Output format, known only after the first decoded frame.
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.format
    }

    pub fn time_base(&self) -> ffmpeg::Rational {
        self.time_base
    }

    pub fn codec_name(&self) -> &'static str {
        self.decoder.id().name()
    }

    /// Frames produced so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_decoder() {
        let params = ffmpeg::codec::Parameters::new();
        let result = MediaDecoder::open(params, ffmpeg::Rational::new(1, 48000));
        assert!(matches!(result, Err(TranscodeError::DecoderNotFound(_))));
    }

    #[test]
    fn test_common_decoders_available() {
        for id in [
            ffmpeg::codec::Id::AAC,
            ffmpeg::codec::Id::MP3,
            ffmpeg::codec::Id::PCM_S16LE,
        ] {
            assert!(ffmpeg::codec::decoder::find(id).is_some());
        }
    }
}

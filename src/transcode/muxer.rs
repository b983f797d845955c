//! Container muxing for the write path
//!
//! The container is chosen from the output path's extension or an explicit
//! hint; content is never inspected.

use std::ffi::CString;

use ffmpeg_next as ffmpeg;

use crate::error::{Result, TranscodeError};
use crate::types::EncodedPacket;

/// The muxer stage as seen by the writer.
pub trait PacketMuxer {
    /// Whether codecs must put their headers in extradata instead of the
    /// bitstream. Consulted before the encoder opens.
    fn requires_global_header(&self) -> bool;

    /// Create the single audio stream.
    fn add_stream(&mut self, parameters: ffmpeg::codec::Parameters, time_base: ffmpeg::Rational) -> Result<()>;

    fn write_header(&mut self) -> Result<()>;

    /// Rescale into the stream time base and write interleaved.
    fn write_packet(&mut self, packet: EncodedPacket) -> Result<()>;

    fn write_trailer(&mut self) -> Result<()>;
}

/// Check that FFmpeg has a muxer for `path` / `container`.
fn guess_format(path: &str, container: Option<&str>) -> Result<()> {
    let unsupported = || {
        TranscodeError::UnsupportedContainer(match container {
            Some(name) => format!("no muxer named '{}'", name),
            None => format!("cannot infer container from '{}'", path),
        })
    };
    let filename = CString::new(path).map_err(|_| unsupported())?;
    let short_name = container
        .map(CString::new)
        .transpose()
        .map_err(|_| unsupported())?;
    // SAFETY: both strings are NUL-terminated and outlive the call; the
    // returned pointer refers to a static muxer description.
    let found = unsafe {
        ffmpeg::ffi::av_guess_format(
            short_name.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            filename.as_ptr(),
            std::ptr::null(),
        )
    };
    if found.is_null() {
        Err(unsupported())
    } else {
        Ok(())
    }
}

/// File muxer with one audio stream.
pub struct AudioMuxer {
    output: ffmpeg::format::context::Output,
    path: String,
    stream_index: Option<usize>,
    stream_time_base: ffmpeg::Rational,
    header_written: bool,
    trailer_written: bool,
    packets_written: u64,
}

impl AudioMuxer {
    /// Allocate the container and open `path` for writing.
    pub fn create(path: &str, container: Option<&str>) -> Result<Self> {
        guess_format(path, container)?;

        let output = match container {
            Some(name) => ffmpeg::format::output_as(&path, name),
            None => ffmpeg::format::output(&path),
        }
        .map_err(|e| match e {
            ffmpeg::Error::MuxerNotFound => {
                TranscodeError::UnsupportedContainer(format!("{}: {}", path, e))
            }
            ffmpeg::Error::Other { errno } if errno == ffmpeg::error::ENOMEM => {
                TranscodeError::AllocationFailed(format!("output context for {}: {}", path, e))
            }
            e => TranscodeError::WriteIo(format!("cannot open {}: {}", path, e)),
        })?;

        tracing::debug!(
            path,
            container = output.format().name(),
            "Created output container"
        );

        Ok(Self {
            output,
            path: path.to_string(),
            stream_index: None,
            stream_time_base: ffmpeg::Rational::new(0, 1),
            header_written: false,
            trailer_written: false,
            packets_written: 0,
        })
    }

    /// The container's preferred audio codec for this path.
    pub fn default_codec(&self) -> ffmpeg::codec::Id {
        self.output
            .format()
            .codec(&self.path, ffmpeg::media::Type::Audio)
    }

    pub fn container_name(&self) -> String {
        self.output.format().name().to_string()
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    fn stream_index(&self, operation: &str) -> Result<usize> {
        self.stream_index.ok_or_else(|| {
            TranscodeError::InvalidInput(format!("{} before the audio stream was added", operation))
        })
    }
}

impl PacketMuxer for AudioMuxer {
    fn requires_global_header(&self) -> bool {
        self.output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER)
    }

    fn add_stream(&mut self, parameters: ffmpeg::codec::Parameters, time_base: ffmpeg::Rational) -> Result<()> {
        if self.stream_index.is_some() {
            return Err(TranscodeError::InvalidInput(
                "output already has an audio stream".into(),
            ));
        }
        let mut out_stream = self
            .output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| TranscodeError::AllocationFailed(format!("Failed to add audio stream: {}", e)))?;
        out_stream.set_parameters(parameters);
        out_stream.set_time_base(time_base);

        self.stream_index = Some(out_stream.index());
        self.stream_time_base = time_base;

        tracing::debug!(index = out_stream.index(), time_base = %time_base, "Added audio stream");
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let index = self.stream_index("write_header")?;
        self.output
            .write_header()
            .map_err(|e| TranscodeError::WriteIo(format!("Failed to write header: {}", e)))?;
        self.header_written = true;

        // The muxer may pick its own time base while writing the header.
        if let Some(stream) = self.output.stream(index) {
            self.stream_time_base = stream.time_base();
        }
        tracing::debug!(
            path = %self.path,
            stream_time_base = %self.stream_time_base,
            "Wrote container header"
        );
        Ok(())
    }

    fn write_packet(&mut self, packet: EncodedPacket) -> Result<()> {
        let index = self.stream_index("write_packet")?;
        if !self.header_written || self.trailer_written {
            return Err(TranscodeError::InvalidInput(
                "packets can only be written between header and trailer".into(),
            ));
        }

        let EncodedPacket {
            mut packet,
            time_base,
        } = packet;
        packet.set_stream(index);
        packet.set_position(-1);
        packet.rescale_ts(time_base, self.stream_time_base);

        packet
            .write_interleaved(&mut self.output)
            .map_err(|e| TranscodeError::WriteIo(format!("Failed to write packet: {}", e)))?;
        self.packets_written += 1;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(TranscodeError::InvalidInput(
                "trailer written before header".into(),
            ));
        }
        self.output
            .write_trailer()
            .map_err(|e| TranscodeError::WriteIo(format!("Failed to write trailer: {}", e)))?;
        self.trailer_written = true;
        tracing::debug!(
            path = %self.path,
            packets = self.packets_written,
            "Wrote container trailer"
        );
        Ok(())
    }
}

//! Bounded-memory audio transcoding on top of FFmpeg.
//!
//! Demux, decode, filter, re-chunk, encode and mux one audio stream, with
//! every stage exchanging data through an explicit push/drain contract.

pub mod config;
pub mod error;
pub mod events;
pub(crate) mod ffmpeg;
pub mod transcode;
pub mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use config::{
    LoggingConfig, PlaybackConfig, ReaderConfig, SeekPolicy, TranscodeConfig, WriterConfig,
};
pub use error::{ErrorClass, Result, TranscodeError};
pub use events::{PipelineObserver, TracingObserver};
pub use ffmpeg::version_info as ffmpeg_version_info;
pub use ffmpeg::{init, install_log_filter};
pub use transcode::job::{transcode_file, transcode_reader, TranscodeSummary};
pub use transcode::reader::{InterruptToken, MediaReader, StreamInfo};
pub use transcode::transcoder::{playback_format, AudioTranscoder};
pub use transcode::writer::{AudioWriter, WriterStats};
pub use types::{EncodedPacket, FormatDescriptor, PipelineState, Pull, Push};

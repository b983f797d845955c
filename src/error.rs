use thiserror::Error;

use crate::types::PipelineState;

/// Main error type for the transcoding pipeline
#[derive(Error, Debug)]
pub enum TranscodeError {
    // Resource
    #[error("FFmpeg initialization failed: {0}")]
    InitFailed(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    // Negotiation
    #[error("Failed to probe stream info: {0}")]
    StreamProbeFailed(String),

    #[error("No matching stream: {0}")]
    NoMatchingStream(String),

    #[error("Decoder not found: {0}")]
    DecoderNotFound(String),

    #[error("Encoder not found: {0}")]
    EncoderNotFound(String),

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Filter graph not configurable: {0}")]
    GraphNotConfigurable(String),

    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    // Transient I/O
    #[error("Read interrupted")]
    Interrupted,

    #[error("Read failed: {0}")]
    ReadFailed(String),

    // Protocol / format
    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // Write I/O
    #[error("Write I/O error: {0}")]
    WriteIo(String),

    // Usage
    #[error("Insufficient samples: requested={requested}, available={available}")]
    InsufficientSamples { requested: usize, available: usize },

    #[error("Invalid state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("Session failed")]
    SessionFailed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classes used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Allocation/open failures. Fatal, never retried inside the pipeline.
    Resource,
    /// No compatible format, codec, filter or container. Fatal, raised before data flows.
    Negotiation,
    /// Read stalls and interruption. Recoverable by a caller-initiated retry or seek.
    TransientIo,
    /// Malformed compressed data. The caller may flush or reposition and continue.
    ProtocolFormat,
    /// Muxer failures. Fatal to the session.
    WriteIo,
    /// API misuse or calls on a finished session.
    Usage,
}

impl TranscodeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InitFailed(_)
            | Self::SourceUnavailable(_)
            | Self::OutOfMemory(_)
            | Self::AllocationFailed(_) => ErrorClass::Resource,
            Self::StreamProbeFailed(_)
            | Self::NoMatchingStream(_)
            | Self::DecoderNotFound(_)
            | Self::EncoderNotFound(_)
            | Self::FilterNotFound(_)
            | Self::GraphNotConfigurable(_)
            | Self::UnsupportedContainer(_) => ErrorClass::Negotiation,
            Self::Interrupted | Self::ReadFailed(_) => ErrorClass::TransientIo,
            Self::MalformedData(_) | Self::Codec(_) => ErrorClass::ProtocolFormat,
            Self::WriteIo(_) | Self::Io(_) => ErrorClass::WriteIo,
            Self::InsufficientSamples { .. }
            | Self::InvalidState { .. }
            | Self::SessionFailed
            | Self::InvalidInput(_)
            | Self::Config(_) => ErrorClass::Usage,
        }
    }

    /// Whether a caller can keep using the component that raised this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientIo | ErrorClass::ProtocolFormat
        )
    }
}

/// Map an FFmpeg error raised while allocating or opening something.
///
/// `ENOMEM` becomes [`TranscodeError::OutOfMemory`]; everything else goes
/// through `fallback`.
pub(crate) fn map_alloc_error(
    e: ffmpeg_next::Error,
    fallback: impl FnOnce(ffmpeg_next::Error) -> TranscodeError,
) -> TranscodeError {
    match e {
        ffmpeg_next::Error::Other { errno } if errno == ffmpeg_next::error::ENOMEM => {
            TranscodeError::OutOfMemory(e.to_string())
        }
        other => fallback(other),
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TranscodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            TranscodeError::SourceUnavailable("x".into()).class(),
            ErrorClass::Resource
        );
        assert_eq!(
            TranscodeError::FilterNotFound("bogus".into()).class(),
            ErrorClass::Negotiation
        );
        assert_eq!(TranscodeError::Interrupted.class(), ErrorClass::TransientIo);
        assert_eq!(
            TranscodeError::MalformedData("bad".into()).class(),
            ErrorClass::ProtocolFormat
        );
        assert_eq!(
            TranscodeError::WriteIo("disk full".into()).class(),
            ErrorClass::WriteIo
        );
        assert_eq!(TranscodeError::SessionFailed.class(), ErrorClass::Usage);
    }

    #[test]
    fn test_recoverable() {
        assert!(TranscodeError::Interrupted.is_recoverable());
        assert!(TranscodeError::MalformedData("x".into()).is_recoverable());
        assert!(!TranscodeError::WriteIo("x".into()).is_recoverable());
        assert!(!TranscodeError::SessionFailed.is_recoverable());
    }

    #[test]
    fn test_enomem_maps_to_out_of_memory() {
        let e = ffmpeg_next::Error::Other {
            errno: ffmpeg_next::error::ENOMEM,
        };
        let mapped = map_alloc_error(e, |e| TranscodeError::Codec(e.to_string()));
        assert!(matches!(mapped, TranscodeError::OutOfMemory(_)));

        let mapped = map_alloc_error(ffmpeg_next::Error::InvalidData, |e| {
            TranscodeError::Codec(e.to_string())
        });
        assert!(matches!(mapped, TranscodeError::Codec(_)));
    }

    #[test]
    fn test_display() {
        let e = TranscodeError::InsufficientSamples {
            requested: 1024,
            available: 10,
        };
        assert_eq!(
            e.to_string(),
            "Insufficient samples: requested=1024, available=10"
        );
        let e = TranscodeError::InvalidState {
            operation: "write",
            state: PipelineState::Uninitialized,
        };
        assert_eq!(e.to_string(), "Invalid state for write: uninitialized");
    }
}

//! Pipeline observer events
//!
//! Progress and failures surface as discrete callbacks on a caller-supplied
//! observer rather than through polling.

use crate::error::TranscodeError;
use crate::types::FormatDescriptor;

/// Receives pipeline events. Every method defaults to a no-op.
///
/// Observers may be called from the packet pump thread, hence `Send + Sync`.
pub trait PipelineObserver: Send + Sync {
    /// The output format of a stage is fixed.
    fn format_ready(&self, _format: &FormatDescriptor) {}

    /// New decoded samples are ready to pull; `buffered` is the total now
    /// available.
    fn output_available(&self, _buffered: usize) {}

    /// Read progress through the source, in `0.0..=1.0`.
    fn progress(&self, _fraction: f64) {}

    /// An unrecoverable error stopped the producer.
    fn error(&self, _error: &TranscodeError) {}
}

/// Observer that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn format_ready(&self, format: &FormatDescriptor) {
        tracing::info!(format = %format, "Output format ready");
    }

    fn output_available(&self, buffered: usize) {
        tracing::trace!(buffered, "Output available");
    }

    fn progress(&self, fraction: f64) {
        tracing::debug!(percent = format!("{:.1}", fraction * 100.0), "Read progress");
    }

    fn error(&self, error: &TranscodeError) {
        tracing::error!(error = %error, class = ?error.class(), "Pipeline error");
    }
}

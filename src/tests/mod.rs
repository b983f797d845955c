//! Integration testing module
//!
//! End-to-end tests for the transcoding pipeline:
//! - Writer re-chunking, lifecycle and failure handling
//! - File-to-file transcodes of generated WAV input
//! - Read-path chunking, seeking and filter errors
//! - Packet pump backpressure and error reporting

pub mod e2e;

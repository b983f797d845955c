//! Audio transcoding pipeline
//!
//! Read path: `reader` → `pump` → `decoder` → `filter_graph` → `fifo`
//! (`transcoder`), ending in fixed-size chunks for a playback consumer.
//!
//! Write path: raw frames → `filter_graph` → `fifo` → `encoder` → `muxer`
//! (`writer`). `job` connects both paths for file-to-file runs.

pub mod decoder;
pub mod encoder;
pub mod fifo;
pub mod filter_graph;
pub mod job;
pub mod muxer;
pub mod negotiate;
pub mod packet_queue;
pub mod pump;
pub mod reader;
pub mod transcoder;
pub mod writer;

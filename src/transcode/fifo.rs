//! Sample FIFO
//!
//! Decouples the variable frame sizes coming out of the filter graph from the
//! fixed frame size an encoder needs. Samples are kept per plane in
//! `BytesMut` buffers; the FIFO never reorders them, it only re-chunks.
//!
//! Timestamps: the pts passed with the first write after the FIFO was empty
//! becomes the logical start. Later writes are assumed contiguous and their
//! pts is ignored. Every read advances the start by the number of samples
//! removed.

use bytes::{Bytes, BytesMut};
use ffmpeg_next as ffmpeg;

use crate::error::{Result, TranscodeError};
use crate::ffmpeg::helpers::{audio_plane_data, audio_plane_data_mut};
use crate::types::FormatDescriptor;

/// Samples removed from the FIFO by one read.
#[derive(Debug, Clone)]
pub struct FifoChunk {
    /// One buffer per plane, `samples * stride` bytes each.
    pub planes: Vec<Bytes>,
    pub samples: usize,
    /// Pts of the first sample, if the FIFO had one.
    pub pts: Option<i64>,
}

/// Byte-accurate FIFO of raw samples.
pub struct SampleFifo {
    format: FormatDescriptor,
    planes: Vec<BytesMut>,
    stride: usize,
    samples: usize,
    next_pts: Option<i64>,
}

impl SampleFifo {
    pub fn new(format: FormatDescriptor) -> Self {
        let planes = (0..format.planes()).map(|_| BytesMut::new()).collect();
        Self {
            format,
            planes,
            stride: format.plane_stride(),
            samples: 0,
            next_pts: None,
        }
    }

    /// Pre-allocate room for `samples` more samples per plane.
    pub fn with_capacity(format: FormatDescriptor, samples: usize) -> Self {
        let mut fifo = Self::new(format);
        for plane in &mut fifo.planes {
            plane.reserve(samples * fifo.stride);
        }
        fifo
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    /// Append `count` samples. `planes` must hold one slice per plane with
    /// at least `count * stride` bytes each.
    pub fn write(&mut self, planes: &[&[u8]], count: usize, pts: Option<i64>) -> Result<()> {
        if planes.len() != self.planes.len() {
            return Err(TranscodeError::InvalidInput(format!(
                "expected {} planes, got {}",
                self.planes.len(),
                planes.len()
            )));
        }
        let bytes = count * self.stride;
        if let Some(short) = planes.iter().position(|p| p.len() < bytes) {
            return Err(TranscodeError::InvalidInput(format!(
                "plane {} holds {} bytes, {} needed for {} samples",
                short,
                planes[short].len(),
                bytes,
                count
            )));
        }
        if count == 0 {
            return Ok(());
        }

        if self.samples == 0 {
            self.next_pts = pts;
        }
        for (dst, src) in self.planes.iter_mut().zip(planes) {
            dst.extend_from_slice(&src[..bytes]);
        }
        self.samples += count;
        Ok(())
    }

    /// Remove exactly `count` samples.
    pub fn read(&mut self, count: usize) -> Result<FifoChunk> {
        if count > self.samples {
            return Err(TranscodeError::InsufficientSamples {
                requested: count,
                available: self.samples,
            });
        }
        Ok(self.take(count))
    }

    /// Remove up to `count` samples. Used when flushing at end of stream,
    /// where a short remainder is expected.
    pub fn read_up_to(&mut self, count: usize) -> FifoChunk {
        self.take(count.min(self.samples))
    }

    fn take(&mut self, count: usize) -> FifoChunk {
        let bytes = count * self.stride;
        let planes = self
            .planes
            .iter_mut()
            .map(|p| p.split_to(bytes).freeze())
            .collect();
        let pts = self.next_pts;

        self.samples -= count;
        if self.samples == 0 {
            self.next_pts = None;
        } else {
            self.next_pts = pts.map(|p| p + count as i64);
        }

        FifoChunk {
            planes,
            samples: count,
            pts,
        }
    }

    pub fn available_samples(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Pts of the next sample to be read.
    pub fn next_pts(&self) -> Option<i64> {
        self.next_pts
    }

    /// Pts one past the last buffered sample.
    pub fn end_pts(&self) -> Option<i64> {
        self.next_pts.map(|p| p + self.samples as i64)
    }

    /// Drop all samples and reset the tracked pts.
    pub fn clear(&mut self) {
        for plane in &mut self.planes {
            plane.clear();
        }
        self.samples = 0;
        self.next_pts = None;
    }

    /// Append every sample of `frame`, which must be in this FIFO's format.
    pub fn write_frame(&mut self, frame: &ffmpeg::util::frame::Audio, pts: Option<i64>) -> Result<()> {
        let actual = FormatDescriptor::of_frame(frame);
        if actual.format != self.format.format || actual.channels() != self.format.channels() {
            return Err(TranscodeError::InvalidInput(format!(
                "frame format {} does not match fifo format {}",
                actual, self.format
            )));
        }
        let planes: Vec<&[u8]> = (0..self.planes.len())
            .map(|i| audio_plane_data(frame, i))
            .collect();
        self.write(&planes, frame.samples(), pts)
    }

    /// Remove `count` samples into a newly allocated frame. With `flush`,
    /// a shorter remainder is accepted; `Ok(None)` means the FIFO is empty.
    pub fn read_frame(
        &mut self,
        count: usize,
        flush: bool,
    ) -> Result<Option<ffmpeg::util::frame::Audio>> {
        if self.samples == 0 {
            return Ok(None);
        }
        let chunk = if flush {
            self.read_up_to(count)
        } else {
            self.read(count)?
        };
        Ok(Some(chunk_to_frame(&chunk, &self.format)))
    }
}

/// Copy a chunk into an FFmpeg frame carrying `format` and the chunk's pts.
pub fn chunk_to_frame(chunk: &FifoChunk, format: &FormatDescriptor) -> ffmpeg::util::frame::Audio {
    let mut frame = ffmpeg::util::frame::Audio::new(format.format, chunk.samples, format.layout);
    frame.set_rate(format.rate);
    frame.set_pts(chunk.pts);
    for (i, plane) in chunk.planes.iter().enumerate() {
        let dst = audio_plane_data_mut(&mut frame, i);
        dst[..plane.len()].copy_from_slice(plane);
    }
    frame
}

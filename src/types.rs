//! Core pipeline types shared by every stage
//!
//! - [`FormatDescriptor`]: the (sample format, rate, layout) triple compared
//!   at each stage boundary
//! - [`Pull`] / [`Push`]: the two-phase produce/drain contract
//! - [`PipelineState`]: the writer lifecycle
//! - [`EncodedPacket`]: a compressed packet tagged with its time base

use std::fmt;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::Sample;

use crate::ffmpeg::utils::{layout_channels, layout_name};

/// Immutable audio format triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format: Sample,
    pub rate: u32,
    pub layout: ChannelLayout,
}

impl FormatDescriptor {
    pub fn new(format: Sample, rate: u32, layout: ChannelLayout) -> Self {
        Self {
            format,
            rate,
            layout,
        }
    }

    /// Describe a decoded or filtered frame.
    pub fn of_frame(frame: &ffmpeg::util::frame::Audio) -> Self {
        Self {
            format: frame.format(),
            rate: frame.rate(),
            layout: frame.channel_layout(),
        }
    }

    pub fn channels(&self) -> usize {
        layout_channels(self.layout)
    }

    /// Same sample format, rate and channel count. Layouts with equal
    /// channel counts are interchangeable.
    pub fn same_shape(&self, other: &FormatDescriptor) -> bool {
        self.format == other.format
            && self.rate == other.rate
            && self.channels() == other.channels()
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.format.bytes()
    }

    pub fn is_planar(&self) -> bool {
        self.format.is_planar()
    }

    /// Number of data planes a frame in this format carries.
    pub fn planes(&self) -> usize {
        if self.is_planar() {
            self.channels()
        } else {
            1
        }
    }

    /// Bytes occupied by one sample instant in a single plane.
    pub fn plane_stride(&self) -> usize {
        if self.is_planar() {
            self.bytes_per_sample()
        } else {
            self.bytes_per_sample() * self.channels()
        }
    }

    /// The natural time base for sample-counted timestamps: `1/rate`.
    pub fn sample_time_base(&self) -> ffmpeg::Rational {
        ffmpeg::Rational::new(1, self.rate.max(1) as i32)
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}Hz/{}",
            self.format.name(),
            self.rate,
            layout_name(self.layout)
        )
    }
}

/// Outcome of a pull-style call on a two-phase stage.
///
/// A stage produces a lazy, finite sequence of outputs per input; callers
/// keep pulling until they see something other than `Ready`.
#[derive(Debug)]
pub enum Pull<T> {
    Ready(T),
    /// Nothing available until more input is pushed.
    NeedMoreInput,
    /// Fully drained after an end-of-stream push.
    EndOfStream,
}

impl<T> Pull<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Pull::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Pull::Ready(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of a send-style call on a two-phase stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// The stage has pending output; drain it before sending again.
    Full,
    /// The stage already received end-of-stream.
    Closed,
}

/// Writer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initialized,
    Opened,
    Writing,
    Draining,
    Closed,
    Failed,
}

impl PipelineState {
    /// Closed and Failed sessions accept nothing but teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Closed | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Initialized => "initialized",
            PipelineState::Opened => "opened",
            PipelineState::Writing => "writing",
            PipelineState::Draining => "draining",
            PipelineState::Closed => "closed",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Compressed packet in the time base of the encoder that produced it.
pub struct EncodedPacket {
    pub packet: ffmpeg::Packet,
    pub time_base: ffmpeg::Rational,
}

impl fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("pts", &self.packet.pts())
            .field("dts", &self.packet.dts())
            .field("size", &self.packet.size())
            .field("time_base", &self.time_base)
            .finish()
    }
}

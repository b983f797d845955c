//! Media reader
//!
//! Opens a source, enumerates its streams, picks the best audio stream and
//! pulls compressed packets. Reads are cancellable from any thread through an
//! [`InterruptToken`]: the token is checked before every read and FFmpeg polls
//! it from its interrupt callback while blocked in I/O.

use std::collections::BTreeMap;
use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::config::SeekPolicy;
use crate::error::{Result, TranscodeError};
use crate::ffmpeg::helpers::{codec_params_channels, codec_params_sample_rate};
use crate::ffmpeg::utils::{media_type_name, microseconds, rescale_ts};

/// Cross-thread cancellation flag shared by a reader and whoever may cancel
/// it. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn as_opaque(&self) -> *mut c_void {
        Arc::as_ptr(&self.flag) as *mut c_void
    }
}

impl fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptToken")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// FFmpeg polls this during blocking I/O; non-zero aborts the operation with
/// `AVERROR_EXIT`.
unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    // SAFETY: `opaque` points at the `AtomicBool` inside the token's Arc,
    // which `FfmpegDemuxer` keeps alive for as long as the format context.
    let flag = &*(opaque as *const AtomicBool);
    flag.load(Ordering::Acquire) as c_int
}

/// Metadata of one demuxed stream.
#[derive(Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub medium: ffmpeg::media::Type,
    pub codec_id: ffmpeg::codec::Id,
    pub time_base: ffmpeg::Rational,
    pub start_time: Option<i64>,
    /// Duration in `time_base` units, if known.
    pub duration: Option<i64>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamInfo {
    fn from_stream(stream: &ffmpeg::format::stream::Stream) -> Self {
        let parameters = stream.parameters();
        let positive = |v: i64| if v > 0 { Some(v) } else { None };
        Self {
            index: stream.index(),
            medium: parameters.medium(),
            codec_id: parameters.id(),
            time_base: stream.time_base(),
            start_time: (stream.start_time() != i64::MIN).then(|| stream.start_time()),
            duration: positive(stream.duration()),
            sample_rate: codec_params_sample_rate(&parameters),
            channels: codec_params_channels(&parameters),
        }
    }

    /// Stream duration in seconds, if known.
    pub fn duration_secs(&self) -> Option<f64> {
        self.duration.map(|d| d as f64 * f64::from(self.time_base))
    }
}

impl fmt::Debug for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamInfo")
            .field("index", &self.index)
            .field("medium", &media_type_name(self.medium))
            .field("codec", &self.codec_id.name())
            .field("time_base", &self.time_base)
            .field("duration", &self.duration)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

/// A demultiplexing backend.
///
/// Implementations must return [`TranscodeError::Interrupted`] from a blocked
/// `read_packet` soon after the reader's token is set.
pub trait Demuxer {
    fn streams(&self) -> Vec<StreamInfo>;

    fn best_stream(&self, medium: ffmpeg::media::Type) -> Option<usize>;

    /// Codec parameters of stream `index`, for opening a decoder.
    fn codec_parameters(&self, index: usize) -> Option<ffmpeg::codec::Parameters>;

    /// Next packet of any stream, `None` at end of stream.
    fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>>;

    /// Reposition to the keyframe at or before `timestamp_us` (microseconds).
    fn seek(&mut self, timestamp_us: i64) -> Result<()>;
}

/// FFmpeg `AVFormatContext` backend.
pub struct FfmpegDemuxer {
    // Dropped before `token` so the context never outlives the flag its
    // interrupt callback points at.
    input: ffmpeg::format::context::Input,
    _token: InterruptToken,
}

impl FfmpegDemuxer {
    /// Open `source` with protocol `options`, wiring `token` into FFmpeg's
    /// interrupt callback.
    pub fn open(
        source: &str,
        options: &BTreeMap<String, String>,
        token: &InterruptToken,
    ) -> Result<Self> {
        let url = CString::new(source).map_err(|_| {
            TranscodeError::SourceUnavailable(format!("source contains a NUL byte: {:?}", source))
        })?;

        let mut dict = ffmpeg::Dictionary::new();
        for (k, v) in options {
            dict.set(k, v);
        }

        // SAFETY: the context is allocated here and either handed to
        // `Input::wrap` (which owns and closes it) or freed on every error
        // path. `avformat_open_input` frees the context itself on failure.
        // The callback's opaque pointer stays valid because the token is
        // stored next to the Input.
        unsafe {
            let mut ctx = ffmpeg::ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(TranscodeError::OutOfMemory(
                    "avformat_alloc_context returned null".into(),
                ));
            }
            (*ctx).interrupt_callback = ffmpeg::ffi::AVIOInterruptCB {
                callback: Some(interrupt_callback),
                opaque: token.as_opaque(),
            };

            let mut opts = dict.disown();
            let ret = ffmpeg::ffi::avformat_open_input(
                &mut ctx,
                url.as_ptr(),
                std::ptr::null_mut(),
                &mut opts,
            );
            let unused = ffmpeg::Dictionary::own(opts);
            if ret < 0 {
                return Err(match ffmpeg::Error::from(ret) {
                    ffmpeg::Error::Exit => TranscodeError::Interrupted,
                    e => TranscodeError::SourceUnavailable(format!("{}: {}", source, e)),
                });
            }
            for (key, _) in unused.iter() {
                tracing::warn!(option = key, "Demuxer ignored option");
            }

            let ret = ffmpeg::ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
            if ret < 0 {
                ffmpeg::ffi::avformat_close_input(&mut ctx);
                return Err(match ffmpeg::Error::from(ret) {
                    ffmpeg::Error::Exit => TranscodeError::Interrupted,
                    e => TranscodeError::StreamProbeFailed(format!("{}: {}", source, e)),
                });
            }

            Ok(Self {
                input: ffmpeg::format::context::Input::wrap(ctx),
                _token: token.clone(),
            })
        }
    }

    /// Overall container duration in microseconds, if known.
    pub fn duration_us(&self) -> Option<i64> {
        let d = self.input.duration();
        (d > 0).then_some(d)
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> Vec<StreamInfo> {
        self.input
            .streams()
            .map(|s| StreamInfo::from_stream(&s))
            .collect()
    }

    fn best_stream(&self, medium: ffmpeg::media::Type) -> Option<usize> {
        self.input.streams().best(medium).map(|s| s.index())
    }

    fn codec_parameters(&self, index: usize) -> Option<ffmpeg::codec::Parameters> {
        self.input.stream(index).map(|s| s.parameters())
    }

    fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(ffmpeg::Error::Exit) => Err(TranscodeError::Interrupted),
            Err(ffmpeg::Error::InvalidData) => Err(TranscodeError::MalformedData(
                "demuxer reported invalid data".into(),
            )),
            Err(e) => Err(TranscodeError::ReadFailed(e.to_string())),
        }
    }

    fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        match self.input.seek(timestamp_us, ..timestamp_us) {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Exit) => Err(TranscodeError::Interrupted),
            Err(e) => Err(TranscodeError::ReadFailed(format!(
                "seek to {}us failed: {}",
                timestamp_us, e
            ))),
        }
    }
}

/// Interruptible, seekable packet source over a [`Demuxer`].
pub struct MediaReader<D: Demuxer = FfmpegDemuxer> {
    demuxer: D,
    token: InterruptToken,
    policy: SeekPolicy,
    streams: Vec<StreamInfo>,
    /// With `SeekPolicy::Exact`, packets ending before this time (in
    /// microseconds) are dropped after a seek.
    discard_before_us: Option<i64>,
}

impl MediaReader<FfmpegDemuxer> {
    /// Open `source` through FFmpeg.
    pub fn open(
        source: &str,
        options: &BTreeMap<String, String>,
        token: InterruptToken,
        policy: SeekPolicy,
    ) -> Result<Self> {
        if token.is_interrupted() {
            return Err(TranscodeError::Interrupted);
        }
        let demuxer = FfmpegDemuxer::open(source, options, &token)?;
        tracing::debug!(
            source,
            streams = demuxer.input.streams().count(),
            duration_us = ?demuxer.duration_us(),
            "Opened source"
        );
        Self::with_demuxer(demuxer, token, policy)
    }
}

impl<D: Demuxer> MediaReader<D> {
    /// Wrap an already opened backend.
    pub fn with_demuxer(demuxer: D, token: InterruptToken, policy: SeekPolicy) -> Result<Self> {
        if token.is_interrupted() {
            return Err(TranscodeError::Interrupted);
        }
        let streams = demuxer.streams();
        if streams.is_empty() {
            return Err(TranscodeError::StreamProbeFailed(
                "source has no streams".into(),
            ));
        }
        Ok(Self {
            demuxer,
            token,
            policy,
            streams,
            discard_before_us: None,
        })
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    pub fn token(&self) -> &InterruptToken {
        &self.token
    }

    pub fn seek_policy(&self) -> SeekPolicy {
        self.policy
    }

    /// Request cancellation of the current and every later read.
    pub fn interrupt(&self) {
        self.token.interrupt();
    }

    /// Codec parameters of stream `index`.
    pub fn codec_parameters(&self, index: usize) -> Result<ffmpeg::codec::Parameters> {
        self.demuxer.codec_parameters(index).ok_or_else(|| {
            TranscodeError::NoMatchingStream(format!("no stream with index {}", index))
        })
    }

    /// Index of the most suitable stream of `medium`.
    pub fn select_best_stream(&self, medium: ffmpeg::media::Type) -> Result<usize> {
        self.demuxer.best_stream(medium).ok_or_else(|| {
            TranscodeError::NoMatchingStream(format!(
                "no {} stream among {} streams",
                media_type_name(medium),
                self.streams.len()
            ))
        })
    }

    /// Block until the next packet (`Some`), end of stream (`None`) or
    /// interruption.
    pub fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        loop {
            if self.token.is_interrupted() {
                return Err(TranscodeError::Interrupted);
            }
            let packet = match self.demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                // An aborted read may surface as end of stream.
                Ok(None) if self.token.is_interrupted() => return Err(TranscodeError::Interrupted),
                Ok(None) => return Ok(None),
                Err(TranscodeError::Interrupted) => return Err(TranscodeError::Interrupted),
                Err(e) if self.token.is_interrupted() => {
                    tracing::debug!(error = %e, "Read failed after interrupt");
                    return Err(TranscodeError::Interrupted);
                }
                Err(e) => return Err(e),
            };

            if let Some(target) = self.discard_before_us {
                if self.ends_before(&packet, target) {
                    continue;
                }
                self.discard_before_us = None;
            }
            return Ok(Some(packet));
        }
    }

    fn ends_before(&self, packet: &ffmpeg::Packet, target_us: i64) -> bool {
        let Some(stream) = self.stream(packet.stream()) else {
            return false;
        };
        let Some(pts) = packet.pts() else {
            return false;
        };
        let end = pts + packet.duration().max(0);
        rescale_ts(end, stream.time_base, microseconds()) <= target_us
    }

    /// Reposition the read cursor.
    ///
    /// `timestamp` is in the time base of `stream_index` when given,
    /// otherwise in microseconds. The landing point follows the reader's
    /// [`SeekPolicy`]; callers must flush their decoder afterwards.
    pub fn seek(&mut self, timestamp: i64, stream_index: Option<usize>) -> Result<()> {
        if self.token.is_interrupted() {
            return Err(TranscodeError::Interrupted);
        }
        let timestamp_us = match stream_index {
            Some(index) => {
                let stream = self.stream(index).ok_or_else(|| {
                    TranscodeError::InvalidInput(format!("no stream with index {}", index))
                })?;
                rescale_ts(timestamp, stream.time_base, microseconds())
            }
            None => timestamp,
        };

        self.demuxer.seek(timestamp_us)?;
        self.discard_before_us = match self.policy {
            SeekPolicy::KeyframeBefore => None,
            SeekPolicy::Exact => Some(timestamp_us),
        };
        tracing::debug!(timestamp_us, policy = ?self.policy, "Seeked");
        Ok(())
    }
}

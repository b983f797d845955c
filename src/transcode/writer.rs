//! Write-path orchestrator
//!
//! Wires FilterGraph → SampleFifo → Encoder → Muxer and owns their
//! lifecycle:
//!
//! ```text
//! Uninitialized ─init─▶ Initialized ─open─▶ Opened ─write*─▶ Writing
//!                                                              │ close
//!                                        Closed ◀─ Draining ◀──┘
//! ```
//!
//! Any error moves the session to `Failed`. Closed and Failed sessions
//! reject every mutating call with `SessionFailed`.
//!
//! Every stage boundary follows "push one, drain fully": one frame goes into
//! the graph, every available graph output goes into the FIFO, every full
//! encoder frame goes out of the FIFO, and every packet produced by a send is
//! written before the next send.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;

use crate::config::WriterConfig;
use crate::error::{Result, TranscodeError};
use crate::ffmpeg::utils::{parse_sample_format, rescale_ts};
use crate::transcode::encoder::{find_encoder, AudioEncoder, FrameEncoder};
use crate::transcode::fifo::{chunk_to_frame, FifoChunk, SampleFifo};
use crate::transcode::filter_graph::{FilterGraph, GraphBuilder};
use crate::transcode::muxer::{AudioMuxer, PacketMuxer};
use crate::transcode::negotiate::CodecCapabilities;
use crate::types::{FormatDescriptor, PipelineState, Pull, Push};

const SOURCE: &str = "in";
const SINK: &str = "out";

/// Counters for one write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Frames handed to `write`.
    pub frames_in: u64,
    pub samples_in: u64,
    /// Samples that entered / left the FIFO.
    pub fifo_samples_in: u64,
    pub fifo_samples_out: u64,
    /// Frames sent to the encoder, the final short frame included.
    pub encoder_frames: u64,
    pub packets_written: u64,
}

/// Orchestrates one output file.
///
/// Stages are released in reverse construction order (FIFO, graph,
/// encoder, muxer) on close, on failure and on drop.
pub struct AudioWriter<E: FrameEncoder = AudioEncoder, M: PacketMuxer = AudioMuxer> {
    state: PipelineState,
    input: Option<FormatDescriptor>,
    input_time_base: ffmpeg::Rational,
    fifo: Option<SampleFifo>,
    graph: Option<FilterGraph>,
    encoder: Option<E>,
    muxer: Option<M>,
    output: Option<FormatDescriptor>,
    frame_size: usize,
    sink_time_base: ffmpeg::Rational,
    /// Running input sample count, for `write_interleaved` timestamps.
    input_samples: i64,
    /// Fallback pts for graph output frames without one.
    next_output_pts: i64,
    stats: WriterStats,
}

impl<E: FrameEncoder, M: PacketMuxer> Default for AudioWriter<E, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioWriter<AudioEncoder, AudioMuxer> {
    /// Create the muxer for `target`, negotiate and open the encoder, and
    /// wire the graph from `input` to the encoder format.
    pub fn init(
        &mut self,
        target: &str,
        input: FormatDescriptor,
        input_time_base: ffmpeg::Rational,
        config: &WriterConfig,
    ) -> Result<()> {
        self.guard("init", &[PipelineState::Uninitialized])?;

        let stages = (|| -> Result<(AudioEncoder, AudioMuxer)> {
            let muxer = AudioMuxer::create(target, config.container.as_deref())?;
            let codec = find_encoder(config.codec.as_deref(), muxer.default_codec())?;

            let format = match config.sample_format.as_deref() {
                Some(name) => parse_sample_format(name).ok_or_else(|| {
                    TranscodeError::Config(format!("unknown sample format '{}'", name))
                })?,
                None => input.format,
            };
            let rate = config.sample_rate.unwrap_or(input.rate);
            let channels = config
                .channels
                .map(usize::from)
                .unwrap_or_else(|| input.channels());

            let encoder = AudioEncoder::open(
                codec,
                format,
                rate,
                channels,
                config.bitrate,
                muxer.requires_global_header(),
            )?;
            Ok((encoder, muxer))
        })();

        match stages {
            Ok((encoder, muxer)) => self.init_with(input, input_time_base, encoder, muxer),
            Err(e) => Err(self.fail(e)),
        }
    }
}

impl<E: FrameEncoder, M: PacketMuxer> AudioWriter<E, M> {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Uninitialized,
            input: None,
            input_time_base: ffmpeg::Rational::new(1, 1),
            fifo: None,
            graph: None,
            encoder: None,
            muxer: None,
            output: None,
            frame_size: 0,
            sink_time_base: ffmpeg::Rational::new(1, 1),
            input_samples: 0,
            next_output_pts: 0,
            stats: WriterStats::default(),
        }
    }

    /// Initialise with an already opened encoder and a created muxer.
    pub fn init_with(
        &mut self,
        input: FormatDescriptor,
        input_time_base: ffmpeg::Rational,
        mut encoder: E,
        mut muxer: M,
    ) -> Result<()> {
        self.guard("init", &[PipelineState::Uninitialized])?;

        let wired = (|| -> Result<(FilterGraph, SampleFifo, FormatDescriptor, usize, ffmpeg::Rational)> {
            let output = encoder.output_format();
            let frame_size = encoder.frame_size();
            if frame_size == 0 {
                return Err(TranscodeError::InvalidInput(
                    "encoder reports a zero frame size".into(),
                ));
            }
            muxer.add_stream(encoder.codec_parameters()?, encoder.time_base())?;

            let mut builder = GraphBuilder::new();
            builder
                .add_source(SOURCE, input, input_time_base)?
                .add_sink(SINK, CodecCapabilities::exactly(&output))?
                .chain(SOURCE, &[], SINK)?;
            let mut graph = builder.configure()?;
            let sink_time_base = graph
                .sink_time_base(SINK)
                .unwrap_or_else(|| output.sample_time_base());

            let fifo = SampleFifo::with_capacity(output, frame_size * 2);
            Ok((graph, fifo, output, frame_size, sink_time_base))
        })();

        let (graph, fifo, output, frame_size, sink_time_base) = match wired {
            Ok(parts) => parts,
            Err(e) => {
                self.encoder = Some(encoder);
                self.muxer = Some(muxer);
                return Err(self.fail(e));
            }
        };

        tracing::info!(
            input = %input,
            output = %output,
            frame_size,
            conversion = graph.description(),
            "Writer initialized"
        );

        self.input = Some(input);
        self.input_time_base = input_time_base;
        self.muxer = Some(muxer);
        self.encoder = Some(encoder);
        self.graph = Some(graph);
        self.fifo = Some(fifo);
        self.output = Some(output);
        self.frame_size = frame_size;
        self.sink_time_base = sink_time_base;
        self.state = PipelineState::Initialized;
        Ok(())
    }

    /// Write the container header.
    pub fn open(&mut self) -> Result<()> {
        self.guard("open", &[PipelineState::Initialized])?;
        let result = match self.muxer.as_mut() {
            Some(muxer) => muxer.write_header(),
            None => Err(TranscodeError::SessionFailed),
        };
        match result {
            Ok(()) => {
                self.state = PipelineState::Opened;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Push one frame in the declared input format and drain every stage.
    pub fn write(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<()> {
        self.guard("write", &[PipelineState::Opened, PipelineState::Writing])?;
        self.state = PipelineState::Writing;

        let result = self.push_and_drain(frame);
        match result {
            Ok(()) => {
                self.stats.frames_in += 1;
                self.stats.samples_in += frame.samples() as u64;
                self.input_samples += frame.samples() as i64;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write interleaved samples in the declared (packed) input format. The
    /// pts continues from the samples written so far.
    pub fn write_interleaved(&mut self, data: &[u8]) -> Result<()> {
        self.guard("write", &[PipelineState::Opened, PipelineState::Writing])?;
        let input = self.input.ok_or(TranscodeError::SessionFailed)?;
        if input.is_planar() {
            return Err(TranscodeError::InvalidInput(format!(
                "interleaved data cannot feed planar input format {}",
                input
            )));
        }
        let stride = input.plane_stride();
        if stride == 0 || data.len() % stride != 0 {
            return Err(TranscodeError::InvalidInput(format!(
                "{} bytes is not a whole number of {}-byte samples",
                data.len(),
                stride
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let pts = rescale_ts(
            self.input_samples,
            input.sample_time_base(),
            self.input_time_base,
        );
        let chunk = FifoChunk {
            planes: vec![Bytes::copy_from_slice(data)],
            samples: data.len() / stride,
            pts: Some(pts),
        };
        let frame = chunk_to_frame(&chunk, &input);
        self.write(&frame)
    }

    /// Flush every stage, send the short remainder, drain the encoder and
    /// write the trailer.
    pub fn close(&mut self) -> Result<()> {
        self.guard("close", &[PipelineState::Opened, PipelineState::Writing])?;
        self.state = PipelineState::Draining;

        match self.finish() {
            Ok(()) => {
                self.state = PipelineState::Closed;
                tracing::info!(
                    frames_in = self.stats.frames_in,
                    encoder_frames = self.stats.encoder_frames,
                    packets = self.stats.packets_written,
                    "Writer closed"
                );
                self.release();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// The encoder's negotiated format, once initialised.
    pub fn output_format(&self) -> Option<FormatDescriptor> {
        self.output
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn guard(&self, operation: &'static str, allowed: &[PipelineState]) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TranscodeError::SessionFailed);
        }
        if !allowed.contains(&self.state) {
            return Err(TranscodeError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: TranscodeError) -> TranscodeError {
        tracing::error!(
            error = %error,
            class = ?error.class(),
            state = %self.state,
            "Writer failed"
        );
        self.state = PipelineState::Failed;
        self.release();
        error
    }

    fn release(&mut self) {
        self.fifo = None;
        self.graph = None;
        self.encoder = None;
        self.muxer = None;
    }

    fn push_and_drain(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<()> {
        let graph = self.graph.as_mut().ok_or(TranscodeError::SessionFailed)?;
        match graph.push_frame(SOURCE, Some(frame))? {
            Push::Accepted => {}
            Push::Full | Push::Closed => {
                return Err(TranscodeError::Codec(
                    "filter graph refused input frame".into(),
                ))
            }
        }
        self.drain_graph()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let graph = self.graph.as_mut().ok_or(TranscodeError::SessionFailed)?;
        graph.push_frame(SOURCE, None)?;
        self.drain_graph()?;

        let (fifo, encoder, muxer) = match (
            self.fifo.as_mut(),
            self.encoder.as_mut(),
            self.muxer.as_mut(),
        ) {
            (Some(f), Some(e), Some(m)) => (f, e, m),
            _ => return Err(TranscodeError::SessionFailed),
        };

        let remainder = fifo.available_samples();
        if let Some(frame) = fifo.read_frame(self.frame_size, true)? {
            tracing::debug!(samples = remainder, pts = ?frame.pts(), "Sending final short frame");
            self.stats.fifo_samples_out += frame.samples() as u64;
            send_frame(encoder, muxer, &mut self.stats, Some(&frame))?;
        }
        send_frame(encoder, muxer, &mut self.stats, None)?;
        muxer.write_trailer()
    }

    /// Move every available graph output into the FIFO, sending full frames
    /// to the encoder after each one. Returns true once the sink is at end
    /// of stream.
    fn drain_graph(&mut self) -> Result<bool> {
        let (graph, fifo, encoder, muxer) = match (
            self.graph.as_mut(),
            self.fifo.as_mut(),
            self.encoder.as_mut(),
            self.muxer.as_mut(),
        ) {
            (Some(g), Some(f), Some(e), Some(m)) => (g, f, e, m),
            _ => return Err(TranscodeError::SessionFailed),
        };
        let output_time_base = encoder.time_base();

        loop {
            let frame = match graph.pull_frame(SINK)? {
                Pull::Ready(frame) => frame,
                Pull::NeedMoreInput => return Ok(false),
                Pull::EndOfStream => return Ok(true),
            };

            let pts = frame
                .pts()
                .map(|p| rescale_ts(p, self.sink_time_base, output_time_base))
                .unwrap_or(self.next_output_pts);
            self.next_output_pts = pts + frame.samples() as i64;

            fifo.write_frame(&frame, Some(pts))?;
            self.stats.fifo_samples_in += frame.samples() as u64;

            while fifo.available_samples() >= self.frame_size {
                if let Some(full) = fifo.read_frame(self.frame_size, false)? {
                    self.stats.fifo_samples_out += full.samples() as u64;
                    send_frame(encoder, muxer, &mut self.stats, Some(&full))?;
                }
            }
        }
    }
}

impl<E: FrameEncoder, M: PacketMuxer> Drop for AudioWriter<E, M> {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.state != PipelineState::Uninitialized {
            tracing::warn!(state = %self.state, "Writer dropped without close");
        }
        self.release();
    }
}

/// Send one frame (or end of stream) and write every packet it produces.
fn send_frame<E: FrameEncoder, M: PacketMuxer>(
    encoder: &mut E,
    muxer: &mut M,
    stats: &mut WriterStats,
    frame: Option<&ffmpeg::util::frame::Audio>,
) -> Result<()> {
    loop {
        match encoder.send_frame(frame)? {
            Push::Accepted => {
                if frame.is_some() {
                    stats.encoder_frames += 1;
                }
                drain_encoder(encoder, muxer, stats)?;
                return Ok(());
            }
            Push::Full => {
                // Pending output must be drained before the frame is retried.
                if drain_encoder(encoder, muxer, stats)? == 0 {
                    return Err(TranscodeError::Codec(
                        "encoder refused input with no pending output".into(),
                    ));
                }
            }
            Push::Closed => {
                return Err(TranscodeError::Codec("encoder already flushed".into()));
            }
        }
    }
}

fn drain_encoder<E: FrameEncoder, M: PacketMuxer>(
    encoder: &mut E,
    muxer: &mut M,
    stats: &mut WriterStats,
) -> Result<usize> {
    let mut written = 0;
    loop {
        match encoder.receive_packet()? {
            Pull::Ready(packet) => {
                muxer.write_packet(packet)?;
                stats.packets_written += 1;
                written += 1;
            }
            Pull::NeedMoreInput | Pull::EndOfStream => return Ok(written),
        }
    }
}

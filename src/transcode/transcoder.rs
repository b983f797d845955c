//! Read-path transcoder
//!
//! Decodes one stream's packets and converts them to a fixed output format
//! for a playback consumer, which pulls fixed-size chunks out of a FIFO.
//!
//! The filter graph is only built once the first frame is decoded: the
//! decoder's output format is not stable before that. A format change in
//! the middle of the stream flushes the current graph and builds a new one.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::config::PlaybackConfig;
use crate::error::{Result, TranscodeError};
use crate::events::PipelineObserver;
use crate::ffmpeg::utils::{layout_for_channels, parse_sample_format, rescale_ts};
use crate::transcode::decoder::MediaDecoder;
use crate::transcode::fifo::{FifoChunk, SampleFifo};
use crate::transcode::filter_graph::{FilterGraph, GraphBuilder, StageSpec};
use crate::transcode::negotiate::CodecCapabilities;
use crate::transcode::reader::StreamInfo;
use crate::types::{FormatDescriptor, Pull, Push};

const SOURCE: &str = "in";
const SINK: &str = "out";

/// The output format a playback configuration asks for.
pub fn playback_format(config: &PlaybackConfig) -> Result<FormatDescriptor> {
    let format = parse_sample_format(&config.sample_format).ok_or_else(|| {
        TranscodeError::Config(format!("unknown sample format '{}'", config.sample_format))
    })?;
    if config.sample_rate == 0 || config.channels == 0 {
        return Err(TranscodeError::Config(
            "playback sample rate and channel count must be positive".into(),
        ));
    }
    Ok(FormatDescriptor::new(
        format,
        config.sample_rate,
        layout_for_channels(config.channels as usize),
    ))
}

struct ActiveGraph {
    graph: FilterGraph,
    input: FormatDescriptor,
    sink_time_base: ffmpeg::Rational,
}

/// Decoder + filter graph + FIFO for one stream.
pub struct AudioTranscoder {
    stream: StreamInfo,
    decoder: MediaDecoder,
    output: FormatDescriptor,
    stages: Vec<StageSpec>,
    graph: Option<ActiveGraph>,
    fifo: SampleFifo,
    observer: Arc<dyn PipelineObserver>,
    format_announced: bool,
    /// End of stream was pushed and every stage has drained.
    drained: bool,
    next_pts: i64,
}

impl AudioTranscoder {
    /// Open a decoder for `stream`. `filter` is an optional chain such as
    /// `volume=0.5` applied before the format conversion.
    pub fn prepare(
        stream: &StreamInfo,
        parameters: ffmpeg::codec::Parameters,
        output: FormatDescriptor,
        filter: Option<&str>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self> {
        let stages = match filter {
            Some(text) => StageSpec::parse_chain(text)?,
            None => Vec::new(),
        };
        let decoder = MediaDecoder::open(parameters, stream.time_base)?;

        tracing::debug!(
            stream = stream.index,
            codec = decoder.codec_name(),
            output = %output,
            filter = filter.unwrap_or(""),
            "Prepared transcoder"
        );

        Ok(Self {
            stream: stream.clone(),
            decoder,
            output,
            stages,
            graph: None,
            fifo: SampleFifo::new(output),
            observer,
            format_announced: false,
            drained: false,
            next_pts: 0,
        })
    }

    /// [`prepare`](Self::prepare) with the output format and filter chain
    /// of a playback configuration.
    pub fn from_config(
        stream: &StreamInfo,
        parameters: ffmpeg::codec::Parameters,
        config: &PlaybackConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self> {
        let output = playback_format(config)?;
        let filter = config.filter.as_deref().filter(|f| !f.trim().is_empty());
        Self::prepare(stream, parameters, output, filter, observer)
    }

    /// Decode one packet (`None` = end of stream) and move everything it
    /// yields into the FIFO.
    ///
    /// With `should_flush` all buffered state is dropped first, as needed
    /// after a seek.
    pub fn push_packet(&mut self, packet: Option<&ffmpeg::Packet>, should_flush: bool) -> Result<()> {
        if should_flush {
            self.decoder.flush();
            self.graph = None;
            self.fifo.clear();
            self.drained = false;
            self.next_pts = 0;
            tracing::debug!(stream = self.stream.index, "Transcoder flushed");
        }
        if self.drained {
            return Ok(());
        }

        loop {
            match self.decoder.send(packet)? {
                Push::Accepted | Push::Closed => break,
                Push::Full => {
                    if !self.drain_decoder()? {
                        return Err(TranscodeError::Codec(
                            "decoder refused input with no pending output".into(),
                        ));
                    }
                }
            }
        }
        self.drain_decoder()?;
        Ok(())
    }

    /// Returns whether any frame was decoded.
    fn drain_decoder(&mut self) -> Result<bool> {
        let mut decoded = false;
        loop {
            match self.decoder.receive()? {
                Pull::Ready(frame) => {
                    decoded = true;
                    self.filter_frame(&frame)?;
                }
                Pull::NeedMoreInput => return Ok(decoded),
                Pull::EndOfStream => {
                    if let Some(active) = self.graph.as_mut() {
                        active.graph.push_frame(SOURCE, None)?;
                    }
                    self.drain_graph()?;
                    self.drained = true;
                    tracing::debug!(
                        stream = self.stream.index,
                        buffered = self.fifo.available_samples(),
                        "Transcoder reached end of stream"
                    );
                    return Ok(decoded);
                }
            }
        }
    }

    fn filter_frame(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<()> {
        let format = FormatDescriptor::of_frame(frame);
        let stale = match &self.graph {
            Some(active) => !active.input.same_shape(&format),
            None => true,
        };
        if stale {
            if let Some(active) = self.graph.as_mut() {
                tracing::info!(from = %active.input, to = %format, "Decoded format changed");
                active.graph.push_frame(SOURCE, None)?;
                self.drain_graph()?;
            }
            self.graph = Some(self.build_graph(format)?);
        }

        if let Some(active) = self.graph.as_mut() {
            active.graph.push_frame(SOURCE, Some(frame))?;
        }
        self.drain_graph()
    }

    fn build_graph(&mut self, input: FormatDescriptor) -> Result<ActiveGraph> {
        let mut builder = GraphBuilder::new();
        builder
            .add_source(SOURCE, input, self.stream.time_base)?
            .add_sink(SINK, CodecCapabilities::exactly(&self.output))?
            .chain(SOURCE, &self.stages, SINK)?;
        let mut graph = builder.configure()?;
        let sink_time_base = graph
            .sink_time_base(SINK)
            .unwrap_or_else(|| self.output.sample_time_base());

        if !self.format_announced {
            self.format_announced = true;
            self.observer.format_ready(&self.output);
        }
        Ok(ActiveGraph {
            graph,
            input,
            sink_time_base,
        })
    }

    fn drain_graph(&mut self) -> Result<()> {
        let Some(active) = self.graph.as_mut() else {
            return Ok(());
        };
        let output_time_base = self.output.sample_time_base();
        let mut added = 0;
        loop {
            let frame = match active.graph.pull_frame(SINK)? {
                Pull::Ready(frame) => frame,
                Pull::NeedMoreInput | Pull::EndOfStream => break,
            };
            let pts = frame
                .pts()
                .map(|p| rescale_ts(p, active.sink_time_base, output_time_base))
                .unwrap_or(self.next_pts);
            self.next_pts = pts + frame.samples() as i64;
            self.fifo.write_frame(&frame, Some(pts))?;
            added += frame.samples();
        }
        if added > 0 {
            self.observer.output_available(self.fifo.available_samples());
        }
        Ok(())
    }

    /// Take exactly `capacity` samples, or the shorter remainder once the
    /// stream has ended. `None` when more packets are needed (or nothing is
    /// left).
    pub fn try_transcode(&mut self, capacity: usize) -> Result<Option<FifoChunk>> {
        if capacity == 0 {
            return Err(TranscodeError::InvalidInput(
                "chunk capacity must be positive".into(),
            ));
        }
        if self.fifo.available_samples() >= capacity {
            return self.fifo.read(capacity).map(Some);
        }
        if self.drained && !self.fifo.is_empty() {
            return Ok(Some(self.fifo.read_up_to(capacity)));
        }
        Ok(None)
    }

    /// Pts one past the last buffered sample, in `1/output rate`.
    pub fn fifo_end_pts(&self) -> Option<i64> {
        self.fifo.end_pts()
    }

    pub fn buffered_samples(&self) -> usize {
        self.fifo.available_samples()
    }

    /// The stream ended and every sample has been taken.
    pub fn is_eof(&self) -> bool {
        self.drained && self.fifo.is_empty()
    }

    pub fn output_format(&self) -> FormatDescriptor {
        self.output
    }

    /// The decoder's format, once the first frame is decoded.
    pub fn input_format(&self) -> Option<FormatDescriptor> {
        self.decoder.format()
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }
}

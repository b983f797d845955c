//! File-to-file transcoding driver
//!
//! Reader → packet pump → decoder → writer. The writer is initialised from
//! the first decoded frame, since the decoder's output format is not known
//! before that. Frames decoded later in another format (a sample-rate switch
//! inside an MP3, a chained Ogg stream) are converted back to that first
//! format by an [`InputAdapter`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;

use crate::config::TranscodeConfig;
use crate::error::{Result, TranscodeError};
use crate::events::PipelineObserver;
use crate::ffmpeg::utils::rescale_ts;
use crate::transcode::decoder::MediaDecoder;
use crate::transcode::encoder::FrameEncoder;
use crate::transcode::filter_graph::{FilterGraph, GraphBuilder};
use crate::transcode::muxer::PacketMuxer;
use crate::transcode::negotiate::CodecCapabilities;
use crate::transcode::pump::{PacketPump, PumpItem};
use crate::transcode::reader::{Demuxer, InterruptToken, MediaReader};
use crate::transcode::writer::{AudioWriter, WriterStats};
use crate::types::{FormatDescriptor, Pull, Push};

const SOURCE: &str = "in";
const SINK: &str = "out";

/// Outcome of one [`transcode_file`] run.
#[derive(Debug, Clone)]
pub struct TranscodeSummary {
    pub stream_index: usize,
    pub decoder: &'static str,
    pub input_format: Option<FormatDescriptor>,
    pub output_format: Option<FormatDescriptor>,
    pub packets_read: u64,
    pub frames_decoded: u64,
    /// Packets the decoder rejected and that were skipped.
    pub malformed_packets: u64,
    /// Times the decoded format changed after the first frame.
    pub format_changes: u64,
    pub writer: WriterStats,
    pub elapsed: Duration,
}

/// Transcode the best audio stream of `input` into `output`.
///
/// `token` cancels the run from another thread; the run then fails with
/// [`TranscodeError::Interrupted`] and the partial output is left as is.
pub fn transcode_file(
    input: &str,
    output: &str,
    config: &TranscodeConfig,
    token: InterruptToken,
    observer: Arc<dyn PipelineObserver>,
) -> Result<TranscodeSummary> {
    let reader = MediaReader::open(
        input,
        &config.reader.options,
        token,
        config.reader.seek_policy,
    )
    .inspect_err(|e| observer.error(e))?;
    transcode_reader(reader, output, config, observer)
}

/// Like [`transcode_file`] over an already opened reader.
pub fn transcode_reader<D>(
    reader: MediaReader<D>,
    output: &str,
    config: &TranscodeConfig,
    observer: Arc<dyn PipelineObserver>,
) -> Result<TranscodeSummary>
where
    D: Demuxer + Send + 'static,
{
    let started = Instant::now();
    let result = (|| -> Result<TranscodeSummary> {
        let index = reader.select_best_stream(ffmpeg::media::Type::Audio)?;
        let stream = reader
            .stream(index)
            .cloned()
            .ok_or_else(|| TranscodeError::NoMatchingStream(format!("stream {}", index)))?;
        let decoder = MediaDecoder::open(reader.codec_parameters(index)?, stream.time_base)?;

        tracing::info!(
            stream = index,
            decoder = decoder.codec_name(),
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            duration_secs = ?stream.duration_secs(),
            output,
            "Starting transcode"
        );

        let mut pump = PacketPump::spawn(reader, index, &config.reader, observer.clone())?;
        let mut job = Job {
            output,
            config,
            time_base: stream.time_base,
            decoder,
            writer: AudioWriter::new(),
            adapter: None,
            packets_read: 0,
            malformed_packets: 0,
        };
        let run = job.run(&pump, Duration::from_millis(config.reader.poll_interval_ms.max(1)));
        pump.stop();
        run?;

        if job.decoder.frames_decoded() == 0 {
            return Err(TranscodeError::InvalidInput(
                "no audio frames could be decoded".into(),
            ));
        }
        Ok(TranscodeSummary {
            stream_index: index,
            decoder: job.decoder.codec_name(),
            input_format: job.decoder.format(),
            output_format: job.writer.output_format(),
            packets_read: job.packets_read,
            frames_decoded: job.decoder.frames_decoded(),
            malformed_packets: job.malformed_packets,
            format_changes: job.adapter.as_ref().map_or(0, InputAdapter::format_changes),
            writer: job.writer.stats(),
            elapsed: started.elapsed(),
        })
    })();

    if let Err(e) = &result {
        observer.error(e);
    }
    result
}

struct Job<'a> {
    output: &'a str,
    config: &'a TranscodeConfig,
    time_base: ffmpeg::Rational,
    decoder: MediaDecoder,
    writer: AudioWriter,
    /// Set together with the writer's input format.
    adapter: Option<InputAdapter>,
    packets_read: u64,
    malformed_packets: u64,
}

impl Job<'_> {
    fn run(&mut self, pump: &PacketPump, poll: Duration) -> Result<()> {
        loop {
            match pump.next(poll)? {
                PumpItem::Pending => continue,
                PumpItem::Discontinuity => {
                    self.decoder.flush();
                    if let Some(adapter) = self.adapter.as_mut() {
                        adapter.reset();
                    }
                }
                PumpItem::Packet(packet) => {
                    self.packets_read += 1;
                    match self.decode(Some(&packet)) {
                        Ok(()) => {}
                        Err(TranscodeError::MalformedData(msg)) => {
                            self.malformed_packets += 1;
                            tracing::warn!(pts = ?packet.pts(), error = %msg, "Skipping malformed packet");
                        }
                        Err(e) => return Err(e),
                    }
                }
                PumpItem::EndOfStream => {
                    self.decode(None)?;
                    break;
                }
            }
        }

        if let Some(adapter) = self.adapter.as_mut() {
            adapter.finish(&mut self.writer)?;
            self.writer.close()?;
        }
        Ok(())
    }

    /// Send one packet (`None` = end of stream) and write every frame it
    /// produces.
    fn decode(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<()> {
        loop {
            match self.decoder.send(packet)? {
                Push::Accepted | Push::Closed => break,
                Push::Full => {
                    if !self.drain()? {
                        return Err(TranscodeError::Codec(
                            "decoder refused input with no pending output".into(),
                        ));
                    }
                }
            }
        }
        self.drain()?;
        Ok(())
    }

    fn drain(&mut self) -> Result<bool> {
        let mut any = false;
        while let Pull::Ready(frame) = self.decoder.receive()? {
            any = true;
            if self.adapter.is_none() {
                let input = FormatDescriptor::of_frame(&frame);
                self.writer
                    .init(self.output, input, self.time_base, &self.config.writer)?;
                self.writer.open()?;
                self.adapter = Some(InputAdapter::new(input, self.time_base));
            }
            if let Some(adapter) = self.adapter.as_mut() {
                adapter.write(&mut self.writer, &frame)?;
            }
        }
        Ok(any)
    }
}

/// Feeds a writer whose input format is fixed, whatever format the decoder
/// currently produces.
///
/// Frames in the writer's format pass straight through. Any other format
/// gets a conversion graph of its own, rebuilt on the next change and
/// flushed into the writer before frames of another format follow.
pub struct InputAdapter {
    input: FormatDescriptor,
    time_base: ffmpeg::Rational,
    last: FormatDescriptor,
    conversion: Option<Conversion>,
    format_changes: u64,
}

struct Conversion {
    graph: FilterGraph,
    source: FormatDescriptor,
    sink_time_base: ffmpeg::Rational,
}

impl InputAdapter {
    /// `input` is the writer's declared input format, `time_base` the one
    /// frame timestamps are expressed in.
    pub fn new(input: FormatDescriptor, time_base: ffmpeg::Rational) -> Self {
        Self {
            input,
            time_base,
            last: input,
            conversion: None,
            format_changes: 0,
        }
    }

    pub fn format_changes(&self) -> u64 {
        self.format_changes
    }

    /// Write `frame` to `writer`, converting it first if needed.
    pub fn write<E: FrameEncoder, M: PacketMuxer>(
        &mut self,
        writer: &mut AudioWriter<E, M>,
        frame: &ffmpeg::util::frame::Audio,
    ) -> Result<()> {
        let format = FormatDescriptor::of_frame(frame);
        if !format.same_shape(&self.last) {
            self.format_changes += 1;
            tracing::info!(from = %self.last, to = %format, writer_input = %self.input, "Decoded format changed");
            self.last = format;
        }

        if format.same_shape(&self.input) {
            self.finish(writer)?;
            return writer.write(frame);
        }

        let reusable = self
            .conversion
            .as_ref()
            .is_some_and(|c| c.source.same_shape(&format));
        if !reusable {
            self.finish(writer)?;
            self.conversion = Some(Conversion::open(format, self.input, self.time_base)?);
        }
        let Some(conversion) = self.conversion.as_mut() else {
            return Ok(());
        };
        match conversion.graph.push_frame(SOURCE, Some(frame))? {
            Push::Accepted => {}
            Push::Full | Push::Closed => {
                return Err(TranscodeError::Codec(
                    "conversion graph refused input frame".into(),
                ))
            }
        }
        conversion.drain(writer, self.time_base)
    }

    /// Flush the active conversion, if any, into `writer`.
    pub fn finish<E: FrameEncoder, M: PacketMuxer>(
        &mut self,
        writer: &mut AudioWriter<E, M>,
    ) -> Result<()> {
        let Some(mut conversion) = self.conversion.take() else {
            return Ok(());
        };
        conversion.graph.push_frame(SOURCE, None)?;
        conversion.drain(writer, self.time_base)
    }

    /// Drop buffered conversion state after a reposition.
    pub fn reset(&mut self) {
        self.conversion = None;
    }
}

impl Conversion {
    fn open(
        source: FormatDescriptor,
        target: FormatDescriptor,
        time_base: ffmpeg::Rational,
    ) -> Result<Self> {
        let mut builder = GraphBuilder::new();
        builder
            .add_source(SOURCE, source, time_base)?
            .add_sink(SINK, CodecCapabilities::exactly(&target))?
            .chain(SOURCE, &[], SINK)?;
        let mut graph = builder.configure()?;
        let sink_time_base = graph
            .sink_time_base(SINK)
            .unwrap_or_else(|| target.sample_time_base());
        tracing::debug!(conversion = graph.description(), "Opened input conversion");
        Ok(Self {
            graph,
            source,
            sink_time_base,
        })
    }

    fn drain<E: FrameEncoder, M: PacketMuxer>(
        &mut self,
        writer: &mut AudioWriter<E, M>,
        time_base: ffmpeg::Rational,
    ) -> Result<()> {
        loop {
            match self.graph.pull_frame(SINK)? {
                Pull::Ready(mut frame) => {
                    if let Some(pts) = frame.pts() {
                        frame.set_pts(Some(rescale_ts(pts, self.sink_time_base, time_base)));
                    }
                    writer.write(&frame)?;
                }
                Pull::NeedMoreInput | Pull::EndOfStream => return Ok(()),
            }
        }
    }
}

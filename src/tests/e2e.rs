//! End-to-end pipeline tests
//!
//! - Writer re-chunking and lifecycle over a recording encoder/muxer
//! - File-to-file transcodes of generated WAV input
//! - Read-path transcoding into fixed-size chunks
//! - Packet pump backpressure, seeking and error reporting

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SeekPolicy;
use crate::error::Result;
use crate::transcode::pump::{PacketPump, PumpItem};
use crate::transcode::reader::{InterruptToken, MediaReader};
use crate::tests::fixtures::ScriptedDemuxer;

/// Next pump item that is not `Pending`, waiting at most five seconds.
pub fn next_item(pump: &PacketPump) -> Result<PumpItem> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match pump.next(Duration::from_millis(20))? {
            PumpItem::Pending if Instant::now() < deadline => continue,
            item => return Ok(item),
        }
    }
}

/// Poll `cond` for up to two seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn scripted_reader(demuxer: ScriptedDemuxer) -> MediaReader<ScriptedDemuxer> {
    MediaReader::with_demuxer(demuxer, InterruptToken::new(), SeekPolicy::KeyframeBefore).unwrap()
}

pub fn packet_pts(item: PumpItem) -> Option<i64> {
    match item {
        PumpItem::Packet(packet) => packet.pts(),
        other => panic!("expected a packet, got {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    use ffmpeg_next as ffmpeg;

    use crate::config::{PlaybackConfig, ReaderConfig, TranscodeConfig, WriterConfig};
    use crate::error::TranscodeError;
    use crate::events::PipelineObserver;
    use crate::tests::fixtures::*;
    use crate::transcode::job::{transcode_file, transcode_reader, InputAdapter};
    use crate::transcode::fifo::FifoChunk;
    use crate::transcode::transcoder::AudioTranscoder;
    use crate::transcode::writer::AudioWriter;
    use crate::types::{FormatDescriptor, PipelineState};
    use ffmpeg_next::util::channel_layout::ChannelLayout;
    use ffmpeg_next::util::format::sample::{Sample, Type};

    fn tb_48k() -> ffmpeg::Rational {
        ffmpeg::Rational::new(1, 48000)
    }

    fn recording_writer(
        input: crate::types::FormatDescriptor,
    ) -> (
        AudioWriter<RecordingEncoder, RecordingMuxer>,
        SendLog,
        Arc<parking_lot::Mutex<MuxLog>>,
    ) {
        let (encoder, sent) = RecordingEncoder::new();
        let (muxer, log) = RecordingMuxer::new();
        let mut writer = AudioWriter::new();
        writer.init_with(input, tb_48k(), encoder, muxer).unwrap();
        (writer, sent, log)
    }

    #[test]
    fn test_writer_rechunks_to_encoder_frames() {
        let (mut writer, sent, log) = recording_writer(fltp_48k_stereo());
        writer.open().unwrap();
        for i in 0..3 {
            writer
                .write(&silent_frame(fltp_48k_stereo(), 960, i * 960))
                .unwrap();
        }
        // Only whole encoder frames leave the FIFO while writing.
        assert_eq!(
            *sent.lock(),
            vec![Some((1024, Some(0))), Some((1024, Some(1024)))]
        );

        writer.close().unwrap();
        assert_eq!(
            *sent.lock(),
            vec![
                Some((1024, Some(0))),
                Some((1024, Some(1024))),
                Some((832, Some(2048))),
                None
            ]
        );

        let log = log.lock();
        assert!(log.header && log.trailer);
        assert_eq!(log.packet_pts, vec![Some(0), Some(1024), Some(2048)]);
        assert!(log.packet_pts.windows(2).all(|w| w[0] <= w[1]));

        let stats = writer.stats();
        assert_eq!(stats.samples_in, 2880);
        assert_eq!(stats.fifo_samples_in, 2880);
        assert_eq!(stats.fifo_samples_out, 2880);
        assert_eq!(stats.encoder_frames, 3);
        assert_eq!(stats.packets_written, 3);
        assert_eq!(writer.state(), PipelineState::Closed);
    }

    #[test]
    fn test_writer_rejects_calls_after_close() {
        let (mut writer, _, _) = recording_writer(fltp_48k_stereo());
        writer.open().unwrap();
        writer.write(&silent_frame(fltp_48k_stereo(), 480, 0)).unwrap();
        writer.close().unwrap();

        let frame = silent_frame(fltp_48k_stereo(), 480, 480);
        assert!(matches!(writer.write(&frame), Err(TranscodeError::SessionFailed)));
        assert!(matches!(writer.close(), Err(TranscodeError::SessionFailed)));
        assert!(matches!(writer.open(), Err(TranscodeError::SessionFailed)));
    }

    #[test]
    fn test_writer_requires_open() {
        let mut writer: AudioWriter<RecordingEncoder, RecordingMuxer> = AudioWriter::new();
        let frame = silent_frame(fltp_48k_stereo(), 480, 0);
        assert!(matches!(
            writer.write(&frame),
            Err(TranscodeError::InvalidState { .. })
        ));

        let (mut writer, _, _) = recording_writer(fltp_48k_stereo());
        assert!(matches!(
            writer.write(&frame),
            Err(TranscodeError::InvalidState { .. })
        ));
        assert!(matches!(
            writer.close(),
            Err(TranscodeError::InvalidState { .. })
        ));
        // Usage errors leave the session usable.
        assert_eq!(writer.state(), PipelineState::Initialized);
        writer.open().unwrap();
        writer.write(&frame).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_writer_converts_interleaved_input() {
        let (mut writer, sent, _) = recording_writer(s16_48k_stereo());
        writer.open().unwrap();

        assert!(matches!(
            writer.write_interleaved(&[0u8; 7]),
            Err(TranscodeError::InvalidInput(_))
        ));
        for _ in 0..3 {
            writer.write_interleaved(&vec![0u8; 960 * 4]).unwrap();
        }
        writer.close().unwrap();

        let sent = sent.lock();
        let total: usize = sent.iter().flatten().map(|(samples, _)| samples).sum();
        assert_eq!(total, 2880);
        assert_eq!(sent.last(), Some(&None));
        // Every frame but the last is full.
        let frames: Vec<usize> = sent.iter().flatten().map(|(s, _)| *s).collect();
        assert!(frames[..frames.len() - 1].iter().all(|s| *s == 1024));
    }

    #[test]
    fn test_writer_fails_on_mux_error() {
        let (encoder, _) = RecordingEncoder::new();
        let (muxer, log) = RecordingMuxer::failing_after(1);
        let mut writer = AudioWriter::new();
        writer
            .init_with(fltp_48k_stereo(), tb_48k(), encoder, muxer)
            .unwrap();
        writer.open().unwrap();

        writer.write(&silent_frame(fltp_48k_stereo(), 960, 0)).unwrap();
        writer.write(&silent_frame(fltp_48k_stereo(), 960, 960)).unwrap();
        let err = writer
            .write(&silent_frame(fltp_48k_stereo(), 960, 1920))
            .unwrap_err();
        assert!(matches!(err, TranscodeError::WriteIo(_)));
        assert_eq!(writer.state(), PipelineState::Failed);
        assert_eq!(log.lock().packet_pts.len(), 1);

        let frame = silent_frame(fltp_48k_stereo(), 960, 2880);
        assert!(matches!(writer.write(&frame), Err(TranscodeError::SessionFailed)));
        assert!(matches!(writer.close(), Err(TranscodeError::SessionFailed)));
    }

    #[test]
    fn test_writer_to_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut writer: AudioWriter = AudioWriter::new();
        writer
            .init(
                path.to_str().unwrap(),
                s16_48k_stereo(),
                tb_48k(),
                &WriterConfig::default(),
            )
            .unwrap();
        assert_eq!(writer.output_format(), Some(s16_48k_stereo()));
        writer.open().unwrap();
        for _ in 0..3 {
            writer.write_interleaved(&vec![0u8; 960 * 4]).unwrap();
        }
        writer.close().unwrap();

        assert_eq!(wav_samples(&path), (48000, 2880));
    }

    #[test]
    fn test_writer_unsupported_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.not_a_container");
        let mut writer: AudioWriter = AudioWriter::new();
        let err = writer
            .init(
                path.to_str().unwrap(),
                s16_48k_stereo(),
                tb_48k(),
                &WriterConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedContainer(_)));
        assert_eq!(writer.state(), PipelineState::Failed);
    }

    #[test]
    fn test_transcode_wav_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 48000);
        let output = dir.path().join("out.wav");
        let observer = Arc::new(CountingObserver::default());

        let summary = transcode_file(
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            &TranscodeConfig::default(),
            InterruptToken::new(),
            observer.clone(),
        )
        .unwrap();

        assert_eq!(summary.input_format, Some(s16_48k_stereo()));
        assert_eq!(summary.output_format, Some(s16_48k_stereo()));
        assert_eq!(summary.malformed_packets, 0);
        assert_eq!(summary.format_changes, 0);
        assert!(summary.packets_read > 0);
        assert_eq!(summary.writer.samples_in, 48000);
        assert_eq!(summary.writer.fifo_samples_out, 48000);
        assert_eq!(CountingObserver::count(&observer.errors), 0);
        assert!(CountingObserver::count(&observer.progress) > 0);

        assert_eq!(wav_samples(&output), (48000, 48000));
    }

    #[test]
    fn test_transcode_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 48000);
        let output = dir.path().join("out.wav");
        let mut config = TranscodeConfig::default();
        config.writer.sample_rate = Some(44100);
        config.writer.channels = Some(1);

        let summary = transcode_file(
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            &config,
            InterruptToken::new(),
            Arc::new(CountingObserver::default()),
        )
        .unwrap();
        let out_format = summary.output_format.unwrap();
        assert_eq!(out_format.rate, 44100);
        assert_eq!(out_format.channels(), 1);

        let (rate, samples) = wav_samples(&output);
        assert_eq!(rate, 44100);
        let expected = 44100.0;
        assert!(
            (samples as f64 - expected).abs() / expected < 0.01,
            "got {} samples",
            samples
        );
    }

    #[test]
    fn test_transcode_interrupted_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 4800);
        let token = InterruptToken::new();
        token.interrupt();
        let observer = Arc::new(CountingObserver::default());
        let err = transcode_file(
            input.to_str().unwrap(),
            dir.path().join("out.wav").to_str().unwrap(),
            &TranscodeConfig::default(),
            token,
            observer.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Interrupted));
        assert_eq!(CountingObserver::count(&observer.errors), 1);
    }

    #[test]
    fn test_transcode_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = transcode_file(
            dir.path().join("missing.wav").to_str().unwrap(),
            dir.path().join("out.wav").to_str().unwrap(),
            &TranscodeConfig::default(),
            InterruptToken::new(),
            Arc::new(CountingObserver::default()),
        )
        .unwrap_err();
        assert!(matches!(err, TranscodeError::SourceUnavailable(_)));
    }

    #[test]
    fn test_transcode_reader_without_decoder_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.wav");
        let observer = Arc::new(CountingObserver::default());
        let err = transcode_reader(
            scripted_reader(ScriptedDemuxer::new(4)),
            output.to_str().unwrap(),
            &TranscodeConfig::default(),
            observer.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, TranscodeError::NoMatchingStream(_)));
        assert_eq!(CountingObserver::count(&observer.errors), 1);
        assert!(!output.exists());
    }

    #[test]
    fn test_writer_input_follows_rate_switch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut writer: AudioWriter = AudioWriter::new();
        writer
            .init(
                path.to_str().unwrap(),
                s16_48k_stereo(),
                tb_48k(),
                &WriterConfig::default(),
            )
            .unwrap();
        writer.open().unwrap();
        let mut adapter = InputAdapter::new(s16_48k_stereo(), tb_48k());
        let s16_44k = FormatDescriptor::new(Sample::I16(Type::Packed), 44100, ChannelLayout::STEREO);

        // 0.5 s at 48 kHz, 0.5 s at 44.1 kHz, then 0.2 s at 48 kHz again.
        let mut pts = 0;
        for _ in 0..25 {
            adapter
                .write(&mut writer, &silent_frame(s16_48k_stereo(), 960, pts))
                .unwrap();
            pts += 960;
        }
        for _ in 0..25 {
            adapter
                .write(&mut writer, &silent_frame(s16_44k, 882, pts))
                .unwrap();
            pts += 960;
        }
        for _ in 0..10 {
            adapter
                .write(&mut writer, &silent_frame(s16_48k_stereo(), 960, pts))
                .unwrap();
            pts += 960;
        }
        adapter.finish(&mut writer).unwrap();
        writer.close().unwrap();

        assert_eq!(adapter.format_changes(), 2);
        assert_eq!(writer.state(), PipelineState::Closed);
        let (rate, samples) = wav_samples(&path);
        assert_eq!(rate, 48000);
        let expected = 57600.0;
        assert!(
            (samples as f64 - expected).abs() / expected < 0.01,
            "got {} samples",
            samples
        );
    }

    fn playback(filter: Option<&str>) -> PlaybackConfig {
        PlaybackConfig {
            filter: filter.map(str::to_string),
            ..PlaybackConfig::default()
        }
    }

    fn open_transcoder(
        path: &std::path::Path,
        config: &PlaybackConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> (MediaReader, AudioTranscoder, usize) {
        let reader = MediaReader::open(
            path.to_str().unwrap(),
            &BTreeMap::new(),
            InterruptToken::new(),
            SeekPolicy::KeyframeBefore,
        )
        .unwrap();
        let index = reader
            .select_best_stream(ffmpeg::media::Type::Audio)
            .unwrap();
        let stream = reader.stream(index).unwrap().clone();
        let transcoder = AudioTranscoder::from_config(
            &stream,
            reader.codec_parameters(index).unwrap(),
            config,
            observer,
        )
        .unwrap();
        (reader, transcoder, index)
    }

    #[test]
    fn test_read_path_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 48000);
        let observer = Arc::new(CountingObserver::default());
        let (mut reader, mut transcoder, index) =
            open_transcoder(&input, &playback(Some("volume=0.5")), observer.clone());

        let mut chunks = Vec::new();
        loop {
            let packet = reader.read_packet().unwrap();
            match &packet {
                Some(p) if p.stream() != index => continue,
                Some(p) => transcoder.push_packet(Some(p), false).unwrap(),
                None => transcoder.push_packet(None, false).unwrap(),
            }
            while let Some(chunk) = transcoder.try_transcode(1024).unwrap() {
                chunks.push((chunk.samples, chunk.pts));
            }
            if packet.is_none() {
                break;
            }
        }

        assert!(transcoder.is_eof());
        assert!(transcoder.try_transcode(1024).unwrap().is_none());
        assert!(chunks[..chunks.len() - 1].iter().all(|(s, _)| *s == 1024));
        // Chunks follow each other in output samples, up to resampler
        // rounding.
        assert_eq!(chunks[0].1, Some(0));
        for (i, (_, pts)) in chunks.iter().enumerate() {
            let pts = pts.unwrap();
            assert!((pts - i as i64 * 1024).abs() <= 2, "chunk {} at pts {}", i, pts);
        }
        let total: usize = chunks.iter().map(|(s, _)| s).sum();
        assert!(
            (total as f64 - 44100.0).abs() / 44100.0 < 0.01,
            "got {} samples",
            total
        );
        assert_eq!(CountingObserver::count(&observer.formats), 1);
        assert!(CountingObserver::count(&observer.outputs) > 0);
        assert_eq!(
            transcoder.input_format(),
            Some(s16_48k_stereo())
        );
    }

    /// Every chunk of the whole input, in order.
    fn read_all_chunks(path: &std::path::Path, config: &PlaybackConfig) -> Vec<FifoChunk> {
        let (mut reader, mut transcoder, index) =
            open_transcoder(path, config, Arc::new(CountingObserver::default()));
        let mut chunks = Vec::new();
        loop {
            let packet = reader.read_packet().unwrap();
            match &packet {
                Some(p) if p.stream() != index => continue,
                Some(p) => transcoder.push_packet(Some(p), false).unwrap(),
                None => transcoder.push_packet(None, false).unwrap(),
            }
            while let Some(chunk) = transcoder.try_transcode(1024).unwrap() {
                chunks.push(chunk);
            }
            if packet.is_none() {
                return chunks;
            }
        }
    }

    #[test]
    fn test_read_path_applies_configured_filter() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 9600);
        // Output is fltp; -0.0 counts as silence.
        let silent = |chunks: &[FifoChunk]| {
            chunks.iter().flat_map(|c| c.planes.iter()).all(|plane| {
                plane
                    .chunks_exact(4)
                    .all(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]) == 0.0)
            })
        };

        let plain = read_all_chunks(&input, &playback(None));
        assert!(!plain.is_empty());
        assert!(!silent(&plain));

        let muted = read_all_chunks(&input, &playback(Some("volume=0")));
        assert_eq!(
            muted.iter().map(|c| c.samples).sum::<usize>(),
            plain.iter().map(|c| c.samples).sum::<usize>()
        );
        assert!(silent(&muted));
    }

    #[test]
    fn test_read_path_flush_after_seek() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 48000);
        let (mut reader, mut transcoder, index) =
            open_transcoder(&input, &playback(None), Arc::new(CountingObserver::default()));

        for _ in 0..8 {
            if let Some(p) = reader.read_packet().unwrap() {
                if p.stream() == index {
                    transcoder.push_packet(Some(&p), false).unwrap();
                }
            }
        }
        let before = transcoder.buffered_samples();
        assert!(before > 0);

        reader.seek(0, None).unwrap();
        let packet = loop {
            let p = reader.read_packet().unwrap().unwrap();
            if p.stream() == index {
                break p;
            }
        };
        transcoder.push_packet(Some(&packet), true).unwrap();
        assert!(transcoder.buffered_samples() < before);
        assert!(!transcoder.is_eof());
    }

    #[test]
    fn test_read_path_unknown_filter() {
        let dir = tempfile::tempdir().unwrap();
        let input = sine_wav(dir.path(), "in.wav", 48000, 4800);
        let (mut reader, mut transcoder, index) = open_transcoder(
            &input,
            &playback(Some("no_such_filter=1")),
            Arc::new(CountingObserver::default()),
        );
        let err = loop {
            match reader.read_packet().unwrap() {
                Some(p) if p.stream() == index => {
                    if let Err(e) = transcoder.push_packet(Some(&p), false) {
                        break e;
                    }
                }
                Some(_) => continue,
                None => panic!("filter error never surfaced"),
            }
        };
        assert!(matches!(err, TranscodeError::FilterNotFound(_)));
    }

    #[test]
    fn test_pump_backpressure() {
        let demuxer = ScriptedDemuxer::new(100);
        let reads = demuxer.reads.clone();
        let config = ReaderConfig {
            max_buffered_bytes: 64,
            ..ReaderConfig::default()
        };
        let mut pump = PacketPump::spawn(
            scripted_reader(demuxer),
            0,
            &config,
            Arc::new(CountingObserver::default()),
        )
        .unwrap();

        assert!(wait_for(|| pump.buffered_bytes() == 64));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pump.buffered_packets(), 4);
        assert_eq!(reads.load(Ordering::SeqCst), 4);

        assert_eq!(packet_pts(next_item(&pump).unwrap()), Some(0));
        assert!(wait_for(|| reads.load(Ordering::SeqCst) == 5));
        assert!(wait_for(|| pump.buffered_packets() == 4));

        pump.stop();
        pump.stop();
    }

    #[test]
    fn test_pump_seek_yields_discontinuity() {
        let observer = Arc::new(CountingObserver::default());
        let pump = PacketPump::spawn(
            scripted_reader(ScriptedDemuxer::new(10)),
            0,
            &ReaderConfig::default(),
            observer.clone(),
        )
        .unwrap();

        assert_eq!(packet_pts(next_item(&pump).unwrap()), Some(0));
        assert_eq!(packet_pts(next_item(&pump).unwrap()), Some(1000));

        pump.seek(6_000_000);
        assert!(matches!(
            next_item(&pump).unwrap(),
            PumpItem::Discontinuity
        ));
        let mut rest = Vec::new();
        loop {
            match next_item(&pump).unwrap() {
                PumpItem::Packet(p) => rest.push(p.pts().unwrap()),
                PumpItem::EndOfStream => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(rest, vec![4000, 5000, 6000, 7000, 8000, 9000]);
        assert!(matches!(next_item(&pump).unwrap(), PumpItem::EndOfStream));
        assert!(CountingObserver::count(&observer.progress) > 0);
    }

    #[test]
    fn test_pump_reports_error_once() {
        let observer = Arc::new(CountingObserver::default());
        let pump = PacketPump::spawn(
            scripted_reader(ScriptedDemuxer::new(10).failing_at(2)),
            0,
            &ReaderConfig::default(),
            observer.clone(),
        )
        .unwrap();

        assert_eq!(packet_pts(next_item(&pump).unwrap()), Some(0));
        assert_eq!(packet_pts(next_item(&pump).unwrap()), Some(1000));
        assert!(matches!(
            next_item(&pump),
            Err(TranscodeError::ReadFailed(_))
        ));
        assert!(matches!(next_item(&pump).unwrap(), PumpItem::EndOfStream));
        assert!(matches!(next_item(&pump).unwrap(), PumpItem::EndOfStream));
        assert_eq!(CountingObserver::count(&observer.errors), 1);
    }

    #[test]
    fn test_pump_skips_other_streams() {
        let pump = PacketPump::spawn(
            scripted_reader(ScriptedDemuxer::new(3).interleaved()),
            0,
            &ReaderConfig::default(),
            Arc::new(CountingObserver::default()),
        )
        .unwrap();
        let mut pts = Vec::new();
        loop {
            match next_item(&pump).unwrap() {
                PumpItem::Packet(p) => {
                    assert_eq!(p.stream(), 0);
                    pts.push(p.pts().unwrap());
                }
                PumpItem::EndOfStream => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(pts, vec![0, 1000, 2000]);
    }

    /// Observer that calls back into the pump from its progress callback.
    #[derive(Default)]
    struct QueryingObserver {
        pump: parking_lot::Mutex<Option<Weak<PacketPump>>>,
        queries: AtomicUsize,
    }

    impl PipelineObserver for QueryingObserver {
        fn progress(&self, _fraction: f64) {
            // The slot stays locked while the pump is borrowed, so the last
            // strong reference is never dropped on the pump's own thread.
            let slot = self.pump.lock();
            let pump = slot.as_ref().and_then(Weak::upgrade);
            if let Some(pump) = pump {
                assert!(pump.buffered_bytes() <= 32);
                pump.buffered_packets();
                self.queries.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_pump_observer_may_query_pump() {
        let observer = Arc::new(QueryingObserver::default());
        let config = ReaderConfig {
            max_buffered_bytes: 32,
            ..ReaderConfig::default()
        };
        let pump = Arc::new(
            PacketPump::spawn(
                scripted_reader(ScriptedDemuxer::new(20)),
                0,
                &config,
                observer.clone(),
            )
            .unwrap(),
        );
        *observer.pump.lock() = Some(Arc::downgrade(&pump));

        let mut packets = 0;
        loop {
            match next_item(&pump).unwrap() {
                PumpItem::Packet(_) => packets += 1,
                PumpItem::EndOfStream => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(packets, 20);
        assert!(wait_for(|| observer.queries.load(Ordering::SeqCst) > 0));
        observer.pump.lock().take();
    }

    #[test]
    fn test_pump_unknown_stream() {
        let err = PacketPump::spawn(
            scripted_reader(ScriptedDemuxer::new(3)),
            7,
            &ReaderConfig::default(),
            Arc::new(CountingObserver::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TranscodeError::NoMatchingStream(_)));
    }
}

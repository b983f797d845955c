//! Background packet pump
//!
//! Runs a [`MediaReader`] on its own thread and keeps a bounded
//! [`PacketQueue`] of one stream's packets filled ahead of the consumer.
//! The consumer side never blocks longer than the timeout it passes to
//! [`PacketPump::next`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};

use crate::config::ReaderConfig;
use crate::error::{Result, TranscodeError};
use crate::events::PipelineObserver;
use crate::transcode::packet_queue::PacketQueue;
use crate::transcode::reader::{Demuxer, InterruptToken, MediaReader, StreamInfo};

/// What the consumer gets from [`PacketPump::next`].
pub enum PumpItem {
    Packet(ffmpeg::Packet),
    /// The reader was repositioned. Everything buffered downstream is stale.
    Discontinuity,
    EndOfStream,
    /// Nothing arrived within the timeout.
    Pending,
}

impl std::fmt::Debug for PumpItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Packet(p) => f
                .debug_struct("Packet")
                .field("pts", &p.pts())
                .field("size", &p.size())
                .finish(),
            Self::Discontinuity => write!(f, "Discontinuity"),
            Self::EndOfStream => write!(f, "EndOfStream"),
            Self::Pending => write!(f, "Pending"),
        }
    }
}

#[derive(Default)]
struct Shared {
    queue: PacketQueue,
    eof: bool,
    discontinuity: bool,
    /// Requested reposition in microseconds, not yet carried out.
    seek: Option<i64>,
    stop: bool,
    error: Option<TranscodeError>,
    /// The error was handed to the consumer; report end of stream from now on.
    failed: bool,
}

struct Inner {
    state: Mutex<Shared>,
    cond: Condvar,
}

/// Reads packets of one stream on a background thread.
pub struct PacketPump {
    inner: Arc<Inner>,
    token: InterruptToken,
    stream_index: usize,
    handle: Option<JoinHandle<()>>,
}

impl PacketPump {
    /// Move `reader` onto a thread named `packet-pump` and start reading
    /// packets of `stream_index`.
    pub fn spawn<D>(
        reader: MediaReader<D>,
        stream_index: usize,
        config: &ReaderConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self>
    where
        D: Demuxer + Send + 'static,
    {
        let stream = reader.stream(stream_index).cloned().ok_or_else(|| {
            TranscodeError::NoMatchingStream(format!("no stream with index {}", stream_index))
        })?;
        let token = reader.token().clone();
        let inner = Arc::new(Inner {
            state: Mutex::new(Shared::default()),
            cond: Condvar::new(),
        });

        let worker = Worker {
            reader,
            stream,
            inner: inner.clone(),
            observer,
            max_buffered_bytes: config.max_buffered_bytes.max(1),
            poll: Duration::from_millis(config.poll_interval_ms.max(1)),
            last_progress: -1.0,
        };
        let handle = std::thread::Builder::new()
            .name("packet-pump".into())
            .spawn(move || worker.run())?;

        tracing::debug!(
            stream = stream_index,
            max_buffered_bytes = config.max_buffered_bytes,
            "Packet pump started"
        );

        Ok(Self {
            inner,
            token,
            stream_index,
            handle: Some(handle),
        })
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    /// Wait up to `timeout` for the next item.
    ///
    /// A reader error is returned once; every later call reports
    /// [`PumpItem::EndOfStream`] until the next seek.
    pub fn next(&self, timeout: Duration) -> Result<PumpItem> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.seek.is_none() {
                if state.discontinuity {
                    state.discontinuity = false;
                    return Ok(PumpItem::Discontinuity);
                }
                if let Some(packet) = state.queue.pop() {
                    self.inner.cond.notify_all();
                    return Ok(PumpItem::Packet(packet));
                }
                if let Some(e) = state.error.take() {
                    state.failed = true;
                    return Err(e);
                }
                if state.failed || state.eof {
                    return Ok(PumpItem::EndOfStream);
                }
                if state.stop {
                    return Err(TranscodeError::Interrupted);
                }
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(PumpItem::Pending);
            }
        }
    }

    /// Reposition to `timestamp_us`. Queued packets are dropped and the next
    /// item after the reposition is [`PumpItem::Discontinuity`].
    pub fn seek(&self, timestamp_us: i64) {
        let mut state = self.inner.state.lock();
        state.seek = Some(timestamp_us);
        state.queue.clear();
        state.eof = false;
        state.discontinuity = false;
        state.error = None;
        state.failed = false;
        self.inner.cond.notify_all();
    }

    /// Payload bytes waiting in the queue.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.state.lock().queue.size()
    }

    pub fn buffered_packets(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Interrupt the reader and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
            self.inner.cond.notify_all();
        }
        self.token.interrupt();
        if handle.join().is_err() {
            tracing::error!(stream = self.stream_index, "Packet pump thread panicked");
        } else {
            tracing::debug!(stream = self.stream_index, "Packet pump stopped");
        }
    }
}

impl Drop for PacketPump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reader side of the pump. Observer callbacks run with the state lock
/// released, so an observer may call back into the pump.
struct Worker<D: Demuxer> {
    reader: MediaReader<D>,
    stream: StreamInfo,
    inner: Arc<Inner>,
    observer: Arc<dyn PipelineObserver>,
    max_buffered_bytes: usize,
    poll: Duration,
    last_progress: f64,
}

impl<D: Demuxer> Worker<D> {
    fn run(mut self) {
        loop {
            let seek = {
                let mut state = self.inner.state.lock();
                loop {
                    if state.stop {
                        return;
                    }
                    if let Some(target) = state.seek {
                        break Some(target);
                    }
                    let idle = state.eof
                        || state.error.is_some()
                        || state.failed
                        || state.queue.is_full(self.max_buffered_bytes);
                    if !idle {
                        break None;
                    }
                    self.inner.cond.wait_for(&mut state, self.poll);
                }
            };

            match seek {
                Some(target) => self.reposition(target),
                None => self.read_one(),
            }
        }
    }

    fn reposition(&mut self, target_us: i64) {
        let result = self.reader.seek(target_us, None);
        let inner = self.inner.clone();
        let mut state = inner.state.lock();
        if state.seek != Some(target_us) {
            // Superseded by a newer request; carry that one out instead.
            return;
        }
        state.queue.clear();
        match result {
            Ok(()) => {
                state.seek = None;
                state.eof = false;
                state.discontinuity = true;
                self.last_progress = -1.0;
            }
            Err(e) => {
                // The seek stays pending, so consumers keep waiting meanwhile.
                drop(state);
                self.observer.error(&e);
                let mut state = inner.state.lock();
                if state.seek == Some(target_us) {
                    state.seek = None;
                    state.error = Some(e);
                }
            }
        }
        inner.cond.notify_all();
    }

    fn read_one(&mut self) {
        let result = self.reader.read_packet();
        let inner = self.inner.clone();
        let mut state = inner.state.lock();
        if state.seek.is_some() {
            // Read from before the reposition.
            return;
        }
        let progress = match result {
            Ok(Some(packet)) => {
                if packet.stream() != self.stream.index {
                    return;
                }
                let progress = self.progress(&packet);
                state.queue.push(packet);
                progress
            }
            Ok(None) => {
                tracing::debug!(stream = self.stream.index, "Packet pump reached end of stream");
                state.eof = true;
                Some(1.0)
            }
            Err(TranscodeError::Interrupted) if state.stop => return,
            Err(e) => {
                tracing::warn!(stream = self.stream.index, error = %e, "Packet pump read failed");
                drop(state);
                self.observer.error(&e);
                let mut state = inner.state.lock();
                if state.seek.is_none() {
                    state.error = Some(e);
                }
                inner.cond.notify_all();
                return;
            }
        };
        inner.cond.notify_all();
        drop(state);

        if let Some(fraction) = progress {
            self.observer.progress(fraction);
        }
    }

    /// Fraction of the stream read so far, reported at most once per
    /// percent.
    fn progress(&mut self, packet: &ffmpeg::Packet) -> Option<f64> {
        let duration = self.stream.duration.filter(|d| *d > 0)?;
        let pts = packet.pts()?;
        let start = self.stream.start_time.unwrap_or(0);
        let fraction = ((pts - start) as f64 / duration as f64).clamp(0.0, 1.0);
        if fraction - self.last_progress < 0.01 {
            return None;
        }
        self.last_progress = fraction;
        Some(fraction)
    }
}

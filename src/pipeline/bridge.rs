//! Drain task - moves captured frames from the capture ring to the outbound sink.
//!
//! Runs on the tokio runtime, never on an audio thread. Each pass it:
//! - Reads every complete frame from the capture ring
//! - Applies the transmit gate (read once per frame)
//! - Re-tags transmitted frames with the outbound sequence number
//! - Writes them to the sink, reporting failures as events
//! - Reports capture overflows since the previous pass

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::capture::CaptureShared;
use super::frame_ring::FrameReader;
use crate::event::{emit, AudioEvent, EventCallback};
use crate::sink::FrameSink;

/// Configuration for the drain task.
#[derive(Debug, Clone)]
pub(crate) struct DrainConfig {
    /// How often the capture ring is polled.
    pub poll_interval: Duration,
    /// Initial transmit gate.
    pub transmit: bool,
}

/// State shared between the drain task and the session.
#[derive(Debug)]
pub(crate) struct DrainShared {
    running: AtomicBool,
    wake: Notify,
    transmit: AtomicBool,
    frames_sent: AtomicU64,
    frames_gated: AtomicU64,
    sink_errors: AtomicU64,
}

impl DrainShared {
    fn new(transmit: bool) -> Self {
        Self {
            running: AtomicBool::new(true),
            wake: Notify::new(),
            transmit: AtomicBool::new(transmit),
            frames_sent: AtomicU64::new(0),
            frames_gated: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
        }
    }
}

/// Session-side handle to a running drain task.
pub(crate) struct DrainHandle {
    shared: Arc<DrainShared>,
    task: Option<JoinHandle<()>>,
}

impl DrainHandle {
    pub(crate) fn set_transmit(&self, enabled: bool) {
        self.shared.transmit.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn is_transmitting(&self) -> bool {
        self.shared.transmit.load(Ordering::Relaxed)
    }

    pub(crate) fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn frames_gated(&self) -> u64 {
        self.shared.frames_gated.load(Ordering::Relaxed)
    }

    pub(crate) fn sink_errors(&self) -> u64 {
        self.shared.sink_errors.load(Ordering::Relaxed)
    }

    /// Stops the task after it drains what is left, and waits for it.
    pub(crate) async fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DrainHandle {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

struct Drain {
    reader: FrameReader,
    sink: Arc<dyn FrameSink>,
    capture: Arc<CaptureShared>,
    shared: Arc<DrainShared>,
    event_callback: Option<EventCallback>,
    poll_interval: Duration,
    outbound_sequence: u64,
    reported_drops: u64,
}

impl Drain {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.shared.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                () = self.shared.wake.notified() => {}
            }
            self.drain_ready().await;
            self.report_overflow();
        }

        // Drain remaining frames on shutdown
        self.drain_ready().await;
        self.report_overflow();

        if let Err(e) = self.sink.on_stop().await {
            self.sink_failed(format!("Error during shutdown: {e}"));
        }
        tracing::debug!(
            sent = self.shared.frames_sent.load(Ordering::Relaxed),
            gated = self.shared.frames_gated.load(Ordering::Relaxed),
            "Drain task finished"
        );
    }

    async fn drain_ready(&mut self) {
        while let Some(frame) = self.reader.try_read() {
            if !self.shared.transmit.load(Ordering::Relaxed) {
                self.shared.frames_gated.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let frame = frame.with_sequence(self.outbound_sequence);
            self.outbound_sequence += 1;

            match self.sink.write(&frame).await {
                Ok(()) => {
                    self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.sink_failed(e.to_string()),
            }
        }
    }

    fn report_overflow(&mut self) {
        let dropped = self.capture.frames_dropped();
        if dropped > self.reported_drops {
            let delta = dropped - self.reported_drops;
            self.reported_drops = dropped;
            tracing::warn!(dropped = delta, total = dropped, "Capture ring overflowed");
            emit(
                self.event_callback.as_ref(),
                AudioEvent::CaptureOverflow { dropped: delta },
            );
        }
    }

    fn sink_failed(&self, error: String) {
        self.shared.sink_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(sink = self.sink.name(), %error, "Sink write failed");
        emit(
            self.event_callback.as_ref(),
            AudioEvent::SinkError {
                sink_name: self.sink.name().to_string(),
                error,
            },
        );
    }
}

/// Spawns the drain task on the current tokio runtime.
pub(crate) fn spawn_drain(
    reader: FrameReader,
    sink: Arc<dyn FrameSink>,
    capture: Arc<CaptureShared>,
    config: &DrainConfig,
    event_callback: Option<EventCallback>,
) -> DrainHandle {
    let shared = Arc::new(DrainShared::new(config.transmit));
    let drain = Drain {
        reader,
        sink,
        capture,
        shared: Arc::clone(&shared),
        event_callback,
        poll_interval: config.poll_interval.max(Duration::from_millis(1)),
        outbound_sequence: 0,
        reported_drops: 0,
    };

    DrainHandle {
        shared,
        task: Some(tokio::spawn(drain.run())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, PipelineFormat};
    use crate::pipeline::frame_ring::{frame_ring, FrameHeader, OverflowPolicy};
    use crate::event::event_callback;
    use crate::{AudioFrame, ChannelSink, SinkError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn pipeline() -> PipelineFormat {
        PipelineFormat::new(AudioFormat::mono(48000), Duration::from_millis(10))
    }

    fn config(transmit: bool) -> DrainConfig {
        DrainConfig {
            poll_interval: Duration::from_millis(1),
            transmit,
        }
    }

    struct FailingSink;

    #[async_trait]
    impl FrameSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn write(&self, _frame: &AudioFrame) -> Result<(), SinkError> {
            Err(SinkError::custom("encoder offline"))
        }
    }

    #[tokio::test]
    async fn test_forwards_frames_with_outbound_sequence() {
        let (mut writer, reader) = frame_ring(8, pipeline(), OverflowPolicy::DropNewest);
        let (tx, mut rx) = mpsc::channel(16);
        let capture = Arc::new(CaptureShared::default());

        // Capture sequence numbers start at 40; outbound numbering starts at 0
        for seq in 40..43 {
            assert!(writer.try_write(FrameHeader::new(seq, Duration::ZERO), &[seq as i16; 480]));
        }

        let mut handle = spawn_drain(reader, Arc::new(ChannelSink::new(tx)), capture, &config(true), None);

        for expected in 0..3 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.samples[0], 40 + expected as i16);
        }
        handle.shutdown().await;
        assert_eq!(handle.frames_sent(), 3);
    }

    #[tokio::test]
    async fn test_transmit_gate_discards_frames() {
        let (mut writer, reader) = frame_ring(8, pipeline(), OverflowPolicy::DropNewest);
        let (tx, mut rx) = mpsc::channel(16);
        let capture = Arc::new(CaptureShared::default());
        let mut handle = spawn_drain(reader, Arc::new(ChannelSink::new(tx)), capture, &config(false), None);

        writer.try_write(FrameHeader::default(), &[1; 480]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.frames_gated(), 1);

        handle.set_transmit(true);
        writer.try_write(FrameHeader::default(), &[2; 480]);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.samples[0], 2);
        assert_eq!(frame.sequence, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sink_errors_become_events() {
        let (mut writer, reader) = frame_ring(8, pipeline(), OverflowPolicy::DropNewest);
        let capture = Arc::new(CaptureShared::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let callback = event_callback(move |e| events_clone.lock().push(e));

        writer.try_write(FrameHeader::default(), &[1; 480]);
        writer.try_write(FrameHeader::default(), &[1; 480]);
        let mut handle = spawn_drain(reader, Arc::new(FailingSink), capture, &config(true), Some(callback));
        handle.shutdown().await;

        assert_eq!(handle.sink_errors(), 2);
        let events = events.lock();
        assert!(events.iter().all(|e| matches!(
            e,
            AudioEvent::SinkError { sink_name, .. } if sink_name == "failing"
        )));
    }

    #[tokio::test]
    async fn test_shutdown_drains_remaining_frames() {
        let (mut writer, reader) = frame_ring(8, pipeline(), OverflowPolicy::DropNewest);
        let (tx, mut rx) = mpsc::channel(16);
        let capture = Arc::new(CaptureShared::default());
        let mut handle = spawn_drain(
            reader,
            Arc::new(ChannelSink::new(tx)),
            capture,
            &DrainConfig {
                poll_interval: Duration::from_secs(3600),
                transmit: true,
            },
            None,
        );

        for _ in 0..4 {
            writer.try_write(FrameHeader::default(), &[5; 480]);
        }
        handle.shutdown().await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }
}

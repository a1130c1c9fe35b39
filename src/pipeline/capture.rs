//! Capture engine: turns native input callbacks into pipeline frames.
//!
//! The input callback hands over whatever buffer size the device uses, in the
//! device's native format. The engine converts it to the pipeline format,
//! cuts it into exact frames and pushes them into the capture ring:
//!
//! ```text
//! native samples → Resampler → pipeline frames → FrameRing (drop newest)
//! ```
//!
//! Frames are stamped from a running sequence number, so timestamps advance
//! by exactly one frame duration regardless of callback jitter and keep
//! advancing across device restarts.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::frame_ring::{frame_ring, FrameHeader, FrameReader, FrameWriter, OverflowPolicy};
use super::CaptureState;
use crate::backend::AudioBackend;
use crate::format::{AudioFormat, PipelineFormat, Resampler};
use crate::AudioError;

/// Counters shared between the input callback and the control side.
#[derive(Debug, Default)]
pub(crate) struct CaptureShared {
    state: AtomicU8,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    callbacks: AtomicU64,
    /// Callbacks that found the processor busy (being rewired).
    busy: AtomicU64,
}

impl CaptureShared {
    pub(crate) fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub(crate) fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }
}

/// Audio-thread half of the engine.
struct CaptureProcessor {
    pipeline: PipelineFormat,
    resampler: Resampler,
    writer: FrameWriter,
    frame: Vec<i16>,
    sequence: u64,
    shared: Arc<CaptureShared>,
}

impl CaptureProcessor {
    /// Converts one native buffer and queues every completed frame.
    fn process(&mut self, native: &[i16]) {
        self.resampler.push(native);

        while self.resampler.pop_into(&mut self.frame) {
            let header = FrameHeader::new(self.sequence, self.pipeline.timestamp_of(self.sequence));
            self.sequence += 1;

            if self.writer.try_write(header, &self.frame) {
                self.shared.frames_captured.fetch_add(1, Ordering::Relaxed);
            } else {
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Control-side handle to the capture path.
pub(crate) struct CaptureEngine {
    pipeline: PipelineFormat,
    processor: Arc<Mutex<CaptureProcessor>>,
    shared: Arc<CaptureShared>,
}

impl CaptureEngine {
    /// Creates an idle engine and the reader for its frames.
    ///
    /// The ring holds `ring_frames` frames; when the reader falls behind,
    /// new frames are dropped and counted.
    pub(crate) fn new(pipeline: PipelineFormat, ring_frames: usize) -> Result<(Self, FrameReader), AudioError> {
        if !pipeline.is_valid() {
            return Err(AudioError::unsupported("capture", pipeline.format, "invalid pipeline format"));
        }

        let (writer, reader) = frame_ring(ring_frames, pipeline, OverflowPolicy::DropNewest);
        let shared = Arc::new(CaptureShared::default());
        let processor = CaptureProcessor {
            pipeline,
            resampler: Resampler::new(pipeline.format, pipeline.format, pipeline.frame_duration)?,
            writer,
            frame: vec![0; pipeline.frame_len()],
            sequence: 0,
            shared: Arc::clone(&shared),
        };

        Ok((
            Self {
                pipeline,
                processor: Arc::new(Mutex::new(processor)),
                shared,
            },
            reader,
        ))
    }

    /// Reconfigures the native→pipeline conversion for a new device.
    ///
    /// Partial frames from the previous device are discarded; the sequence
    /// counter carries on.
    pub(crate) fn rewire(&self, native: AudioFormat) -> Result<(), AudioError> {
        let resampler = Resampler::new(native, self.pipeline.format, self.pipeline.frame_duration)?;
        self.processor.lock().resampler = resampler;
        Ok(())
    }

    /// Rewires for `native` and installs the input callback on `backend`.
    pub(crate) fn start(&self, backend: &mut dyn AudioBackend, native: AudioFormat) -> Result<(), AudioError> {
        self.rewire(native)?;

        let processor = Arc::clone(&self.processor);
        let shared = Arc::clone(&self.shared);
        backend.start_capture(Box::new(move |data: &[i16]| {
            shared.callbacks.fetch_add(1, Ordering::Relaxed);
            match processor.try_lock() {
                Some(mut processor) => processor.process(data),
                None => {
                    shared.busy.fetch_add(1, Ordering::Relaxed);
                }
            }
        }))?;

        self.shared.set_state(CaptureState::Capturing);
        tracing::info!(pipeline = %self.pipeline, %native, "Capture started");
        Ok(())
    }

    /// Stops `backend` and returns the engine to idle.
    pub(crate) fn stop(&self, backend: &mut dyn AudioBackend) {
        backend.stop();
        self.shared.set_state(CaptureState::Idle);
    }

    pub(crate) fn begin_negotiation(&self) {
        self.shared.set_state(CaptureState::Negotiating);
    }

    pub(crate) fn mark_idle(&self) {
        self.shared.set_state(CaptureState::Idle);
    }

    pub(crate) fn shared(&self) -> &Arc<CaptureShared> {
        &self.shared
    }

    #[cfg(test)]
    fn process_for_test(&self, native: &[i16]) {
        self.processor.lock().process(native);
    }
}

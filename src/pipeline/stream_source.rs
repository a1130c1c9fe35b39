//! Per-participant inbound audio.
//!
//! A participant's decoded audio travels through its own frame ring: the
//! decode stage holds the [`StreamSourceWriter`], the mixer holds the
//! [`StreamSource`]. Both share a [`SourceActivity`] block of atomics, which
//! is what the control thread looks at when it reaps silent sources.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::frame_ring::{frame_ring, FrameHeader, FrameReader, FrameWriter, OverflowPolicy};
use crate::format::{PipelineFormat, Resampler};
use crate::participant::ParticipantId;
use crate::{AudioError, AudioFrame};

/// Counters shared by both halves of a stream source.
#[derive(Debug)]
pub(crate) struct SourceActivity {
    participant: ParticipantId,
    frames_pushed: AtomicU64,
    frames_mixed: AtomicU64,
    underruns: AtomicU64,
    /// Mixer cycle in which the source last contributed non-zero audio.
    last_audible_cycle: AtomicU64,
    removed: AtomicBool,
}

impl SourceActivity {
    fn new(participant: ParticipantId, cycle: u64) -> Self {
        Self {
            participant,
            frames_pushed: AtomicU64::new(0),
            frames_mixed: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            last_audible_cycle: AtomicU64::new(cycle),
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn last_audible_cycle(&self) -> u64 {
        self.last_audible_cycle.load(Ordering::Relaxed)
    }

    pub(crate) fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn snapshot(&self, queued: usize, overflows: u64) -> SourceStats {
        SourceStats {
            participant: self.participant,
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
            underruns: self.underruns(),
            overflows,
            queued,
        }
    }
}

/// Point-in-time counters for one stream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    /// The participant.
    pub participant: ParticipantId,
    /// Frames handed over by the decode stage.
    pub frames_pushed: u64,
    /// Frames consumed by the mixer.
    pub frames_mixed: u64,
    /// Mix cycles in which no frame was ready.
    pub underruns: u64,
    /// Stale frames discarded because the ring was full.
    pub overflows: u64,
    /// Frames waiting in the ring.
    pub queued: usize,
}

/// Mixer-side half of a participant's stream.
pub struct StreamSource {
    reader: FrameReader,
    activity: Arc<SourceActivity>,
}

/// Decode-side half of a participant's stream.
///
/// Returned by
/// [`AudioSession::add_stream_source`](crate::AudioSession::add_stream_source).
/// Once the source is removed (explicitly or after a silence timeout) pushes
/// are refused; check [`is_closed`](Self::is_closed) and re-add the source
/// when the participant talks again.
pub struct StreamSourceWriter {
    writer: FrameWriter,
    activity: Arc<SourceActivity>,
    pipeline: PipelineFormat,
    sequence: u64,
    /// Carries filter state across frames of a foreign-format stream.
    converter: Option<Resampler>,
    /// One pipeline frame.
    scratch: Vec<i16>,
}

/// Creates both halves of a stream source.
///
/// `cycle` is the mixer's current cycle, so the silence timeout counts from
/// creation.
pub(crate) fn stream_source(
    participant: ParticipantId,
    pipeline: PipelineFormat,
    ring_frames: usize,
    cycle: u64,
) -> (StreamSourceWriter, StreamSource) {
    let (writer, reader) = frame_ring(ring_frames, pipeline, OverflowPolicy::DropOldest);
    let activity = Arc::new(SourceActivity::new(participant, cycle));

    (
        StreamSourceWriter {
            writer,
            activity: Arc::clone(&activity),
            pipeline,
            sequence: 0,
            converter: None,
            scratch: vec![0; pipeline.frame_len()],
        },
        StreamSource { reader, activity },
    )
}

impl StreamSource {
    /// Participant this stream belongs to.
    pub fn participant(&self) -> ParticipantId {
        self.activity.participant
    }

    pub(crate) fn activity(&self) -> &Arc<SourceActivity> {
        &self.activity
    }

    /// Adds one frame into `accumulator`, using `scratch` as the read buffer.
    ///
    /// Returns `false` (and counts an underrun) if no frame was ready.
    /// Real-time safe.
    #[inline]
    pub(crate) fn mix_into(&mut self, accumulator: &mut [i32], scratch: &mut [i16], cycle: u64) -> bool {
        if self.reader.try_read_into(scratch).is_none() {
            self.activity.underruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut audible = false;
        for (acc, &sample) in accumulator.iter_mut().zip(scratch.iter()) {
            *acc += i32::from(sample);
            audible |= sample != 0;
        }

        self.activity.frames_mixed.fetch_add(1, Ordering::Relaxed);
        if audible {
            self.activity
                .last_audible_cycle
                .store(cycle, Ordering::Relaxed);
        }
        true
    }

    /// Frames waiting to be mixed.
    pub fn queued(&self) -> usize {
        self.reader.len()
    }

    /// Current counters.
    pub fn stats(&self) -> SourceStats {
        self.activity.snapshot(self.reader.len(), self.reader.overflows())
    }
}

impl StreamSourceWriter {
    /// Participant this stream belongs to.
    pub fn participant(&self) -> ParticipantId {
        self.activity.participant
    }

    /// Returns `true` once the mixer no longer consumes this stream.
    pub fn is_closed(&self) -> bool {
        self.activity.removed.load(Ordering::Acquire)
    }

    /// Pushes one decoded frame of pipeline-format samples.
    ///
    /// The frame is tagged with the next sequence number. If the ring is
    /// full the oldest queued frame makes way. Returns `false` if the source
    /// is closed or `samples` is not exactly one pipeline frame.
    pub fn push_frame(&mut self, samples: &[i16]) -> bool {
        if self.is_closed() {
            return false;
        }

        let header = FrameHeader::new(self.sequence, self.pipeline.timestamp_of(self.sequence));
        if !self.writer.try_write(header, samples) {
            return false;
        }
        self.sequence += 1;
        self.activity.frames_pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pushes a decoded frame in any format.
    ///
    /// Pipeline-format frames must be exactly one frame long. Frames in any
    /// other format may hold any whole number of sample frames; they are
    /// streamed through a converter that persists between calls, so
    /// consecutive frames join without gaps and each call may queue zero,
    /// one or several pipeline frames. A change of input format starts a
    /// fresh converter.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` for a malformed frame and `InvalidState`
    /// if the source is closed.
    pub fn push(&mut self, frame: &AudioFrame) -> Result<(), AudioError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        if frame.format == self.pipeline.format {
            if frame.samples.len() != self.pipeline.frame_len() {
                return Err(AudioError::unsupported(
                    "stream source",
                    frame.format,
                    format!(
                        "{} samples do not make one {} frame",
                        frame.samples.len(),
                        self.pipeline
                    ),
                ));
            }
            self.converter = None;
            return self.store(&frame.samples);
        }

        if !frame.format.is_valid() || frame.samples.len() % frame.format.channels as usize != 0 {
            return Err(AudioError::unsupported(
                "stream source",
                frame.format,
                format!("{} samples is not a whole number of frames", frame.samples.len()),
            ));
        }

        let mut converter = match self.converter.take() {
            Some(converter) if converter.input() == frame.format => converter,
            _ => Resampler::new(frame.format, self.pipeline.format, self.pipeline.frame_duration)?,
        };
        converter.push(&frame.samples);

        let mut scratch = std::mem::take(&mut self.scratch);
        let mut result = Ok(());
        while result.is_ok() && converter.pop_into(&mut scratch) {
            result = self.store(&scratch);
        }
        self.scratch = scratch;
        self.converter = Some(converter);
        result
    }

    fn store(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        if self.push_frame(samples) {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> AudioError {
        AudioError::invalid_state(format!("stream source {} is closed", self.participant()))
    }

    /// Current counters.
    pub fn stats(&self) -> SourceStats {
        self.activity.snapshot(self.writer.len(), self.writer.overflows())
    }
}

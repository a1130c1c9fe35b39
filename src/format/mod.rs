//! Audio format types and conversion utilities.
//!
//! All sample data in this crate is interleaved 16-bit signed PCM. A format
//! therefore only varies in sample rate and channel count:
//! - [`AudioFormat`]: a native device format or the canonical pipeline format
//! - [`PipelineFormat`]: the canonical format plus the fixed frame duration
//! - Sample format conversion (f32 ↔ i16) and channel remixing
//! - Sample rate conversion ([`Resampler`])

mod convert;
mod resample;

use std::fmt;
use std::time::Duration;

pub use convert::{f32_to_i16, i16_to_f32, remix_frame, saturate};
pub use resample::{convert, Resampler};

/// Bit depth of every sample handled by the pipeline.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Sample rate and channel layout of an interleaved i16 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g., 16000, 44100, 48000).
    pub sample_rate: u32,
    /// Number of interleaved channels (1 = mono, 2 = stereo).
    pub channels: u16,
}

impl AudioFormat {
    /// Creates a format with the given rate and channel count.
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Creates a mono format.
    pub const fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Creates a stereo format.
    pub const fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2)
    }

    /// Returns `true` if the rate and channel count are non-zero.
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    /// Number of frames (one sample per channel) covering `duration`.
    pub fn frames_for(&self, duration: Duration) -> usize {
        (u128::from(self.sample_rate) * duration.as_micros() / 1_000_000) as usize
    }

    /// Number of interleaved samples covering `duration`.
    pub fn samples_for(&self, duration: Duration) -> usize {
        self.frames_for(duration) * self.channels as usize
    }

    /// Duration of `frames` frames at this rate.
    pub fn duration_of(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// The canonical internal format, fixed for the lifetime of a session.
///
/// Every [`AudioFrame`](crate::AudioFrame) flowing between the capture engine,
/// the resampler and the mixer has exactly this format and holds exactly
/// [`frame_len()`](Self::frame_len) samples. Only backend-facing buffers use a
/// native device format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineFormat {
    /// Rate and channel layout.
    pub format: AudioFormat,
    /// Duration of one frame.
    pub frame_duration: Duration,
}

impl PipelineFormat {
    /// Creates a pipeline format.
    pub const fn new(format: AudioFormat, frame_duration: Duration) -> Self {
        Self {
            format,
            frame_duration,
        }
    }

    /// Frames (per-channel samples) in one pipeline frame.
    pub fn frame_frames(&self) -> usize {
        self.format.frames_for(self.frame_duration)
    }

    /// Interleaved samples in one pipeline frame.
    pub fn frame_len(&self) -> usize {
        self.format.samples_for(self.frame_duration)
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Channel count.
    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Timestamp of the frame with the given sequence number.
    pub fn timestamp_of(&self, sequence: u64) -> Duration {
        self.frame_duration.saturating_mul(sequence.min(u64::from(u32::MAX)) as u32)
    }

    /// Returns `true` if the format yields non-empty frames.
    pub fn is_valid(&self) -> bool {
        self.format.is_valid() && self.frame_frames() > 0
    }
}

impl fmt::Display for PipelineFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}ms frames",
            self.format,
            self.frame_duration.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_for_common_rates() {
        let ten_ms = Duration::from_millis(10);
        assert_eq!(AudioFormat::mono(48000).frames_for(ten_ms), 480);
        assert_eq!(AudioFormat::mono(44100).frames_for(ten_ms), 441);
        assert_eq!(AudioFormat::stereo(16000).samples_for(ten_ms), 320);
    }

    #[test]
    fn test_pipeline_frame_len() {
        let pipeline = PipelineFormat::new(AudioFormat::stereo(48000), Duration::from_millis(20));
        assert_eq!(pipeline.frame_frames(), 960);
        assert_eq!(pipeline.frame_len(), 1920);
        assert!(pipeline.is_valid());
    }

    #[test]
    fn test_timestamp_of() {
        let pipeline = PipelineFormat::new(AudioFormat::mono(48000), Duration::from_millis(10));
        assert_eq!(pipeline.timestamp_of(0), Duration::ZERO);
        assert_eq!(pipeline.timestamp_of(15), Duration::from_millis(150));
    }

    #[test]
    fn test_invalid_formats() {
        assert!(!AudioFormat::new(0, 1).is_valid());
        assert!(!AudioFormat::new(48000, 0).is_valid());
        let too_short = PipelineFormat::new(AudioFormat::mono(8000), Duration::from_micros(10));
        assert!(!too_short.is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::stereo(44100).to_string(), "44100Hz/2ch");
    }
}

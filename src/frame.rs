//! Audio frame with sequence and timing metadata.

use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioFormat;

/// A fixed-length block of PCM samples, the unit exchanged between stages.
///
/// Frames produced by the capture engine or handed to a stream source are
/// always exactly one pipeline frame long at the pipeline format. Samples are
/// stored in an `Arc<Vec<i16>>` so clones share the sample data.
///
/// # Example
///
/// ```
/// use duplex_audio::{AudioFormat, AudioFrame};
/// use std::time::Duration;
///
/// let frame = AudioFrame::new(vec![0i16; 480], 7, Duration::from_millis(70), AudioFormat::mono(48000));
/// assert_eq!(frame.duration(), Duration::from_millis(10));
///
/// let shared = frame.clone(); // shares sample data
/// assert_eq!(shared.sequence, 7);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved 16-bit PCM samples.
    pub samples: Arc<Vec<i16>>,

    /// Monotonically increasing sequence number within its stream.
    pub sequence: u64,

    /// Capture or render timestamp relative to the start of the stream.
    pub timestamp: Duration,

    /// Rate and channel layout of `samples`.
    pub format: AudioFormat,
}

impl AudioFrame {
    /// Creates a new frame.
    pub fn new(samples: Vec<i16>, sequence: u64, timestamp: Duration, format: AudioFormat) -> Self {
        Self {
            samples: Arc::new(samples),
            sequence,
            timestamp,
            format,
        }
    }

    /// Creates a silent frame of `frames` frames.
    pub fn silence(frames: usize, sequence: u64, timestamp: Duration, format: AudioFormat) -> Self {
        Self::new(
            vec![0; frames * format.channels as usize],
            sequence,
            timestamp,
            format,
        )
    }

    /// Returns a copy of this frame carrying a different sequence number.
    ///
    /// Sample data stays shared.
    pub fn with_sequence(&self, sequence: u64) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }

    /// Returns the duration of this frame.
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.frame_count())
    }

    /// Returns the number of frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        if self.format.channels == 0 {
            return 0;
        }
        self.samples.len() / self.format.channels as usize
    }

    /// Returns `true` if this frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns `true` if every sample is zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_mono_48khz() {
        let frame = AudioFrame::new(vec![0i16; 480], 0, Duration::ZERO, AudioFormat::mono(48000));
        assert_eq!(frame.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_duration_stereo_48khz() {
        // 1920 samples / 2 channels = 960 frames / 48000 Hz = 20ms
        let frame = AudioFrame::new(vec![0i16; 1920], 0, Duration::ZERO, AudioFormat::stereo(48000));
        assert_eq!(frame.duration(), Duration::from_millis(20));
        assert_eq!(frame.frame_count(), 960);
    }

    #[test]
    fn test_silence() {
        let frame = AudioFrame::silence(160, 1, Duration::ZERO, AudioFormat::stereo(16000));
        assert_eq!(frame.samples.len(), 320);
        assert!(frame.is_silent());
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_with_sequence_shares_samples() {
        let frame = AudioFrame::new(vec![1, 2, 3], 4, Duration::ZERO, AudioFormat::mono(8000));
        let retagged = frame.with_sequence(9);
        assert_eq!(retagged.sequence, 9);
        assert!(Arc::ptr_eq(&frame.samples, &retagged.samples));
    }

    #[test]
    fn test_zero_channels() {
        let frame = AudioFrame::new(vec![0i16; 100], 0, Duration::ZERO, AudioFormat::new(16000, 0));
        assert_eq!(frame.duration(), Duration::ZERO);
        assert_eq!(frame.frame_count(), 0);
    }
}

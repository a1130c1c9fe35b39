//! Configuration types for the audio engine.

use std::time::Duration;

use crate::format::{AudioFormat, PipelineFormat};

/// Preset pipeline formats for common use cases.
///
/// The pipeline format is fixed for the lifetime of a session; devices that
/// run at a different rate or channel count are converted at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPreset {
    /// 48kHz mono - what voice codecs such as Opus expect.
    #[default]
    Voice,

    /// 48kHz stereo - for positional audio or music bots.
    VoiceStereo,

    /// 16kHz mono - lower CPU cost for wideband codecs.
    Wideband,
}

impl FormatPreset {
    /// Returns the pipeline sample rate for this preset.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Voice | Self::VoiceStereo => 48000,
            Self::Wideband => 16000,
        }
    }

    /// Returns the pipeline channel count for this preset.
    #[must_use]
    pub fn channels(&self) -> u16 {
        match self {
            Self::Voice | Self::Wideband => 1,
            Self::VoiceStereo => 2,
        }
    }

    /// Returns the audio format for this preset.
    #[must_use]
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate(), self.channels())
    }
}

/// Configuration for engine behavior.
///
/// Use [`EngineConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use duplex_audio::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     frame_duration: Duration::from_millis(20),
///     reopen_attempts: 3,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Duration of one pipeline frame.
    ///
    /// Default: 10ms
    pub frame_duration: Duration,

    /// Capacity of the outbound capture ring, in frames.
    ///
    /// When it fills, the newest frame is dropped and counted.
    /// Default: 8
    pub capture_ring_frames: usize,

    /// Capacity of each participant's inbound ring, in frames.
    ///
    /// When it fills, the oldest frames are discarded.
    /// Default: 8
    pub source_ring_frames: usize,

    /// How long a stream source may stay silent before it is reaped.
    ///
    /// Default: 2 seconds
    pub source_silence_timeout: Duration,

    /// Upper bound on simultaneously mixed stream sources.
    ///
    /// Default: 32
    pub max_sources: usize,

    /// How often the drain task polls the capture ring.
    ///
    /// Default: 5ms
    pub drain_poll_interval: Duration,

    /// How often the device monitor polls device lists and backend status.
    ///
    /// Default: 1 second
    pub device_poll_interval: Duration,

    /// Number of attempts to reopen a device after it is lost.
    ///
    /// Default: 5
    pub reopen_attempts: u32,

    /// Initial delay between reopen attempts.
    ///
    /// Uses exponential backoff (delay doubles each attempt).
    /// Default: 100ms
    pub reopen_backoff: Duration,
}

impl EngineConfig {
    /// Returns the pipeline format for `preset` at this frame duration.
    #[must_use]
    pub fn pipeline(&self, preset: FormatPreset) -> PipelineFormat {
        PipelineFormat::new(preset.format(), self.frame_duration)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(10),
            capture_ring_frames: 8,
            source_ring_frames: 8,
            source_silence_timeout: Duration::from_secs(2),
            max_sources: 32,
            drain_poll_interval: Duration::from_millis(5),
            device_poll_interval: Duration::from_secs(1),
            reopen_attempts: 5,
            reopen_backoff: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_preset_voice() {
        let preset = FormatPreset::Voice;
        assert_eq!(preset.sample_rate(), 48000);
        assert_eq!(preset.channels(), 1);
    }

    #[test]
    fn test_format_preset_wideband() {
        assert_eq!(FormatPreset::Wideband.format(), AudioFormat::mono(16000));
        assert_eq!(FormatPreset::VoiceStereo.format(), AudioFormat::stereo(48000));
    }

    #[test]
    fn test_format_preset_default() {
        assert_eq!(FormatPreset::default(), FormatPreset::Voice);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.frame_duration, Duration::from_millis(10));
        assert_eq!(config.capture_ring_frames, 8);
        assert_eq!(config.reopen_attempts, 5);
        assert_eq!(config.reopen_backoff, Duration::from_millis(100));

        let pipeline = config.pipeline(FormatPreset::Voice);
        assert_eq!(pipeline.frame_len(), 480);
    }
}

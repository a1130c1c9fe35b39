//! Error types for duplex-audio.
//!
//! Errors are split into two categories:
//! - **Control errors** ([`AudioError`]): returned from negotiation, device
//!   selection and session management calls on the control thread
//! - **Degraded-quality signals**: ring overflow/underflow and device restarts,
//!   surfaced as counters in [`SessionStats`](crate::SessionStats) and via the
//!   [`EventCallback`](crate::EventCallback), never as errors
//!
//! Real-time callbacks never produce an `AudioError`. They record a status
//! code that the device monitor turns into one of these variants.

use crate::backend::{DeviceId, Direction};
use crate::format::AudioFormat;
use crate::participant::ParticipantId;

/// Errors reported by the audio core to the control thread.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// Format negotiation failed; the engine stays idle.
    ///
    /// The user has to pick another device or pipeline rate.
    #[error("unsupported format {requested} on {device}: {reason}")]
    UnsupportedFormat {
        /// Device the negotiation ran against.
        device: String,
        /// Format that was requested.
        requested: AudioFormat,
        /// Why the device cannot serve it.
        reason: String,
    },

    /// The native endpoint disappeared while in use.
    #[error("{direction} device lost: {device}")]
    DeviceLost {
        /// Which side of the device was lost.
        direction: Direction,
        /// Name of the lost device.
        device: String,
    },

    /// The requested device does not exist.
    #[error("device not found: {id}")]
    DeviceNotFound {
        /// Identifier that could not be resolved.
        id: DeviceId,
    },

    /// No default device is configured for the direction.
    #[error("no default {direction} device configured")]
    NoDefaultDevice {
        /// Direction without a default device.
        direction: Direction,
    },

    /// Unrecoverable native failure; audio is unavailable.
    #[error("audio unavailable: {reason}")]
    BackendFatal {
        /// Description of the failure.
        reason: String,
    },

    /// An error reported by the underlying audio library.
    #[error("audio backend error: {0}")]
    Backend(String),

    /// An operation was issued in the wrong engine or backend state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The mixer has no free slot for another participant.
    #[error("mixer full: at most {max} stream sources")]
    TooManySources {
        /// Configured source limit.
        max: usize,
    },

    /// A stream source already exists for the participant.
    #[error("stream source already exists for participant {id}")]
    DuplicateSource {
        /// The duplicated participant.
        id: ParticipantId,
    },

    /// The outbound sink failed to start.
    #[error("sink '{sink_name}' failed to start: {reason}")]
    SinkStartFailed {
        /// Name of the sink.
        sink_name: String,
        /// Description of the failure.
        reason: String,
    },

    /// The session's control task is gone.
    #[error("audio session closed")]
    SessionClosed,
}

impl AudioError {
    /// Creates a backend error from anything displayable.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Creates an unsupported-format error.
    pub fn unsupported(
        device: impl Into<String>,
        requested: AudioFormat,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedFormat {
            device: device.into(),
            requested,
            reason: reason.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns `true` if reopening the device may fix the condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost { .. }
                | Self::DeviceNotFound { .. }
                | Self::NoDefaultDevice { .. }
                | Self::Backend(_)
        )
    }
}

/// Errors from an outbound [`FrameSink`](crate::FrameSink).
///
/// Sink errors are recoverable: the drain task emits an
/// [`AudioEvent::SinkError`](crate::AudioEvent::SinkError) and moves on to
/// the next frame.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A write operation failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The receiving channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The receiving channel was full and the frame was dropped.
    #[error("channel full, frame dropped")]
    ChannelFull,

    /// Custom error for user-implemented sinks.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates a write failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_format_display() {
        let err = AudioError::unsupported("USB Mic", AudioFormat::mono(48000), "no input channels");
        assert_eq!(
            err.to_string(),
            "unsupported format 48000Hz/1ch on USB Mic: no input channels"
        );
    }

    #[test]
    fn test_device_lost_display() {
        let err = AudioError::DeviceLost {
            direction: Direction::Output,
            device: "Speakers".to_string(),
        };
        assert_eq!(err.to_string(), "output device lost: Speakers");
    }

    #[test]
    fn test_backend_helper() {
        let err = AudioError::backend("stream build failed");
        assert_eq!(err.to_string(), "audio backend error: stream build failed");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(AudioError::backend("x").is_recoverable());
        assert!(AudioError::NoDefaultDevice {
            direction: Direction::Input
        }
        .is_recoverable());
        assert!(!AudioError::BackendFatal {
            reason: "gone".into()
        }
        .is_recoverable());
        assert!(!AudioError::unsupported("d", AudioFormat::mono(8000), "r").is_recoverable());
    }

    #[test]
    fn test_sink_error_helpers() {
        assert_eq!(SinkError::custom("boom").to_string(), "boom");
        assert_eq!(
            SinkError::write_failed("socket reset").to_string(),
            "write failed: socket reset"
        );
        assert_eq!(SinkError::ChannelClosed.to_string(), "channel closed");
        assert_eq!(SinkError::ChannelFull.to_string(), "channel full, frame dropped");
    }
}

//! Runtime events for monitoring engine health.
//!
//! Events are non-fatal notifications. Audio keeps flowing after an event is
//! emitted (except after [`AudioEvent::AudioUnavailable`]); they're for
//! logging, metrics and UI, not error handling. Events are never emitted from
//! a real-time callback.

use std::sync::Arc;

use crate::backend::{DeviceId, Direction};
use crate::format::AudioFormat;
use crate::participant::ParticipantId;

/// Runtime events emitted by a running session.
///
/// # Example
///
/// ```
/// use duplex_audio::AudioEvent;
///
/// fn handle_event(event: AudioEvent) {
///     match event {
///         AudioEvent::CaptureOverflow { dropped } => {
///             eprintln!("Warning: dropped {dropped} captured frames");
///         }
///         AudioEvent::DeviceLost { direction, device } => {
///             eprintln!("{direction} device {device} lost, reconfiguring");
///         }
///         AudioEvent::AudioUnavailable { direction, reason } => {
///             eprintln!("{direction} audio unavailable: {reason}");
///         }
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// A device was opened and its native format negotiated.
    FormatNegotiated {
        /// Which side of the engine the device serves.
        direction: Direction,
        /// The opened device.
        device: DeviceId,
        /// The format the device actually runs at.
        native: AudioFormat,
    },

    /// Captured frames were dropped because the outbound ring was full.
    ///
    /// This happens when the drain task falls behind the capture callback.
    CaptureOverflow {
        /// Frames dropped since the previous report.
        dropped: u64,
    },

    /// Stream sources had no frame ready when the mixer needed one.
    PlaybackUnderrun {
        /// Underruns across all sources since the previous report.
        underruns: u64,
    },

    /// An active device disappeared or reported an error.
    ///
    /// The monitor follows up with [`DeviceRestarted`] or
    /// [`AudioUnavailable`].
    ///
    /// [`DeviceRestarted`]: AudioEvent::DeviceRestarted
    /// [`AudioUnavailable`]: AudioEvent::AudioUnavailable
    DeviceLost {
        /// Which side of the engine lost its device.
        direction: Direction,
        /// The device that was lost.
        device: DeviceId,
    },

    /// A replacement device is open and audio is flowing again.
    DeviceRestarted {
        /// Which side of the engine was restarted.
        direction: Direction,
        /// The device now in use.
        device: DeviceId,
        /// Its negotiated native format.
        native: AudioFormat,
    },

    /// One reopen attempt failed; another will follow after a backoff.
    ReopenFailed {
        /// Which side of the engine is reopening.
        direction: Direction,
        /// 1-based attempt number.
        attempt: u32,
        /// Description of the failure.
        error: String,
    },

    /// Reopen attempts are exhausted; this side of the engine is idle.
    ///
    /// Selecting a device or signalling a device change retries.
    AudioUnavailable {
        /// Which side of the engine gave up.
        direction: Direction,
        /// Description of the last failure.
        reason: String,
    },

    /// A stream source was registered with the mixer.
    SourceAdded {
        /// The participant.
        participant: ParticipantId,
    },

    /// A stream source was silent past the timeout and was removed.
    SourceExpired {
        /// The participant.
        participant: ParticipantId,
    },

    /// The outbound sink rejected a frame.
    SinkError {
        /// Name of the sink.
        sink_name: String,
        /// Description of the error.
        error: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register an event callback via [`DuplexAudioBuilder::on_event()`].
///
/// [`DuplexAudioBuilder::on_event()`]: crate::DuplexAudioBuilder::on_event
pub type EventCallback = Arc<dyn Fn(AudioEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use duplex_audio::{event_callback, AudioEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(AudioEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Emits `event` if a callback is registered.
pub(crate) fn emit(callback: Option<&EventCallback>, event: AudioEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_event_debug() {
        let event = AudioEvent::CaptureOverflow { dropped: 100 };
        let debug = format!("{:?}", event);
        assert!(debug.contains("CaptureOverflow"));
        assert!(debug.contains("100"));
    }

    #[test]
    fn test_audio_event_clone() {
        let event = AudioEvent::SinkError {
            sink_name: "channel".to_string(),
            error: "closed".to_string(),
        };
        assert_eq!(event.clone(), event);
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        emit(Some(&callback), AudioEvent::PlaybackUnderrun { underruns: 0 });
        assert!(called.load(Ordering::SeqCst));
    }
}

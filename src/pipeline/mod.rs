//! Audio pipeline components.
//!
//! Two paths cross the real-time boundary, each through SPSC frame rings:
//!
//! ```text
//! Input callback → CaptureEngine → FrameRing → Drain Task → FrameSink
//! Decoder → StreamSourceWriter → FrameRing → PlaybackMixer → Output callback
//! ```
//!
//! - **Frame Ring**: Lock-free SPSC queue of fixed-size pipeline frames
//! - **Capture Engine**: Converts native input to pipeline frames
//! - **Drain Task**: Applies the transmit gate and feeds the outbound sink
//! - **Stream Source**: One inbound ring per remote participant
//! - **Playback Mixer**: Sums sources with saturation and converts to native
//!
//! Nothing on the audio-thread side of a ring allocates, locks or blocks.

mod bridge;
mod capture;
mod frame_ring;
mod mixer;
mod stream_source;

pub(crate) use bridge::{spawn_drain, DrainConfig, DrainHandle};
pub(crate) use capture::{CaptureEngine, CaptureShared};
pub use frame_ring::{frame_ring, FrameHeader, FrameReader, FrameWriter, OverflowPolicy};
pub use mixer::{MixerStats, PlaybackMixer};
pub use stream_source::{SourceStats, StreamSource, StreamSourceWriter};

/// Lifecycle of the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CaptureState {
    /// No input device is open.
    #[default]
    Idle = 0,
    /// An input device is being opened.
    Negotiating = 1,
    /// The input callback is producing frames.
    Capturing = 2,
}

impl CaptureState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Negotiating,
            2 => Self::Capturing,
            _ => Self::Idle,
        }
    }
}

/// Lifecycle of the playback side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PlaybackState {
    /// No output device is open.
    #[default]
    Idle = 0,
    /// An output device is being opened.
    Negotiating = 1,
    /// The output callback is pulling mixed audio.
    Playing = 2,
}

impl PlaybackState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Negotiating,
            2 => Self::Playing,
            _ => Self::Idle,
        }
    }
}

//! Outbound destinations for captured audio.
//!
//! A [`FrameSink`] receives every pipeline frame the capture drain forwards,
//! already tagged with its outbound sequence number. In a voice client that
//! is the encoder; [`ChannelSink`] hands frames to a tokio mpsc channel so
//! the encoder can live on its own task.

mod channel;

pub use channel::{ChannelSink, OutboundPolicy};

use crate::{AudioFrame, SinkError};
use async_trait::async_trait;

/// A destination for captured audio frames.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability (`Mutex`, `RwLock`) if needed
/// - All methods are async and run on the tokio runtime, never on an audio thread
/// - `on_start` is called before any audio flows; open resources here
/// - `on_stop` is called during graceful shutdown; close resources here
///
/// # Example
///
/// ```
/// use duplex_audio::{AudioFrame, FrameSink, SinkError};
/// use async_trait::async_trait;
///
/// struct PrintSink;
///
/// #[async_trait]
/// impl FrameSink for PrintSink {
///     fn name(&self) -> &str {
///         "print"
///     }
///
///     async fn write(&self, frame: &AudioFrame) -> Result<(), SinkError> {
///         println!("frame #{}: {} samples", frame.sequence, frame.samples.len());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Called once before frames flow.
    ///
    /// Errors here are fatal and prevent the session from starting.
    ///
    /// Default implementation does nothing.
    async fn on_start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Receives one frame.
    ///
    /// Errors are recoverable: the drain emits an
    /// [`AudioEvent::SinkError`](crate::AudioEvent::SinkError) and continues
    /// with the next frame.
    async fn write(&self, frame: &AudioFrame) -> Result<(), SinkError>;

    /// Called during graceful shutdown, after the last frame.
    ///
    /// Default implementation does nothing.
    async fn on_stop(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

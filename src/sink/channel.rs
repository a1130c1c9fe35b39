//! Tokio mpsc channel sink implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::sink::FrameSink;
use crate::{AudioFrame, SinkError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a [`ChannelSink`] does when its channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundPolicy {
    /// Wait for the receiver to make room.
    ///
    /// The drain task stalls and the capture ring absorbs the backlog; once
    /// that fills, the capture callback drops frames and reports
    /// [`AudioEvent::CaptureOverflow`](crate::AudioEvent::CaptureOverflow).
    /// Size the channel for the encoder's worst-case stall.
    #[default]
    Backpressure,

    /// Drop the frame immediately and report [`SinkError::ChannelFull`].
    ///
    /// The drain never waits, so the capture ring stays empty and the
    /// receiver always gets the freshest audio once it catches up.
    DropWhenFull,
}

/// A sink that forwards captured frames to a tokio mpsc channel.
///
/// This is the usual way to hand microphone audio to an encoder task.
///
/// # Example
///
/// ```
/// use duplex_audio::{AudioFrame, ChannelSink, OutboundPolicy};
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel::<AudioFrame>(64);
/// let sink = ChannelSink::new(tx).with_policy(OutboundPolicy::DropWhenFull);
///
/// // Use sink with the DuplexAudio builder...
/// // Then receive frames:
/// // while let Some(frame) = rx.recv().await { encoder.encode(&frame) }
/// ```
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<AudioFrame>,
    policy: OutboundPolicy,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Creates a channel sink that applies backpressure when full.
    pub fn new(sender: mpsc::Sender<AudioFrame>) -> Self {
        Self::with_name("channel", sender)
    }

    /// Creates a channel sink with a custom name.
    pub fn with_name(name: impl Into<String>, sender: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            name: name.into(),
            sender,
            policy: OutboundPolicy::default(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Sets the full-channel policy.
    #[must_use]
    pub fn with_policy(mut self, policy: OutboundPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The full-channel policy in effect.
    pub fn policy(&self) -> OutboundPolicy {
        self.policy
    }

    /// Frames dropped on a full channel under [`OutboundPolicy::DropWhenFull`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, frame: &AudioFrame) -> Result<(), SinkError> {
        match self.policy {
            OutboundPolicy::Backpressure => self
                .sender
                .send(frame.clone())
                .await
                .map_err(|_| SinkError::ChannelClosed),
            OutboundPolicy::DropWhenFull => match self.sender.try_send(frame.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!(sink = %self.name, sequence = frame.sequence, dropped, "Channel full");
                    Err(SinkError::ChannelFull)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::ChannelClosed),
            },
        }
    }
}

//! # duplex-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time audio I/O core for voice clients.
//!
//! `duplex-audio` captures microphone audio for an encoder, mixes decoded
//! audio from any number of remote participants onto the output device, and
//! keeps both running across hot-plug and default-device changes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use duplex_audio::{ChannelSink, DuplexAudio, FormatPreset, ParticipantId};
//! use tokio::sync::mpsc;
//!
//! // Size the channel for your encoder's worst-case stall
//! let (tx, mut rx) = mpsc::channel(64);
//!
//! let session = DuplexAudio::builder()
//!     .format(FormatPreset::Voice)                // 48kHz mono, 10ms frames
//!     .outbound(ChannelSink::new(tx))
//!     .on_event(|e| tracing::warn!(?e, "audio event"))
//!     .start()
//!     .await?;
//!
//! // Outbound: encode captured frames
//! tokio::spawn(async move {
//!     while let Some(frame) = rx.recv().await {
//!         // opus.encode(&frame.samples) ...
//!     }
//! });
//!
//! // Inbound: one stream source per talking participant
//! let mut alice = session.add_stream_source(ParticipantId::new(12))?;
//! alice.push(&decoded_frame)?;
//!
//! session.stop().await?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Audio threads**: platform callbacks that never block, allocate or log
//! - **Frame rings**: lock-free SPSC queues of fixed-size frames between the
//!   audio threads and everything else
//! - **Tokio runtime**: the drain task feeding the outbound sink, and the
//!   device monitor that owns and reconfigures devices
//!
//! Everything inside the pipeline runs at one [`PipelineFormat`]; devices at
//! other rates or channel counts are converted at the edges.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod backend;
mod builder;
mod config;
mod error;
mod event;
pub mod format;
mod frame;
mod monitor;
mod participant;
pub mod pipeline;
mod session;
mod sink;

pub use builder::{DuplexAudio, DuplexAudioBuilder};
pub use config::{EngineConfig, FormatPreset};
pub use error::{AudioError, SinkError};
pub use event::{event_callback, AudioEvent, EventCallback};
pub use format::{AudioFormat, PipelineFormat};
pub use frame::AudioFrame;
pub use participant::ParticipantId;
pub use pipeline::{CaptureState, PlaybackState, SourceStats, StreamSourceWriter};
pub use session::{AudioSession, SessionStats};
pub use sink::{ChannelSink, FrameSink, OutboundPolicy};

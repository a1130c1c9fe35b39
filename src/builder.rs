//! Builder pattern for `DuplexAudio`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendProvider, CpalProvider, DeviceId};
use crate::format::{AudioFormat, PipelineFormat};
use crate::monitor::{command_channel, DeviceMonitor};
use crate::pipeline::{spawn_drain, CaptureEngine, DrainConfig, PlaybackMixer};
use crate::session::{AudioSession, CaptureHandles};
use crate::sink::FrameSink;
use crate::{event_callback, AudioError, AudioEvent, EngineConfig, EventCallback, FormatPreset};

/// Entry point for starting a duplex audio session.
///
/// Use [`DuplexAudio::builder()`] to configure and start one.
pub struct DuplexAudio;

impl DuplexAudio {
    /// Creates a builder with default settings.
    pub fn builder() -> DuplexAudioBuilder {
        DuplexAudioBuilder::new()
    }
}

/// Builder for configuring and starting a duplex audio session.
///
/// Capture runs when an outbound sink is configured; playback runs unless
/// disabled with [`playback(false)`](Self::playback).
///
/// # Example
///
/// ```ignore
/// use duplex_audio::{ChannelSink, DuplexAudio, FormatPreset};
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel(64);
///
/// let session = DuplexAudio::builder()
///     .format(FormatPreset::Voice)                 // 48kHz mono
///     .outbound(ChannelSink::new(tx))
///     .on_event(|e| tracing::warn!(?e, "audio event"))
///     .start()
///     .await?;
///
/// while let Some(frame) = rx.recv().await {
///     // encode and send
/// }
/// ```
///
/// [`DuplexAudio::builder()`]: crate::DuplexAudio::builder
#[must_use]
pub struct DuplexAudioBuilder {
    provider: Option<Arc<dyn BackendProvider>>,
    format: AudioFormat,
    input_device: Option<DeviceId>,
    output_device: Option<DeviceId>,
    outbound: Option<Arc<dyn FrameSink>>,
    playback: bool,
    transmit: bool,
    event_callback: Option<EventCallback>,
    config: EngineConfig,
}

impl Default for DuplexAudioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexAudioBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            provider: None,
            format: FormatPreset::default().format(),
            input_device: None,
            output_device: None,
            outbound: None,
            playback: true,
            transmit: true,
            event_callback: None,
            config: EngineConfig::default(),
        }
    }

    /// Set the backend provider.
    ///
    /// Default: [`CpalProvider`] (the platform's native audio API).
    pub fn provider<P: BackendProvider + 'static>(mut self, provider: P) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Set the pipeline format preset.
    ///
    /// Default: [`FormatPreset::Voice`] (48kHz mono)
    pub fn format(mut self, preset: FormatPreset) -> Self {
        self.format = preset.format();
        self
    }

    /// Set an explicit pipeline format.
    pub fn custom_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// Capture from a specific device instead of following the default.
    pub fn input_device(mut self, id: impl Into<DeviceId>) -> Self {
        self.input_device = Some(id.into());
        self
    }

    /// Play to a specific device instead of following the default.
    pub fn output_device(mut self, id: impl Into<DeviceId>) -> Self {
        self.output_device = Some(id.into());
        self
    }

    /// Set the sink that receives captured frames, enabling capture.
    pub fn outbound<S: FrameSink + 'static>(mut self, sink: S) -> Self {
        self.outbound = Some(Arc::new(sink));
        self
    }

    /// Enable or disable playback.
    ///
    /// Default: enabled
    pub fn playback(mut self, enabled: bool) -> Self {
        self.playback = enabled;
        self
    }

    /// Initial state of the transmit gate.
    ///
    /// Default: transmitting
    pub fn transmit(mut self, enabled: bool) -> Self {
        self.transmit = enabled;
        self
    }

    /// Set a callback to receive runtime events.
    ///
    /// Events include overflow and underrun reports, device changes and sink
    /// errors.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(AudioEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Set custom engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The pipeline format the session will run at.
    pub fn pipeline_format(&self) -> PipelineFormat {
        PipelineFormat::new(self.format, self.config.frame_duration)
    }

    /// Validates the builder configuration.
    fn validate(&self) -> Result<PipelineFormat, AudioError> {
        let pipeline = self.pipeline_format();
        if !pipeline.is_valid() {
            return Err(AudioError::unsupported(
                "pipeline",
                self.format,
                "format or frame duration yields empty frames",
            ));
        }
        if self.outbound.is_none() && !self.playback {
            return Err(AudioError::invalid_state(
                "neither capture (outbound sink) nor playback is enabled",
            ));
        }
        Ok(pipeline)
    }

    /// Opens the devices and starts the session.
    ///
    /// Device negotiation happens before this returns; later device changes
    /// are handled in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pipeline format is invalid
    /// - Neither capture nor playback is enabled
    /// - The outbound sink fails to start
    /// - A device cannot be resolved or opened
    pub async fn start(self) -> Result<AudioSession, AudioError> {
        let pipeline = self.validate()?;
        let provider = self
            .provider
            .clone()
            .unwrap_or_else(|| Arc::new(CpalProvider::new()));

        if let Some(sink) = &self.outbound {
            sink.on_start().await.map_err(|e| AudioError::SinkStartFailed {
                sink_name: sink.name().to_string(),
                reason: e.to_string(),
            })?;
        }

        let capture = match &self.outbound {
            Some(_) => Some(CaptureEngine::new(pipeline, self.config.capture_ring_frames)?),
            None => None,
        };
        let mixer = if self.playback {
            Some(Arc::new(Mutex::new(PlaybackMixer::new(pipeline, &self.config)?)))
        } else {
            None
        };

        let (engine, reader) = match capture {
            Some((engine, reader)) => (Some(engine), Some(reader)),
            None => (None, None),
        };
        let capture_shared = engine.as_ref().map(|engine| Arc::clone(engine.shared()));

        let mut monitor = DeviceMonitor::new(
            provider,
            pipeline,
            self.config.clone(),
            engine,
            mixer.clone(),
            self.input_device.clone(),
            self.output_device.clone(),
            self.event_callback.clone(),
        );
        if let Err(e) = monitor.start_all() {
            if let Some(sink) = &self.outbound {
                let _ = sink.on_stop().await;
            }
            return Err(e);
        }

        let capture = match (self.outbound, reader, capture_shared) {
            (Some(sink), Some(reader), Some(shared)) => {
                let drain = spawn_drain(
                    reader,
                    sink,
                    Arc::clone(&shared),
                    &DrainConfig {
                        poll_interval: self.config.drain_poll_interval,
                        transmit: self.transmit,
                    },
                    self.event_callback.clone(),
                );
                Some(CaptureHandles { shared, drain })
            }
            _ => None,
        };

        let (commands, command_rx) = command_channel();
        let monitor = tokio::spawn(monitor.run(command_rx, commands.downgrade()));

        tracing::info!(
            %pipeline,
            capture = capture.is_some(),
            playback = mixer.is_some(),
            "Audio session started"
        );

        Ok(AudioSession::new(
            pipeline,
            commands,
            monitor,
            capture,
            mixer,
            self.event_callback,
        ))
    }
}

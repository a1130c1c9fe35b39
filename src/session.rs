//! Running audio session management.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::{DeviceId, Direction};
use crate::event::{emit, AudioEvent, EventCallback};
use crate::format::{AudioFormat, PipelineFormat};
use crate::monitor::MonitorCommand;
use crate::pipeline::{
    CaptureShared, CaptureState, DrainHandle, PlaybackMixer, PlaybackState, SourceStats,
    StreamSourceWriter,
};
use crate::{AudioError, ParticipantId};

/// Statistics about a running session.
///
/// Overflows and underruns are reported here and through
/// [`AudioEvent`](crate::AudioEvent)s; they are never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Pipeline frames written into the capture ring.
    pub frames_captured: u64,
    /// Captured frames dropped because the capture ring was full.
    pub frames_dropped: u64,
    /// Frames delivered to the outbound sink.
    pub frames_sent: u64,
    /// Frames discarded while transmit was disabled.
    pub frames_gated: u64,
    /// Frames the outbound sink rejected.
    pub sink_errors: u64,
    /// Input callbacks served.
    pub capture_callbacks: u64,
    /// Pipeline frames mixed for playback.
    pub frames_mixed: u64,
    /// Output callbacks served.
    pub playback_callbacks: u64,
    /// Mix cycles in which a stream source had no frame ready.
    pub playback_underruns: u64,
    /// Registered stream sources.
    pub sources: usize,
}

/// Capture-side pieces of a session.
pub(crate) struct CaptureHandles {
    pub shared: Arc<CaptureShared>,
    pub drain: DrainHandle,
}

/// Handle to a running duplex audio session.
///
/// Returned by [`DuplexAudioBuilder::start()`]. Devices are owned by a
/// background monitor task that follows hot-plug and default-device changes
/// until [`stop()`](AudioSession::stop) is called or the session is dropped.
///
/// # Example
///
/// ```ignore
/// let session = DuplexAudio::builder()
///     .outbound(ChannelSink::new(encoder_tx))
///     .start()
///     .await?;
///
/// // Decoded audio for participant 7
/// let mut writer = session.add_stream_source(ParticipantId::new(7))?;
/// writer.push(&decoded_frame)?;
///
/// session.set_transmit(true);
/// // ...
/// session.stop().await?;
/// ```
///
/// [`DuplexAudioBuilder::start()`]: crate::DuplexAudioBuilder::start
pub struct AudioSession {
    pipeline: PipelineFormat,
    commands: mpsc::Sender<MonitorCommand>,
    monitor: Option<JoinHandle<()>>,
    capture: Option<CaptureHandles>,
    mixer: Option<Arc<Mutex<PlaybackMixer>>>,
    event_callback: Option<EventCallback>,
    running: bool,
}

impl AudioSession {
    pub(crate) fn new(
        pipeline: PipelineFormat,
        commands: mpsc::Sender<MonitorCommand>,
        monitor: JoinHandle<()>,
        capture: Option<CaptureHandles>,
        mixer: Option<Arc<Mutex<PlaybackMixer>>>,
        event_callback: Option<EventCallback>,
    ) -> Self {
        Self {
            pipeline,
            commands,
            monitor: Some(monitor),
            capture,
            mixer,
            event_callback,
            running: true,
        }
    }

    /// The session's pipeline format.
    pub fn pipeline_format(&self) -> PipelineFormat {
        self.pipeline
    }

    /// Returns `true` until [`stop()`](Self::stop) runs.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn mixer(&self) -> Result<&Arc<Mutex<PlaybackMixer>>, AudioError> {
        self.mixer
            .as_ref()
            .ok_or_else(|| AudioError::invalid_state("playback is disabled for this session"))
    }

    /// Registers a remote participant and returns the writer the decode
    /// stage pushes its audio into.
    ///
    /// # Errors
    ///
    /// `DuplicateSource` if the participant is already registered,
    /// `TooManySources` if the mixer is full, `InvalidState` if playback is
    /// disabled.
    pub fn add_stream_source(&self, participant: ParticipantId) -> Result<StreamSourceWriter, AudioError> {
        let writer = self.mixer()?.lock().add_source(participant)?;
        emit(
            self.event_callback.as_ref(),
            AudioEvent::SourceAdded { participant },
        );
        Ok(writer)
    }

    /// Removes a participant's stream (e.g. on disconnect).
    ///
    /// Returns `false` if the participant was not registered.
    pub fn remove_stream_source(&self, participant: ParticipantId) -> bool {
        self.mixer
            .as_ref()
            .is_some_and(|mixer| mixer.lock().remove_source(participant))
    }

    /// Number of registered stream sources.
    pub fn source_count(&self) -> usize {
        self.mixer.as_ref().map_or(0, |mixer| mixer.lock().source_count())
    }

    /// Per-participant counters.
    pub fn source_stats(&self) -> Vec<SourceStats> {
        self.mixer
            .as_ref()
            .map_or_else(Vec::new, |mixer| mixer.lock().source_stats())
    }

    /// Enables or disables sending captured audio (push-to-talk, VAD).
    ///
    /// Capture keeps running while disabled; frames are discarded.
    pub fn set_transmit(&self, enabled: bool) {
        if let Some(capture) = &self.capture {
            capture.drain.set_transmit(enabled);
        }
    }

    /// Returns `true` if captured audio is being sent.
    pub fn is_transmitting(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|capture| capture.drain.is_transmitting())
    }

    /// Silences playback while still consuming every stream source.
    pub fn set_deafened(&self, deafened: bool) {
        if let Some(mixer) = &self.mixer {
            mixer.lock().set_deafened(deafened);
        }
    }

    /// Returns `true` if playback is deafened.
    pub fn is_deafened(&self) -> bool {
        self.mixer.as_ref().is_some_and(|mixer| mixer.lock().is_deafened())
    }

    /// Current capture state.
    pub fn capture_state(&self) -> CaptureState {
        self.capture
            .as_ref()
            .map_or(CaptureState::Idle, |capture| capture.shared.state())
    }

    /// Current playback state.
    pub fn playback_state(&self) -> PlaybackState {
        self.mixer
            .as_ref()
            .map_or(PlaybackState::Idle, |mixer| mixer.lock().state())
    }

    /// Switches capture to `device`.
    ///
    /// The session stays on the device until it disappears; it does not
    /// follow default-device changes. Returns the negotiated native format.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` if the device is unknown (the current device is
    /// kept), or the last open error after retries are exhausted.
    pub async fn select_input(&self, device: impl Into<DeviceId>) -> Result<AudioFormat, AudioError> {
        self.select(Direction::Input, Some(device.into())).await
    }

    /// Switches playback to `device`. See [`select_input`](Self::select_input).
    pub async fn select_output(&self, device: impl Into<DeviceId>) -> Result<AudioFormat, AudioError> {
        self.select(Direction::Output, Some(device.into())).await
    }

    /// Returns capture to the platform default and follows it from now on.
    pub async fn use_default_input(&self) -> Result<AudioFormat, AudioError> {
        self.select(Direction::Input, None).await
    }

    /// Returns playback to the platform default and follows it from now on.
    pub async fn use_default_output(&self) -> Result<AudioFormat, AudioError> {
        self.select(Direction::Output, None).await
    }

    async fn select(&self, direction: Direction, device: Option<DeviceId>) -> Result<AudioFormat, AudioError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Select {
                direction,
                device,
                reply,
            })
            .await
            .map_err(|_| AudioError::SessionClosed)?;
        response.await.map_err(|_| AudioError::SessionClosed)?
    }

    /// Tells the monitor the device list changed and waits until it has
    /// re-checked every device.
    ///
    /// For platforms whose backend cannot push notifications; the monitor
    /// also polls on its own.
    pub async fn notify_devices_changed(&self) -> Result<(), AudioError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(MonitorCommand::DevicesChanged { ack: Some(ack) })
            .await
            .map_err(|_| AudioError::SessionClosed)?;
        done.await.map_err(|_| AudioError::SessionClosed)
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();

        if let Some(capture) = &self.capture {
            stats.frames_captured = capture.shared.frames_captured();
            stats.frames_dropped = capture.shared.frames_dropped();
            stats.capture_callbacks = capture.shared.callbacks();
            stats.frames_sent = capture.drain.frames_sent();
            stats.frames_gated = capture.drain.frames_gated();
            stats.sink_errors = capture.drain.sink_errors();
        }

        if let Some(mixer) = &self.mixer {
            let mixer = mixer.lock();
            let shared = mixer.shared();
            stats.frames_mixed = shared.cycles();
            stats.playback_callbacks = shared.callbacks();
            stats.playback_underruns = shared.underruns();
            stats.sources = mixer.source_count();
        }

        stats
    }

    /// Gracefully stops the session.
    ///
    /// This will:
    /// 1. Stop both devices (no callback runs after this step)
    /// 2. Drain captured frames still queued to the outbound sink
    /// 3. Call `on_stop()` on the sink
    /// 4. Wait for background tasks to complete
    pub async fn stop(mut self) -> Result<(), AudioError> {
        self.stop_internal().await
    }

    async fn stop_internal(&mut self) -> Result<(), AudioError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        let (ack, done) = oneshot::channel();
        if self.commands.send(MonitorCommand::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }

        if let Some(capture) = self.capture.as_mut() {
            capture.drain.shutdown().await;
        }

        tracing::info!("Audio session stopped");
        Ok(())
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        if self.running {
            // Dropped without stop(); the monitor stops devices on its own
            self.running = false;
            let (ack, _) = oneshot::channel();
            let _ = self.commands.try_send(MonitorCommand::Stop { ack });
        }
    }
}

//! Device monitor - the control task that owns the open devices.
//!
//! Every backend instance lives here, so device (re)configuration only ever
//! happens on this task. It reacts to:
//! - Selection requests from the session
//! - Device-list notifications pushed by the provider
//! - A periodic poll of the device list and backend status codes
//!
//! Each pass checks whether the active input and output devices are still
//! valid (present, healthy, still the default when following the default).
//! An invalid device is stopped and replaced, with bounded exponential
//! backoff; the capture ring and every stream source survive the swap.
//!
//! The same tick runs the mixer's housekeeping: reaping silent sources,
//! freeing removed ones and reporting underruns.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    default_device, AudioBackend, BackendProvider, BackendStatus, DeviceDescriptor, DeviceId,
    Direction,
};
use crate::config::EngineConfig;
use crate::event::{emit, AudioEvent, EventCallback};
use crate::format::{AudioFormat, PipelineFormat};
use crate::pipeline::{CaptureEngine, PlaybackMixer};
use crate::AudioError;

/// Commands queued between the session and the monitor.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Request handled by the monitor task.
pub(crate) enum MonitorCommand {
    /// Switch a direction to `device`, or back to the platform default.
    Select {
        direction: Direction,
        device: Option<DeviceId>,
        reply: oneshot::Sender<Result<AudioFormat, AudioError>>,
    },
    /// Re-check devices now.
    DevicesChanged { ack: Option<oneshot::Sender<()>> },
    /// Stop every device and exit.
    Stop { ack: oneshot::Sender<()> },
}

/// Why an active device must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
    Lost,
    DefaultChanged,
    Fatal,
}

struct ActiveDevice {
    backend: Box<dyn AudioBackend>,
    device: DeviceDescriptor,
    native: AudioFormat,
}

/// Per-direction device state.
struct DeviceSlot {
    /// Explicit user selection; `None` follows the platform default.
    selection: Option<DeviceId>,
    active: Option<ActiveDevice>,
    /// Reopen attempts were exhausted; retried on the next device change.
    unavailable: bool,
}

impl DeviceSlot {
    fn new(selection: Option<DeviceId>) -> Self {
        Self {
            selection,
            active: None,
            unavailable: false,
        }
    }
}

/// State owned by the monitor task.
pub(crate) struct DeviceMonitor {
    provider: Arc<dyn BackendProvider>,
    pipeline: PipelineFormat,
    config: EngineConfig,
    capture: Option<CaptureEngine>,
    mixer: Option<Arc<Mutex<PlaybackMixer>>>,
    input: DeviceSlot,
    output: DeviceSlot,
    event_callback: Option<EventCallback>,
    known_devices: Vec<DeviceId>,
    reported_underruns: u64,
}

impl DeviceMonitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Arc<dyn BackendProvider>,
        pipeline: PipelineFormat,
        config: EngineConfig,
        capture: Option<CaptureEngine>,
        mixer: Option<Arc<Mutex<PlaybackMixer>>>,
        input_selection: Option<DeviceId>,
        output_selection: Option<DeviceId>,
        event_callback: Option<EventCallback>,
    ) -> Self {
        Self {
            provider,
            pipeline,
            config,
            capture,
            mixer,
            input: DeviceSlot::new(input_selection),
            output: DeviceSlot::new(output_selection),
            event_callback,
            known_devices: Vec::new(),
            reported_underruns: 0,
        }
    }

    fn serves(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.capture.is_some(),
            Direction::Output => self.mixer.is_some(),
        }
    }

    fn slot(&self, direction: Direction) -> &DeviceSlot {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut DeviceSlot {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    fn emit(&self, event: AudioEvent) {
        emit(self.event_callback.as_ref(), event);
    }

    /// Opens every served direction once. Used at session start.
    pub(crate) fn start_all(&mut self) -> Result<(), AudioError> {
        let devices = self.provider.enumerate_devices()?;
        self.known_devices = devices.iter().map(|d| d.id.clone()).collect();

        for direction in [Direction::Input, Direction::Output] {
            if self.serves(direction) {
                if let Err(e) = self.open(direction, &devices) {
                    self.stop_all();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Picks the device `direction` should use from `devices`.
    fn resolve<'a>(
        &self,
        direction: Direction,
        devices: &'a [DeviceDescriptor],
    ) -> Result<&'a DeviceDescriptor, AudioError> {
        match &self.slot(direction).selection {
            Some(id) => devices
                .iter()
                .find(|d| &d.id == id && d.supports(direction))
                .ok_or_else(|| AudioError::DeviceNotFound { id: id.clone() }),
            None => default_device(devices, direction)
                .ok_or(AudioError::NoDefaultDevice { direction }),
        }
    }

    /// Single attempt: opens the resolved device and starts its engine.
    fn open(&mut self, direction: Direction, devices: &[DeviceDescriptor]) -> Result<AudioFormat, AudioError> {
        let device = self.resolve(direction, devices)?.clone();
        self.begin_negotiation(direction);

        let mut backend = self.provider.create_backend();
        let started = backend
            .open(&device, direction, self.pipeline.format)
            .and_then(|native| {
                self.start_engine(direction, backend.as_mut(), native)?;
                Ok(native)
            });

        let native = match started {
            Ok(native) => native,
            Err(e) => {
                backend.stop();
                self.mark_idle(direction);
                return Err(e);
            }
        };

        tracing::info!(
            %direction,
            device = %device.id,
            backend = backend.name(),
            %native,
            pipeline = %self.pipeline,
            "Device opened"
        );
        self.emit(AudioEvent::FormatNegotiated {
            direction,
            device: device.id.clone(),
            native,
        });

        let slot = self.slot_mut(direction);
        slot.active = Some(ActiveDevice {
            backend,
            device,
            native,
        });
        slot.unavailable = false;
        Ok(native)
    }

    fn start_engine(
        &self,
        direction: Direction,
        backend: &mut dyn AudioBackend,
        native: AudioFormat,
    ) -> Result<(), AudioError> {
        match direction {
            Direction::Input => match &self.capture {
                Some(capture) => capture.start(backend, native),
                None => Err(AudioError::invalid_state("capture is disabled")),
            },
            Direction::Output => match &self.mixer {
                Some(mixer) => mixer.lock().start(backend, native),
                None => Err(AudioError::invalid_state("playback is disabled")),
            },
        }
    }

    fn begin_negotiation(&self, direction: Direction) {
        match direction {
            Direction::Input => {
                if let Some(capture) = &self.capture {
                    capture.begin_negotiation();
                }
            }
            Direction::Output => {
                if let Some(mixer) = &self.mixer {
                    mixer.lock().begin_negotiation();
                }
            }
        }
    }

    fn mark_idle(&self, direction: Direction) {
        match direction {
            Direction::Input => {
                if let Some(capture) = &self.capture {
                    capture.mark_idle();
                }
            }
            Direction::Output => {
                if let Some(mixer) = &self.mixer {
                    mixer.lock().mark_idle();
                }
            }
        }
    }

    /// Stops the active device for `direction`, if any.
    fn close(&mut self, direction: Direction) {
        let Some(mut active) = self.slot_mut(direction).active.take() else {
            return;
        };

        match direction {
            Direction::Input => match &self.capture {
                Some(capture) => capture.stop(active.backend.as_mut()),
                None => active.backend.stop(),
            },
            Direction::Output => match &self.mixer {
                Some(mixer) => mixer.lock().stop(active.backend.as_mut()),
                None => active.backend.stop(),
            },
        }
        tracing::debug!(%direction, device = %active.device.id, native = %active.native, "Device closed");
    }

    fn stop_all(&mut self) {
        self.close(Direction::Input);
        self.close(Direction::Output);
    }

    /// Replaces the device for `direction`, retrying with exponential backoff.
    ///
    /// On exhaustion the direction is left idle and `AudioUnavailable` is
    /// emitted.
    async fn reopen(&mut self, direction: Direction) -> Result<AudioFormat, AudioError> {
        self.close(direction);

        let attempts = self.config.reopen_attempts.max(1);
        let mut backoff = self.config.reopen_backoff;
        let mut last_error = AudioError::invalid_state("no reopen attempt made");

        for attempt in 1..=attempts {
            let result = match self.provider.enumerate_devices() {
                Ok(devices) => {
                    self.known_devices = devices.iter().map(|d| d.id.clone()).collect();
                    self.open(direction, &devices)
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(native) => {
                    if let Some(active) = &self.slot(direction).active {
                        tracing::info!(%direction, device = %active.device.id, attempt, "Device restarted");
                        self.emit(AudioEvent::DeviceRestarted {
                            direction,
                            device: active.device.id.clone(),
                            native,
                        });
                    }
                    return Ok(native);
                }
                Err(e) if !e.is_recoverable() => {
                    last_error = e;
                    break;
                }
                Err(e) => {
                    tracing::warn!(%direction, attempt, error = %e, "Reopen attempt failed");
                    self.emit(AudioEvent::ReopenFailed {
                        direction,
                        attempt,
                        error: e.to_string(),
                    });
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        self.give_up(direction, last_error.to_string());
        Err(last_error)
    }

    fn give_up(&mut self, direction: Direction, reason: String) {
        self.close(direction);
        self.mark_idle(direction);
        self.slot_mut(direction).unavailable = true;
        tracing::error!(%direction, %reason, "Audio unavailable");
        self.emit(AudioEvent::AudioUnavailable { direction, reason });
    }

    /// A fatal backend takes the whole engine down, not only the side that
    /// reported it.
    fn give_up_all(&mut self, reason: String) {
        for direction in [Direction::Input, Direction::Output] {
            if self.serves(direction) {
                self.give_up(direction, reason.clone());
            }
        }
    }

    /// Decides whether the active device for `direction` must be replaced.
    fn check(&self, direction: Direction, devices: &[DeviceDescriptor]) -> Option<Invalidation> {
        let slot = self.slot(direction);
        let active = slot.active.as_ref()?;

        match active.backend.status() {
            BackendStatus::Fatal => return Some(Invalidation::Fatal),
            BackendStatus::DeviceLost => return Some(Invalidation::Lost),
            BackendStatus::Ok => {}
        }

        if !devices.iter().any(|d| d.id == active.device.id) {
            return Some(Invalidation::Lost);
        }

        if slot.selection.is_none() {
            if let Some(default) = default_device(devices, direction) {
                if default.id != active.device.id {
                    return Some(Invalidation::DefaultChanged);
                }
            }
        }
        None
    }

    /// One validation pass over both directions.
    ///
    /// `explicit` is set for change notifications; idle directions are then
    /// retried even if the device list looks the same.
    async fn refresh(&mut self, explicit: bool) {
        let devices = match self.provider.enumerate_devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(error = %e, "Device enumeration failed");
                return;
            }
        };
        let ids: Vec<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
        let list_changed = ids != self.known_devices;
        self.known_devices = ids;

        for direction in [Direction::Input, Direction::Output] {
            if !self.serves(direction) {
                continue;
            }

            let verdict = self.check(direction, &devices);
            match verdict {
                Some(Invalidation::Fatal) => {
                    let name = self.slot(direction).active.as_ref().map(|a| a.backend.name()).unwrap_or("backend");
                    let error = AudioError::BackendFatal {
                        reason: format!("{name} backend reported a fatal error on {direction}"),
                    };
                    self.give_up_all(error.to_string());
                    return;
                }
                Some(Invalidation::Lost) => {
                    if let Some(active) = &self.slot(direction).active {
                        tracing::warn!(%direction, device = %active.device.id, "Device lost");
                        self.emit(AudioEvent::DeviceLost {
                            direction,
                            device: active.device.id.clone(),
                        });
                    }
                    let _ = self.reopen(direction).await;
                }
                Some(Invalidation::DefaultChanged) => {
                    tracing::info!(%direction, "Default device changed, following");
                    let _ = self.reopen(direction).await;
                }
                None => {
                    let slot = self.slot(direction);
                    if slot.active.is_none() && slot.unavailable && (explicit || list_changed) {
                        tracing::info!(%direction, "Retrying unavailable device");
                        let _ = self.reopen(direction).await;
                    }
                }
            }
        }
    }

    /// Handles a selection request.
    async fn select(&mut self, direction: Direction, device: Option<DeviceId>) -> Result<AudioFormat, AudioError> {
        if !self.serves(direction) {
            return Err(AudioError::invalid_state(format!("{direction} is disabled for this session")));
        }

        // Validate before touching the running device
        let devices = self.provider.enumerate_devices()?;
        if let Some(id) = &device {
            if !devices.iter().any(|d| &d.id == id && d.supports(direction)) {
                return Err(AudioError::DeviceNotFound { id: id.clone() });
            }
        }

        tracing::info!(%direction, device = ?device.as_ref().map(DeviceId::as_str), "Selecting device");
        self.slot_mut(direction).selection = device;
        self.reopen(direction).await
    }

    /// Mixer housekeeping: expiry, garbage and underrun reporting.
    fn maintain(&mut self) {
        let Some(mixer) = &self.mixer else {
            return;
        };

        let (expired, underruns) = {
            let mut mixer = mixer.lock();
            let expired = mixer.reap_silent(self.config.source_silence_timeout);
            mixer.maintain();
            (expired, mixer.stats().underruns)
        };

        for participant in expired {
            self.emit(AudioEvent::SourceExpired { participant });
        }

        if underruns > self.reported_underruns {
            let delta = underruns - self.reported_underruns;
            self.reported_underruns = underruns;
            tracing::trace!(underruns = delta, "Playback underruns");
            self.emit(AudioEvent::PlaybackUnderrun { underruns: delta });
        }
    }

    /// Runs the monitor until `Stop` arrives or every sender is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<MonitorCommand>,
        notify: mpsc::WeakSender<MonitorCommand>,
    ) {
        self.provider.subscribe(Arc::new(move || {
            if let Some(tx) = notify.upgrade() {
                let _ = tx.try_send(MonitorCommand::DevicesChanged { ack: None });
            }
        }));

        let mut interval = tokio::time::interval(self.config.device_poll_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Select { direction, device, reply }) => {
                        let result = self.select(direction, device).await;
                        let _ = reply.send(result);
                    }
                    Some(MonitorCommand::DevicesChanged { ack }) => {
                        self.refresh(true).await;
                        self.maintain();
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    Some(MonitorCommand::Stop { ack }) => {
                        self.stop_all();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.refresh(false).await;
                    self.maintain();
                }
            }
        }

        tracing::debug!("Device monitor stopped");
    }
}

/// Creates the command channel for a monitor.
pub(crate) fn command_channel() -> (mpsc::Sender<MonitorCommand>, mpsc::Receiver<MonitorCommand>) {
    mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockProvider, MOCK_MICROPHONE, MOCK_SPEAKERS};
    use crate::participant::ParticipantId;
    use crate::pipeline::{CaptureState, PlaybackState};

    fn pipeline() -> PipelineFormat {
        PipelineFormat::new(AudioFormat::mono(48000), Duration::from_millis(10))
    }

    fn config() -> EngineConfig {
        EngineConfig {
            reopen_attempts: 3,
            reopen_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn monitor(provider: &MockProvider) -> (DeviceMonitor, Arc<Mutex<PlaybackMixer>>) {
        let (capture, _reader) = CaptureEngine::new(pipeline(), 8).unwrap();
        let mixer = Arc::new(Mutex::new(PlaybackMixer::new(pipeline(), &config()).unwrap()));
        let monitor = DeviceMonitor::new(
            Arc::new(provider.clone()),
            pipeline(),
            config(),
            Some(capture),
            Some(Arc::clone(&mixer)),
            None,
            None,
            None,
        );
        (monitor, mixer)
    }

    #[test]
    fn test_start_opens_defaults() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        assert_eq!(
            provider.device(MOCK_MICROPHONE).negotiated_format(),
            Some(AudioFormat::mono(48000))
        );
        // Speakers are stereo but mono was requested
        assert_eq!(
            provider.device(MOCK_SPEAKERS).negotiated_format(),
            Some(AudioFormat::mono(48000))
        );
        assert_eq!(monitor.capture.as_ref().unwrap().shared().state(), CaptureState::Capturing);
        assert_eq!(mixer.lock().state(), PlaybackState::Playing);
    }

    #[test]
    fn test_start_without_devices_fails() {
        let provider = MockProvider::new();
        let (mut monitor, _mixer) = monitor(&provider);
        assert!(matches!(
            monitor.start_all(),
            Err(AudioError::NoDefaultDevice { direction: Direction::Input })
        ));
    }

    #[tokio::test]
    async fn test_lost_device_falls_over_to_new_default() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, mixer) = monitor(&provider);
        monitor.start_all().unwrap();
        let writer = mixer.lock().add_source(ParticipantId::new(7)).unwrap();

        let mut headset = MockProvider::output_descriptor("headset", "Headset", &[44100], 2);
        headset.is_default_output = true;
        provider.add_device(headset);
        provider.remove_device(&DeviceId::from(MOCK_SPEAKERS));

        monitor.refresh(true).await;

        assert_eq!(
            provider.device("headset").negotiated_format(),
            Some(AudioFormat::mono(44100))
        );
        assert!(!writer.is_closed());
        assert!(mixer.lock().contains(ParticipantId::new(7)));
        assert_eq!(mixer.lock().state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_follows_default_change() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, _mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        provider.add_device(MockProvider::input_descriptor("usb-mic", "USB Mic", &[16000, 48000], 1));
        provider.set_default_input(&DeviceId::from("usb-mic"));
        monitor.refresh(true).await;

        assert!(provider.device("usb-mic").is_active());
        assert!(!provider.device(MOCK_MICROPHONE).is_active());
    }

    #[tokio::test]
    async fn test_explicit_selection_is_not_overridden_by_default() {
        let provider = MockProvider::with_default_devices();
        provider.add_device(MockProvider::input_descriptor("usb-mic", "USB Mic", &[48000], 1));
        let (mut monitor, _mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        monitor
            .select(Direction::Input, Some(DeviceId::from("usb-mic")))
            .await
            .unwrap();
        assert!(provider.device("usb-mic").is_active());

        monitor.refresh(true).await;
        assert!(provider.device("usb-mic").is_active());
        assert!(!provider.device(MOCK_MICROPHONE).is_active());
    }

    #[tokio::test]
    async fn test_select_unknown_device_keeps_current() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, _mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        let result = monitor.select(Direction::Input, Some(DeviceId::from("nope"))).await;
        assert!(matches!(result, Err(AudioError::DeviceNotFound { .. })));
        assert!(provider.device(MOCK_MICROPHONE).is_active());
    }

    #[tokio::test]
    async fn test_reopen_retries_then_gives_up() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, _mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        provider.fail_next_opens(10);
        provider.device(MOCK_MICROPHONE).fail(BackendStatus::DeviceLost);
        monitor.refresh(false).await;

        assert!(monitor.input.unavailable);
        assert!(monitor.input.active.is_none());
        assert_eq!(monitor.capture.as_ref().unwrap().shared().state(), CaptureState::Idle);

        // A later change notification retries
        provider.fail_next_opens(0);
        monitor.refresh(true).await;
        assert!(provider.device(MOCK_MICROPHONE).is_active());
        assert!(!monitor.input.unavailable);
    }

    #[tokio::test]
    async fn test_reopen_succeeds_within_attempts() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, _mixer) = monitor(&provider);
        monitor.start_all().unwrap();
        let opens = provider.open_count();

        provider.fail_next_opens(2);
        provider.device(MOCK_MICROPHONE).fail(BackendStatus::DeviceLost);
        monitor.refresh(false).await;

        assert!(provider.device(MOCK_MICROPHONE).is_active());
        assert_eq!(provider.open_count(), opens + 1);
    }

    #[tokio::test]
    async fn test_fatal_status_goes_idle_without_retry() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, mixer) = monitor(&provider);
        monitor.start_all().unwrap();
        let opens = provider.open_count();

        provider.device(MOCK_SPEAKERS).fail(BackendStatus::Fatal);
        monitor.refresh(false).await;

        assert_eq!(provider.open_count(), opens);
        assert_eq!(mixer.lock().state(), PlaybackState::Idle);
        assert!(monitor.output.unavailable);

        // The healthy input goes down with it
        let capture = monitor.capture.as_ref().unwrap();
        assert_eq!(capture.shared().state(), CaptureState::Idle);
        assert!(monitor.input.unavailable);
        assert!(monitor.input.active.is_none());
        assert!(!provider.device(MOCK_MICROPHONE).is_active());
    }

    #[tokio::test]
    async fn test_fatal_status_on_input_stops_output() {
        let provider = MockProvider::with_default_devices();
        let (mut monitor, mixer) = monitor(&provider);
        monitor.start_all().unwrap();

        provider.device(MOCK_MICROPHONE).fail(BackendStatus::Fatal);
        monitor.refresh(false).await;

        assert_eq!(mixer.lock().state(), PlaybackState::Idle);
        assert!(!provider.device(MOCK_SPEAKERS).is_active());
        assert!(monitor.input.unavailable && monitor.output.unavailable);
    }
}

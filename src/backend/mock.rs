//! Hardware-free backend for tests and CI.
//!
//! The caller plays the part of the operating system: it decides which
//! devices exist, feeds capture callbacks with [`MockDevice::push_input`],
//! pulls rendered audio with [`MockDevice::render`] and unplugs devices with
//! [`MockProvider::remove_device`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    negotiate_format, AudioBackend, BackendProvider, BackendStatus, CallbackSlot,
    DeviceDescriptor, DeviceId, DeviceNotifier, Direction, InputCallback, OutputCallback,
    StatusCell, StreamCaps,
};
use crate::error::AudioError;
use crate::format::AudioFormat;

/// Id of the default input created by [`MockProvider::with_default_devices`].
pub const MOCK_MICROPHONE: &str = "mock-microphone";
/// Id of the default output created by [`MockProvider::with_default_devices`].
pub const MOCK_SPEAKERS: &str = "mock-speakers";

/// One open device session.
struct MockStream {
    device: DeviceId,
    direction: Direction,
    format: AudioFormat,
    capture: CallbackSlot<dyn FnMut(&[i16]) + Send>,
    playback: CallbackSlot<dyn FnMut(&mut [i16]) + Send>,
    status: StatusCell,
    stopped: AtomicBool,
}

impl MockStream {
    fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    fn invocations(&self) -> u64 {
        self.capture.invocations() + self.playback.invocations()
    }
}

#[derive(Default)]
struct MockHost {
    devices: Mutex<Vec<DeviceDescriptor>>,
    /// Open sessions only; stopped ones are retired into `retired`.
    streams: Mutex<Vec<Arc<MockStream>>>,
    /// Callback invocations of stopped sessions, per device.
    retired: Mutex<HashMap<DeviceId, u64>>,
    notifiers: Mutex<Vec<DeviceNotifier>>,
    failing_opens: AtomicU32,
    opens: AtomicU32,
}

impl MockHost {
    fn notify(&self) {
        let notifiers = self.notifiers.lock().clone();
        for notifier in notifiers {
            notifier();
        }
    }

    /// Drops a stopped session, keeping its invocation count.
    fn retire(&self, stream: &Arc<MockStream>) {
        let mut streams = self.streams.lock();
        streams.retain(|s| !Arc::ptr_eq(s, stream));
        *self.retired.lock().entry(stream.device.clone()).or_default() += stream.invocations();
    }

    fn invocations(&self, device: &DeviceId) -> u64 {
        let streams = self.streams.lock();
        let live: u64 = streams
            .iter()
            .filter(|s| &s.device == device)
            .map(|s| s.invocations())
            .sum();
        live + self.retired.lock().get(device).copied().unwrap_or(0)
    }

    fn active_stream(&self, device: &DeviceId, direction: Direction) -> Option<Arc<MockStream>> {
        self.streams
            .lock()
            .iter()
            .rev()
            .find(|s| &s.device == device && s.direction == direction && s.is_active())
            .cloned()
    }
}

/// Provider of [`MockBackend`]s over a caller-controlled device list.
///
/// Cloning shares the device list, so a test can keep a handle after moving
/// a clone into the session builder.
///
/// # Example
///
/// ```
/// use duplex_audio::backend::{BackendProvider, MockProvider};
///
/// let provider = MockProvider::with_default_devices();
/// let devices = provider.enumerate_devices().unwrap();
/// assert_eq!(devices.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct MockProvider {
    host: Arc<MockHost>,
}

impl MockProvider {
    /// Creates a provider with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider with a 48kHz mono default microphone and a 48kHz
    /// stereo default speaker.
    pub fn with_default_devices() -> Self {
        let provider = Self::new();
        {
            let mut devices = provider.host.devices.lock();
            let mut mic = Self::input_descriptor(MOCK_MICROPHONE, "Mock Microphone", &[48000], 1);
            mic.is_default_input = true;
            let mut speakers =
                Self::output_descriptor(MOCK_SPEAKERS, "Mock Speakers", &[48000], 2);
            speakers.is_default_output = true;
            devices.push(mic);
            devices.push(speakers);
        }
        provider
    }

    /// Builds a descriptor for a capture-only device.
    pub fn input_descriptor(
        id: &str,
        name: &str,
        sample_rates: &[u32],
        channels: u16,
    ) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id),
            name: name.to_string(),
            input: StreamCaps::up_to(sample_rates, channels),
            output: StreamCaps::default(),
            is_default_input: false,
            is_default_output: false,
        }
    }

    /// Builds a descriptor for a playback-only device.
    pub fn output_descriptor(
        id: &str,
        name: &str,
        sample_rates: &[u32],
        channels: u16,
    ) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id),
            name: name.to_string(),
            input: StreamCaps::default(),
            output: StreamCaps::up_to(sample_rates, channels),
            is_default_input: false,
            is_default_output: false,
        }
    }

    /// Plugs in a device and notifies subscribers.
    pub fn add_device(&self, device: DeviceDescriptor) {
        {
            let mut devices = self.host.devices.lock();
            devices.retain(|d| d.id != device.id);
            devices.push(device);
        }
        self.host.notify();
    }

    /// Unplugs a device: open sessions on it report `DeviceLost` and
    /// subscribers are notified.
    pub fn remove_device(&self, id: &DeviceId) {
        self.host.devices.lock().retain(|d| &d.id != id);
        for stream in self.host.streams.lock().iter() {
            if &stream.device == id {
                stream.status.record(BackendStatus::DeviceLost);
            }
        }
        self.host.notify();
    }

    /// Makes `id` the default input and notifies subscribers.
    pub fn set_default_input(&self, id: &DeviceId) {
        self.set_default(id, Direction::Input);
    }

    /// Makes `id` the default output and notifies subscribers.
    pub fn set_default_output(&self, id: &DeviceId) {
        self.set_default(id, Direction::Output);
    }

    fn set_default(&self, id: &DeviceId, direction: Direction) {
        for device in self.host.devices.lock().iter_mut() {
            let is_target = &device.id == id;
            match direction {
                Direction::Input => device.is_default_input = is_target,
                Direction::Output => device.is_default_output = is_target,
            }
        }
        self.host.notify();
    }

    /// Makes the next `count` calls to `open` fail with a backend error.
    pub fn fail_next_opens(&self, count: u32) {
        self.host.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Total successful `open` calls across all backends.
    pub fn open_count(&self) -> u32 {
        self.host.opens.load(Ordering::SeqCst)
    }

    /// Returns a handle acting as the OS side of device `id`.
    pub fn device(&self, id: impl Into<DeviceId>) -> MockDevice {
        MockDevice {
            host: Arc::clone(&self.host),
            id: id.into(),
        }
    }
}

impl BackendProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self.host.devices.lock().clone())
    }

    fn create_backend(&self) -> Box<dyn AudioBackend> {
        Box::new(MockBackend {
            host: Arc::clone(&self.host),
            stream: None,
        })
    }

    fn subscribe(&self, notifier: DeviceNotifier) {
        self.host.notifiers.lock().push(notifier);
    }
}

/// A [`MockProvider`] device session.
pub struct MockBackend {
    host: Arc<MockHost>,
    stream: Option<Arc<MockStream>>,
}

impl MockBackend {
    fn opened(&self, direction: Direction) -> Result<&Arc<MockStream>, AudioError> {
        match &self.stream {
            Some(stream) if stream.direction == direction && stream.is_active() => Ok(stream),
            Some(_) => Err(AudioError::invalid_state(format!(
                "mock backend is not open for {direction}"
            ))),
            None => Err(AudioError::invalid_state("mock backend is not open")),
        }
    }
}

impl AudioBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self.host.devices.lock().clone())
    }

    fn open(
        &mut self,
        device: &DeviceDescriptor,
        direction: Direction,
        requested: AudioFormat,
    ) -> Result<AudioFormat, AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::invalid_state("mock backend already opened"));
        }

        let current = self
            .host
            .devices
            .lock()
            .iter()
            .find(|d| d.id == device.id)
            .cloned()
            .ok_or_else(|| AudioError::DeviceNotFound {
                id: device.id.clone(),
            })?;

        let failing = self.host.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.host.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(AudioError::backend(format!(
                "injected open failure on {}",
                current.name
            )));
        }

        let format = negotiate_format(&current, direction, requested)?;
        let stream = Arc::new(MockStream {
            device: current.id.clone(),
            direction,
            format,
            capture: CallbackSlot::new(),
            playback: CallbackSlot::new(),
            status: StatusCell::new(),
            stopped: AtomicBool::new(false),
        });
        self.host.streams.lock().push(Arc::clone(&stream));
        self.host.opens.fetch_add(1, Ordering::SeqCst);
        self.stream = Some(stream);
        Ok(format)
    }

    fn start_capture(&mut self, callback: InputCallback) -> Result<(), AudioError> {
        self.opened(Direction::Input)?.capture.install(callback);
        Ok(())
    }

    fn start_playback(&mut self, callback: OutputCallback) -> Result<(), AudioError> {
        self.opened(Direction::Output)?.playback.install(callback);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = &self.stream {
            if stream.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            stream.capture.clear();
            stream.playback.clear();
            self.host.retire(stream);
        }
    }

    fn status(&self) -> BackendStatus {
        self.stream
            .as_ref()
            .map_or(BackendStatus::Ok, |stream| stream.status.get())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The OS side of one mock device.
///
/// Calls made through this handle run the installed real-time callbacks on
/// the calling thread.
#[derive(Clone)]
pub struct MockDevice {
    host: Arc<MockHost>,
    id: DeviceId,
}

impl MockDevice {
    /// Device id.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Delivers native capture samples, as the audio thread would.
    ///
    /// Returns `false` if no capture callback is running on this device.
    pub fn push_input(&self, samples: &[i16]) -> bool {
        self.host
            .active_stream(&self.id, Direction::Input)
            .and_then(|stream| stream.capture.with(|callback| callback(samples)))
            .is_some()
    }

    /// Requests `frames` native frames of playback audio.
    ///
    /// Returns an empty buffer if no playback callback is running.
    pub fn render(&self, frames: usize) -> Vec<i16> {
        let Some(stream) = self.host.active_stream(&self.id, Direction::Output) else {
            return Vec::new();
        };
        let mut buffer = vec![0i16; frames * stream.format.channels as usize];
        match stream.playback.with(|callback| callback(&mut buffer)) {
            Some(()) => buffer,
            None => Vec::new(),
        }
    }

    /// Native format of the active session, if any.
    pub fn negotiated_format(&self) -> Option<AudioFormat> {
        let streams = self.host.streams.lock();
        streams
            .iter()
            .rev()
            .find(|s| s.device == self.id && s.is_active())
            .map(|s| s.format)
    }

    /// Returns `true` if a session is open on this device.
    pub fn is_active(&self) -> bool {
        self.negotiated_format().is_some()
    }

    /// Callback invocations across every session ever opened on the device.
    pub fn invocations(&self) -> u64 {
        self.host.invocations(&self.id)
    }

    /// Reports an error on open sessions, as an OS error callback would.
    pub fn fail(&self, status: BackendStatus) {
        for stream in self.host.streams.lock().iter() {
            if stream.device == self.id && stream.is_active() {
                stream.status.record(status);
            }
        }
    }
}

//! Platform audio backend abstraction.
//!
//! The engine never talks to a platform audio API directly. Everything goes
//! through two traits:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │     DeviceMonitor / CaptureEngine / Mixer    │
//! │  use the traits, don't know which platform   │
//! └──────────────┬───────────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────────────────────┐
//! │  trait BackendProvider  (one per session)    │
//! │  enumerate_devices(), create_backend()       │
//! │                                              │
//! │  trait AudioBackend     (one per open device)│
//! │  open(), start_*(), stop(), status()         │
//! └──────┬──────────────────────┬────────────────┘
//!        ▼                      ▼
//! ┌──────────────┐    ┌──────────────────┐
//! │ CpalBackend  │    │ MockBackend      │
//! │ (hardware)   │    │ (tests, no HW)   │
//! └──────────────┘    └──────────────────┘
//! ```
//!
//! # Callback contract
//!
//! The callbacks handed to [`AudioBackend::start_capture`] and
//! [`AudioBackend::start_playback`] run on the platform's real-time audio
//! thread. They must not block, allocate, log or take a contended lock. This
//! is documented, not enforced.

mod cpal_host;
mod mock;
mod slot;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use cpal_host::{CpalBackend, CpalProvider};
pub use mock::{MockBackend, MockDevice, MockProvider, MOCK_MICROPHONE, MOCK_SPEAKERS};
pub(crate) use slot::CallbackSlot;

use crate::error::AudioError;
use crate::format::AudioFormat;

/// Rate picked when the requested one is unsupported.
pub const PREFERRED_SAMPLE_RATE: u32 = 48000;

/// Real-time capture callback: receives native interleaved samples.
pub type InputCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Real-time playback callback: fills the native interleaved render buffer.
pub type OutputCallback = Box<dyn FnMut(&mut [i16]) + Send + 'static>;

/// Invoked (off the real-time path) when the device list may have changed.
pub type DeviceNotifier = Arc<dyn Fn() + Send + Sync>;

/// Which way audio flows through a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Microphone / capture.
    Input,
    /// Speakers / playback.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Opaque, backend-defined device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a device offers in one direction.
///
/// Empty lists mean the device cannot serve the direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamCaps {
    /// Sample rates the device can run at in this direction, ascending.
    pub sample_rates: Vec<u32>,
    /// Channel counts the device accepts in this direction, ascending.
    pub channel_counts: Vec<u16>,
}

impl StreamCaps {
    /// Capabilities for `sample_rates` and every channel count up to
    /// `max_channels`.
    pub fn up_to(sample_rates: &[u32], max_channels: u16) -> Self {
        Self {
            sample_rates: sample_rates.to_vec(),
            channel_counts: (1..=max_channels).collect(),
        }
    }

    /// Capabilities for `sample_rates` at exactly the listed channel counts.
    pub fn exact(sample_rates: &[u32], channel_counts: &[u16]) -> Self {
        let mut caps = Self {
            sample_rates: sample_rates.to_vec(),
            channel_counts: channel_counts.to_vec(),
        };
        caps.normalize();
        caps
    }

    /// Returns `true` if nothing is offered.
    pub fn is_empty(&self) -> bool {
        self.channel_counts.is_empty()
    }

    /// Largest channel count, 0 if none.
    pub fn max_channels(&self) -> u16 {
        self.channel_counts.iter().copied().max().unwrap_or(0)
    }

    /// Folds `other` into these capabilities.
    pub fn merge(&mut self, other: &StreamCaps) {
        self.sample_rates.extend_from_slice(&other.sample_rates);
        self.channel_counts.extend_from_slice(&other.channel_counts);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.sample_rates.sort_unstable();
        self.sample_rates.dedup();
        self.channel_counts.retain(|&c| c > 0);
        self.channel_counts.sort_unstable();
        self.channel_counts.dedup();
    }
}

/// Immutable snapshot of one audio endpoint.
///
/// Re-enumerated on every monitor pass; never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Backend-defined identifier.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Capture capabilities (empty = not an input).
    pub input: StreamCaps,
    /// Playback capabilities (empty = not an output).
    pub output: StreamCaps,
    /// Platform default for capture.
    pub is_default_input: bool,
    /// Platform default for playback.
    pub is_default_output: bool,
}

impl DeviceDescriptor {
    /// Capabilities for `direction`.
    pub fn caps(&self, direction: Direction) -> &StreamCaps {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    /// Maximum channel count for `direction`.
    pub fn channels(&self, direction: Direction) -> u16 {
        self.caps(direction).max_channels()
    }

    /// Returns `true` if the device can serve `direction` at all.
    pub fn supports(&self, direction: Direction) -> bool {
        !self.caps(direction).is_empty()
    }

    /// Returns `true` if this is the platform default for `direction`.
    pub fn is_default(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.is_default_input,
            Direction::Output => self.is_default_output,
        }
    }
}

/// Picks the platform default device for `direction` from a snapshot.
pub fn default_device(
    devices: &[DeviceDescriptor],
    direction: Direction,
) -> Option<&DeviceDescriptor> {
    devices
        .iter()
        .find(|d| d.is_default(direction) && d.supports(direction))
}

/// Picks the native format a backend should open for `requested`.
///
/// Rates and channel counts come from the device's capabilities for
/// `direction` only. Keeps the requested rate if supported, otherwise prefers
/// [`PREFERRED_SAMPLE_RATE`], otherwise the closest supported rate. Keeps the
/// requested channel count if supported, otherwise the smallest larger count
/// (the pipeline up-mixes), otherwise the largest available.
///
/// # Errors
///
/// Returns `UnsupportedFormat` if the device has no channels for
/// `direction` or advertises no sample rates for it.
pub fn negotiate_format(
    device: &DeviceDescriptor,
    direction: Direction,
    requested: AudioFormat,
) -> Result<AudioFormat, AudioError> {
    let caps = device.caps(direction);
    let channels = pick_channels(&caps.channel_counts, requested.channels).ok_or_else(|| {
        AudioError::unsupported(
            &device.name,
            requested,
            format!("device has no {direction} channels"),
        )
    })?;

    let rate = if caps.sample_rates.contains(&requested.sample_rate) {
        requested.sample_rate
    } else if caps.sample_rates.contains(&PREFERRED_SAMPLE_RATE) {
        PREFERRED_SAMPLE_RATE
    } else {
        caps.sample_rates
            .iter()
            .copied()
            .min_by_key(|rate| rate.abs_diff(requested.sample_rate))
            .ok_or_else(|| {
                AudioError::unsupported(
                    &device.name,
                    requested,
                    format!("device reports no {direction} sample rates"),
                )
            })?
    };

    Ok(AudioFormat::new(rate, channels))
}

/// Channel count closest to `requested` among `supported`, rounding up.
pub(crate) fn pick_channels(supported: &[u16], requested: u16) -> Option<u16> {
    let requested = requested.max(1);
    if supported.contains(&requested) {
        return Some(requested);
    }
    supported
        .iter()
        .copied()
        .filter(|&c| c > requested)
        .min()
        .or_else(|| supported.iter().copied().max())
}

/// Health of an open backend, as last recorded by its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendStatus {
    /// Running normally.
    Ok = 0,
    /// The device went away; reopening on another device may work.
    DeviceLost = 1,
    /// Unrecoverable failure.
    Fatal = 2,
}

/// Lock-free status code written from real-time or error callbacks.
///
/// Only escalates: once `DeviceLost` is recorded, a later `Ok` is ignored.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    /// Creates a cell reading `Ok`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` if it is more severe than the current one.
    pub fn record(&self, status: BackendStatus) {
        self.0.fetch_max(status as u8, Ordering::AcqRel);
    }

    /// Reads the current status.
    pub fn get(&self) -> BackendStatus {
        match self.0.load(Ordering::Acquire) {
            0 => BackendStatus::Ok,
            1 => BackendStatus::DeviceLost,
            _ => BackendStatus::Fatal,
        }
    }
}

/// One open device session.
///
/// Lifecycle: `open` → `start_capture` or `start_playback` → `stop`. A
/// stopped backend is not reopened; ask the [`BackendProvider`] for a new
/// instance.
pub trait AudioBackend: Send {
    /// Backend name (e.g., "cpal", "mock").
    fn name(&self) -> &'static str;

    /// Lists the devices this backend can open.
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError>;

    /// Opens `device` for `direction` and returns the negotiated native format.
    ///
    /// The negotiated format may differ from `requested`. The backend never
    /// converts; callers resample.
    fn open(
        &mut self,
        device: &DeviceDescriptor,
        direction: Direction,
        requested: AudioFormat,
    ) -> Result<AudioFormat, AudioError>;

    /// Starts delivering captured audio to `callback`.
    fn start_capture(&mut self, callback: InputCallback) -> Result<(), AudioError>;

    /// Starts requesting playback audio from `callback`.
    fn start_playback(&mut self, callback: OutputCallback) -> Result<(), AudioError>;

    /// Stops the stream and releases the device.
    ///
    /// Idempotent. Once this returns, the installed callback is never
    /// invoked again.
    fn stop(&mut self);

    /// Last status recorded by the real-time or error callbacks.
    fn status(&self) -> BackendStatus;
}

/// Factory for backend instances; the backend variant chosen at startup.
pub trait BackendProvider: Send + Sync {
    /// Provider name (e.g., "cpal", "mock").
    fn name(&self) -> &'static str;

    /// Lists currently available devices.
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError>;

    /// Creates a fresh, unopened backend.
    fn create_backend(&self) -> Box<dyn AudioBackend>;

    /// Registers `notifier` for device-list changes.
    ///
    /// Providers without push notifications keep the default, and the device
    /// monitor falls back to polling.
    fn subscribe(&self, _notifier: DeviceNotifier) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(rates: &[u32], input: u16, output: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("dev"),
            name: "Test Device".to_string(),
            input: StreamCaps::up_to(rates, input),
            output: StreamCaps::up_to(rates, output),
            is_default_input: input > 0,
            is_default_output: false,
        }
    }

    #[test]
    fn test_negotiate_keeps_supported_request() {
        let dev = device(&[16000, 44100, 48000], 2, 0);
        let format = negotiate_format(&dev, Direction::Input, AudioFormat::mono(44100)).unwrap();
        assert_eq!(format, AudioFormat::mono(44100));
    }

    #[test]
    fn test_negotiate_identical_format() {
        let dev = device(&[48000], 1, 0);
        let format = negotiate_format(&dev, Direction::Input, AudioFormat::mono(48000)).unwrap();
        assert_eq!(format, AudioFormat::mono(48000));
    }

    #[test]
    fn test_negotiate_prefers_48k() {
        let dev = device(&[44100, 48000, 96000], 1, 0);
        let format = negotiate_format(&dev, Direction::Input, AudioFormat::mono(16000)).unwrap();
        assert_eq!(format.sample_rate, 48000);
    }

    #[test]
    fn test_negotiate_closest_rate() {
        let dev = device(&[8000, 22050, 44100], 1, 0);
        let format = negotiate_format(&dev, Direction::Input, AudioFormat::mono(16000)).unwrap();
        assert_eq!(format.sample_rate, 22050);
    }

    #[test]
    fn test_negotiate_clamps_channels() {
        let dev = device(&[48000], 0, 2);
        let format =
            negotiate_format(&dev, Direction::Output, AudioFormat::new(48000, 6)).unwrap();
        assert_eq!(format.channels, 2);
    }

    #[test]
    fn test_negotiate_rounds_channels_up_to_supported_count() {
        // Stereo-only speakers serving a mono pipeline
        let mut dev = device(&[48000], 0, 0);
        dev.output = StreamCaps::exact(&[48000], &[2]);
        let format = negotiate_format(&dev, Direction::Output, AudioFormat::mono(48000)).unwrap();
        assert_eq!(format, AudioFormat::stereo(48000));

        dev.output = StreamCaps::exact(&[48000], &[2, 8, 6]);
        let format = negotiate_format(&dev, Direction::Output, AudioFormat::new(48000, 4)).unwrap();
        assert_eq!(format.channels, 6);
    }

    #[test]
    fn test_negotiate_uses_rates_of_the_requested_direction() {
        let mut dev = device(&[], 0, 0);
        dev.input = StreamCaps::up_to(&[16000], 1);
        dev.output = StreamCaps::up_to(&[44100, 48000], 2);

        let input = negotiate_format(&dev, Direction::Input, AudioFormat::mono(48000)).unwrap();
        assert_eq!(input, AudioFormat::mono(16000));
        let output = negotiate_format(&dev, Direction::Output, AudioFormat::mono(16000)).unwrap();
        assert_eq!(output, AudioFormat::mono(48000));
    }

    #[test]
    fn test_pick_channels() {
        assert_eq!(pick_channels(&[1, 2], 1), Some(1));
        assert_eq!(pick_channels(&[2], 1), Some(2));
        assert_eq!(pick_channels(&[1], 2), Some(1));
        assert_eq!(pick_channels(&[2, 4], 3), Some(4));
        assert_eq!(pick_channels(&[], 1), None);
    }

    #[test]
    fn test_stream_caps_merge_dedups() {
        let mut caps = StreamCaps::exact(&[48000, 44100], &[2]);
        caps.merge(&StreamCaps::exact(&[48000], &[1, 2]));
        assert_eq!(caps.sample_rates, vec![44100, 48000]);
        assert_eq!(caps.channel_counts, vec![1, 2]);
        assert_eq!(caps.max_channels(), 2);
        assert!(StreamCaps::default().is_empty());
    }

    #[test]
    fn test_negotiate_wrong_direction() {
        let dev = device(&[48000], 0, 2);
        let result = negotiate_format(&dev, Direction::Input, AudioFormat::mono(48000));
        assert!(matches!(result, Err(AudioError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_negotiate_no_rates() {
        let dev = device(&[], 1, 0);
        assert!(negotiate_format(&dev, Direction::Input, AudioFormat::mono(48000)).is_err());
    }

    #[test]
    fn test_default_device() {
        let mic = device(&[48000], 1, 0);
        let mut speakers = device(&[48000], 0, 2);
        speakers.id = DeviceId::new("spk");
        speakers.is_default_output = true;
        let devices = vec![mic, speakers];

        assert_eq!(
            default_device(&devices, Direction::Output).map(|d| d.id.as_str()),
            Some("spk")
        );
        assert_eq!(
            default_device(&devices, Direction::Input).map(|d| d.id.as_str()),
            Some("dev")
        );
    }

    #[test]
    fn test_status_cell_only_escalates() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), BackendStatus::Ok);
        cell.record(BackendStatus::DeviceLost);
        cell.record(BackendStatus::Ok);
        assert_eq!(cell.get(), BackendStatus::DeviceLost);
        cell.record(BackendStatus::Fatal);
        assert_eq!(cell.get(), BackendStatus::Fatal);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Input.to_string(), "input");
        assert_eq!(Direction::Output.to_string(), "output");
    }
}

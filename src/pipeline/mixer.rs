//! Playback mixer: sums every participant's audio into the output device.
//!
//! The mixer is split across the thread boundary:
//!
//! ```text
//!  control thread                         audio thread
//! ┌───────────────┐   commands ring    ┌──────────────┐
//! │ PlaybackMixer │ ─────────────────→ │ MixRenderer  │ → resample → device
//! │  (registry)   │ ←───────────────── │ (slot table) │
//! └───────────────┘   graveyard ring   └──────────────┘
//! ```
//!
//! Sources are created and destroyed only on the control side. The renderer
//! receives them through the command ring and hands removed ones back through
//! the graveyard ring, so the audio thread never frees memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::stream_source::{stream_source, SourceActivity, SourceStats, StreamSource, StreamSourceWriter};
use super::PlaybackState;
use crate::backend::AudioBackend;
use crate::config::EngineConfig;
use crate::format::{saturate, AudioFormat, PipelineFormat, Resampler};
use crate::participant::ParticipantId;
use crate::AudioError;

/// Extra mix passes allowed per callback beyond what the buffer size needs.
const MIX_PASS_SLACK: usize = 8;

enum MixerCommand {
    Add(StreamSource),
    Remove(ParticipantId),
}

/// Counters and flags shared with the audio thread.
#[derive(Debug, Default)]
pub(crate) struct MixerShared {
    state: AtomicU8,
    deafened: AtomicBool,
    /// Pipeline frames mixed so far; the mixer's clock.
    cycles: AtomicU64,
    callbacks: AtomicU64,
    /// Callbacks that found the renderer busy and rendered silence.
    busy: AtomicU64,
    underruns: AtomicU64,
}

impl MixerShared {
    pub(crate) fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub(crate) fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Relaxed)
    }
}

/// Audio-thread half of the mixer.
struct MixRenderer {
    pipeline: PipelineFormat,
    commands: HeapCons<MixerCommand>,
    graveyard: HeapProd<StreamSource>,
    slots: Vec<Option<StreamSource>>,
    accumulator: Vec<i32>,
    scratch: Vec<i16>,
    mixed: Vec<i16>,
    resampler: Resampler,
    /// Native samples produced by one pipeline frame.
    native_frame_len: usize,
    shared: Arc<MixerShared>,
    cycle: u64,
}

impl MixRenderer {
    /// Fills `out` with native-format audio. Real-time safe.
    fn render(&mut self, out: &mut [i16]) {
        self.apply_commands();

        let mut written = self.resampler.pop_up_to(out);
        let max_passes = out.len() / self.native_frame_len + MIX_PASS_SLACK;
        let mut passes = 0;
        while written < out.len() && passes < max_passes {
            self.mix_frame();
            written += self.resampler.pop_up_to(&mut out[written..]);
            passes += 1;
        }
        out[written..].fill(0);
    }

    /// Mixes one pipeline frame from every source and feeds the resampler.
    fn mix_frame(&mut self) {
        self.accumulator.fill(0);

        let mut underruns = 0;
        for source in self.slots.iter_mut().flatten() {
            if !source.mix_into(&mut self.accumulator, &mut self.scratch, self.cycle) {
                underruns += 1;
            }
        }
        if underruns > 0 {
            self.shared.underruns.fetch_add(underruns, Ordering::Relaxed);
        }

        if self.shared.deafened.load(Ordering::Relaxed) {
            self.mixed.fill(0);
        } else {
            for (out, &sum) in self.mixed.iter_mut().zip(self.accumulator.iter()) {
                *out = saturate(sum);
            }
        }

        self.resampler.push(&self.mixed);
        self.cycle += 1;
        self.shared.cycles.store(self.cycle, Ordering::Relaxed);
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                MixerCommand::Add(source) => {
                    match self.slots.iter_mut().find(|slot| slot.is_none()) {
                        Some(slot) => *slot = Some(source),
                        // Registry enforces the limit; hand it back untouched
                        None => {
                            let _ = self.graveyard.try_push(source);
                        }
                    }
                }
                MixerCommand::Remove(participant) => {
                    for slot in &mut self.slots {
                        if slot.as_ref().is_some_and(|s| s.participant() == participant) {
                            if let Some(source) = slot.take() {
                                let _ = self.graveyard.try_push(source);
                            }
                        }
                    }
                }
            }
        }
    }

    fn rewire(&mut self, native: AudioFormat) -> Result<(), AudioError> {
        self.resampler = Resampler::new(self.pipeline.format, native, self.pipeline.frame_duration)?;
        self.native_frame_len = native.samples_for(self.pipeline.frame_duration).max(1);
        Ok(())
    }
}

/// Point-in-time mixer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MixerStats {
    /// Pipeline frames mixed.
    pub frames_mixed: u64,
    /// Output callbacks served.
    pub callbacks: u64,
    /// Per-source mix cycles without a ready frame.
    pub underruns: u64,
    /// Active stream sources.
    pub sources: usize,
}

/// Control-thread half of the mixer.
///
/// Owns the participant registry and the render state shared with the
/// output callback. All methods run on control threads.
pub struct PlaybackMixer {
    pipeline: PipelineFormat,
    max_sources: usize,
    ring_frames: usize,
    commands: HeapProd<MixerCommand>,
    graveyard: HeapCons<StreamSource>,
    sources: HashMap<ParticipantId, Arc<SourceActivity>>,
    renderer: Arc<Mutex<MixRenderer>>,
    shared: Arc<MixerShared>,
}

impl PlaybackMixer {
    /// Creates an idle mixer for `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` if the pipeline format is invalid.
    pub fn new(pipeline: PipelineFormat, config: &EngineConfig) -> Result<Self, AudioError> {
        if !pipeline.is_valid() {
            return Err(AudioError::unsupported("mixer", pipeline.format, "invalid pipeline format"));
        }

        let max_sources = config.max_sources.max(1);
        // Room for one add and one remove per source between callbacks
        let (commands_tx, commands_rx) = HeapRb::<MixerCommand>::new(max_sources * 2).split();
        let (graveyard_tx, graveyard_rx) = HeapRb::<StreamSource>::new(max_sources * 2).split();

        let frame_len = pipeline.frame_len();
        let shared = Arc::new(MixerShared::default());
        let renderer = MixRenderer {
            pipeline,
            commands: commands_rx,
            graveyard: graveyard_tx,
            slots: (0..max_sources).map(|_| None).collect(),
            accumulator: vec![0; frame_len],
            scratch: vec![0; frame_len],
            mixed: vec![0; frame_len],
            resampler: Resampler::new(pipeline.format, pipeline.format, pipeline.frame_duration)?,
            native_frame_len: frame_len,
            shared: Arc::clone(&shared),
            cycle: 0,
        };

        Ok(Self {
            pipeline,
            max_sources,
            ring_frames: config.source_ring_frames,
            commands: commands_tx,
            graveyard: graveyard_rx,
            sources: HashMap::new(),
            renderer: Arc::new(Mutex::new(renderer)),
            shared,
        })
    }

    /// Registers a participant and returns the writer for its decoded audio.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSource` if the participant already has a source and
    /// `TooManySources` if the mixer is full.
    pub fn add_source(&mut self, participant: ParticipantId) -> Result<StreamSourceWriter, AudioError> {
        self.maintain();

        if self.sources.contains_key(&participant) {
            return Err(AudioError::DuplicateSource { id: participant });
        }
        if self.sources.len() >= self.max_sources {
            return Err(AudioError::TooManySources {
                max: self.max_sources,
            });
        }

        let (writer, source) =
            stream_source(participant, self.pipeline, self.ring_frames, self.shared.cycles());
        let activity = Arc::clone(source.activity());

        if self.commands.try_push(MixerCommand::Add(source)).is_err() {
            return Err(AudioError::invalid_state("mixer command queue is full"));
        }
        self.sources.insert(participant, activity);
        self.maintain();

        tracing::debug!(%participant, sources = self.sources.len(), "Added stream source");
        Ok(writer)
    }

    /// Unregisters a participant. Returns `false` if it was unknown.
    pub fn remove_source(&mut self, participant: ParticipantId) -> bool {
        let Some(activity) = self.sources.remove(&participant) else {
            return false;
        };
        activity.mark_removed();

        if self.commands.try_push(MixerCommand::Remove(participant)).is_err() {
            // Apply directly; the renderer will not get this slot back otherwise
            self.renderer.lock().apply_commands();
            let _ = self.commands.try_push(MixerCommand::Remove(participant));
        }
        self.maintain();

        tracing::debug!(%participant, sources = self.sources.len(), "Removed stream source");
        true
    }

    /// Removes sources silent for longer than `timeout`.
    ///
    /// Silence is measured in mixed frames, so nothing expires while
    /// playback is stopped.
    pub fn reap_silent(&mut self, timeout: std::time::Duration) -> Vec<ParticipantId> {
        let frame_nanos = self.pipeline.frame_duration.as_nanos().max(1);
        let timeout_cycles = (timeout.as_nanos() / frame_nanos) as u64;
        let now = self.shared.cycles();

        let expired: Vec<ParticipantId> = self
            .sources
            .iter()
            .filter(|(_, activity)| now.saturating_sub(activity.last_audible_cycle()) > timeout_cycles)
            .map(|(participant, _)| *participant)
            .collect();

        for participant in &expired {
            tracing::info!(%participant, ?timeout, "Stream source expired after silence");
            self.remove_source(*participant);
        }
        expired
    }

    /// Frees sources the renderer has handed back. Returns how many.
    pub fn collect_garbage(&mut self) -> usize {
        let mut freed = 0;
        while let Some(source) = self.graveyard.try_pop() {
            drop(source);
            freed += 1;
        }
        freed
    }

    /// Applies queued commands directly while no output callback runs, then
    /// collects garbage.
    pub fn maintain(&mut self) {
        if self.shared.state() != PlaybackState::Playing {
            self.renderer.lock().apply_commands();
        }
        self.collect_garbage();
    }

    /// Renders silence (while still consuming sources) when `true`.
    pub fn set_deafened(&self, deafened: bool) {
        self.shared.deafened.store(deafened, Ordering::Relaxed);
    }

    /// Returns `true` if output is deafened.
    pub fn is_deafened(&self) -> bool {
        self.shared.is_deafened()
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if `participant` has a source.
    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.sources.contains_key(&participant)
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Marks the mixer as negotiating a device.
    pub fn begin_negotiation(&self) {
        self.shared.set_state(PlaybackState::Negotiating);
    }

    /// Marks the mixer idle without touching a backend.
    pub fn mark_idle(&self) {
        self.shared.set_state(PlaybackState::Idle);
    }

    /// Reconfigures the pipeline→native conversion for a new device.
    ///
    /// Must only run while no output callback is installed.
    pub fn rewire(&self, native: AudioFormat) -> Result<(), AudioError> {
        self.renderer.lock().rewire(native)
    }

    /// Rewires for `native` and installs the output callback on `backend`.
    pub fn start(&self, backend: &mut dyn AudioBackend, native: AudioFormat) -> Result<(), AudioError> {
        self.rewire(native)?;

        let renderer = Arc::clone(&self.renderer);
        let shared = Arc::clone(&self.shared);
        backend.start_playback(Box::new(move |out: &mut [i16]| {
            shared.callbacks.fetch_add(1, Ordering::Relaxed);
            match renderer.try_lock() {
                Some(mut renderer) => renderer.render(out),
                None => {
                    shared.busy.fetch_add(1, Ordering::Relaxed);
                    out.fill(0);
                }
            }
        }))?;

        self.shared.set_state(PlaybackState::Playing);
        tracing::info!(pipeline = %self.pipeline, %native, "Playback started");
        Ok(())
    }

    /// Stops `backend` and returns the mixer to idle. Sources are kept.
    pub fn stop(&self, backend: &mut dyn AudioBackend) {
        backend.stop();
        self.shared.set_state(PlaybackState::Idle);
    }

    /// Per-source counters.
    pub fn source_stats(&self) -> Vec<SourceStats> {
        self.sources
            .values()
            .map(|activity| activity.snapshot(0, 0))
            .collect()
    }

    /// Mixer counters.
    pub fn stats(&self) -> MixerStats {
        MixerStats {
            frames_mixed: self.shared.cycles(),
            callbacks: self.shared.callbacks(),
            underruns: self.shared.underruns(),
            sources: self.sources.len(),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<MixerShared> {
        &self.shared
    }

    /// Renders `out` on the calling thread, as an output callback would.
    #[cfg(test)]
    fn render_for_test(&self, out: &mut [i16]) {
        self.renderer.lock().render(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pipeline() -> PipelineFormat {
        PipelineFormat::new(AudioFormat::mono(48000), Duration::from_millis(10))
    }

    fn mixer() -> PlaybackMixer {
        PlaybackMixer::new(pipeline(), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_no_sources_renders_silence() {
        let mixer = mixer();
        let mut out = vec![1i16; 480];
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_silent_sources_render_silence() {
        let mut mixer = mixer();
        let mut writers: Vec<_> = (0..3)
            .map(|id| mixer.add_source(ParticipantId::new(id)).unwrap())
            .collect();
        for writer in &mut writers {
            writer.push_frame(&[0; 480]);
        }

        let mut out = vec![1i16; 480];
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_identical_sources_double_amplitude() {
        let mut mixer = mixer();
        let mut a = mixer.add_source(ParticipantId::new(1)).unwrap();
        let mut b = mixer.add_source(ParticipantId::new(2)).unwrap();
        let frame: Vec<i16> = (0..480).map(|i| ((i % 50) * 100 - 2500) as i16).collect();
        a.push_frame(&frame);
        b.push_frame(&frame);

        let mut out = vec![0i16; 480];
        mixer.render_for_test(&mut out);
        for (mixed, original) in out.iter().zip(&frame) {
            assert_eq!(*mixed, original * 2);
        }
    }

    #[test]
    fn test_mix_saturates_instead_of_wrapping() {
        let mut mixer = mixer();
        let mut a = mixer.add_source(ParticipantId::new(1)).unwrap();
        let mut b = mixer.add_source(ParticipantId::new(2)).unwrap();
        a.push_frame(&[30_000; 480]);
        b.push_frame(&[30_000; 480]);

        let mut out = vec![0i16; 480];
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == i16::MAX));

        a.push_frame(&[-30_000; 480]);
        b.push_frame(&[-30_000; 480]);
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn test_deafen_silences_but_drains() {
        let mut mixer = mixer();
        let mut writer = mixer.add_source(ParticipantId::new(1)).unwrap();
        writer.push_frame(&[500; 480]);
        mixer.set_deafened(true);

        let mut out = vec![1i16; 480];
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(writer.stats().frames_mixed, 1);
        assert_eq!(writer.stats().queued, 0);
    }

    #[test]
    fn test_underrun_counted_per_source() {
        let mut mixer = mixer();
        let _writer = mixer.add_source(ParticipantId::new(1)).unwrap();
        let mut out = vec![0i16; 960];
        mixer.render_for_test(&mut out);
        assert_eq!(mixer.stats().underruns, 2);
        assert_eq!(mixer.stats().frames_mixed, 2);
    }

    #[test]
    fn test_duplicate_and_limit() {
        let config = EngineConfig {
            max_sources: 2,
            ..Default::default()
        };
        let mut mixer = PlaybackMixer::new(pipeline(), &config).unwrap();
        let _a = mixer.add_source(ParticipantId::new(1)).unwrap();
        assert!(matches!(
            mixer.add_source(ParticipantId::new(1)),
            Err(AudioError::DuplicateSource { .. })
        ));
        let _b = mixer.add_source(ParticipantId::new(2)).unwrap();
        assert!(matches!(
            mixer.add_source(ParticipantId::new(3)),
            Err(AudioError::TooManySources { max: 2 })
        ));

        assert!(mixer.remove_source(ParticipantId::new(1)));
        assert!(!mixer.remove_source(ParticipantId::new(1)));
        assert!(mixer.add_source(ParticipantId::new(3)).is_ok());
    }

    #[test]
    fn test_removed_source_is_closed_and_collected() {
        let mut mixer = mixer();
        let writer = mixer.add_source(ParticipantId::new(1)).unwrap();
        mixer.remove_source(ParticipantId::new(1));
        assert!(writer.is_closed());
        assert_eq!(mixer.source_count(), 0);

        // Slot was released: rendering finds nothing to mix
        let mut out = vec![0i16; 480];
        mixer.render_for_test(&mut out);
        assert_eq!(mixer.stats().underruns, 0);
    }

    #[test]
    fn test_reap_silent_sources() {
        let mut mixer = mixer();
        let mut talking = mixer.add_source(ParticipantId::new(1)).unwrap();
        let quiet = mixer.add_source(ParticipantId::new(2)).unwrap();

        // 30 frames = 300ms; only participant 1 produces audio
        let mut out = vec![0i16; 480];
        for _ in 0..30 {
            talking.push_frame(&[10; 480]);
            mixer.render_for_test(&mut out);
        }

        let expired = mixer.reap_silent(Duration::from_millis(200));
        assert_eq!(expired, vec![ParticipantId::new(2)]);
        assert!(quiet.is_closed());
        assert!(!talking.is_closed());
        assert!(mixer.contains(ParticipantId::new(1)));
    }

    #[test]
    fn test_rewire_to_stereo_native() {
        let mut mixer = mixer();
        mixer.rewire(AudioFormat::stereo(48000)).unwrap();
        let mut writer = mixer.add_source(ParticipantId::new(1)).unwrap();
        writer.push_frame(&[250; 480]);

        let mut out = vec![0i16; 960];
        mixer.render_for_test(&mut out);
        assert!(out.iter().all(|&s| s == 250));
    }

    #[test]
    fn test_native_buffer_not_multiple_of_frame() {
        let mut mixer = mixer();
        let mut writer = mixer.add_source(ParticipantId::new(1)).unwrap();
        writer.push_frame(&[7; 480]);
        writer.push_frame(&[9; 480]);

        // 300 + 300 + 360 native samples span two pipeline frames
        let mut first = vec![0i16; 300];
        mixer.render_for_test(&mut first);
        let mut second = vec![0i16; 300];
        mixer.render_for_test(&mut second);
        let mut third = vec![0i16; 360];
        mixer.render_for_test(&mut third);

        assert!(first.iter().all(|&s| s == 7));
        assert_eq!(&second[..180], &[7; 180][..]);
        assert!(second[180..].iter().all(|&s| s == 9));
        assert!(third.iter().all(|&s| s == 9));
    }
}

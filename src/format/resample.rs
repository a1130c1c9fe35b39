//! Sample rate and channel layout conversion.
//!
//! [`Resampler`] converts a stream of interleaved i16 samples from one
//! [`AudioFormat`] to another. Channels are remixed first (averaging for
//! down-mix, duplication for up-mix), then the rate is converted with
//! rubato's FFT resampler, which handles arbitrary rational ratios such as
//! 44100 → 48000 with a steep anti-aliasing filter.
//!
//! Identical formats take a zero-conversion fast path: samples are copied
//! through bit-for-bit.
//!
//! All buffers are allocated in [`Resampler::new`]; `push` and the `pop_*`
//! methods do not allocate in steady state, so the resampler can run inside
//! a real-time callback.

use std::collections::VecDeque;
use std::time::Duration;

use rubato::{FftFixedInOut, Resampler as _};

use super::{f32_to_i16, i16_to_f32, remix_frame, AudioFormat};
use crate::{AudioError, AudioFrame};

/// Upper bound on lead-in flushes for one-shot conversion.
const MAX_FLUSH_PASSES: usize = 64;

/// Streaming converter between two audio formats.
///
/// Input is pushed in arbitrary amounts; output is popped in exact amounts.
/// Because the FFT stage consumes fixed-size chunks, up to
/// [`latency_frames()`](Self::latency_frames) output frames can be held
/// back between calls. That is the only state carried across calls.
pub struct Resampler {
    input: AudioFormat,
    output: AudioFormat,
    rate: Option<RateStage>,
    /// One remixed frame (output channel count).
    remixed: Vec<i16>,
    /// Converted samples awaiting `pop_*`, interleaved in the output layout.
    pending: VecDeque<i16>,
    pending_limit: usize,
}

/// Fixed-chunk FFT rate conversion over the output channel layout.
struct RateStage {
    fft: FftFixedInOut<f32>,
    staged: Vec<Vec<f32>>,
    staged_frames: usize,
    produced: Vec<Vec<f32>>,
    chunk_in: usize,
    chunk_out: usize,
}

impl RateStage {
    fn new(input_rate: u32, output_rate: u32, chunk: usize, channels: usize) -> Result<Self, AudioError> {
        let fft = FftFixedInOut::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            chunk.max(1),
            channels,
        )
        .map_err(|e| AudioError::backend(format!("failed to create resampler: {e}")))?;

        let chunk_in = fft.input_frames_max();
        let chunk_out = fft.output_frames_max();

        Ok(Self {
            fft,
            staged: vec![vec![0.0; chunk_in]; channels],
            staged_frames: 0,
            produced: vec![vec![0.0; chunk_out]; channels],
            chunk_in,
            chunk_out,
        })
    }

    fn stage(&mut self, frame: &[i16], pending: &mut VecDeque<i16>) {
        for (channel, &sample) in self.staged.iter_mut().zip(frame) {
            channel[self.staged_frames] = i16_to_f32(sample);
        }
        self.staged_frames += 1;

        if self.staged_frames == self.chunk_in {
            self.staged_frames = 0;
            // A failed chunk becomes a gap; there is nobody to report to here.
            if let Ok((_, written)) =
                self.fft
                    .process_into_buffer(&self.staged, &mut self.produced, None)
            {
                for i in 0..written {
                    for channel in &self.produced {
                        pending.push_back(f32_to_i16(channel[i]));
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.staged_frames = 0;
    }

    /// Output frames of lead-in before the first input frame appears.
    fn delay(&self) -> usize {
        self.fft.output_delay()
    }
}

impl Resampler {
    /// Creates a resampler sized for frames of `frame_duration`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` if either format is invalid, or a backend
    /// error if the FFT stage cannot be built for the rate pair.
    pub fn new(
        input: AudioFormat,
        output: AudioFormat,
        frame_duration: Duration,
    ) -> Result<Self, AudioError> {
        Self::with_chunk(input, output, input.frames_for(frame_duration))
    }

    fn with_chunk(
        input: AudioFormat,
        output: AudioFormat,
        chunk_frames: usize,
    ) -> Result<Self, AudioError> {
        if !input.is_valid() {
            return Err(AudioError::unsupported("resampler", input, "invalid input format"));
        }
        if !output.is_valid() {
            return Err(AudioError::unsupported("resampler", output, "invalid output format"));
        }

        let out_channels = output.channels as usize;
        let rate = if input.sample_rate == output.sample_rate {
            None
        } else {
            Some(RateStage::new(
                input.sample_rate,
                output.sample_rate,
                chunk_frames,
                out_channels,
            )?)
        };

        let out_frames_per_chunk = if input.sample_rate == 0 {
            0
        } else {
            (chunk_frames as u64 * u64::from(output.sample_rate) / u64::from(input.sample_rate))
                as usize
        };
        let held = rate.as_ref().map_or(0, |stage| stage.chunk_out);
        let pending_limit = (held + out_frames_per_chunk.max(1)) * out_channels * 4;

        Ok(Self {
            input,
            output,
            rate,
            remixed: vec![0; out_channels],
            pending: VecDeque::with_capacity(pending_limit),
            pending_limit,
        })
    }

    /// Input format.
    pub fn input(&self) -> AudioFormat {
        self.input
    }

    /// Output format.
    pub fn output(&self) -> AudioFormat {
        self.output
    }

    /// Returns `true` if input and output formats are identical.
    pub fn is_passthrough(&self) -> bool {
        self.input == self.output
    }

    /// Upper bound, in output frames, on audio held back between calls.
    ///
    /// Zero when the rates match. Otherwise one staged input chunk plus one
    /// FFT overlap chunk.
    pub fn latency_frames(&self) -> usize {
        self.rate.as_ref().map_or(0, |stage| stage.chunk_out * 2)
    }

    /// Output frames of filter lead-in at the start of the stream.
    pub(crate) fn delay_frames(&self) -> usize {
        self.rate.as_ref().map_or(0, RateStage::delay)
    }

    /// Converted frames ready to pop.
    pub fn available_frames(&self) -> usize {
        self.pending.len() / self.output.channels as usize
    }

    /// Pushes interleaved samples in the input format.
    ///
    /// A trailing partial frame is ignored. If converted output piles up
    /// beyond the internal limit (nobody is popping), the oldest samples are
    /// discarded.
    pub fn push(&mut self, samples: &[i16]) {
        if self.is_passthrough() {
            self.pending.extend(samples.iter().copied());
        } else {
            let in_channels = self.input.channels as usize;
            for frame in samples.chunks_exact(in_channels) {
                remix_frame(frame, &mut self.remixed);
                match self.rate.as_mut() {
                    Some(stage) => stage.stage(&self.remixed, &mut self.pending),
                    None => self.pending.extend(self.remixed.iter().copied()),
                }
            }
        }

        if self.pending.len() > self.pending_limit {
            let excess = self.pending.len() - self.pending_limit;
            let channels = self.output.channels as usize;
            let aligned = excess.div_ceil(channels) * channels;
            self.pending.drain(..aligned.min(self.pending.len()));
        }
    }

    /// Pops exactly `out.len()` samples if that many are available.
    ///
    /// Returns `false` and leaves `out` untouched otherwise.
    pub fn pop_into(&mut self, out: &mut [i16]) -> bool {
        if self.pending.len() < out.len() {
            return false;
        }
        self.pop_up_to(out);
        true
    }

    /// Pops up to `out.len()` samples and returns how many were written.
    pub fn pop_up_to(&mut self, out: &mut [i16]) -> usize {
        let count = self.pending.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(self.pending.drain(..count)) {
            *dst = src;
        }
        count
    }

    /// Discards all buffered audio.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(stage) = self.rate.as_mut() {
            stage.reset();
        }
    }
}

/// Converts one frame between formats in a single call.
///
/// The output always holds exactly `round(in_frames * out_rate / in_rate)`
/// frames of `output.channels` channels, time-aligned with the input: the
/// filter lead-in is dropped and the tail is flushed out with silence.
/// Identical formats return the input unchanged, bit for bit.
///
/// Each call starts from a fresh filter state. Streams of consecutive frames
/// should go through one [`Resampler`] instead.
///
/// # Errors
///
/// Returns `UnsupportedFormat` if a format is invalid or the sample count is
/// not a whole number of input frames.
pub fn convert(
    frame: &AudioFrame,
    input: AudioFormat,
    output: AudioFormat,
) -> Result<AudioFrame, AudioError> {
    if !input.is_valid() || frame.samples.len() % input.channels as usize != 0 {
        return Err(AudioError::unsupported(
            "resampler",
            input,
            format!("{} samples is not a whole number of frames", frame.samples.len()),
        ));
    }
    if input == output {
        return Ok(frame.clone());
    }

    let in_frames = frame.samples.len() / input.channels as usize;
    let expected = ((in_frames as u64 * u64::from(output.sample_rate)
        + u64::from(input.sample_rate) / 2)
        / u64::from(input.sample_rate)) as usize;
    let mut samples = vec![0i16; expected * output.channels as usize];

    if in_frames > 0 {
        let mut resampler = Resampler::with_chunk(input, output, in_frames)?;
        resampler.push(&frame.samples);

        let delay = resampler.delay_frames();
        let silence = vec![0i16; frame.samples.len()];
        let mut passes = 0;
        while resampler.available_frames() < expected + delay && passes < MAX_FLUSH_PASSES {
            resampler.push(&silence);
            passes += 1;
        }

        let mut lead_in = vec![0i16; delay.min(resampler.available_frames()) * output.channels as usize];
        resampler.pop_up_to(&mut lead_in);
        resampler.pop_up_to(&mut samples);
    }

    Ok(AudioFrame::new(samples, frame.sequence, frame.timestamp, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEN_MS: Duration = Duration::from_millis(10);

    fn sine(format: AudioFormat, frequency: f64, frames: usize, amplitude: f64) -> Vec<i16> {
        let mut samples = Vec::with_capacity(frames * format.channels as usize);
        for i in 0..frames {
            let t = i as f64 / f64::from(format.sample_rate);
            let value = (amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()) as i16;
            for _ in 0..format.channels {
                samples.push(value);
            }
        }
        samples
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
        (sum / samples.len().max(1) as f64).sqrt()
    }

    #[test]
    fn test_passthrough_is_bit_identical() {
        let format = AudioFormat::mono(48000);
        let mut resampler = Resampler::new(format, format, TEN_MS).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.latency_frames(), 0);

        let input: Vec<i16> = (0..480).map(|i| (i * 67 - 16000) as i16).collect();
        resampler.push(&input);

        let mut out = vec![0i16; 480];
        assert!(resampler.pop_into(&mut out));
        assert_eq!(out, input);
        assert_eq!(resampler.available_frames(), 0);
    }

    #[test]
    fn test_downmix_same_rate() {
        let mut resampler =
            Resampler::new(AudioFormat::stereo(16000), AudioFormat::mono(16000), TEN_MS).unwrap();
        resampler.push(&[100, 200, 300, 400]);

        let mut out = [0i16; 2];
        assert!(resampler.pop_into(&mut out));
        assert_eq!(out, [150, 350]);
    }

    #[test]
    fn test_upmix_same_rate() {
        let mut resampler =
            Resampler::new(AudioFormat::mono(48000), AudioFormat::stereo(48000), TEN_MS).unwrap();
        resampler.push(&[7, -9]);

        let mut out = [0i16; 4];
        assert!(resampler.pop_into(&mut out));
        assert_eq!(out, [7, 7, -9, -9]);
    }

    #[test]
    fn test_pop_into_requires_full_frame() {
        let format = AudioFormat::mono(16000);
        let mut resampler = Resampler::new(format, format, TEN_MS).unwrap();
        resampler.push(&[1, 2, 3]);

        let mut out = [0i16; 4];
        assert!(!resampler.pop_into(&mut out));
        assert_eq!(out, [0, 0, 0, 0]);
        assert_eq!(resampler.pop_up_to(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_streaming_44100_to_48000_frame_lengths() {
        let input = AudioFormat::mono(44100);
        let output = AudioFormat::mono(48000);
        let mut resampler = Resampler::new(input, output, TEN_MS).unwrap();
        assert!(!resampler.is_passthrough());

        let signal = sine(input, 440.0, 441 * 100, 8000.0);
        let mut frame = vec![0i16; 480];
        let mut popped = 0;
        for chunk in signal.chunks(441) {
            resampler.push(chunk);
            while resampler.pop_into(&mut frame) {
                popped += 1;
            }
        }

        // One second in, one second out, minus what the FFT stage holds back
        let held_frames = resampler.latency_frames().div_ceil(480);
        assert!(popped >= 100 - held_frames - 1, "popped {popped}");
        assert!(popped <= 100);
    }

    #[test]
    fn test_tone_survives_rate_conversion() {
        let input = AudioFormat::mono(44100);
        let output = AudioFormat::mono(48000);
        let mut resampler = Resampler::new(input, output, TEN_MS).unwrap();

        let signal = sine(input, 1000.0, 44100, 10000.0);
        resampler.push(&signal);

        let mut out = vec![0i16; resampler.available_frames()];
        resampler.pop_up_to(&mut out);
        let tail = &out[out.len() / 2..];
        let expected = 10000.0 / std::f64::consts::SQRT_2;
        assert!((rms(tail) - expected).abs() < expected * 0.1, "rms {}", rms(tail));
    }

    #[test]
    fn test_downsampling_suppresses_aliasing() {
        // 12 kHz is above the 8 kHz Nyquist limit of the 16 kHz output
        let input = AudioFormat::mono(48000);
        let output = AudioFormat::mono(16000);
        let mut resampler = Resampler::new(input, output, TEN_MS).unwrap();

        let signal = sine(input, 12000.0, 48000, 16000.0);
        resampler.push(&signal);

        let mut out = vec![0i16; resampler.available_frames()];
        resampler.pop_up_to(&mut out);
        let tail = &out[out.len() / 2..];
        assert!(rms(tail) < 500.0, "aliased energy rms {}", rms(tail));
    }

    #[test]
    fn test_convert_output_matches_declared_format() {
        let pairs = [
            (AudioFormat::mono(44100), AudioFormat::mono(48000)),
            (AudioFormat::stereo(48000), AudioFormat::mono(16000)),
            (AudioFormat::mono(16000), AudioFormat::stereo(48000)),
            (AudioFormat::stereo(22050), AudioFormat::mono(48000)),
            (AudioFormat::mono(8000), AudioFormat::stereo(44100)),
            (AudioFormat::new(96000, 6), AudioFormat::stereo(48000)),
        ];

        for (input, output) in pairs {
            let in_frames = input.frames_for(TEN_MS);
            let frame = AudioFrame::new(
                sine(input, 440.0, in_frames, 5000.0),
                3,
                Duration::from_millis(30),
                input,
            );
            let converted = convert(&frame, input, output).unwrap();

            let expected_frames = ((in_frames as u64 * u64::from(output.sample_rate)
                + u64::from(input.sample_rate) / 2)
                / u64::from(input.sample_rate)) as usize;
            assert_eq!(converted.format, output, "{input} -> {output}");
            assert_eq!(
                converted.samples.len(),
                expected_frames * output.channels as usize,
                "{input} -> {output}"
            );
            assert_eq!(converted.sequence, 3);
            assert_eq!(converted.timestamp, Duration::from_millis(30));
        }
    }

    #[test]
    fn test_convert_keeps_content_aligned() {
        let input = AudioFormat::mono(16000);
        let output = AudioFormat::mono(48000);
        let frame = AudioFrame::new(vec![10000; 160], 0, Duration::ZERO, input);
        let converted = convert(&frame, input, output).unwrap();
        assert_eq!(converted.samples.len(), 480);

        // The middle of the output is the middle of the input, not lead-in
        let middle = &converted.samples[120..360];
        assert!(
            middle.iter().all(|&s| (9000..=11000).contains(&s)),
            "middle {:?}",
            &middle[..8]
        );
    }

    #[test]
    fn test_delay_frames() {
        let format = AudioFormat::mono(48000);
        let passthrough = Resampler::new(format, format, TEN_MS).unwrap();
        assert_eq!(passthrough.delay_frames(), 0);

        let resampler = Resampler::new(AudioFormat::mono(16000), format, TEN_MS).unwrap();
        assert!(resampler.delay_frames() > 0);
        assert!(resampler.delay_frames() <= resampler.latency_frames());
    }

    #[test]
    fn test_convert_identical_formats_is_noop() {
        let format = AudioFormat::mono(48000);
        let frame = AudioFrame::new((0..480).map(|i| i as i16).collect(), 0, Duration::ZERO, format);
        let converted = convert(&frame, format, format).unwrap();
        assert_eq!(converted.samples, frame.samples);
    }

    #[test]
    fn test_convert_rejects_partial_frames() {
        let input = AudioFormat::stereo(48000);
        let frame = AudioFrame::new(vec![1, 2, 3], 0, Duration::ZERO, input);
        let result = convert(&frame, input, AudioFormat::mono(48000));
        assert!(matches!(result, Err(AudioError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let result = Resampler::new(AudioFormat::mono(0), AudioFormat::mono(48000), TEN_MS);
        assert!(result.is_err());
    }

    #[test]
    fn test_pending_is_bounded_without_consumer() {
        let format = AudioFormat::mono(48000);
        let mut resampler = Resampler::new(format, format, TEN_MS).unwrap();
        for _ in 0..100 {
            resampler.push(&[1i16; 480]);
        }
        assert!(resampler.available_frames() <= 480 * 4);
    }
}

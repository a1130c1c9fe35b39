//! Sample format and channel conversion.
//!
//! Everything here is allocation-free and safe to call from a real-time
//! callback.

/// Converts an f32 sample to i16.
///
/// Input should be in the range [-1.0, 1.0].
/// Values outside this range are clamped.
///
/// Uses × 32767 (not 32768) for symmetric scaling. This means -1.0 maps
/// to -32767 rather than -32768, losing 1 LSB at the negative extreme.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Converts an i16 sample to f32 in the range [-1.0, 1.0].
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Clamps a widened accumulator back into the i16 range.
///
/// Mixing sums in i32 and saturates here, so loud overlapping sources clip
/// instead of wrapping around.
#[inline]
pub fn saturate(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Remixes one interleaved frame from `input.len()` to `output.len()` channels.
///
/// - Down-mix: output channel `c` is the average of every input channel `i`
///   with `i % out == c` (stereo → mono averages left and right).
/// - Up-mix: output channel `c` duplicates input channel `c % in`
///   (mono → stereo copies the sample to both sides).
/// - Equal counts copy through unchanged.
#[inline]
pub fn remix_frame(input: &[i16], output: &mut [i16]) {
    let in_ch = input.len();
    let out_ch = output.len();
    if in_ch == 0 || out_ch == 0 {
        output.fill(0);
        return;
    }

    if in_ch == out_ch {
        output.copy_from_slice(input);
    } else if in_ch > out_ch {
        for (c, out) in output.iter_mut().enumerate() {
            let mut sum = 0i32;
            let mut count = 0i32;
            for sample in input.iter().skip(c).step_by(out_ch) {
                sum += i32::from(*sample);
                count += 1;
            }
            *out = if count == 0 { 0 } else { (sum / count) as i16 };
        }
    } else {
        for (c, out) in output.iter_mut().enumerate() {
            *out = input[c % in_ch];
        }
    }
}

//! # Audio Codec Utilities
//!
//! Sample-rate conversion and telephony encodings for the playback pipeline.
//! Synthesized speech arrives at a higher sample rate (typically 16kHz or
//! 24kHz) and must be delivered to the carrier as 8kHz, 16-bit, mono PCM —
//! optionally G.711 mu-law encoded for carriers that require it.
//!
//! ## Key Functions:
//! - **Resampler**: FFT-based sample-rate conversion with a linear fallback
//! - **pcm_to_mulaw**: bit-exact ITU G.711 mu-law encoding
//! - **Byte conversion**: raw little-endian PCM bytes to i16 samples and back

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::warn;

/// Sample-rate converter between two fixed rates.
///
/// Uses rubato's FFT resampler for quality, falling back to linear
/// interpolation for inputs too short to window properly or when the FFT
/// path fails. Mono only — the carrier protocol is single-channel.
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self { from_rate, to_rate }
    }

    /// Resample normalized f32 samples from `from_rate` to `to_rate`.
    pub fn resample(&self, input: &[f32]) -> Vec<f32> {
        use rubato::{FftFixedIn, Resampler as RubatoResampler};

        if self.from_rate == self.to_rate || input.is_empty() {
            return input.to_vec();
        }

        // FFT windowing needs a reasonable chunk; short tails go linear.
        if input.len() < 64 {
            return self.resample_linear(input);
        }

        let expected_len =
            (input.len() as f64 * self.to_rate as f64 / self.from_rate as f64).round() as usize;
        let chunk_size = input.len().min(1024);

        let mut resampler = match FftFixedIn::<f64>::new(
            self.from_rate as usize,
            self.to_rate as usize,
            chunk_size,
            2,
            1,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!("FFT resampler init failed, using linear fallback: {}", e);
                return self.resample_linear(input);
            }
        };

        let delay = resampler.output_delay();
        let mut output: Vec<f32> = Vec::with_capacity(expected_len + delay);
        for chunk in input.chunks(chunk_size) {
            // The FFT resampler consumes fixed-size chunks; pad the tail.
            let mut frame: Vec<f64> = chunk.iter().map(|&s| s as f64).collect();
            frame.resize(chunk_size, 0.0);

            match resampler.process(&[frame], None) {
                Ok(frames) => output.extend(frames[0].iter().map(|&s| s as f32)),
                Err(e) => {
                    warn!("FFT resampling failed, using linear fallback: {}", e);
                    return self.resample_linear(input);
                }
            }
        }

        // Flush the filter delay so the tail of the signal is emitted, then
        // skip the same number of leading transient samples.
        while output.len() < expected_len + delay {
            match resampler.process_partial::<Vec<f64>>(None, None) {
                Ok(frames) if !frames[0].is_empty() => {
                    output.extend(frames[0].iter().map(|&s| s as f32));
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("FFT resampler flush failed, using linear fallback: {}", e);
                    return self.resample_linear(input);
                }
            }
        }

        output.drain(..delay.min(output.len()));
        output.truncate(expected_len);
        output
    }

    /// Resample 16-bit PCM, returning 16-bit PCM.
    pub fn resample_pcm(&self, input: &[i16]) -> Vec<i16> {
        let as_float: Vec<f32> = input.iter().map(|&s| s as f32 / 32768.0).collect();
        self.resample(&as_float)
            .iter()
            .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
            .collect()
    }

    /// Linear interpolation fallback for short inputs and FFT failures.
    fn resample_linear(&self, input: &[f32]) -> Vec<f32> {
        let ratio = self.to_rate as f64 / self.from_rate as f64;
        let output_len = (input.len() as f64 * ratio).ceil() as usize;
        let mut output = Vec::with_capacity(output_len);

        for i in 0..output_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(input.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;

            let sample = input[idx_floor] * (1.0 - frac) + input[idx_ceil] * frac;
            output.push(sample);
        }

        output
    }
}

/// Maximum linear magnitude the mu-law encoder accepts before biasing.
const MULAW_CLIP: i32 = 32635;

/// ITU G.711 bias added before exponent extraction.
const MULAW_BIAS: i32 = 0x84;

/// Encode one 16-bit linear PCM sample as 8-bit G.711 mu-law.
///
/// Standard bias/clamp/exponent logic: clamp the magnitude to 32635, add the
/// 0x84 bias, locate the exponent (highest set bit above bit 7), take the
/// four mantissa bits below it, and emit the bitwise complement of
/// sign|exponent|mantissa. Must stay bit-exact with G.711 for carrier
/// interoperability.
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = (sample as i32).abs();
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Exponent: shift right until the biased magnitude fits 8 bits.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Encode a PCM buffer as G.711 mu-law bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| pcm_to_mulaw(s)).collect()
}

/// Parse raw little-endian 16-bit PCM bytes into samples.
///
/// Returns an error for odd-length input rather than silently dropping the
/// trailing byte.
pub fn bytes_to_pcm(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err("PCM byte length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Root-mean-square amplitude of a PCM buffer, in linear sample units.
///
/// Used by the transcription energy gate to reject segments that are only
/// line noise.
pub fn rms_amplitude(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

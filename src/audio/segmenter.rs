//! # Audio Segmenter
//!
//! Accumulates raw PCM samples for one call and decides when enough speech
//! has been collected to hand a segment to the transcription service.
//! Carrier media arrives in small fixed-size frames (tens of milliseconds);
//! transcribing per frame would be wasteful and inaccurate, so samples are
//! accumulated and endpointed on silence.
//!
//! ## Endpointing:
//! A segment closes when EITHER the accumulated duration reaches the hard
//! maximum, OR it has reached the minimum duration and the configured silence
//! window has elapsed since the last non-silent sample. The dual condition
//! balances latency against cutting speech mid-word.

use std::io::Cursor;
use std::time::Instant;

/// Thresholds controlling segment endpointing.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Minimum accumulated duration before a silence-closed segment (ms)
    pub min_audio_ms: u64,

    /// Hard backstop: force a drain at this duration (ms)
    pub max_audio_ms: u64,

    /// Silence window that closes a segment once past the minimum (ms)
    pub silence_ms: u64,

    /// Smallest absolute sample value counted as non-silent
    pub silence_amplitude: i16,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_audio_ms: 3000,
            max_audio_ms: 15000,
            silence_ms: 1000,
            silence_amplitude: 500,
        }
    }
}

/// Read-only snapshot of accumulator state for diagnostics and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SegmenterInfo {
    pub total_samples: usize,
    pub duration_ms: u64,
}

/// Per-call PCM accumulator with silence-based endpointing.
///
/// Samples collected since the last segmentation boundary, in arrival order.
/// Segments are non-overlapping: every drain (or rejection) is followed by a
/// `reset()` before the next segment starts.
pub struct AudioSegmenter {
    config: SegmenterConfig,

    /// Accumulated signed 16-bit samples since the last boundary
    samples: Vec<i16>,

    /// Sample rate adopted from the first accepted frame of the segment
    sample_rate: u32,

    /// When the last sample above the amplitude threshold arrived
    last_voice_at: Option<Instant>,
}

impl AudioSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
            sample_rate: 8000,
            last_voice_at: None,
        }
    }

    /// Append a media frame's samples to the accumulator.
    ///
    /// The segment adopts the sample rate of its first frame; the carrier
    /// keeps the rate stable within a call once the initial odd-rate frame
    /// has been discarded upstream.
    pub fn add_samples(&mut self, samples: &[i16], sample_rate: u32) {
        if samples.is_empty() {
            return;
        }

        if self.samples.is_empty() {
            self.sample_rate = sample_rate.max(1);
        }

        let threshold = self.config.silence_amplitude;
        if samples.iter().any(|&s| s.unsigned_abs() as i32 > threshold as i32) {
            self.last_voice_at = Some(Instant::now());
        }

        self.samples.extend_from_slice(samples);
    }

    /// Accumulated audio duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    /// Whether the accumulated segment is ready for the transcription service.
    pub fn should_send(&self) -> bool {
        let duration = self.duration_ms();

        if duration >= self.config.max_audio_ms {
            return true;
        }
        if duration < self.config.min_audio_ms {
            return false;
        }

        // An all-silence segment never closes on the silence window; it
        // waits for the max-duration backstop.
        self.last_voice_at.is_some() && self.is_silent()
    }

    /// Whether no sample above the amplitude threshold arrived within the
    /// configured silence window (or ever, for a pure-noise segment).
    pub fn is_silent(&self) -> bool {
        match self.last_voice_at {
            Some(at) => at.elapsed().as_millis() as u64 >= self.config.silence_ms,
            None => true,
        }
    }

    /// Serialize the accumulated samples as a RIFF/WAVE buffer (mono, 16-bit,
    /// little-endian at the segment's sample rate). Returns `None` when
    /// nothing has accumulated.
    pub fn to_wav_buffer(&self) -> Option<Vec<u8>> {
        if self.samples.is_empty() {
            return None;
        }

        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let track = wav::BitDepth::Sixteen(self.samples.clone());
        let mut out = Cursor::new(Vec::new());
        if wav::write(header, &track, &mut out).is_err() {
            return None;
        }
        Some(out.into_inner())
    }

    /// Snapshot for diagnostics and the pre-dispatch validation gates.
    pub fn info(&self) -> SegmenterInfo {
        SegmenterInfo {
            total_samples: self.samples.len(),
            duration_ms: self.duration_ms(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Borrow the accumulated samples (for the energy gate).
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Clear samples and timestamps to start the next segment.
    ///
    /// Called after every successful or rejected send; segments never
    /// overlap.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_voice_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            min_audio_ms: 3000,
            max_audio_ms: 15000,
            silence_ms: 1000,
            silence_amplitude: 500,
        }
    }

    fn frame(len: usize, amplitude: i16) -> Vec<i16> {
        vec![amplitude; len]
    }

    #[test]
    fn test_total_samples_tracks_additions() {
        let mut seg = AudioSegmenter::new(config());
        seg.add_samples(&frame(160, 1000), 8000);
        seg.add_samples(&frame(80, 0), 8000);
        assert_eq!(seg.info().total_samples, 240);

        seg.reset();
        assert_eq!(seg.info().total_samples, 0);
        seg.add_samples(&frame(10, 0), 8000);
        assert_eq!(seg.info().total_samples, 10);
    }

    #[test]
    fn test_duration_math() {
        let mut seg = AudioSegmenter::new(config());
        // 8000 samples at 8kHz = 1 second
        seg.add_samples(&frame(8000, 1000), 8000);
        assert_eq!(seg.info().duration_ms, 1000);
    }

    #[test]
    fn test_should_send_false_below_min_duration() {
        let mut seg = AudioSegmenter::new(config());
        // 1s of audio, well under the 3s minimum: never ready, silence or not.
        seg.add_samples(&frame(8000, 0), 8000);
        assert!(!seg.should_send());
    }

    #[test]
    fn test_should_send_true_at_max_duration() {
        let mut seg = AudioSegmenter::new(config());
        // 15s of continuously voiced audio hits the hard backstop even though
        // the silence window never elapsed.
        seg.add_samples(&frame(15 * 8000, 1000), 8000);
        assert!(seg.should_send());
    }

    #[test]
    fn test_should_send_waits_for_silence_between_min_and_max() {
        let mut seg = AudioSegmenter::new(config());
        // 4s of voiced audio: past the minimum but the last voiced sample
        // just arrived, so the silence window has not elapsed.
        seg.add_samples(&frame(4 * 8000, 1000), 8000);
        assert!(!seg.is_silent());
        assert!(!seg.should_send());
    }

    #[test]
    fn test_all_silence_waits_for_max_duration() {
        let mut seg = AudioSegmenter::new(config());
        // 50 silent frames, 4s total: past the 3s minimum, but with no
        // voiced sample the silence window never closes the segment.
        for _ in 0..50 {
            seg.add_samples(&frame(640, 0), 8000);
        }
        assert!(seg.is_silent());
        assert!(!seg.should_send());

        // The hard backstop closes it regardless.
        seg.add_samples(&frame(11 * 8000, 0), 8000);
        assert!(seg.should_send());
    }

    #[test]
    fn test_wav_roundtrip_lossless() {
        let mut seg = AudioSegmenter::new(config());
        let samples: Vec<i16> = (0..1000).map(|i| ((i * 37) % 65536 - 32768) as i16).collect();
        seg.add_samples(&samples, 8000);

        let buffer = seg.to_wav_buffer().expect("non-empty accumulator");
        let (header, data) = wav::read(&mut Cursor::new(buffer)).expect("valid wav");

        assert_eq!(header.channel_count, 1);
        assert_eq!(header.sampling_rate, 8000);
        assert_eq!(header.bits_per_sample, 16);
        match data {
            wav::BitDepth::Sixteen(parsed) => assert_eq!(parsed, samples),
            other => panic!("unexpected bit depth: {:?}", other),
        }
    }

    #[test]
    fn test_wav_buffer_empty_when_no_samples() {
        let seg = AudioSegmenter::new(config());
        assert!(seg.to_wav_buffer().is_none());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut seg = AudioSegmenter::new(config());
        seg.add_samples(&frame(16000, 1000), 8000);
        seg.reset();
        assert_eq!(seg.info().total_samples, 0);
        assert_eq!(seg.info().duration_ms, 0);
        assert!(!seg.should_send());
    }

    #[test]
    fn test_sample_rate_adopted_from_first_frame() {
        let mut seg = AudioSegmenter::new(config());
        seg.add_samples(&frame(16000, 0), 16000);
        assert_eq!(seg.sample_rate(), 16000);
        assert_eq!(seg.info().duration_ms, 1000);
    }
}

//! # Transcription Validation Gates
//!
//! Validation applied around the external speech-to-text call. Segments that
//! are too short or too quiet are rejected before dispatch; results matching
//! known empty-speech artifacts, results that are too short, and immediate
//! repeats are rejected after. Every rejection resets the accumulator and
//! appends nothing — normal operation continues.

use crate::audio::segmenter::SegmenterInfo;

/// Why a segment or transcription result was rejected.
///
/// Named per gate so drops are observable in logs and metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    /// Segment shorter than the transcription floor
    TooShort { duration_ms: u64 },

    /// RMS amplitude below the energy floor (silence / line noise)
    TooQuiet { rms: f64 },

    /// Result matches a known empty-speech artifact
    Hallucination,

    /// Trimmed result under the minimum character count
    TooFewChars,

    /// Same text as the previous chunk within the repeat window
    DuplicateChunk,
}

impl GateRejection {
    pub fn gate_name(&self) -> &'static str {
        match self {
            GateRejection::TooShort { .. } => "min_duration",
            GateRejection::TooQuiet { .. } => "energy",
            GateRejection::Hallucination => "hallucination",
            GateRejection::TooFewChars => "min_length",
            GateRejection::DuplicateChunk => "duplicate",
        }
    }
}

/// Tuning for the pre- and post-dispatch gates.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Floor on segment duration before dispatch (ms)
    pub min_transcription_ms: u64,

    /// Floor on RMS amplitude (linear 16-bit sample units)
    pub min_rms_amplitude: f64,

    /// Minimum trimmed character count on results
    pub min_result_chars: usize,

    /// Window in which an identical consecutive result is a repeat artifact (ms)
    pub duplicate_window_ms: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_transcription_ms: 1500,
            min_rms_amplitude: 120.0,
            min_result_chars: 3,
            duplicate_window_ms: 3000,
        }
    }
}

/// Empty-speech artifacts the transcription service produces for silence.
/// Matched case-insensitively after trimming and stripping closing
/// punctuation.
const HALLUCINATION_PHRASES: &[&str] = &[
    "thank you",
    "thanks",
    "thank you very much",
    "you",
    "bye",
];

/// Pre-dispatch gates: minimum duration, then RMS energy.
pub fn check_segment(
    info: &SegmenterInfo,
    rms: f64,
    config: &GateConfig,
) -> Result<(), GateRejection> {
    if info.duration_ms < config.min_transcription_ms {
        return Err(GateRejection::TooShort {
            duration_ms: info.duration_ms,
        });
    }
    if rms < config.min_rms_amplitude {
        return Err(GateRejection::TooQuiet { rms });
    }
    Ok(())
}

/// Post-dispatch gates: hallucination filter, then minimum length.
pub fn check_result(text: &str, config: &GateConfig) -> Result<(), GateRejection> {
    if is_hallucination(text) {
        return Err(GateRejection::Hallucination);
    }
    if text.trim().chars().count() < config.min_result_chars {
        return Err(GateRejection::TooFewChars);
    }
    Ok(())
}

/// Whether a result is a known empty-speech artifact: an exact
/// (case-insensitive) match against the fixed phrase set, or a string of
/// nothing but punctuation, whitespace, and dots.
pub fn is_hallucination(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed.chars().all(|c| !c.is_alphanumeric()) {
        return true;
    }

    let normalized = trimmed
        .trim_end_matches(['.', '!', '?', '…'])
        .trim()
        .to_lowercase();
    HALLUCINATION_PHRASES.iter().any(|&p| p == normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration_ms: u64) -> SegmenterInfo {
        SegmenterInfo {
            total_samples: (duration_ms * 8) as usize,
            duration_ms,
        }
    }

    #[test]
    fn test_duration_gate() {
        let config = GateConfig::default();
        assert_eq!(
            check_segment(&info(900), 500.0, &config),
            Err(GateRejection::TooShort { duration_ms: 900 })
        );
        assert!(check_segment(&info(1500), 500.0, &config).is_ok());
    }

    #[test]
    fn test_energy_gate() {
        let config = GateConfig::default();
        assert!(matches!(
            check_segment(&info(2000), 10.0, &config),
            Err(GateRejection::TooQuiet { .. })
        ));
        assert!(check_segment(&info(2000), 121.0, &config).is_ok());
    }

    #[test]
    fn test_hallucination_exact_phrases_any_case() {
        assert!(is_hallucination("Thank you."));
        assert!(is_hallucination("THANK YOU"));
        assert!(is_hallucination("thanks"));
        assert!(is_hallucination("  You.  "));
        assert!(is_hallucination("Bye!"));
    }

    #[test]
    fn test_hallucination_punctuation_only() {
        assert!(is_hallucination("..."));
        assert!(is_hallucination(" . . . "));
        assert!(is_hallucination("?!"));
        assert!(is_hallucination(""));
    }

    #[test]
    fn test_real_speech_passes() {
        assert!(!is_hallucination("I'd like to check my account balance"));
        assert!(!is_hallucination("thank you for calling, I need help"));
        let config = GateConfig::default();
        assert!(check_result("I need help with my bill", &config).is_ok());
    }

    #[test]
    fn test_min_length_gate() {
        let config = GateConfig::default();
        assert_eq!(check_result("hm", &config), Err(GateRejection::TooFewChars));
        assert!(check_result("yes please", &config).is_ok());
    }

    #[test]
    fn test_gate_names() {
        assert_eq!(GateRejection::Hallucination.gate_name(), "hallucination");
        assert_eq!(GateRejection::DuplicateChunk.gate_name(), "duplicate");
    }
}

//! # Transcription Session
//!
//! Per-call transcript state: the ordered chunk list, the mutable language
//! preference, and the running error count. Chunks are appended only in
//! arrival order and only after surviving the result gates; finalization
//! deduplicates consecutive identical chunks before joining the combined
//! transcript.

use crate::transcription::filter::{check_result, GateConfig, GateRejection};
use chrono::{DateTime, Utc};

/// One transcription result that survived all gates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscriptChunk {
    /// Transcribed text
    pub text: String,

    /// Language the service detected (or the hint it was given)
    pub language: String,

    /// When the chunk was accepted
    pub timestamp: DateTime<Utc>,

    /// Duration of the source audio segment (ms)
    pub audio_duration_ms: u64,

    /// Round-trip latency of the transcription call (ms)
    pub latency_ms: u64,
}

/// Summary produced on call stop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscriptSummary {
    pub transcript: String,
    pub total_chunks: usize,
    pub total_audio_ms: u64,
    pub error_count: u32,
}

/// Per-call transcript accumulator with dedup and error tracking.
pub struct TranscriptSession {
    /// Language hint for the transcription service; mutable, defaults to the
    /// configured value ("auto" lets the service detect)
    language: String,

    gates: GateConfig,

    /// Accepted chunks in arrival order
    chunks: Vec<TranscriptChunk>,

    /// External-service failures observed on this call
    error_count: u32,
}

impl TranscriptSession {
    pub fn new(default_language: String, gates: GateConfig) -> Self {
        Self {
            language: default_language,
            gates,
            chunks: Vec::new(),
            error_count: 0,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Update the language preference, e.g. from the service's detection.
    pub fn set_language(&mut self, language: String) {
        if !language.is_empty() {
            self.language = language;
        }
    }

    pub fn chunks(&self) -> &[TranscriptChunk] {
        &self.chunks
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Run the result gates and append the chunk if it survives.
    ///
    /// Gate order: hallucination filter, minimum length, then duplicate
    /// suppression against the immediately preceding chunk.
    pub fn push_result(
        &mut self,
        text: &str,
        language: &str,
        audio_duration_ms: u64,
        latency_ms: u64,
    ) -> Result<&TranscriptChunk, GateRejection> {
        self.push_result_at(text, language, audio_duration_ms, latency_ms, Utc::now())
    }

    fn push_result_at(
        &mut self,
        text: &str,
        language: &str,
        audio_duration_ms: u64,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<&TranscriptChunk, GateRejection> {
        check_result(text, &self.gates)?;

        let trimmed = text.trim();
        if let Some(previous) = self.chunks.last() {
            let elapsed_ms = timestamp
                .signed_duration_since(previous.timestamp)
                .num_milliseconds();
            if previous.text == trimmed && elapsed_ms < self.gates.duplicate_window_ms {
                return Err(GateRejection::DuplicateChunk);
            }
        }

        self.chunks.push(TranscriptChunk {
            text: trimmed.to_string(),
            language: language.to_string(),
            timestamp,
            audio_duration_ms,
            latency_ms,
        });
        Ok(self.chunks.last().expect("chunk just pushed"))
    }

    /// Combine all chunk texts into the final transcript, dropping
    /// consecutive repeats, and report totals.
    pub fn finalize(&self) -> TranscriptSummary {
        let mut parts: Vec<&str> = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            if parts.last() != Some(&chunk.text.as_str()) {
                parts.push(&chunk.text);
            }
        }

        TranscriptSummary {
            transcript: parts.join(" "),
            total_chunks: self.chunks.len(),
            total_audio_ms: self.chunks.iter().map(|c| c.audio_duration_ms).sum(),
            error_count: self.error_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> TranscriptSession {
        TranscriptSession::new("auto".to_string(), GateConfig::default())
    }

    #[test]
    fn test_accepted_chunk_is_appended() {
        let mut s = session();
        let chunk = s.push_result("I need to reset my password", "en", 4000, 250).unwrap();
        assert_eq!(chunk.text, "I need to reset my password");
        assert_eq!(s.chunks().len(), 1);
    }

    #[test]
    fn test_hallucination_not_appended() {
        let mut s = session();
        let result = s.push_result("Thank you.", "en", 2000, 100);
        assert_eq!(result.err(), Some(GateRejection::Hallucination));
        assert!(s.chunks().is_empty());
    }

    #[test]
    fn test_duplicate_within_window_rejected() {
        let mut s = session();
        let t0 = Utc::now();
        s.push_result_at("call me back", "en", 3000, 100, t0).unwrap();
        let result = s.push_result_at(
            "call me back",
            "en",
            3000,
            100,
            t0 + Duration::milliseconds(500),
        );
        assert_eq!(result.err(), Some(GateRejection::DuplicateChunk));
        assert_eq!(s.chunks().len(), 1);
    }

    #[test]
    fn test_duplicate_outside_window_retained() {
        let mut s = session();
        let t0 = Utc::now();
        s.push_result_at("call me back", "en", 3000, 100, t0).unwrap();
        s.push_result_at(
            "call me back",
            "en",
            3000,
            100,
            t0 + Duration::milliseconds(5000),
        )
        .unwrap();
        assert_eq!(s.chunks().len(), 2);
    }

    #[test]
    fn test_finalize_joins_and_dedupes() {
        let mut s = session();
        let t0 = Utc::now();
        s.push_result_at("hello there", "en", 2000, 100, t0).unwrap();
        s.push_result_at(
            "hello there",
            "en",
            2000,
            100,
            t0 + Duration::milliseconds(10_000),
        )
        .unwrap();
        s.push_result_at(
            "I have a question",
            "en",
            3000,
            120,
            t0 + Duration::milliseconds(20_000),
        )
        .unwrap();
        s.record_error();

        let summary = s.finalize();
        assert_eq!(summary.transcript, "hello there I have a question");
        assert_eq!(summary.total_chunks, 3);
        assert_eq!(summary.total_audio_ms, 7000);
        assert_eq!(summary.error_count, 1);
    }

    #[test]
    fn test_language_preference_mutable() {
        let mut s = session();
        assert_eq!(s.language(), "auto");
        s.set_language("hi".to_string());
        assert_eq!(s.language(), "hi");
        s.set_language(String::new());
        assert_eq!(s.language(), "hi");
    }
}

//! # Speech Service Collaborators
//!
//! The gateway treats speech-to-text, response generation, and speech
//! synthesis as opaque request/response services behind small traits. The
//! call session holds `Arc<dyn ...>` seams so tests can substitute counting
//! fakes; production wiring uses the HTTP clients in [`http`].
//!
//! Trait methods return boxed futures so the traits stay object-safe.

pub mod http;

pub use http::{HttpResponseGenerator, HttpSpeechSynthesizer, HttpSpeechToText};

use anyhow::Result;
use futures_util::future::BoxFuture;

/// Result of a transcription call.
#[derive(Debug, Clone)]
pub struct SttResult {
    pub text: String,
    /// Language the service detected
    pub language: String,
}

/// Audio produced by the synthesis service.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub format: SynthesisFormat,
}

/// How synthesis output is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisFormat {
    /// RIFF/WAVE container (parsed, then resampled)
    Wav,
    /// Raw little-endian 16-bit mono PCM at the given rate (resampled directly)
    RawPcm { sample_rate: u32 },
}

/// Transcribes a WAV buffer with a language hint ("auto" for detection).
pub trait SpeechToText: Send + Sync {
    fn transcribe<'a>(
        &'a self,
        wav: &'a [u8],
        language_hint: &'a str,
    ) -> BoxFuture<'a, Result<SttResult>>;
}

/// Produces a conversational reply from user text plus history and a system
/// context string.
pub trait ResponseGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        user_text: &'a str,
        history: &'a [String],
        system_context: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Synthesizes speech for a text with a voice identifier and optional
/// language.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        language: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SynthesizedAudio>>;
}

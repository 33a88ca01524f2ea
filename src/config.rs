//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_AUDIO_SILENCE_MS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use crate::audio::segmenter::SegmenterConfig;
use crate::transcription::filter::GateConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub playback: PlaybackConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Segmentation and transcription-gate thresholds.
///
/// ## Tuning guidelines:
/// - Lower `min_segment_ms`: snappier responses, more mid-word cuts
/// - Higher `silence_ms`: fewer false endpoints, more latency after speech
/// - `max_segment_ms` is a hard backstop against callers who never pause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Minimum accumulated duration before a silence-closed segment (ms)
    pub min_segment_ms: u64,

    /// Force a drain at this duration regardless of silence (ms)
    pub max_segment_ms: u64,

    /// Silence window that closes a segment (ms)
    pub silence_ms: u64,

    /// Smallest absolute sample value counted as non-silent
    pub silence_amplitude: i16,

    /// Floor on segment duration before dispatching to transcription (ms)
    pub min_transcription_ms: u64,

    /// Floor on RMS amplitude before dispatching to transcription
    pub min_rms_amplitude: f64,
}

/// Speech service collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Base URL of the transcription service
    pub stt_base_url: String,

    /// Base URL of the response-generation service
    pub responder_base_url: String,

    /// Base URL of the speech-synthesis service
    pub tts_base_url: String,

    /// Voice identifier passed to synthesis
    pub voice: String,

    /// Default language hint; "auto" lets the service detect
    pub default_language: String,

    /// System-context string for response generation
    pub system_context: String,

    /// Spoken when the response pipeline fails mid-call
    pub apology_text: String,

    /// Per-request timeout for all three collaborators (seconds)
    pub request_timeout_secs: u64,

    /// Sample rate assumed for synthesis output that arrives as raw PCM
    pub tts_raw_pcm_rate: u32,
}

/// Outbound playback pacing.
///
/// The carrier consumes audio in real time; 160 samples at 8kHz is one 20ms
/// frame, and pacing sends at the same interval keeps its receive buffer
/// from overrunning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Outbound PCM sample rate required by the carrier
    pub sample_rate: u32,

    /// Samples per outbound media frame
    pub frame_samples: usize,

    /// Delay between frame sends (ms)
    pub frame_interval_ms: u64,

    /// Wire encoding for outbound samples
    pub encoding: PayloadEncoding,
}

/// How outbound audio samples are encoded on the wire. Most deployments take
/// linear 16-bit PCM; some carriers require G.711 mu-law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Pcm16,
    Mulaw,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of simultaneously active calls
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                min_segment_ms: 3000,
                max_segment_ms: 15000,
                silence_ms: 1000,
                silence_amplitude: 500,
                min_transcription_ms: 1500,
                min_rms_amplitude: 120.0,
            },
            speech: SpeechConfig {
                stt_base_url: "http://localhost:9000".to_string(),
                responder_base_url: "http://localhost:9001".to_string(),
                tts_base_url: "http://localhost:9002".to_string(),
                voice: "en-US-standard".to_string(),
                default_language: "auto".to_string(),
                system_context: "You are a helpful call-center voice assistant. \
                                 Keep replies short and speakable."
                    .to_string(),
                apology_text: "I'm sorry, I'm having trouble right now. \
                               Could you please repeat that?"
                    .to_string(),
                request_timeout_secs: 15,
                tts_raw_pcm_rate: 16000,
            },
            playback: PlaybackConfig {
                sample_rate: 8000,
                frame_samples: 160,
                frame_interval_ms: 20,
                encoding: PayloadEncoding::Pcm16,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment
    /// variables, in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly set bare HOST/PORT
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.audio.min_segment_ms == 0 || self.audio.max_segment_ms <= self.audio.min_segment_ms
        {
            return Err(anyhow::anyhow!(
                "max_segment_ms must be greater than min_segment_ms (and both non-zero)"
            ));
        }
        if self.audio.silence_ms == 0 {
            return Err(anyhow::anyhow!("silence_ms must be greater than 0"));
        }
        if self.playback.frame_samples == 0 || self.playback.frame_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "playback frame size and interval must be greater than 0"
            ));
        }
        if self.playback.sample_rate == 0 {
            return Err(anyhow::anyhow!("playback sample rate must be greater than 0"));
        }
        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("max_concurrent_calls must be greater than 0"));
        }
        Ok(())
    }

    /// Segmenter thresholds as the segmenter's own config type.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            min_audio_ms: self.audio.min_segment_ms,
            max_audio_ms: self.audio.max_segment_ms,
            silence_ms: self.audio.silence_ms,
            silence_amplitude: self.audio.silence_amplitude,
        }
    }

    /// Transcription gate thresholds as the filter's own config type.
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            min_transcription_ms: self.audio.min_transcription_ms,
            min_rms_amplitude: self.audio.min_rms_amplitude,
            ..GateConfig::default()
        }
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// Partial updates: only the provided fields change. The result is
    /// re-validated before being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(v) = audio.get("min_segment_ms").and_then(|v| v.as_u64()) {
                self.audio.min_segment_ms = v;
            }
            if let Some(v) = audio.get("max_segment_ms").and_then(|v| v.as_u64()) {
                self.audio.max_segment_ms = v;
            }
            if let Some(v) = audio.get("silence_ms").and_then(|v| v.as_u64()) {
                self.audio.silence_ms = v;
            }
            if let Some(v) = audio.get("silence_amplitude").and_then(|v| v.as_i64()) {
                self.audio.silence_amplitude = v as i16;
            }
            if let Some(v) = audio.get("min_transcription_ms").and_then(|v| v.as_u64()) {
                self.audio.min_transcription_ms = v;
            }
            if let Some(v) = audio.get("min_rms_amplitude").and_then(|v| v.as_f64()) {
                self.audio.min_rms_amplitude = v;
            }
        }

        if let Some(speech) = partial.get("speech") {
            if let Some(v) = speech.get("voice").and_then(|v| v.as_str()) {
                self.speech.voice = v.to_string();
            }
            if let Some(v) = speech.get("default_language").and_then(|v| v.as_str()) {
                self.speech.default_language = v.to_string();
            }
            if let Some(v) = speech.get("system_context").and_then(|v| v.as_str()) {
                self.speech.system_context = v.to_string();
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance
                .get("max_concurrent_calls")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_calls = v as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.playback.frame_samples, 160);
        assert_eq!(config.playback.sample_rate, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.max_segment_ms = config.audio.min_segment_ms;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"silence_ms": 800}, "speech": {"voice": "hi-IN-warm"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.silence_ms, 800);
        assert_eq!(config.speech.voice, "hi-IN-warm");
        // Untouched fields keep their defaults
        assert_eq!(config.audio.min_segment_ms, 3000);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"silence_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}

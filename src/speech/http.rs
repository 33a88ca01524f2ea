//! # HTTP Speech Clients
//!
//! reqwest-backed implementations of the collaborator traits. Each client
//! carries its own request timeout so a hung provider stalls only the call
//! that awaited it, never the process.

use crate::config::SpeechConfig;
use crate::speech::{
    ResponseGenerator, SpeechSynthesizer, SpeechToText, SttResult, SynthesisFormat,
    SynthesizedAudio,
};
use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// Transcription service client: POSTs a WAV buffer, receives
/// `{text, language}`.
pub struct HttpSpeechToText {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    language: String,
}

impl HttpSpeechToText {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            client: build_client(config.request_timeout_secs),
            base_url: config.stt_base_url.clone(),
        }
    }
}

impl SpeechToText for HttpSpeechToText {
    fn transcribe<'a>(
        &'a self,
        wav: &'a [u8],
        language_hint: &'a str,
    ) -> BoxFuture<'a, Result<SttResult>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/transcribe", self.base_url))
                .query(&[("language", language_hint)])
                .header("content-type", "audio/wav")
                .body(wav.to_vec())
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(anyhow!("transcription service error: {}", response.status()));
            }

            let parsed: TranscribeResponse = response.json().await?;
            Ok(SttResult {
                text: parsed.text,
                language: parsed.language,
            })
        })
    }
}

/// Response-generation client: user text + history + system context in,
/// reply string out.
pub struct HttpResponseGenerator {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct RespondRequest<'a> {
    message: &'a str,
    history: &'a [String],
    system_context: &'a str,
}

#[derive(Deserialize)]
struct RespondResponse {
    reply: String,
}

impl HttpResponseGenerator {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            client: build_client(config.request_timeout_secs),
            base_url: config.responder_base_url.clone(),
        }
    }
}

impl ResponseGenerator for HttpResponseGenerator {
    fn generate<'a>(
        &'a self,
        user_text: &'a str,
        history: &'a [String],
        system_context: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let body = RespondRequest {
                message: user_text,
                history,
                system_context,
            };

            let response = self
                .client
                .post(format!("{}/respond", self.base_url))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(anyhow!("response service error: {}", response.status()));
            }

            let parsed: RespondResponse = response.json().await?;
            Ok(parsed.reply.trim().to_string())
        })
    }
}

/// Speech-synthesis client: text + voice in, audio bytes out. Output format
/// is sniffed from the payload — a RIFF header means WAV, anything else is
/// raw PCM at the provider's configured rate.
pub struct HttpSpeechSynthesizer {
    client: Client,
    base_url: String,
    raw_pcm_rate: u32,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            client: build_client(config.request_timeout_secs),
            base_url: config.tts_base_url.clone(),
            raw_pcm_rate: config.tts_raw_pcm_rate,
        }
    }
}

impl SpeechSynthesizer for HttpSpeechSynthesizer {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        language: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SynthesizedAudio>> {
        Box::pin(async move {
            let body = SynthesizeRequest {
                text,
                voice,
                language,
            };

            let response = self
                .client
                .post(format!("{}/synthesize", self.base_url))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(anyhow!("synthesis service error: {}", response.status()));
            }

            let data = response.bytes().await?.to_vec();
            let format = if data.starts_with(b"RIFF") {
                SynthesisFormat::Wav
            } else {
                SynthesisFormat::RawPcm {
                    sample_rate: self.raw_pcm_rate,
                }
            };

            Ok(SynthesizedAudio { data, format })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_request_omits_missing_language() {
        let body = SynthesizeRequest {
            text: "hello",
            voice: "amy",
            language: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("language"));
    }

    #[test]
    fn test_respond_request_shape() {
        let history = vec!["hi".to_string()];
        let body = RespondRequest {
            message: "what are your hours",
            history: &history,
            system_context: "call center agent",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"message\""));
        assert!(json.contains("\"history\""));
        assert!(json.contains("\"system_context\""));
    }
}

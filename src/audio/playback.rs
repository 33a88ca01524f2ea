//! # Playback Pipeline
//!
//! Converts synthesized speech into the carrier's raw PCM requirement
//! (8kHz, 16-bit, mono) and streams it out in real time. The carrier cannot
//! buffer faster-than-real-time audio, so frames are paced with an explicit
//! delay; cancellation is cooperative — the frame loop re-checks the call's
//! playback flag before every send.
//!
//! ## Failure semantics:
//! Every failure is scoped to the one call: empty synthesis, codec errors,
//! and transport send failures all surface as a `false` return with the
//! playback state cleared, never as a crash.

use crate::audio::call::CallSession;
use crate::audio::codec::{bytes_to_pcm, Resampler};
use crate::config::PlaybackConfig;
use crate::speech::{SpeechSynthesizer, SynthesisFormat, SynthesizedAudio};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outbound transport seam: delivers one PCM frame to the carrier.
///
/// The WebSocket actor implements this by forwarding frames to its own
/// mailbox; tests implement it with a collecting fake.
pub trait MediaSink: Send + Sync {
    fn send_frame(&self, ucid: &str, samples: &[i16]) -> Result<(), String>;
}

/// Streams synthesized speech to the carrier for one call at a time.
pub struct PlaybackEngine {
    config: PlaybackConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn MediaSink>,
}

impl PlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        Self {
            config,
            synthesizer,
            sink,
        }
    }

    /// Synthesize `text` and stream it to the call.
    ///
    /// Returns false (without propagating an error) on empty synthesis or
    /// any pipeline failure so callers can continue the call.
    pub async fn play_text(
        &self,
        call: &CallSession,
        text: &str,
        voice: &str,
        language: Option<&str>,
    ) -> bool {
        match self.prepare_speech(call, text, voice, language).await {
            Some(samples) => self.play_audio(call, samples).await,
            None => false,
        }
    }

    /// Synthesize `text` and convert it to carrier PCM without streaming it.
    ///
    /// `None` covers synthesis failure, empty output, and codec errors, so
    /// callers can tell "nothing to play" apart from a stream that stopped
    /// mid-flight.
    pub async fn prepare_speech(
        &self,
        call: &CallSession,
        text: &str,
        voice: &str,
        language: Option<&str>,
    ) -> Option<Vec<i16>> {
        let audio = match self.synthesizer.synthesize(text, voice, language).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(ucid = %call.ucid, "speech synthesis failed: {:#}", e);
                return None;
            }
        };

        if audio.data.is_empty() {
            warn!(ucid = %call.ucid, "speech synthesis returned no audio");
            return None;
        }

        match self.convert_to_carrier_pcm(audio) {
            Ok(samples) if !samples.is_empty() => Some(samples),
            Ok(_) => {
                warn!(ucid = %call.ucid, "synthesis audio converted to zero samples");
                None
            }
            Err(e) => {
                warn!(ucid = %call.ucid, "synthesis audio conversion failed: {}", e);
                None
            }
        }
    }

    /// Stream prepared carrier-rate PCM to the call in paced frames.
    ///
    /// Marks playback active, sends fixed-size frames with the configured
    /// inter-frame delay, and re-checks the call's playback flag before each
    /// send. Returns true only when every frame was delivered.
    pub async fn play_audio(&self, call: &CallSession, samples: Vec<i16>) -> bool {
        call.playback_started(samples.len());
        debug!(
            ucid = %call.ucid,
            samples = samples.len(),
            "starting playback ({} frames)",
            samples.len().div_ceil(self.config.frame_samples)
        );

        for frame in samples.chunks(self.config.frame_samples) {
            if !call.playback_active() {
                debug!(ucid = %call.ucid, "playback cancelled");
                call.playback_finished();
                return false;
            }

            if let Err(e) = self.sink.send_frame(&call.ucid, frame) {
                warn!(ucid = %call.ucid, "playback transport failure: {}", e);
                call.playback_finished();
                return false;
            }
            call.record_samples_sent(frame.len());

            tokio::time::sleep(Duration::from_millis(self.config.frame_interval_ms)).await;
        }

        call.playback_finished();
        true
    }

    /// Cooperative cancellation: flip the flag, let the loop exit on its
    /// next iteration. In-flight sends are not interrupted.
    pub fn stop_playback(call: &CallSession) {
        call.cancel_playback();
    }

    /// Convert synthesis output to carrier PCM (mono 16-bit at the
    /// configured rate). WAV-wrapped audio is parsed and resampled; raw PCM
    /// at a declared rate is resampled directly.
    fn convert_to_carrier_pcm(&self, audio: SynthesizedAudio) -> Result<Vec<i16>, String> {
        let (samples, source_rate) = match audio.format {
            SynthesisFormat::Wav => decode_wav_mono(&audio.data)?,
            SynthesisFormat::RawPcm { sample_rate } => (bytes_to_pcm(&audio.data)?, sample_rate),
        };

        if source_rate == self.config.sample_rate {
            return Ok(samples);
        }

        let resampler = Resampler::new(source_rate, self.config.sample_rate);
        Ok(resampler.resample_pcm(&samples))
    }
}

/// Parse a WAV buffer into mono i16 samples plus its sample rate. Stereo
/// sources are downmixed by averaging channels.
fn decode_wav_mono(data: &[u8]) -> Result<(Vec<i16>, u32), String> {
    let (header, track) = wav::read(&mut Cursor::new(data))
        .map_err(|e| format!("invalid wav from synthesis: {}", e))?;

    let samples = match track {
        wav::BitDepth::Sixteen(samples) => samples,
        other => return Err(format!("unsupported synthesis bit depth: {:?}", other)),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    };

    Ok((mono, header.sampling_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::call::CallRegistry;
    use crate::audio::segmenter::SegmenterConfig;
    use crate::transcription::filter::GateConfig;
    use anyhow::Result;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn playback_config() -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: 8000,
            frame_samples: 160,
            // Keep tests fast; pacing behavior is unchanged.
            frame_interval_ms: 1,
            encoding: crate::config::PayloadEncoding::Pcm16,
        }
    }

    fn call_session() -> (CallRegistry, Arc<CallSession>) {
        let registry = CallRegistry::new(4);
        let call = registry
            .register(
                "C1",
                "1800123",
                SegmenterConfig::default(),
                GateConfig::default(),
                "auto".to_string(),
            )
            .unwrap();
        (registry, call)
    }

    /// Sink that records frames and can fail or cancel after N sends.
    struct FakeSink {
        frames: Mutex<Vec<Vec<i16>>>,
        fail_after: Option<usize>,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                fail_after: None,
            }
        }

        fn failing_after(n: usize) -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                fail_after: Some(n),
            }
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl MediaSink for FakeSink {
        fn send_frame(&self, _ucid: &str, samples: &[i16]) -> Result<(), String> {
            let mut frames = self.frames.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if frames.len() >= limit {
                    return Err("socket closed".to_string());
                }
            }
            frames.push(samples.to_vec());
            Ok(())
        }
    }

    /// Synthesizer returning a fixed WAV buffer.
    struct FakeSynthesizer {
        wav: Vec<u8>,
        calls: AtomicUsize,
    }

    impl FakeSynthesizer {
        fn with_tone(sample_rate: u32, samples: usize) -> Self {
            let pcm: Vec<i16> = (0..samples).map(|i| ((i % 64) as i16) * 400).collect();
            let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
            let mut out = Cursor::new(Vec::new());
            wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut out).unwrap();
            Self {
                wav: out.into_inner(),
                calls: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self {
                wav: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SpeechSynthesizer for FakeSynthesizer {
        fn synthesize<'a>(
            &'a self,
            _text: &'a str,
            _voice: &'a str,
            _language: Option<&'a str>,
        ) -> BoxFuture<'a, Result<SynthesizedAudio>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = self.wav.clone();
            Box::pin(async move {
                Ok(SynthesizedAudio {
                    data,
                    format: SynthesisFormat::Wav,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_play_audio_sends_all_frames() {
        let (_reg, call) = call_session();
        let sink = Arc::new(FakeSink::new());
        let engine = PlaybackEngine::new(
            playback_config(),
            Arc::new(FakeSynthesizer::empty()),
            sink.clone(),
        );

        // 480 samples = 3 full frames of 160
        let samples: Vec<i16> = vec![100; 480];
        assert!(engine.play_audio(&call, samples).await);

        assert_eq!(sink.frame_count(), 3);
        assert!(!call.playback_active());
        assert_eq!(call.playback_snapshot().sent_samples, 480);
    }

    #[tokio::test]
    async fn test_play_audio_partial_final_frame() {
        let (_reg, call) = call_session();
        let sink = Arc::new(FakeSink::new());
        let engine = PlaybackEngine::new(
            playback_config(),
            Arc::new(FakeSynthesizer::empty()),
            sink.clone(),
        );

        assert!(engine.play_audio(&call, vec![1; 200]).await);
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 160);
        assert_eq!(frames[1].len(), 40);
    }

    #[tokio::test]
    async fn test_play_audio_transport_failure_stops_loop() {
        let (_reg, call) = call_session();
        let sink = Arc::new(FakeSink::failing_after(2));
        let engine = PlaybackEngine::new(
            playback_config(),
            Arc::new(FakeSynthesizer::empty()),
            sink.clone(),
        );

        assert!(!engine.play_audio(&call, vec![1; 800]).await);
        assert_eq!(sink.frame_count(), 2);
        assert!(!call.playback_active());
    }

    /// Sink that cancels the call's playback after two delivered frames.
    struct CancellingSink {
        inner: FakeSink,
        call: Arc<CallSession>,
    }

    impl MediaSink for CancellingSink {
        fn send_frame(&self, ucid: &str, samples: &[i16]) -> Result<(), String> {
            self.inner.send_frame(ucid, samples)?;
            if self.inner.frame_count() == 2 {
                PlaybackEngine::stop_playback(&self.call);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_frames() {
        let (_reg, call) = call_session();
        let sink = Arc::new(CancellingSink {
            inner: FakeSink::new(),
            call: call.clone(),
        });
        let engine = PlaybackEngine::new(
            playback_config(),
            Arc::new(FakeSynthesizer::empty()),
            sink.clone(),
        );

        // 5 frames queued, cancellation lands after the second send.
        assert!(!engine.play_audio(&call, vec![1; 800]).await);
        assert_eq!(sink.inner.frame_count(), 2);
        assert!(!call.playback_active());
    }

    #[tokio::test]
    async fn test_play_text_resamples_to_carrier_rate() {
        let (_reg, call) = call_session();
        let sink = Arc::new(FakeSink::new());
        // 16kHz source, 3200 samples = 200ms -> 1600 samples at 8kHz = 10 frames
        let synth = Arc::new(FakeSynthesizer::with_tone(16000, 3200));
        let engine = PlaybackEngine::new(playback_config(), synth.clone(), sink.clone());

        assert!(engine.play_text(&call, "hello caller", "amy", Some("en")).await);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        let sent: usize = sink.frames.lock().unwrap().iter().map(|f| f.len()).sum();
        assert_eq!(sent, 1600);
    }

    #[tokio::test]
    async fn test_play_text_empty_synthesis_returns_false() {
        let (_reg, call) = call_session();
        let sink = Arc::new(FakeSink::new());
        let engine = PlaybackEngine::new(
            playback_config(),
            Arc::new(FakeSynthesizer::empty()),
            sink.clone(),
        );

        assert!(!engine.play_text(&call, "hello", "amy", None).await);
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_decode_wav_downmixes_stereo() {
        let pcm = vec![100i16, 300, -100, -300];
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 2, 16000, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut out).unwrap();

        let (mono, rate) = decode_wav_mono(&out.into_inner()).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(mono, vec![200, -200]);
    }
}

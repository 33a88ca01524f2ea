//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Thread Safety Pattern:
//! - **Arc**: many handlers hold references to the same state
//! - **RwLock**: many readers or one writer for config and metrics
//! - The call registry does its own locking internally

use crate::audio::call::CallRegistry;
use crate::config::AppConfig;
use crate::speech::{ResponseGenerator, SpeechSynthesizer, SpeechToText};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Gateway counters, constantly updated by requests and calls
    pub metrics: Arc<RwLock<GatewayMetrics>>,

    /// All active call sessions, keyed by UCID
    pub calls: Arc<CallRegistry>,

    /// Speech collaborators behind trait objects so tests can swap fakes in
    pub stt: Arc<dyn SpeechToText>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters for the whole gateway since startup.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct GatewayMetrics {
    /// HTTP requests processed
    pub request_count: u64,

    /// HTTP requests that returned an error status
    pub error_count: u64,

    /// Calls registered via the carrier's start event
    pub calls_started: u64,

    /// Calls fully torn down (stop event or connection close)
    pub calls_completed: u64,

    /// Inbound media frames observed across all calls
    pub media_frames: u64,

    /// Audio segments dispatched to transcription
    pub segments_dispatched: u64,

    /// Transcription results kept after all gates
    pub chunks_kept: u64,

    /// Transcription results rejected, keyed by gate name
    pub chunks_rejected: HashMap<String, u64>,

    /// Playbacks started / run to completion / cancelled mid-stream
    pub playbacks_started: u64,
    pub playbacks_completed: u64,
    pub playbacks_cancelled: u64,

    /// Failures from the speech collaborators (any of the three services)
    pub service_errors: u64,

    /// Per-endpoint HTTP statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint HTTP statistics.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        stt: Arc<dyn SpeechToText>,
        responder: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let calls = Arc::new(CallRegistry::new(config.performance.max_concurrent_calls));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
            calls,
            stt,
            responder,
            synthesizer,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; cloning releases the lock
    /// immediately so other threads are not blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_call_started(&self) {
        self.metrics.write().unwrap().calls_started += 1;
    }

    pub fn record_call_completed(&self) {
        self.metrics.write().unwrap().calls_completed += 1;
    }

    pub fn record_media_frame(&self) {
        self.metrics.write().unwrap().media_frames += 1;
    }

    pub fn record_segment_dispatched(&self) {
        self.metrics.write().unwrap().segments_dispatched += 1;
    }

    pub fn record_chunk_kept(&self) {
        self.metrics.write().unwrap().chunks_kept += 1;
    }

    /// Count a gate rejection under the gate's name.
    pub fn record_chunk_rejected(&self, gate: &str) {
        let mut metrics = self.metrics.write().unwrap();
        *metrics.chunks_rejected.entry(gate.to_string()).or_default() += 1;
    }

    pub fn record_playback_started(&self) {
        self.metrics.write().unwrap().playbacks_started += 1;
    }

    pub fn record_playback_completed(&self) {
        self.metrics.write().unwrap().playbacks_completed += 1;
    }

    pub fn record_playback_cancelled(&self) {
        self.metrics.write().unwrap().playbacks_cancelled += 1;
    }

    pub fn record_service_error(&self) {
        self.metrics.write().unwrap().service_errors += 1;
    }

    /// Consistent copy of the metrics for the /metrics endpoint.
    pub fn get_metrics_snapshot(&self) -> GatewayMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{SttResult, SynthesizedAudio};
    use anyhow::Result;
    use futures_util::future::BoxFuture;

    struct NoopSpeech;

    impl SpeechToText for NoopSpeech {
        fn transcribe<'a>(
            &'a self,
            _wav: &'a [u8],
            _language_hint: &'a str,
        ) -> BoxFuture<'a, Result<SttResult>> {
            Box::pin(async { Err(anyhow::anyhow!("noop")) })
        }
    }

    impl ResponseGenerator for NoopSpeech {
        fn generate<'a>(
            &'a self,
            _user_text: &'a str,
            _history: &'a [String],
            _system_context: &'a str,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async { Err(anyhow::anyhow!("noop")) })
        }
    }

    impl SpeechSynthesizer for NoopSpeech {
        fn synthesize<'a>(
            &'a self,
            _text: &'a str,
            _voice: &'a str,
            _language: Option<&'a str>,
        ) -> BoxFuture<'a, Result<SynthesizedAudio>> {
            Box::pin(async { Err(anyhow::anyhow!("noop")) })
        }
    }

    fn state() -> AppState {
        let speech = Arc::new(NoopSpeech);
        AppState::new(
            crate::config::AppConfig::default(),
            speech.clone(),
            speech.clone(),
            speech,
        )
    }

    #[test]
    fn test_call_and_chunk_counters() {
        let state = state();
        state.record_call_started();
        state.record_chunk_kept();
        state.record_chunk_rejected("hallucination");
        state.record_chunk_rejected("hallucination");
        state.record_chunk_rejected("too_quiet");

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.calls_started, 1);
        assert_eq!(snapshot.chunks_kept, 1);
        assert_eq!(snapshot.chunks_rejected["hallucination"], 2);
        assert_eq!(snapshot.chunks_rejected["too_quiet"], 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_config_update_validates() {
        let state = state();
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());

        let mut good = state.get_config();
        good.audio.silence_ms = 700;
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.get_config().audio.silence_ms, 700);
    }
}

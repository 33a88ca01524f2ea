//! # Call Session Management
//!
//! Per-call state for the streaming pipeline, keyed by the carrier-assigned
//! UCID. Every map entry is created on the carrier's `start` event and fully
//! removed on `stop` or connection close so state never accumulates across
//! calls.
//!
//! ## Re-entrancy guards:
//! Each call carries two single-permit semaphores — one for "transcription
//! in flight", one for "playback in flight". Work begins only after a
//! successful try-acquire, and the owned permit is dropped on every exit
//! path, so overlapping triggers for the same call are structurally inert
//! rather than guarded by convention.

use crate::audio::segmenter::{AudioSegmenter, SegmenterConfig};
use crate::transcription::filter::GateConfig;
use crate::transcription::session::TranscriptSession;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Outbound playback bookkeeping for one call.
///
/// At most one playback is active per call; the `active` flag doubles as the
/// cooperative cancellation signal the frame loop re-checks between sends.
#[derive(Debug, Default, Clone)]
pub struct PlaybackState {
    pub active: bool,
    pub total_samples: usize,
    pub sent_samples: usize,
    pub started_at: Option<DateTime<Utc>>,
}

/// State for one phone call.
pub struct CallSession {
    /// Carrier-assigned unique call identifier
    pub ucid: String,

    /// Dialed number the carrier reported on `start`
    pub called_number: String,

    pub started_at: DateTime<Utc>,

    /// Inbound media frames observed (including the discarded first frame)
    media_packets: AtomicU64,

    /// The carrier's very first media frame arrives at a different,
    /// unusable sample rate and is discarded unconditionally
    first_packet_seen: AtomicBool,

    pub segmenter: Mutex<AudioSegmenter>,
    pub transcript: Mutex<TranscriptSession>,

    /// Gate thresholds frozen at call start; runtime config updates apply to
    /// later calls
    pub gates: GateConfig,

    playback: Mutex<PlaybackState>,

    transcription_guard: Arc<Semaphore>,
    playback_guard: Arc<Semaphore>,
}

impl CallSession {
    pub fn new(
        ucid: String,
        called_number: String,
        segmenter_config: SegmenterConfig,
        gate_config: GateConfig,
        default_language: String,
    ) -> Self {
        Self {
            ucid,
            called_number,
            started_at: Utc::now(),
            media_packets: AtomicU64::new(0),
            first_packet_seen: AtomicBool::new(false),
            segmenter: Mutex::new(AudioSegmenter::new(segmenter_config)),
            transcript: Mutex::new(TranscriptSession::new(default_language, gate_config.clone())),
            gates: gate_config,
            playback: Mutex::new(PlaybackState::default()),
            transcription_guard: Arc::new(Semaphore::new(1)),
            playback_guard: Arc::new(Semaphore::new(1)),
        }
    }

    /// Count a media frame; returns true when this is the call's first frame
    /// and the caller must discard it.
    pub fn observe_media_packet(&self) -> bool {
        self.media_packets.fetch_add(1, Ordering::SeqCst);
        !self.first_packet_seen.swap(true, Ordering::SeqCst)
    }

    pub fn media_packet_count(&self) -> u64 {
        self.media_packets.load(Ordering::SeqCst)
    }

    /// Try to start a transcription; `None` while one is already in flight.
    pub fn try_begin_transcription(&self) -> Option<OwnedSemaphorePermit> {
        self.transcription_guard.clone().try_acquire_owned().ok()
    }

    /// Wait for the transcription guard and take it. Used at teardown, after
    /// the call has left the registry, so an in-flight transcription can
    /// finish and record its chunk before the final drain.
    pub async fn begin_transcription(&self) -> Option<OwnedSemaphorePermit> {
        self.transcription_guard.clone().acquire_owned().await.ok()
    }

    /// Try to start the response/playback pipeline; `None` while one is
    /// already in flight (the chunk is dropped, not queued).
    pub fn try_begin_playback(&self) -> Option<OwnedSemaphorePermit> {
        self.playback_guard.clone().try_acquire_owned().ok()
    }

    /// Mark playback active for `total_samples` samples.
    pub fn playback_started(&self, total_samples: usize) {
        let mut state = self.playback.lock().unwrap();
        state.active = true;
        state.total_samples = total_samples;
        state.sent_samples = 0;
        state.started_at = Some(Utc::now());
    }

    /// Whether the frame loop should keep sending.
    pub fn playback_active(&self) -> bool {
        self.playback.lock().unwrap().active
    }

    pub fn record_samples_sent(&self, samples: usize) {
        self.playback.lock().unwrap().sent_samples += samples;
    }

    /// Cooperative cancellation: the in-flight frame loop observes the
    /// cleared flag on its next iteration and exits.
    pub fn cancel_playback(&self) {
        self.playback.lock().unwrap().active = false;
    }

    /// Clear playback state after the loop exits (completed or aborted).
    pub fn playback_finished(&self) {
        let mut state = self.playback.lock().unwrap();
        state.active = false;
    }

    pub fn playback_snapshot(&self) -> PlaybackState {
        self.playback.lock().unwrap().clone()
    }
}

/// Diagnostic view of one active call for the /api/v1/calls endpoint.
#[derive(Debug, serde::Serialize)]
pub struct CallSummary {
    pub ucid: String,
    pub called_number: String,
    pub started_at: DateTime<Utc>,
    pub media_packets: u64,
    pub transcript_chunks: usize,
    pub transcript_errors: u32,
    pub playback_active: bool,
}

/// Owner of all per-call state, keyed by UCID.
///
/// ## Thread Safety:
/// RwLock over the map: media handling for many calls reads concurrently,
/// start/stop events take the write lock briefly.
pub struct CallRegistry {
    calls: RwLock<HashMap<String, Arc<CallSession>>>,
    max_concurrent_calls: usize,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_concurrent_calls,
        }
    }

    /// Register a call on the carrier's `start` event.
    pub fn register(
        &self,
        ucid: &str,
        called_number: &str,
        segmenter_config: SegmenterConfig,
        gate_config: GateConfig,
        default_language: String,
    ) -> Result<Arc<CallSession>, String> {
        let mut calls = self.calls.write().unwrap();

        if calls.len() >= self.max_concurrent_calls {
            return Err(format!(
                "maximum concurrent calls ({}) reached",
                self.max_concurrent_calls
            ));
        }
        if calls.contains_key(ucid) {
            return Err(format!("call '{}' already registered", ucid));
        }

        let session = Arc::new(CallSession::new(
            ucid.to_string(),
            called_number.to_string(),
            segmenter_config,
            gate_config,
            default_language,
        ));
        calls.insert(ucid.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, ucid: &str) -> Option<Arc<CallSession>> {
        self.calls.read().unwrap().get(ucid).cloned()
    }

    /// Remove a call's state entirely (on `stop` or connection close).
    pub fn remove(&self, ucid: &str) -> Option<Arc<CallSession>> {
        self.calls.write().unwrap().remove(ucid)
    }

    pub fn active_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn summaries(&self) -> Vec<CallSummary> {
        let calls = self.calls.read().unwrap();
        calls
            .values()
            .map(|call| {
                let transcript = call.transcript.lock().unwrap();
                CallSummary {
                    ucid: call.ucid.clone(),
                    called_number: call.called_number.clone(),
                    started_at: call.started_at,
                    media_packets: call.media_packet_count(),
                    transcript_chunks: transcript.chunks().len(),
                    transcript_errors: transcript.error_count(),
                    playback_active: call.playback_active(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CallRegistry {
        CallRegistry::new(2)
    }

    fn register(reg: &CallRegistry, ucid: &str) -> Arc<CallSession> {
        reg.register(
            ucid,
            "1800123",
            SegmenterConfig::default(),
            GateConfig::default(),
            "auto".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_register_get_remove() {
        let reg = registry();
        register(&reg, "C1");
        assert!(reg.get("C1").is_some());
        assert_eq!(reg.active_count(), 1);

        assert!(reg.remove("C1").is_some());
        assert!(reg.get("C1").is_none());
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn test_duplicate_and_limit_rejected() {
        let reg = registry();
        register(&reg, "C1");
        assert!(reg
            .register(
                "C1",
                "1800123",
                SegmenterConfig::default(),
                GateConfig::default(),
                "auto".to_string()
            )
            .is_err());

        register(&reg, "C2");
        assert!(reg
            .register(
                "C3",
                "1800123",
                SegmenterConfig::default(),
                GateConfig::default(),
                "auto".to_string()
            )
            .is_err());
    }

    #[test]
    fn test_first_packet_flag() {
        let reg = registry();
        let call = register(&reg, "C1");
        assert!(call.observe_media_packet());
        assert!(!call.observe_media_packet());
        assert!(!call.observe_media_packet());
        assert_eq!(call.media_packet_count(), 3);
    }

    #[test]
    fn test_transcription_guard_is_exclusive() {
        let reg = registry();
        let call = register(&reg, "C1");

        let permit = call.try_begin_transcription();
        assert!(permit.is_some());
        assert!(call.try_begin_transcription().is_none());

        drop(permit);
        assert!(call.try_begin_transcription().is_some());
    }

    #[test]
    fn test_playback_guard_is_independent_of_transcription_guard() {
        let reg = registry();
        let call = register(&reg, "C1");

        let _t = call.try_begin_transcription().unwrap();
        assert!(call.try_begin_playback().is_some());
    }

    #[test]
    fn test_playback_state_lifecycle() {
        let reg = registry();
        let call = register(&reg, "C1");

        assert!(!call.playback_active());
        call.playback_started(800);
        assert!(call.playback_active());

        call.record_samples_sent(160);
        call.record_samples_sent(160);
        let snapshot = call.playback_snapshot();
        assert_eq!(snapshot.total_samples, 800);
        assert_eq!(snapshot.sent_samples, 320);

        call.cancel_playback();
        assert!(!call.playback_active());
    }
}

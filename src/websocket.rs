//! # Carrier WebSocket Handler
//!
//! The telephony carrier connects to `/ws/telephony` and exchanges JSON text
//! frames. Each connection carries one call.
//!
//! ## Carrier Protocol:
//! 1. **start**: call setup; carries the UCID and the dialed number
//! 2. **media**: one frame of inbound PCM samples with its format
//! 3. **stop**: call teardown
//!
//! Outbound, the gateway sends `media` events with synthesized audio and
//! control commands (`clearBuffer`, `callDisconnect`).
//!
//! ## Pipeline:
//! Media frames feed the call's segmenter; when a segment endpoints, it is
//! gated, transcribed, answered, and spoken back — all off the actor thread
//! in a spawned task so the connection never blocks on a speech service.
//! Per-call permits keep at most one transcription and one playback in
//! flight; a trigger that finds its stage busy drops its work instead of
//! queueing.

use crate::audio::call::CallSession;
use crate::audio::codec::{encode_mulaw, rms_amplitude};
use crate::audio::playback::{MediaSink, PlaybackEngine};
use crate::config::{AppConfig, PayloadEncoding, PlaybackConfig};
use crate::state::AppState;
use crate::transcription::filter::{check_segment, GateConfig};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One media frame's payload, as the carrier formats it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPayload {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,
    #[serde(default = "default_channel_count")]
    pub channel_count: u16,
    #[serde(default)]
    pub number_of_frames: u32,
    #[serde(rename = "type", default)]
    pub kind: String,
}

fn default_bits_per_sample() -> u16 {
    16
}

fn default_channel_count() -> u16 {
    1
}

/// Inbound carrier events, tagged by the `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierEvent {
    Start {
        ucid: String,
        #[serde(default)]
        did: Option<String>,
    },
    Media {
        ucid: String,
        data: MediaPayload,
    },
    Stop {
        ucid: String,
    },
}

/// WebSocket actor for one carrier connection.
pub struct TelephonyWebSocket {
    state: web::Data<AppState>,

    /// Config snapshot taken at connection time; runtime updates apply to
    /// later connections
    config: AppConfig,

    /// Correlation id for log lines before a UCID is known
    conn_id: uuid::Uuid,

    /// UCID of the call bound to this connection, once started
    ucid: Option<String>,

    last_heartbeat: Instant,
}

impl TelephonyWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let config = state.get_config();
        Self {
            state,
            config,
            conn_id: uuid::Uuid::new_v4(),
            ucid: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_start(&mut self, ucid: String, did: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(existing) = &self.ucid {
            warn!(
                ucid = %ucid,
                existing = %existing,
                "start event on a connection that already carries a call"
            );
            return;
        }

        let called_number = did.unwrap_or_default();
        let result = self.state.calls.register(
            &ucid,
            &called_number,
            self.config.segmenter_config(),
            self.config.gate_config(),
            self.config.speech.default_language.clone(),
        );

        match result {
            Ok(_) => {
                self.ucid = Some(ucid.clone());
                self.state.record_call_started();
                info!(ucid = %ucid, did = %called_number, "call started");
            }
            Err(e) => {
                // The connection stays open for control traffic; only the
                // call itself is refused.
                warn!(conn = %self.conn_id, ucid = %ucid, "rejecting call: {}", e);
                send_control(ctx, "callDisconnect");
            }
        }
    }

    fn handle_media(&mut self, ucid: &str, data: MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(call) = self.state.calls.get(ucid) else {
            debug!(ucid = %ucid, "media for unknown call, ignoring");
            return;
        };

        let gates = self.config.gate_config();
        if let Some((wav, segment_ms, permit)) = ingest_media(&self.state, &call, &data, &gates) {
            let sink: Arc<dyn MediaSink> = Arc::new(ActorMediaSink {
                recipient: ctx.address().recipient(),
            });
            tokio::spawn(transcribe_and_respond(
                self.state.get_ref().clone(),
                call,
                sink,
                wav,
                segment_ms,
                permit,
            ));
        }
    }

    fn handle_stop(&mut self, ucid: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(call) = self.state.calls.remove(ucid) else {
            debug!(ucid = %ucid, "stop for unknown call, ignoring");
            return;
        };

        if call.playback_active() {
            call.cancel_playback();
            send_control(ctx, "clearBuffer");
        }

        tokio::spawn(finalize_call(self.state.get_ref().clone(), call));
        if self.ucid.as_deref() == Some(ucid) {
            self.ucid = None;
        }
    }
}

/// Remove the call's state when the connection drops without a stop event.
fn cleanup_on_close(state: &AppState, ucid: &str) {
    if let Some(call) = state.calls.remove(ucid) {
        info!(ucid = %ucid, "connection closed without stop");
        call.cancel_playback();
        tokio::spawn(finalize_call(state.clone(), call));
    }
}

/// Final drain on call teardown: any audio still buffered goes through the
/// same gates and, if it survives, one last transcription — so speech cut
/// off by the hangup still lands in the transcript. Then log the summary
/// and count the call as completed.
pub(crate) async fn finalize_call(state: AppState, call: Arc<CallSession>) {
    // Wait for any in-flight transcription to land its chunk first; the call
    // is already out of the registry, so nothing else can take the permit.
    let permit = call.begin_transcription().await;

    let drained = {
        let mut segmenter = call.segmenter.lock().unwrap();
        let info = segmenter.info();
        if info.total_samples == 0 {
            None
        } else {
            let rms = rms_amplitude(segmenter.samples());
            let wav = match check_segment(&info, rms, &call.gates) {
                Ok(()) => segmenter.to_wav_buffer(),
                Err(rejection) => {
                    state.record_chunk_rejected(rejection.gate_name());
                    None
                }
            };
            segmenter.reset();
            wav.map(|wav| (wav, info.duration_ms))
        }
    };

    if let (Some((wav, segment_ms)), Some(_permit)) = (drained, permit) {
        state.record_segment_dispatched();
        let hint = call.transcript.lock().unwrap().language().to_string();
        let started = Instant::now();
        match state.stt.transcribe(&wav, &hint).await {
            Ok(stt) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let mut transcript = call.transcript.lock().unwrap();
                transcript.set_language(stt.language.clone());
                let language = transcript.language().to_string();
                match transcript.push_result(&stt.text, &language, segment_ms, latency_ms) {
                    Ok(_) => state.record_chunk_kept(),
                    Err(rejection) => state.record_chunk_rejected(rejection.gate_name()),
                }
            }
            Err(e) => {
                warn!(ucid = %call.ucid, "final-drain transcription failed: {:#}", e);
                state.record_service_error();
                call.transcript.lock().unwrap().record_error();
            }
        }
    }

    let summary = call.transcript.lock().unwrap().finalize();
    info!(
        ucid = %call.ucid,
        chunks = summary.total_chunks,
        audio_ms = summary.total_audio_ms,
        errors = summary.error_count,
        transcript = %summary.transcript,
        "call ended"
    );
    state.record_call_completed();
}

fn send_control(ctx: &mut ws::WebsocketContext<TelephonyWebSocket>, command: &str) {
    ctx.text(json!({ "command": command }).to_string());
}

/// Feed one media frame into the call and, when a segment is ready and
/// passes the pre-dispatch gates, drain it as a WAV buffer.
///
/// Returns `None` in the common cases: frame accumulated but no segment
/// ready, the call's first frame (always discarded), a transcription already
/// in flight (the buffer is kept and retried on the next frame), or a gate
/// rejection (the buffer is reset).
pub(crate) fn ingest_media(
    state: &AppState,
    call: &Arc<CallSession>,
    payload: &MediaPayload,
    gates: &GateConfig,
) -> Option<(Vec<u8>, u64, OwnedSemaphorePermit)> {
    state.record_media_frame();

    // The carrier's first media frame arrives at an unrelated sample rate.
    if call.observe_media_packet() {
        debug!(ucid = %call.ucid, rate = payload.sample_rate, "discarding first media frame");
        return None;
    }

    let mut segmenter = call.segmenter.lock().unwrap();
    segmenter.add_samples(&payload.samples, payload.sample_rate);

    if !segmenter.should_send() {
        return None;
    }

    let permit = call.try_begin_transcription()?;

    let info = segmenter.info();
    let rms = rms_amplitude(segmenter.samples());
    if let Err(rejection) = check_segment(&info, rms, gates) {
        debug!(
            ucid = %call.ucid,
            gate = rejection.gate_name(),
            duration_ms = info.duration_ms,
            "segment rejected before dispatch"
        );
        state.record_chunk_rejected(rejection.gate_name());
        segmenter.reset();
        return None;
    }

    let wav = segmenter.to_wav_buffer()?;
    segmenter.reset();
    state.record_segment_dispatched();
    Some((wav, info.duration_ms, permit))
}

/// The per-segment pipeline: transcribe, gate the result, generate a reply,
/// synthesize and stream it back. Runs as a spawned task; the transcription
/// permit is held until the result is recorded, the playback permit for the
/// rest.
pub(crate) async fn transcribe_and_respond(
    state: AppState,
    call: Arc<CallSession>,
    sink: Arc<dyn MediaSink>,
    wav: Vec<u8>,
    segment_ms: u64,
    permit: OwnedSemaphorePermit,
) {
    let config = state.get_config();

    let hint = call.transcript.lock().unwrap().language().to_string();
    let started = Instant::now();
    let stt = match state.stt.transcribe(&wav, &hint).await {
        Ok(result) => result,
        Err(e) => {
            warn!(ucid = %call.ucid, "transcription failed: {:#}", e);
            state.record_service_error();
            call.transcript.lock().unwrap().record_error();
            drop(permit);

            // One apology attempt, skipped when a reply is already playing.
            if let Some(playback_permit) = call.try_begin_playback() {
                let engine =
                    PlaybackEngine::new(config.playback.clone(), state.synthesizer.clone(), sink);
                state.record_playback_started();
                if engine
                    .play_text(&call, &config.speech.apology_text, &config.speech.voice, None)
                    .await
                {
                    state.record_playback_completed();
                } else {
                    state.record_playback_cancelled();
                }
                drop(playback_permit);
            }
            return;
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let (text, language, history) = {
        let mut transcript = call.transcript.lock().unwrap();
        transcript.set_language(stt.language.clone());
        let language = transcript.language().to_string();

        let text = match transcript.push_result(&stt.text, &language, segment_ms, latency_ms) {
            Ok(chunk) => chunk.text.clone(),
            Err(rejection) => {
                debug!(
                    ucid = %call.ucid,
                    gate = rejection.gate_name(),
                    text = %stt.text,
                    "transcription result rejected"
                );
                state.record_chunk_rejected(rejection.gate_name());
                return;
            }
        };
        state.record_chunk_kept();
        debug!(ucid = %call.ucid, latency_ms, text = %text, "transcription chunk accepted");

        let chunks = transcript.chunks();
        let history: Vec<String> = chunks[..chunks.len() - 1]
            .iter()
            .map(|c| c.text.clone())
            .collect();
        (text, language, history)
    };
    drop(permit);

    // A reply is already being spoken: drop this chunk rather than queue it.
    let Some(playback_permit) = call.try_begin_playback() else {
        debug!(ucid = %call.ucid, "playback busy, dropping chunk");
        return;
    };

    let engine = PlaybackEngine::new(config.playback.clone(), state.synthesizer.clone(), sink);

    let reply = match state
        .responder
        .generate(&text, &history, &config.speech.system_context)
        .await
    {
        Ok(reply) if !reply.is_empty() => reply,
        Ok(_) => {
            debug!(ucid = %call.ucid, "empty reply, nothing to play");
            drop(playback_permit);
            return;
        }
        Err(e) => {
            warn!(ucid = %call.ucid, "response generation failed: {:#}", e);
            state.record_service_error();
            call.transcript.lock().unwrap().record_error();

            state.record_playback_started();
            if engine
                .play_text(&call, &config.speech.apology_text, &config.speech.voice, Some(&language))
                .await
            {
                state.record_playback_completed();
            } else {
                state.record_playback_cancelled();
            }
            drop(playback_permit);
            return;
        }
    };

    state.record_playback_started();
    let delivered = match engine
        .prepare_speech(&call, &reply, &config.speech.voice, Some(&language))
        .await
    {
        Some(samples) => engine.play_audio(&call, samples).await,
        None => {
            // Synthesis or codec trouble: try the one apology line instead.
            state.record_service_error();
            call.transcript.lock().unwrap().record_error();
            engine
                .play_text(&call, &config.speech.apology_text, &config.speech.voice, Some(&language))
                .await
        }
    };
    if delivered {
        state.record_playback_completed();
    } else {
        state.record_playback_cancelled();
    }
    drop(playback_permit);
}

/// Serialize one outbound media frame in the carrier's envelope, applying
/// the configured wire encoding.
pub(crate) fn outbound_media_json(ucid: &str, samples: &[i16], config: &PlaybackConfig) -> String {
    let data = match config.encoding {
        PayloadEncoding::Pcm16 => json!({
            "samples": samples,
            "bitsPerSample": 16,
            "sampleRate": config.sample_rate,
            "channelCount": 1,
            "numberOfFrames": samples.len(),
            "type": "data"
        }),
        PayloadEncoding::Mulaw => json!({
            "samples": encode_mulaw(samples),
            "bitsPerSample": 8,
            "sampleRate": config.sample_rate,
            "channelCount": 1,
            "numberOfFrames": samples.len(),
            "type": "data"
        }),
    };

    json!({ "event": "media", "ucid": ucid, "data": data }).to_string()
}

/// One synthesized frame headed for the carrier.
#[derive(Message)]
#[rtype(result = "()")]
pub(crate) struct OutboundFrame {
    pub ucid: String,
    pub samples: Vec<i16>,
}

/// Bridges the playback frame loop to the actor's mailbox.
struct ActorMediaSink {
    recipient: Recipient<OutboundFrame>,
}

impl MediaSink for ActorMediaSink {
    fn send_frame(&self, ucid: &str, samples: &[i16]) -> Result<(), String> {
        self.recipient
            .try_send(OutboundFrame {
                ucid: ucid.to_string(),
                samples: samples.to_vec(),
            })
            .map_err(|e| format!("actor mailbox send failed: {}", e))
    }
}

impl Actor for TelephonyWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(conn = %self.conn_id, "carrier connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(conn = %act.conn_id, "carrier heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(conn = %self.conn_id, "carrier connection stopped");
        if let Some(ucid) = self.ucid.take() {
            cleanup_on_close(&self.state, &ucid);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<CarrierEvent>(&text) {
                Ok(CarrierEvent::Start { ucid, did }) => self.handle_start(ucid, did, ctx),
                Ok(CarrierEvent::Media { ucid, data }) => self.handle_media(&ucid, data, ctx),
                Ok(CarrierEvent::Stop { ucid }) => self.handle_stop(&ucid, ctx),
                Err(e) => {
                    warn!("unparseable carrier event: {}", e);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("unexpected binary frame from carrier");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("carrier closed connection: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame from carrier");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("websocket protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for TelephonyWebSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(outbound_media_json(&msg.ucid, &msg.samples, &self.config.playback));
    }
}

/// HTTP entry point: upgrades the carrier's request to a WebSocket and hands
/// it to the actor.
pub async fn telephony_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "new carrier connection request"
    );
    ws::start(TelephonyWebSocket::new(app_state), &req, stream)
}

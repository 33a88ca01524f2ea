//! # Call Inspection Endpoints
//!
//! Read-only views over the call registry for operators.

use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/calls — summaries of every active call.
pub async fn list_calls(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let summaries = state.calls.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_calls": summaries.len(),
        "calls": summaries
    })))
}

/// GET /api/v1/calls/{ucid} — one call's summary plus playback progress.
pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let ucid = path.into_inner();
    let call = state
        .calls
        .get(&ucid)
        .ok_or_else(|| AppError::NotFound(format!("no active call with ucid '{}'", ucid)))?;

    let playback = call.playback_snapshot();
    let segment = call.segmenter.lock().unwrap().info();
    let transcript = call.transcript.lock().unwrap();

    Ok(HttpResponse::Ok().json(json!({
        "ucid": call.ucid,
        "called_number": call.called_number,
        "started_at": call.started_at,
        "media_packets": call.media_packet_count(),
        "segment": {
            "buffered_samples": segment.total_samples,
            "buffered_ms": segment.duration_ms
        },
        "transcript": {
            "chunks": transcript.chunks().len(),
            "errors": transcript.error_count(),
            "text": transcript.finalize().transcript
        },
        "playback": {
            "active": playback.active,
            "total_samples": playback.total_samples,
            "sent_samples": playback.sent_samples
        }
    })))
}

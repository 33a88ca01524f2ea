//! # Configuration Endpoints
//!
//! GET returns the active configuration; PUT applies a partial JSON update
//! and re-validates before accepting. Updated thresholds apply to calls
//! registered after the update; in-flight calls keep the thresholds they
//! started with.

use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

/// Serializable view of the config. Collaborator URLs are included but the
/// system-context string is elided to keep responses small.
fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "min_segment_ms": config.audio.min_segment_ms,
            "max_segment_ms": config.audio.max_segment_ms,
            "silence_ms": config.audio.silence_ms,
            "silence_amplitude": config.audio.silence_amplitude,
            "min_transcription_ms": config.audio.min_transcription_ms,
            "min_rms_amplitude": config.audio.min_rms_amplitude
        },
        "speech": {
            "stt_base_url": config.speech.stt_base_url,
            "responder_base_url": config.speech.responder_base_url,
            "tts_base_url": config.speech.tts_base_url,
            "voice": config.speech.voice,
            "default_language": config.speech.default_language
        },
        "playback": {
            "sample_rate": config.playback.sample_rate,
            "frame_samples": config.playback.frame_samples,
            "frame_interval_ms": config.playback.frame_interval_ms,
            "encoding": config.playback.encoding
        },
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls
        }
    })
}

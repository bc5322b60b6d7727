use axum::{extract::rejection::JsonRejection, http::StatusCode, http::Uri, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::hub::HubHandle;
use crate::events::{Command, StatusReport};

type ApiResponse = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl ToString) -> ApiResponse {
    (
        status,
        Json(json!({"status": "error", "message": message.to_string()})),
    )
}

/// A body that failed to extract. Nothing is applied.
fn bad_body(rejection: JsonRejection) -> ApiResponse {
    warn!("rejected request body: {rejection}");
    error(StatusCode::BAD_REQUEST, rejection)
}

pub async fn index() -> &'static str {
    "yt-remote backend\n\nsocket namespaces:\n  /extension  browser extension relay\n  /mobile     remote control clients\n"
}

pub async fn get_status(hub: Extension<HubHandle>) -> Json<StatusReport> {
    Json(hub.status().await)
}

#[derive(Deserialize)]
pub struct SystemVolumeBody {
    volume: Option<f64>,
}

pub async fn set_system_volume(
    hub: Extension<HubHandle>,
    body: Result<Json<SystemVolumeBody>, JsonRejection>,
) -> ApiResponse {
    let requested = match body {
        Ok(Json(body)) => body.volume.unwrap_or(50.0),
        Err(rejection) => return bad_body(rejection),
    };
    let level = requested.clamp(0.0, 100.0).round() as u8;

    let volume = hub.volume();
    match tokio::task::spawn_blocking(move || volume.set_volume(level)).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"status": "success", "volume": level})),
        ),
        Ok(false) => error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to set volume"),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

pub async fn toggle_system_mute(hub: Extension<HubHandle>) -> ApiResponse {
    let volume = hub.volume();
    match tokio::task::spawn_blocking(move || volume.toggle_mute()).await {
        Ok(Some(muted)) => (
            StatusCode::OK,
            Json(json!({"status": "success", "muted": muted})),
        ),
        Ok(None) => error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to toggle mute"),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn forward(hub: &HubHandle, command: Command) -> ApiResponse {
    if !hub.extension_connected() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Extension not connected");
    }
    match hub.send_command(&command) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "success"}))),
        Err(err) => {
            warn!("legacy {} failed: {err}", command.action());
            error(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

pub async fn youtube_play_pause(hub: Extension<HubHandle>) -> ApiResponse {
    forward(&hub, Command::PlayPause)
}

#[derive(Deserialize)]
pub struct SeekBody {
    time: Option<f64>,
}

pub async fn youtube_seek(
    hub: Extension<HubHandle>,
    body: Result<Json<SeekBody>, JsonRejection>,
) -> ApiResponse {
    let value = match body {
        Ok(Json(body)) => body.time.unwrap_or(0.0),
        Err(rejection) => return bad_body(rejection),
    };
    forward(&hub, Command::Seek { value })
}

#[derive(Deserialize)]
pub struct VolumeBody {
    volume: Option<f64>,
}

pub async fn youtube_set_volume(
    hub: Extension<HubHandle>,
    body: Result<Json<VolumeBody>, JsonRejection>,
) -> ApiResponse {
    let value = match body {
        Ok(Json(body)) => body.volume.unwrap_or(100.0),
        Err(rejection) => return bad_body(rejection),
    };
    forward(&hub, Command::SetVolume { value })
}

pub async fn youtube_next(hub: Extension<HubHandle>) -> ApiResponse {
    forward(&hub, Command::Next)
}

pub async fn youtube_previous(hub: Extension<HubHandle>) -> ApiResponse {
    forward(&hub, Command::Previous)
}

pub async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {}", uri))
}

//! HTTP calls the remote control makes besides its socket.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered {0}")]
    Status(StatusCode),
}

#[derive(Deserialize)]
struct MuteReply {
    muted: bool,
}

#[derive(Debug, Clone)]
pub struct BackendApi {
    base: String,
    http: reqwest::Client,
}

impl BackendApi {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn set_system_volume(&self, volume: u8) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.url("/api/system/volume"))
            .json(&json!({ "volume": volume }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        Ok(())
    }

    /// Flips the host's mute and returns the new state.
    pub async fn toggle_mute(&self) -> Result<bool, ApiError> {
        let resp = self.http.post(self.url("/api/system/mute")).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        let reply: MuteReply = resp.json().await?;
        Ok(reply.muted)
    }
}

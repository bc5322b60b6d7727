//! Settings flow of the extension popup.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::storage::{ExtensionStorage, StorageError};

pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PopupError {
    #[error("Please enter a backend URL")]
    EmptyUrl,
    #[error("Invalid URL format")]
    InvalidUrl,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub fn validate_backend_url(input: &str) -> Result<Url, PopupError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PopupError::EmptyUrl);
    }
    let url = Url::parse(input).map_err(|_| PopupError::InvalidUrl)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PopupError::InvalidUrl);
    }
    Ok(url)
}

/// `GET <base>/api/status`; any 2xx within the timeout counts as reachable.
pub async fn test_connection(client: &reqwest::Client, base: &str) -> bool {
    let target = format!("{}/api/status", base.trim_end_matches('/'));
    match client.get(&target).timeout(CONNECTION_TEST_TIMEOUT).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(err) => {
            warn!("connection test to {target} failed: {err}");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub connected: bool,
    pub message: &'static str,
}

/// Validates and tests the URL, then stores it with the test result.
/// The URL is stored even when the backend cannot be reached.
pub async fn save_settings(
    storage: &ExtensionStorage,
    client: &reqwest::Client,
    input: &str,
) -> Result<SaveOutcome, PopupError> {
    validate_backend_url(input)?;
    let url = input.trim();

    let connected = test_connection(client, url).await;
    storage.update(|s| {
        s.backend_url = Some(url.to_owned());
        s.connected = connected;
    })?;
    info!(url, connected, "backend url saved");

    Ok(SaveOutcome {
        connected,
        message: if connected {
            "Settings saved successfully!"
        } else {
            "Could not connect to backend. Please check the URL and make sure the backend is running."
        },
    })
}

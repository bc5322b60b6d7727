//! Extension-local storage: a small JSON document shared by the relay and the
//! configuration popup, with change notifications.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("storage file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSettings {
    #[serde(rename = "backendUrl", default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub connected: bool,
}

impl StoredSettings {
    pub fn backend_url(&self) -> &str {
        self.backend_url.as_deref().unwrap_or(DEFAULT_BACKEND_URL)
    }
}

pub struct ExtensionStorage {
    path: Option<PathBuf>,
    current: watch::Sender<StoredSettings>,
}

impl ExtensionStorage {
    /// Opens the store at `path`. A missing file reads as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let settings = read_file(&path)?;
        let (current, _) = watch::channel(settings);
        Ok(Self {
            path: Some(path),
            current,
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        let (current, _) = watch::channel(StoredSettings::default());
        Self {
            path: None,
            current,
        }
    }

    pub fn settings(&self) -> StoredSettings {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoredSettings> {
        self.current.subscribe()
    }

    pub fn set_backend_url(&self, url: &str) -> Result<(), StorageError> {
        self.update(|s| s.backend_url = Some(url.to_owned()))
    }

    pub fn set_connected(&self, connected: bool) -> Result<(), StorageError> {
        self.update(|s| s.connected = connected)
    }

    /// Read-modify-write against the file, so keys written by another
    /// process in the meantime survive. Subscribers hear about it only when
    /// something changed.
    pub fn update(&self, f: impl FnOnce(&mut StoredSettings)) -> Result<(), StorageError> {
        let mut settings = match &self.path {
            Some(path) => read_file(path)?,
            None => self.settings(),
        };
        f(&mut settings);
        if let Some(path) = &self.path {
            write_file(path, &settings)?;
        }
        self.publish(settings);
        Ok(())
    }

    /// Re-reads the file and notifies subscribers if it changed on disk.
    pub fn reload(&self) -> Result<(), StorageError> {
        if let Some(path) = &self.path {
            self.publish(read_file(path)?);
        }
        Ok(())
    }

    fn publish(&self, settings: StoredSettings) {
        self.current.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
    }

    /// Polls the file for writes made by other processes.
    pub fn spawn_reload(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                if let Err(err) = storage.reload() {
                    warn!("failed reloading storage: {err}");
                }
            }
        })
    }
}

fn read_file(path: &Path) -> Result<StoredSettings, StorageError> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(StoredSettings::default()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoredSettings::default()),
        Err(err) => Err(err.into()),
    }
}

fn write_file(path: &Path, settings: &StoredSettings) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::{
    codec::{EventCodec, ParseError},
    events::{names, BackendSnapshot, Command, PlaybackState, StatusReport},
    volume::VolumeControl,
};

pub type HubHandle = Arc<Hub>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Extension not connected")]
    ExtensionNotConnected,
    #[error("failed encoding frame: {0}")]
    Encode(#[from] ParseError),
}

struct ExtensionPeer {
    sid: String,
    frames: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Peers {
    extension: Option<ExtensionPeer>,
    mobiles: usize,
}

/// Everything the backend shares between connections: the last reported
/// playback state, the one extension allowed to take commands, and the
/// host's audio controller.
pub struct Hub {
    peers: RwLock<Peers>,
    snapshot: watch::Sender<BackendSnapshot>,
    volume: Arc<dyn VolumeControl>,
    extension_codec: EventCodec,
}

impl Hub {
    pub fn new(volume: Arc<dyn VolumeControl>) -> Self {
        let (snapshot, _) = watch::channel(BackendSnapshot::default());
        Self {
            peers: RwLock::new(Peers::default()),
            snapshot,
            volume,
            extension_codec: EventCodec::new(names::EXTENSION_NS),
        }
    }

    fn peers(&self) -> RwLockReadGuard<'_, Peers> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers_mut(&self) -> RwLockWriteGuard<'_, Peers> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Replaces the stored state and wakes every mobile subscriber, even
    /// when nothing changed.
    pub fn update_state(&self, state: PlaybackState) {
        self.snapshot.send_replace(BackendSnapshot {
            state,
            last_update: Some(chrono::Local::now().to_rfc3339()),
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn volume(&self) -> Arc<dyn VolumeControl> {
        Arc::clone(&self.volume)
    }

    /// Snapshot plus host audio. Reading audio may spawn processes, so it
    /// runs on the blocking pool.
    pub async fn status(&self) -> StatusReport {
        let volume = self.volume();
        let system = tokio::task::spawn_blocking(move || volume.read_audio())
            .await
            .unwrap_or_default();
        StatusReport {
            youtube: self.snapshot(),
            system,
        }
    }

    /// The newest extension connection replaces any older one.
    pub fn attach_extension(&self, sid: &str, frames: mpsc::UnboundedSender<String>) {
        let previous = self.peers_mut().extension.replace(ExtensionPeer {
            sid: sid.to_owned(),
            frames,
        });
        if let Some(previous) = previous {
            debug!("extension {} replaced by {sid}", previous.sid);
        }
        info!("extension connected: {sid}");
    }

    /// Forgets the extension if `sid` is still the current one.
    pub fn detach_extension(&self, sid: &str) {
        let mut peers = self.peers_mut();
        if peers.extension.as_ref().map_or(false, |e| e.sid == sid) {
            peers.extension = None;
            info!("extension disconnected: {sid}");
        }
    }

    pub fn extension_connected(&self) -> bool {
        self.peers().extension.is_some()
    }

    pub fn mobile_joined(&self, sid: &str) {
        let mut peers = self.peers_mut();
        peers.mobiles += 1;
        info!("mobile client connected: {sid} (total: {})", peers.mobiles);
    }

    pub fn mobile_left(&self, sid: &str) {
        let mut peers = self.peers_mut();
        peers.mobiles = peers.mobiles.saturating_sub(1);
        info!("mobile client disconnected: {sid} (total: {})", peers.mobiles);
    }

    pub fn mobile_count(&self) -> usize {
        self.peers().mobiles
    }

    /// Queues `execute_command` for the extension. Nothing waits for it to
    /// be delivered.
    pub fn send_command(&self, command: &Command) -> Result<(), HubError> {
        let frame = self.extension_codec.encode(names::EXECUTE_COMMAND, command)?;
        let peers = self.peers();
        let extension = peers
            .extension
            .as_ref()
            .ok_or(HubError::ExtensionNotConnected)?;
        info!("forwarding {} to extension {}", command.action(), extension.sid);
        extension
            .frames
            .send(frame)
            .map_err(|_| HubError::ExtensionNotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::SystemAudio, volume::FakeVolume};

    fn hub() -> Hub {
        Hub::new(Arc::new(FakeVolume::new(SystemAudio {
            volume: 35,
            muted: true,
        })))
    }

    #[tokio::test]
    async fn status_starts_with_placeholder() {
        let hub = hub();
        let status = hub.status().await;
        assert_eq!(status.youtube, BackendSnapshot::default());
        assert_eq!(
            status.system,
            SystemAudio {
                volume: 35,
                muted: true
            }
        );
    }

    #[test]
    fn update_replaces_and_notifies() {
        let hub = hub();
        let mut rx = hub.subscribe();
        let mut state = PlaybackState::placeholder();
        state.title = "Song".into();
        hub.update_state(state.clone());

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.state, state);
        assert!(snapshot.last_update.is_some());
        assert_eq!(hub.snapshot(), snapshot);
    }

    #[test]
    fn commands_need_an_extension() {
        let hub = hub();
        assert!(matches!(
            hub.send_command(&Command::Next),
            Err(HubError::ExtensionNotConnected)
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_extension("a", tx);
        hub.send_command(&Command::Seek { value: 12.0 }).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            r#"42/extension,["execute_command",{"action":"seek","value":12.0}]"#
        );
    }

    #[test]
    fn stale_detach_keeps_newer_extension() {
        let hub = hub();
        let (old, _old_rx) = mpsc::unbounded_channel();
        let (new, _new_rx) = mpsc::unbounded_channel();
        hub.attach_extension("old", old);
        hub.attach_extension("new", new);
        hub.detach_extension("old");
        assert!(hub.extension_connected());
        hub.detach_extension("new");
        assert!(!hub.extension_connected());
    }
}

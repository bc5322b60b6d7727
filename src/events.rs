use serde::{Deserialize, Serialize};

pub const NO_VIDEO_TITLE: &str = "No video playing";

/// Snapshot of the host page's media element.
///
/// Always produced whole by the observer and replaced whole by every reader;
/// nothing merges two snapshots field by field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub title: String,
    #[serde(rename = "thumbnail", default)]
    pub thumbnail_url: String,
    #[serde(rename = "current_time", default)]
    pub current_time_seconds: f64,
    #[serde(rename = "duration", default)]
    pub duration_seconds: f64,
    #[serde(rename = "playing", default)]
    pub is_playing: bool,
    #[serde(rename = "volume", default = "full_volume")]
    pub volume_percent: u8,
}

fn full_volume() -> u8 {
    100
}

impl PlaybackState {
    /// What the backend reports before any extension has said anything.
    pub fn placeholder() -> Self {
        Self {
            title: NO_VIDEO_TITLE.to_owned(),
            thumbnail_url: String::new(),
            current_time_seconds: 0.0,
            duration_seconds: 0.0,
            is_playing: false,
            volume_percent: 100,
        }
    }

    pub fn has_video(&self) -> bool {
        !self.title.is_empty() && self.title != NO_VIDEO_TITLE
    }
}

/// A playback command. Transient: never stored, only forwarded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Command {
    PlayPause,
    Seek { value: f64 },
    SetVolume { value: f64 },
    Next,
    Previous,
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::PlayPause => "play-pause",
            Command::Seek { .. } => "seek",
            Command::SetVolume { .. } => "set-volume",
            Command::Next => "next",
            Command::Previous => "previous",
        }
    }
}

/// Host machine audio, as read by the backend's volume controller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemAudio {
    pub volume: u8,
    pub muted: bool,
}

impl Default for SystemAudio {
    fn default() -> Self {
        Self {
            volume: 50,
            muted: false,
        }
    }
}

/// Backend-side record of the last reported playback state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendSnapshot {
    #[serde(flatten)]
    pub state: PlaybackState,
    #[serde(default)]
    pub last_update: Option<String>,
}

impl Default for BackendSnapshot {
    fn default() -> Self {
        Self {
            state: PlaybackState::placeholder(),
            last_update: None,
        }
    }
}

/// Payload of `initial_state` and of `GET /api/status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub youtube: BackendSnapshot,
    pub system: SystemAudio,
}

/// Payload of the mobile `youtube_command` event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: Command,
}

/// Messages exchanged between the observer's tab and the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeMessage {
    VideoState { data: PlaybackState },
    ExecuteCommand { command: Command },
    TestConnection { url: String },
}

/// Replies a runtime message handler may send back to its sender.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RuntimeReply {
    Received { received: bool },
    Connected { connected: bool },
}

/// Socket event names used on both namespaces.
pub mod names {
    pub const EXTENSION_NS: &str = "/extension";
    pub const MOBILE_NS: &str = "/mobile";

    pub const VIDEO_STATE: &str = "video_state";
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const CONNECTED: &str = "connected";
    pub const INITIAL_STATE: &str = "initial_state";
    pub const YOUTUBE_STATE: &str = "youtube_state";
    pub const YOUTUBE_COMMAND: &str = "youtube_command";
}

use std::fmt;

use chrono::{DateTime, Local};

use crate::events::{PlaybackState, SystemAudio, NO_VIDEO_TITLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Connection Error",
        })
    }
}

/// `m:ss`, with anything non-finite or non-positive shown as `0:00`.
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0:00".to_owned();
    }
    let whole = seconds.floor() as u64;
    format!("{}:{:02}", whole / 60, whole % 60)
}

/// A volume slider that the user and the backend both write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slider {
    value: u8,
}

impl Slider {
    pub fn new(value: u8) -> Self {
        Self {
            value: value.min(100),
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn input(&mut self, value: u8) {
        self.value = value.min(100);
    }

    /// Takes a value pushed by the backend, unless it is within one step of
    /// what the slider already shows. Keeps a pushed echo of the user's own
    /// drag from yanking the slider back.
    pub fn apply_pushed(&mut self, value: f64) -> bool {
        let value = value.clamp(0.0, 100.0).round();
        if (value - f64::from(self.value)).abs() > 1.0 {
            self.value = value as u8;
            true
        } else {
            false
        }
    }
}

/// Everything the remote control shows.
#[derive(Debug, Clone)]
pub struct RemoteView {
    pub status: ConnectionStatus,
    pub title: String,
    pub thumbnail: Option<String>,
    pub current_time: f64,
    pub duration: f64,
    pub playing: bool,
    pub youtube_volume: Slider,
    pub system_volume: Slider,
    pub muted: bool,
    pub last_update: Option<DateTime<Local>>,
}

impl Default for RemoteView {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            title: NO_VIDEO_TITLE.to_owned(),
            thumbnail: None,
            current_time: 0.0,
            duration: 0.0,
            playing: false,
            youtube_volume: Slider::new(100),
            system_volume: Slider::new(50),
            muted: false,
            last_update: None,
        }
    }
}

impl RemoteView {
    /// Applies a full status report.
    pub fn apply(&mut self, youtube: &PlaybackState, system: SystemAudio) {
        self.apply_youtube(youtube);
        self.system_volume.apply_pushed(f64::from(system.volume));
        self.muted = system.muted;
    }

    /// Applies a playback update, leaving the system audio as it was.
    pub fn apply_youtube(&mut self, youtube: &PlaybackState) {
        if youtube.has_video() {
            self.title = youtube.title.clone();
            self.thumbnail = Some(youtube.thumbnail_url.clone()).filter(|url| !url.is_empty());
        } else {
            self.title = NO_VIDEO_TITLE.to_owned();
            self.thumbnail = None;
        }
        self.current_time = youtube.current_time_seconds;
        self.duration = youtube.duration_seconds;
        self.playing = youtube.is_playing;
        self.youtube_volume
            .apply_pushed(f64::from(youtube.volume_percent));
        self.last_update = Some(Local::now());
    }

    /// Position as a share of the duration, in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.duration > 0.0 && self.current_time.is_finite() {
            (self.current_time / self.duration * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    /// Where a tap at `fraction` of the progress bar should seek to.
    pub fn seek_target(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        fraction * self.duration.max(0.0)
    }

    pub fn render(&self) -> String {
        let mut out = format!("[{}] {}\n", self.status, self.title);
        match &self.thumbnail {
            Some(url) => out.push_str(&format!("  thumbnail: {url}\n")),
            None => out.push_str("  (no thumbnail)\n"),
        }
        out.push_str(&format!(
            "  {} {} / {} ({:.0}%)\n",
            if self.playing { "playing" } else { "paused" },
            format_time(self.current_time),
            format_time(self.duration),
            self.progress_percent()
        ));
        out.push_str(&format!(
            "  video volume {}%  system volume {}%{}\n",
            self.youtube_volume.value(),
            self.system_volume.value(),
            if self.muted { " (muted)" } else { "" }
        ));
        if let Some(at) = self.last_update {
            out.push_str(&format!("  last update {}\n", at.format("%H:%M:%S")));
        }
        out
    }
}

//! Host machine volume, driven through the platform's command line tools.
//!
//! Everything here blocks on a child process; async callers go through
//! `spawn_blocking`.

use std::{
    process::Command,
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::events::SystemAudio;

pub trait VolumeControl: Send + Sync + 'static {
    /// Output volume, 0 to 100.
    fn get_volume(&self) -> Option<u8>;
    /// `level` is clamped to 0..=100. False when the platform refused.
    fn set_volume(&self, level: u8) -> bool;
    fn get_muted(&self) -> Option<bool>;
    fn set_muted(&self, muted: bool) -> bool;

    /// The new mute state, or None if it could not be read or written.
    fn toggle_mute(&self) -> Option<bool> {
        let muted = !self.get_muted()?;
        self.set_muted(muted).then_some(muted)
    }

    /// Current audio, with defaults standing in for unreadable values.
    fn read_audio(&self) -> SystemAudio {
        let defaults = SystemAudio::default();
        SystemAudio {
            volume: self.get_volume().unwrap_or(defaults.volume),
            muted: self.get_muted().unwrap_or(defaults.muted),
        }
    }
}

/// Picks the controller for the platform we were built for.
pub fn detect() -> Box<dyn VolumeControl> {
    if cfg!(target_os = "macos") {
        Box::new(OsaScript)
    } else if cfg!(target_os = "linux") {
        Box::new(PulseAudio)
    } else {
        Box::new(Unsupported)
    }
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).trim().to_owned()),
        Ok(out) => {
            debug!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            None
        }
        Err(err) => {
            debug!("failed running {program}: {err}");
            None
        }
    }
}

/// macOS, through AppleScript's volume settings.
#[derive(Debug, Default)]
pub struct OsaScript;

impl OsaScript {
    fn script(line: &str) -> Option<String> {
        run("osascript", &["-e", line])
    }
}

impl VolumeControl for OsaScript {
    fn get_volume(&self) -> Option<u8> {
        Self::script("output volume of (get volume settings)")?.parse().ok()
    }

    fn set_volume(&self, level: u8) -> bool {
        Self::script(&format!("set volume output volume {}", level.min(100))).is_some()
    }

    fn get_muted(&self) -> Option<bool> {
        match Self::script("output muted of (get volume settings)")?.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn set_muted(&self, muted: bool) -> bool {
        Self::script(&format!("set volume output muted {muted}")).is_some()
    }
}

/// Linux, through `pactl` against the default sink.
#[derive(Debug, Default)]
pub struct PulseAudio;

const DEFAULT_SINK: &str = "@DEFAULT_SINK@";

impl VolumeControl for PulseAudio {
    fn get_volume(&self) -> Option<u8> {
        parse_pactl_volume(&run("pactl", &["get-sink-volume", DEFAULT_SINK])?)
    }

    fn set_volume(&self, level: u8) -> bool {
        let level = format!("{}%", level.min(100));
        run("pactl", &["set-sink-volume", DEFAULT_SINK, &level]).is_some()
    }

    fn get_muted(&self) -> Option<bool> {
        parse_pactl_mute(&run("pactl", &["get-sink-mute", DEFAULT_SINK])?)
    }

    fn set_muted(&self, muted: bool) -> bool {
        let flag = if muted { "1" } else { "0" };
        run("pactl", &["set-sink-mute", DEFAULT_SINK, flag]).is_some()
    }
}

/// First channel's percentage from
/// `Volume: front-left: 42597 /  65% / -11.23 dB, ...`.
fn parse_pactl_volume(output: &str) -> Option<u8> {
    output
        .split_whitespace()
        .find_map(|word| word.strip_suffix('%'))
        .and_then(|pct| pct.parse::<u32>().ok())
        .map(|pct| pct.min(100) as u8)
}

/// `Mute: yes` / `Mute: no`.
fn parse_pactl_mute(output: &str) -> Option<bool> {
    match output.trim().strip_prefix("Mute:")?.trim() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// Platforms we have no controller for: nothing reads, nothing writes.
#[derive(Debug, Default)]
pub struct Unsupported;

impl VolumeControl for Unsupported {
    fn get_volume(&self) -> Option<u8> {
        None
    }

    fn set_volume(&self, _level: u8) -> bool {
        false
    }

    fn get_muted(&self) -> Option<bool> {
        None
    }

    fn set_muted(&self, _muted: bool) -> bool {
        false
    }
}

/// In-memory audio, for `serve --fake-audio` and tests.
#[derive(Debug, Default)]
pub struct FakeVolume {
    audio: Mutex<SystemAudio>,
}

impl FakeVolume {
    pub fn new(audio: SystemAudio) -> Self {
        Self {
            audio: Mutex::new(audio),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut SystemAudio) -> T) -> T {
        f(&mut self.audio.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl VolumeControl for FakeVolume {
    fn get_volume(&self) -> Option<u8> {
        Some(self.with(|a| a.volume))
    }

    fn set_volume(&self, level: u8) -> bool {
        self.with(|a| a.volume = level.min(100));
        true
    }

    fn get_muted(&self) -> Option<bool> {
        Some(self.with(|a| a.muted))
    }

    fn set_muted(&self, muted: bool) -> bool {
        self.with(|a| a.muted = muted);
        true
    }
}

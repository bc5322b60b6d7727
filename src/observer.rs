//! Content-side half of the extension: reads the page's media element and
//! applies commands to it.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    events::{Command, PlaybackState, RuntimeMessage},
    runtime::RuntimePort,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

const UNKNOWN_TITLE: &str = "Unknown";

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("playback was refused: {0}")]
    PlayRefused(String),
}

/// Handle to a live media element. Handles are cheap to clone and all refer
/// to the same element.
pub trait MediaElement: Clone + Send + Sync + 'static {
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    fn paused(&self) -> bool;
    /// Native range, 0.0 to 1.0.
    fn volume(&self) -> f64;

    fn set_current_time(&self, seconds: f64);
    fn set_volume(&self, volume: f64);
    fn play(&self) -> Result<(), MediaError>;
    fn pause(&self);
}

/// The hosting page's document.
pub trait PageDocument: Send + Sync + 'static {
    type Media: MediaElement;

    /// First media element in the document, if any.
    fn query_media(&self) -> Option<Self::Media>;
    /// Whether `media` is still attached to the document tree.
    fn contains(&self, media: &Self::Media) -> bool;
    fn title_text(&self) -> Option<String>;
    /// Content of the `og:image` meta tag.
    fn og_image(&self) -> Option<String>;
    /// Clicks the page's "next" control. False when there is none.
    fn click_next(&self) -> bool;
    /// Bumped on every change to the body's subtree.
    fn mutations(&self) -> watch::Receiver<u64>;
}

/// Observer session: the document, the element currently bound, and the
/// channel to the relay.
pub struct Observer<D: PageDocument> {
    document: D,
    media: Option<D::Media>,
    relay: RuntimePort,
}

impl<D: PageDocument> Observer<D> {
    pub fn new(document: D, relay: RuntimePort) -> Self {
        Self {
            document,
            media: None,
            relay,
        }
    }

    /// Looks the media element up again. True when one was found.
    pub fn acquire(&mut self) -> bool {
        self.media = self.document.query_media();
        if self.media.is_some() {
            info!("media element found");
        }
        self.media.is_some()
    }

    /// Tree mutation: rebind if the element is missing or detached.
    pub fn on_mutation(&mut self) {
        let detached = match &self.media {
            Some(media) => !self.document.contains(media),
            None => true,
        };
        if detached {
            debug!("media element changed, re-finding");
            self.acquire();
        }
    }

    pub fn read_state(&self) -> Option<PlaybackState> {
        let media = self.media.as_ref()?;

        let title = self
            .document
            .title_text()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_TITLE.to_owned());

        Some(PlaybackState {
            title,
            thumbnail_url: self.document.og_image().unwrap_or_default(),
            current_time_seconds: finite_or_zero(media.current_time()),
            duration_seconds: finite_or_zero(media.duration()),
            is_playing: !media.paused(),
            volume_percent: (finite_or_zero(media.volume()) * 100.0).round().clamp(0.0, 100.0) as u8,
        })
    }

    /// Reports the current state to the relay. Quietly does nothing when
    /// there is no element or the relay has gone away.
    pub fn push_state(&self) {
        if let Some(data) = self.read_state() {
            if let Err(err) = self.relay.post(RuntimeMessage::VideoState { data }) {
                debug!("state not delivered: {err}");
            }
        }
    }

    /// Applies `command` to the bound element. Returns false, after logging,
    /// when nothing is bound.
    pub fn apply_command(&mut self, command: &Command) -> bool {
        let Some(media) = &self.media else {
            warn!("no media element found, dropping {}", command.action());
            return false;
        };

        debug!(
            paused = media.paused(),
            current_time = media.current_time(),
            "executing {command:?}"
        );

        match command {
            Command::PlayPause => {
                if media.paused() {
                    if let Err(err) = media.play() {
                        warn!("play failed: {err}");
                    }
                } else {
                    media.pause();
                }
            }
            Command::Seek { value } => media.set_current_time(*value),
            Command::SetVolume { value } => media.set_volume(value.clamp(0.0, 100.0) / 100.0),
            Command::Next => {
                if !self.document.click_next() {
                    debug!("page has no next control");
                }
            }
            // the page has no previous action; restart instead
            Command::Previous => media.set_current_time(0.0),
        }
        true
    }

    /// Runs the observer until its inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RuntimeMessage>) {
        let mut mutations = self.document.mutations();
        let mut watching = true;

        if self.acquire() {
            self.push_state();
        }

        let mut poll = time::interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let settle = time::sleep(SETTLE_DELAY);
        tokio::pin!(settle);
        let mut settling = false;

        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(RuntimeMessage::ExecuteCommand { command }) => {
                        if self.apply_command(&command) {
                            settle.as_mut().reset(Instant::now() + SETTLE_DELAY);
                            settling = true;
                        }
                    }
                    Some(other) => debug!("observer ignores {other:?}"),
                    None => break,
                },
                changed = mutations.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else {
                        self.on_mutation();
                    }
                }
                _ = poll.tick() => {
                    if self.media.is_none() {
                        self.acquire();
                    }
                    self.push_state();
                }
                _ = &mut settle, if settling => {
                    settling = false;
                    self.push_state();
                }
            }
        }

        debug!("observer stopped");
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

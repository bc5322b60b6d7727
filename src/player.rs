//! A host page without a browser: one media element whose clock runs while
//! playing, plus the bits of surrounding DOM the observer looks at.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::watch, time::Instant};

use crate::observer::{MediaElement, MediaError, PageDocument};

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: String,
    pub duration: Duration,
}

struct PlayerClock {
    playing: bool,
    resumed_at: Instant,
    /// Position when last paused, sought or resumed.
    start_offset: f64,
    duration: f64,
    volume: f64,
    autoplay_blocked: bool,
}

impl PlayerClock {
    fn position(&self) -> f64 {
        let pos = if self.playing {
            self.start_offset + self.resumed_at.elapsed().as_secs_f64()
        } else {
            self.start_offset
        };
        pos.min(self.duration)
    }
}

/// Media element handle. Clones share the element.
#[derive(Clone)]
pub struct SimulatedPlayer {
    clock: Arc<Mutex<PlayerClock>>,
}

impl SimulatedPlayer {
    pub fn new(duration: Duration) -> Self {
        Self {
            clock: Arc::new(Mutex::new(PlayerClock {
                playing: false,
                resumed_at: Instant::now(),
                start_offset: 0.0,
                duration: duration.as_secs_f64(),
                volume: 1.0,
                autoplay_blocked: false,
            })),
        }
    }

    /// Makes `play` fail the way a browser refuses unmuted autoplay.
    pub fn block_autoplay(&self, blocked: bool) {
        self.clock().autoplay_blocked = blocked;
    }

    pub fn same_element(&self, other: &SimulatedPlayer) -> bool {
        Arc::ptr_eq(&self.clock, &other.clock)
    }

    fn clock(&self) -> MutexGuard<'_, PlayerClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaElement for SimulatedPlayer {
    fn current_time(&self) -> f64 {
        self.clock().position()
    }

    fn duration(&self) -> f64 {
        self.clock().duration
    }

    fn paused(&self) -> bool {
        !self.clock().playing
    }

    fn volume(&self) -> f64 {
        self.clock().volume
    }

    fn set_current_time(&self, seconds: f64) {
        let mut clock = self.clock();
        clock.start_offset = seconds.clamp(0.0, clock.duration);
        clock.resumed_at = Instant::now();
    }

    fn set_volume(&self, volume: f64) {
        self.clock().volume = volume.clamp(0.0, 1.0);
    }

    fn play(&self) -> Result<(), MediaError> {
        let mut clock = self.clock();
        if clock.autoplay_blocked {
            return Err(MediaError::PlayRefused("autoplay is blocked".into()));
        }
        if clock.playing {
            // already playing
            return Ok(());
        }
        clock.playing = true;
        clock.resumed_at = Instant::now();
        Ok(())
    }

    fn pause(&self) {
        let mut clock = self.clock();
        if !clock.playing {
            return;
        }
        // fold the running time into the offset before stopping the clock
        clock.start_offset = clock.position();
        clock.playing = false;
    }
}

#[derive(Default)]
struct PageState {
    media: Option<SimulatedPlayer>,
    current: Option<VideoInfo>,
    playlist: Vec<VideoInfo>,
    index: usize,
}

/// Single-page-app style document: navigating swaps the media element
/// without reloading, and every swap counts as a body mutation.
#[derive(Clone)]
pub struct SimulatedPage {
    state: Arc<Mutex<PageState>>,
    mutations: Arc<watch::Sender<u64>>,
}

impl Default for SimulatedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPage {
    pub fn new() -> Self {
        let (mutations, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(PageState::default())),
            mutations: Arc::new(mutations),
        }
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutated(&self) {
        self.mutations.send_modify(|n| *n += 1);
    }

    /// Navigates to `video`, replacing the media element.
    pub fn load(&self, video: VideoInfo) {
        {
            let mut state = self.state();
            state.media = Some(SimulatedPlayer::new(video.duration));
            state.current = Some(video);
        }
        self.mutated();
    }

    /// Loads the first entry; later entries are reached with "next".
    pub fn set_playlist(&self, playlist: Vec<VideoInfo>) {
        let first = playlist.first().cloned();
        {
            let mut state = self.state();
            state.playlist = playlist;
            state.index = 0;
        }
        if let Some(first) = first {
            self.load(first);
        }
    }

    /// Leaves the watch page: no media element remains.
    pub fn clear(&self) {
        {
            let mut state = self.state();
            state.media = None;
            state.current = None;
        }
        self.mutated();
    }

    pub fn media(&self) -> Option<SimulatedPlayer> {
        self.state().media.clone()
    }

    pub fn current(&self) -> Option<VideoInfo> {
        self.state().current.clone()
    }
}

impl PageDocument for SimulatedPage {
    type Media = SimulatedPlayer;

    fn query_media(&self) -> Option<SimulatedPlayer> {
        self.media()
    }

    fn contains(&self, media: &SimulatedPlayer) -> bool {
        self.state()
            .media
            .as_ref()
            .map_or(false, |m| m.same_element(media))
    }

    fn title_text(&self) -> Option<String> {
        self.state().current.as_ref().map(|v| v.title.clone())
    }

    fn og_image(&self) -> Option<String> {
        self.state()
            .current
            .as_ref()
            .map(|v| v.thumbnail.clone())
            .filter(|t| !t.is_empty())
    }

    fn click_next(&self) -> bool {
        let next = {
            let mut state = self.state();
            if state.index + 1 >= state.playlist.len() {
                return false;
            }
            state.index += 1;
            state.playlist[state.index].clone()
        };
        self.load(next);
        true
    }

    fn mutations(&self) -> watch::Receiver<u64> {
        self.mutations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_runs_only_while_playing() {
        let player = SimulatedPlayer::new(Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(player.current_time(), 0.0);

        player.play().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(player.current_time(), 10.0);

        player.pause();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(player.current_time(), 10.0);

        player.set_current_time(1000.0);
        assert_eq!(player.current_time(), 300.0);
    }

    #[test]
    fn blocked_autoplay_refuses_play() {
        let player = SimulatedPlayer::new(Duration::from_secs(10));
        player.block_autoplay(true);
        assert!(player.play().is_err());
        assert!(player.paused());
    }

    #[test]
    fn next_walks_the_playlist_and_stops_at_end() {
        let page = SimulatedPage::new();
        let mut mutations = page.mutations();
        page.set_playlist(vec![
            VideoInfo {
                title: "One".into(),
                thumbnail: String::new(),
                duration: Duration::from_secs(10),
            },
            VideoInfo {
                title: "Two".into(),
                thumbnail: String::new(),
                duration: Duration::from_secs(20),
            },
        ]);
        assert!(mutations.has_changed().unwrap());
        mutations.borrow_and_update();

        let first = page.media().unwrap();
        assert!(page.click_next());
        assert!(!page.contains(&first));
        assert_eq!(page.title_text().as_deref(), Some("Two"));
        assert_eq!(page.og_image(), None);
        assert!(!page.click_next());
        assert!(mutations.has_changed().unwrap());

        page.clear();
        assert!(page.query_media().is_none());
    }
}

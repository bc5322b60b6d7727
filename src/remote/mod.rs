//! The remote control: joins `/mobile`, shows what is playing and sends
//! commands back through the backend.

use std::{str::FromStr, sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, time};
use tracing::{debug, info, warn};

use crate::{
    codec::{EventCodec, Frame, PacketKind},
    events::{names, Command, CommandEnvelope, PlaybackState, StatusReport},
    link::{Connector, Link},
    relay::RECONNECT_DELAY,
};

pub mod api;
pub mod debounce;
pub mod view;

pub use api::BackendApi;
use debounce::Debouncer;
pub use view::{ConnectionStatus, RemoteView};

/// Quiet period a volume slider needs before its value is sent.
pub const VOLUME_DEBOUNCE: Duration = Duration::from_millis(150);

/// Something the user did.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    PlayPause,
    Previous,
    Next,
    /// Tap on the progress bar, as a fraction of its width.
    Seek(f64),
    VideoVolume(u8),
    SystemVolume(u8),
    ToggleMute,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown input {0:?} (try: play, prev, next, seek <0-100>, vol <0-100>, sys <0-100>, mute)")]
pub struct ActionParseError(String);

impl FromStr for UserAction {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ActionParseError(s.trim().to_owned());
        let mut words = s.split_whitespace();
        let verb = words.next().ok_or_else(err)?;
        let mut percent = || -> Result<f64, ActionParseError> {
            let value: f64 = words.next().ok_or_else(err)?.parse().map_err(|_| err())?;
            Ok(value.clamp(0.0, 100.0))
        };
        Ok(match verb {
            "p" | "play" | "pause" => UserAction::PlayPause,
            "b" | "prev" | "previous" => UserAction::Previous,
            "n" | "next" => UserAction::Next,
            "seek" => UserAction::Seek(percent()? / 100.0),
            "vol" => UserAction::VideoVolume(percent()?.round() as u8),
            "sys" => UserAction::SystemVolume(percent()?.round() as u8),
            "m" | "mute" => UserAction::ToggleMute,
            _ => return Err(err()),
        })
    }
}

enum Input {
    Action(UserAction),
    VideoVolume(u8),
    SystemVolume(u8),
    Muted(bool),
}

/// Everything besides the socket that can wake the controller.
struct Inputs {
    actions: mpsc::UnboundedReceiver<UserAction>,
    video_volume: mpsc::UnboundedReceiver<u8>,
    system_volume: mpsc::UnboundedReceiver<u8>,
    muted: mpsc::UnboundedReceiver<bool>,
}

impl Inputs {
    /// `None` once the user's action stream has ended.
    async fn next(&mut self) -> Option<Input> {
        tokio::select! {
            action = self.actions.recv() => action.map(Input::Action),
            Some(v) = self.video_volume.recv() => Some(Input::VideoVolume(v)),
            Some(v) = self.system_volume.recv() => Some(Input::SystemVolume(v)),
            Some(m) = self.muted.recv() => Some(Input::Muted(m)),
        }
    }
}

struct Controls {
    video_volume: Debouncer<u8>,
    system_volume: Debouncer<u8>,
    muted: mpsc::UnboundedSender<bool>,
}

pub type Render = Box<dyn FnMut(&RemoteView) + Send>;

pub struct RemoteController {
    backend_url: String,
    codec: EventCodec,
    api: BackendApi,
    view: RemoteView,
    link: Option<mpsc::UnboundedSender<String>>,
    render: Render,
}

impl RemoteController {
    pub fn new(backend_url: &str, render: Render) -> Self {
        Self {
            backend_url: backend_url.to_owned(),
            codec: EventCodec::new(names::MOBILE_NS),
            api: BackendApi::new(backend_url),
            view: RemoteView::default(),
            link: None,
            render,
        }
    }

    fn redraw(&mut self) {
        (self.render)(&self.view);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.view.status != status {
            self.view.status = status;
            self.redraw();
        }
    }

    fn send(&self, frame: String) {
        if let Some(link) = &self.link {
            debug!("-> {frame}");
            let _ = link.send(frame);
        }
    }

    fn send_command(&self, command: Command) {
        if self.link.is_none() {
            warn!("not connected, dropping {}", command.action());
            return;
        }
        info!("sending command {command:?}");
        match self
            .codec
            .encode(names::YOUTUBE_COMMAND, &CommandEnvelope { command })
        {
            Ok(frame) => self.send(frame),
            Err(err) => warn!("failed encoding command: {err}"),
        }
    }

    fn on_open(&mut self, outbound: mpsc::UnboundedSender<String>) {
        self.link = Some(outbound);
        self.send(self.codec.join());
    }

    fn on_closed(&mut self) {
        if self.link.take().is_some() {
            info!("disconnected from {}", self.backend_url);
        }
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Returns false when the backend closed the session.
    fn on_frame(&mut self, text: &str) -> bool {
        debug!("<- {text}");
        let packet = match Frame::parse(text) {
            Ok(Frame::Message(packet)) => packet,
            Ok(Frame::Ping) => {
                self.send(Frame::Pong.to_string());
                return true;
            }
            Ok(Frame::Close) => return false,
            Ok(_) => return true,
            Err(err) => {
                warn!("dropping malformed frame {text:?}: {err}");
                return true;
            }
        };
        if packet.namespace != self.codec.namespace() {
            return true;
        }
        match packet.kind {
            PacketKind::Connect => {
                info!("connected to {}", self.backend_url);
                self.set_status(ConnectionStatus::Connected);
            }
            PacketKind::ConnectError => {
                warn!("backend refused {}: {:?}", packet.namespace, packet.data);
                self.set_status(ConnectionStatus::Error);
            }
            PacketKind::Disconnect => return false,
            PacketKind::Ack => {}
            PacketKind::Event => match self.codec.decode_packet(packet) {
                Ok((event, payload)) => self.on_event(&event, payload),
                Err(err) => warn!("dropping malformed frame {text:?}: {err}"),
            },
        }
        true
    }

    fn on_event(&mut self, event: &str, payload: Value) {
        match event {
            names::INITIAL_STATE => match serde_json::from_value::<StatusReport>(payload) {
                Ok(report) => {
                    self.view.apply(&report.youtube.state, report.system);
                    self.redraw();
                }
                Err(err) => warn!("bad initial state: {err}"),
            },
            names::YOUTUBE_STATE => match serde_json::from_value::<PlaybackState>(payload) {
                Ok(state) => {
                    self.view.apply_youtube(&state);
                    self.redraw();
                }
                Err(err) => warn!("bad playback state: {err}"),
            },
            other => debug!("ignoring event {other}"),
        }
    }

    fn on_input(&mut self, input: Input, controls: &Controls) {
        match input {
            Input::Action(action) => self.on_action(action, controls),
            Input::VideoVolume(v) => self.send_command(Command::SetVolume {
                value: f64::from(v),
            }),
            Input::SystemVolume(v) => {
                let api = self.api.clone();
                tokio::spawn(async move {
                    if let Err(err) = api.set_system_volume(v).await {
                        warn!("failed setting system volume: {err}");
                    }
                });
            }
            Input::Muted(muted) => {
                self.view.muted = muted;
                self.redraw();
            }
        }
    }

    fn on_action(&mut self, action: UserAction, controls: &Controls) {
        match action {
            UserAction::PlayPause => self.send_command(Command::PlayPause),
            UserAction::Previous => self.send_command(Command::Previous),
            UserAction::Next => self.send_command(Command::Next),
            UserAction::Seek(fraction) => {
                let value = self.view.seek_target(fraction);
                self.send_command(Command::Seek { value });
            }
            UserAction::VideoVolume(v) => {
                self.view.youtube_volume.input(v);
                controls.video_volume.push(self.view.youtube_volume.value());
                self.redraw();
            }
            UserAction::SystemVolume(v) => {
                self.view.system_volume.input(v);
                controls.system_volume.push(self.view.system_volume.value());
                self.redraw();
            }
            UserAction::ToggleMute => {
                let api = self.api.clone();
                let muted = controls.muted.clone();
                tokio::spawn(async move {
                    match api.toggle_mute().await {
                        Ok(state) => {
                            let _ = muted.send(state);
                        }
                        Err(err) => warn!("failed toggling mute: {err}"),
                    }
                });
            }
        }
    }

    /// Runs until `actions` ends, reconnecting whenever the socket drops.
    pub async fn run(mut self, connector: Arc<dyn Connector>, actions: mpsc::UnboundedReceiver<UserAction>) {
        let (video_volume, video_settled) = debounce::channel(VOLUME_DEBOUNCE);
        let (system_volume, system_settled) = debounce::channel(VOLUME_DEBOUNCE);
        let (muted_tx, muted_rx) = mpsc::unbounded_channel();
        let controls = Controls {
            video_volume,
            system_volume,
            muted: muted_tx,
        };
        let mut inputs = Inputs {
            actions,
            video_volume: video_settled,
            system_volume: system_settled,
            muted: muted_rx,
        };

        self.redraw();
        let mut wait_first = false;
        loop {
            if wait_first && !self.wait(&mut inputs, &controls).await {
                break;
            }
            wait_first = true;

            let link = match self.connect(connector.as_ref(), &mut inputs, &controls).await {
                Some(Ok(link)) => link,
                Some(Err(())) => continue,
                None => break,
            };
            if !self.serve(link, &mut inputs, &controls).await {
                break;
            }
        }
        self.link = None;
        info!("remote stopping");
    }

    async fn wait(&mut self, inputs: &mut Inputs, controls: &Controls) -> bool {
        let deadline = time::sleep(RECONNECT_DELAY);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                input = inputs.next() => match input {
                    Some(input) => self.on_input(input, controls),
                    None => return false,
                },
            }
        }
    }

    /// `None` when the user is done, `Some(Err)` on a failed attempt.
    async fn connect(
        &mut self,
        connector: &dyn Connector,
        inputs: &mut Inputs,
        controls: &Controls,
    ) -> Option<Result<Link, ()>> {
        info!("connecting to {}", self.backend_url);
        let attempt = connector.connect(&self.backend_url);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return Some(result.map_err(|err| {
                        warn!("connection error: {err}");
                        self.set_status(ConnectionStatus::Error);
                    }));
                }
                input = inputs.next() => match input {
                    Some(input) => self.on_input(input, controls),
                    None => return None,
                },
            }
        }
    }

    /// Returns false when the user is done.
    async fn serve(&mut self, link: Link, inputs: &mut Inputs, controls: &Controls) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;
        self.on_open(outbound);

        let keep_going = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        if !self.on_frame(&text) {
                            break true;
                        }
                    }
                    None => break true,
                },
                input = inputs.next() => match input {
                    Some(input) => self.on_input(input, controls),
                    None => break false,
                },
            }
        };

        self.on_closed();
        keep_going
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::{MockConnector, Remote};
    use tokio::time::Instant;

    struct Harness {
        actions: mpsc::UnboundedSender<UserAction>,
        views: mpsc::UnboundedReceiver<RemoteView>,
        connector: MockConnector,
        remotes: mpsc::UnboundedReceiver<Remote>,
    }

    fn start() -> Harness {
        start_refusing(0)
    }

    /// Like `start`, with the first `refusals` connection attempts failing.
    fn start_refusing(refusals: usize) -> Harness {
        let (views_tx, views) = mpsc::unbounded_channel();
        let render: Render = Box::new(move |view: &RemoteView| {
            let _ = views_tx.send(view.clone());
        });
        let controller = RemoteController::new("http://backend.test", render);
        let (connector, remotes) = MockConnector::new();
        connector.refuse_next(refusals);
        let (actions, actions_rx) = mpsc::unbounded_channel();
        tokio::spawn(controller.run(Arc::new(connector.clone()), actions_rx));
        Harness {
            actions,
            views,
            connector,
            remotes,
        }
    }

    async fn joined(h: &mut Harness) -> Remote {
        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.url, "http://backend.test");
        assert_eq!(remote.from_client.recv().await.unwrap(), "40/mobile,");
        remote
            .to_client
            .send(r#"40/mobile,{"sid":"abc"}"#.into())
            .unwrap();
        remote
    }

    async fn view_where(h: &mut Harness, pred: impl Fn(&RemoteView) -> bool) -> RemoteView {
        loop {
            let view = h.views.recv().await.unwrap();
            if pred(&view) {
                return view;
            }
        }
    }

    const INITIAL: &str = r#"42/mobile,["initial_state",{"youtube":{"title":"Song","thumbnail":"","current_time":30,"duration":200,"playing":true,"volume":70,"last_update":null},"system":{"volume":35,"muted":true}}]"#;

    #[tokio::test(start_paused = true)]
    async fn shows_status_and_initial_state() {
        let mut h = start();
        let remote = joined(&mut h).await;
        view_where(&mut h, |v| v.status == ConnectionStatus::Connected).await;

        remote.to_client.send(INITIAL.into()).unwrap();
        let view = view_where(&mut h, |v| v.title == "Song").await;
        assert_eq!(view.youtube_volume.value(), 70);
        assert_eq!(view.system_volume.value(), 35);
        assert!(view.muted);
        assert_eq!(view.thumbnail, None);

        remote
            .to_client
            .send(r#"42/mobile,["youtube_state",{"title":"Other","thumbnail":"t.jpg","current_time":1,"duration":10,"playing":false,"volume":20}]"#.into())
            .unwrap();
        let view = view_where(&mut h, |v| v.title == "Other").await;
        assert_eq!(view.system_volume.value(), 35);
        assert!(view.muted);
        assert_eq!(view.thumbnail.as_deref(), Some("t.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn buttons_send_commands() {
        let mut h = start();
        let mut remote = joined(&mut h).await;
        remote.to_client.send(INITIAL.into()).unwrap();
        view_where(&mut h, |v| v.title == "Song").await;

        h.actions.send(UserAction::PlayPause).unwrap();
        assert_eq!(
            remote.from_client.recv().await.unwrap(),
            r#"42/mobile,["youtube_command",{"command":{"action":"play-pause"}}]"#
        );
        h.actions.send(UserAction::Seek(0.25)).unwrap();
        assert_eq!(
            remote.from_client.recv().await.unwrap(),
            r#"42/mobile,["youtube_command",{"command":{"action":"seek","value":50.0}}]"#
        );

        remote.to_client.send("2".into()).unwrap();
        assert_eq!(remote.from_client.recv().await.unwrap(), "3");
    }

    #[tokio::test(start_paused = true)]
    async fn volume_drags_are_debounced() {
        let mut h = start();
        let mut remote = joined(&mut h).await;

        let start = Instant::now();
        for v in [10u8, 20, 30, 40] {
            h.actions.send(UserAction::VideoVolume(v)).unwrap();
            time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            remote.from_client.recv().await.unwrap(),
            r#"42/mobile,["youtube_command",{"command":{"action":"set-volume","value":40.0}}]"#
        );
        assert_eq!(start.elapsed(), Duration::from_millis(450));
        assert!(remote.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_a_drop() {
        let mut h = start();
        let remote = joined(&mut h).await;
        view_where(&mut h, |v| v.status == ConnectionStatus::Connected).await;

        drop(remote);
        view_where(&mut h, |v| v.status == ConnectionStatus::Connecting).await;
        let _again = joined(&mut h).await;
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= RECONNECT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_without_a_link_are_dropped() {
        let mut h = start_refusing(1);
        view_where(&mut h, |v| v.status == ConnectionStatus::Error).await;

        h.actions.send(UserAction::Next).unwrap();
        h.actions.send(UserAction::PlayPause).unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.connector.attempts().len(), 1);

        // after the retry only the join goes out; nothing was queued
        let mut remote = joined(&mut h).await;
        remote.to_client.send("2".into()).unwrap();
        assert_eq!(remote.from_client.recv().await.unwrap(), "3");
        assert!(remote.from_client.try_recv().is_err());

        h.actions.send(UserAction::Next).unwrap();
        assert_eq!(
            remote.from_client.recv().await.unwrap(),
            r#"42/mobile,["youtube_command",{"command":{"action":"next"}}]"#
        );
    }

    #[test]
    fn parses_terminal_input() {
        assert_eq!("play".parse(), Ok(UserAction::PlayPause));
        assert_eq!("n".parse(), Ok(UserAction::Next));
        assert_eq!("seek 50".parse(), Ok(UserAction::Seek(0.5)));
        assert_eq!("vol 140".parse(), Ok(UserAction::VideoVolume(100)));
        assert_eq!("sys 12.4".parse(), Ok(UserAction::SystemVolume(12)));
        assert!("seek".parse::<UserAction>().is_err());
        assert!("dance".parse::<UserAction>().is_err());
    }
}

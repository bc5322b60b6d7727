//! Background half of the extension: keeps one socket open to the backend,
//! reports the observer's state on a timer and routes commands to its tab.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::{EventCodec, Frame, PacketKind},
    events::{names, Command, PlaybackState, RuntimeMessage, RuntimeReply},
    link::{Connector, Link},
    popup,
    runtime::Envelope,
    storage::{ExtensionStorage, StoredSettings},
    tabs::{select_target, DispatchError, MatchPattern, TabHost, TabId},
};

/// Fixed delay before every reconnect attempt. There is no backoff and no
/// retry cap.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const STATE_INTERVAL: Duration = Duration::from_secs(2);

/// What the relay does with a frame once it has been handled.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Why a connection (or an attempt at one) ended.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Closed,
    UrlChanged,
    Shutdown,
}

pub struct RelaySession {
    storage: Arc<ExtensionStorage>,
    tabs: Arc<dyn TabHost>,
    pattern: MatchPattern,
    codec: EventCodec,
    http: reqwest::Client,
    backend_url: String,
    last_state: Option<PlaybackState>,
    link: Option<mpsc::UnboundedSender<String>>,
}

impl RelaySession {
    pub fn new(storage: Arc<ExtensionStorage>, tabs: Arc<dyn TabHost>, pattern: MatchPattern) -> Self {
        let backend_url = storage.settings().backend_url().to_owned();
        info!("backend url loaded: {backend_url}");
        Self {
            storage,
            tabs,
            pattern,
            codec: EventCodec::new(names::EXTENSION_NS),
            http: reqwest::Client::new(),
            backend_url,
            last_state: None,
            link: None,
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Err(err) = self.storage.set_connected(connected) {
            warn!("failed persisting connection state: {err}");
        }
    }

    fn send(&self, frame: String) {
        if let Some(link) = &self.link {
            debug!("-> {frame}");
            if link.send(frame).is_err() {
                debug!("link already closed");
            }
        }
    }

    fn on_open(&mut self, outbound: mpsc::UnboundedSender<String>) {
        info!("connected to {}", self.backend_url);
        self.link = Some(outbound);
        self.set_connected(true);
        self.send(self.codec.join());
    }

    fn on_closed(&mut self) {
        if self.link.take().is_some() {
            info!(
                "disconnected, reconnecting in {} seconds",
                RECONNECT_DELAY.as_secs()
            );
        }
        self.set_connected(false);
    }

    fn on_frame(&mut self, text: &str) -> Flow {
        debug!("<- {text}");
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping malformed frame {text:?}: {err}");
                return Flow::Continue;
            }
        };

        match frame {
            Frame::Ping => self.send(Frame::Pong.to_string()),
            Frame::Close => return Flow::Close,
            Frame::Open(handshake) => debug!("engine open {handshake}"),
            Frame::Message(packet) if packet.namespace != self.codec.namespace() => {
                debug!("ignoring packet for {}", packet.namespace);
            }
            Frame::Message(packet) => match packet.kind {
                PacketKind::Connect => info!("joined {}", packet.namespace),
                PacketKind::ConnectError => warn!("backend refused {}: {:?}", packet.namespace, packet.data),
                PacketKind::Disconnect => return Flow::Close,
                PacketKind::Ack => {}
                PacketKind::Event => match self.codec.decode_packet(packet) {
                    Ok((event, payload)) => self.on_event(&event, payload),
                    Err(err) => warn!("dropping malformed frame {text:?}: {err}"),
                },
            },
            Frame::Pong | Frame::Noop => {}
        }
        Flow::Continue
    }

    fn on_event(&mut self, event: &str, payload: Value) {
        match event {
            names::EXECUTE_COMMAND => match serde_json::from_value::<Command>(payload) {
                Ok(command) => {
                    info!("received command {command:?}");
                    if let Err(err) = self.dispatch_command(command) {
                        warn!("command dropped: {err}");
                    }
                }
                Err(err) => warn!("dropping malformed command: {err}"),
            },
            other => debug!("ignoring event {other}"),
        }
    }

    /// Hands `command` to the focused matching tab, or the first one.
    /// Does not wait for the tab to act on it.
    pub fn dispatch_command(&self, command: Command) -> Result<TabId, DispatchError> {
        let tabs = self.tabs.query(&self.pattern);
        debug!("found {} matching tabs", tabs.len());
        let target = select_target(&tabs)
            .ok_or_else(|| DispatchError::NoMatchingTab(self.pattern.as_str().to_owned()))?;
        info!("sending {} to tab {} ({})", command.action(), target.id, target.url);
        self.tabs
            .send_message(target.id, RuntimeMessage::ExecuteCommand { command })?;
        Ok(target.id)
    }

    /// Resends the cached snapshot, if there is one.
    fn on_tick(&self) {
        let Some(state) = &self.last_state else {
            return;
        };
        match self.codec.encode(names::VIDEO_STATE, state) {
            Ok(frame) => self.send(frame),
            Err(err) => error!("failed encoding state: {err}"),
        }
    }

    fn on_runtime(&mut self, envelope: Envelope) {
        match &envelope.message {
            RuntimeMessage::VideoState { data } => {
                self.last_state = Some(data.clone());
                envelope.respond(RuntimeReply::Received { received: true });
            }
            RuntimeMessage::TestConnection { url } => {
                let http = self.http.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    let connected = popup::test_connection(&http, &url).await;
                    envelope.respond(RuntimeReply::Connected { connected });
                });
            }
            RuntimeMessage::ExecuteCommand { .. } => {
                debug!("execute requests go to tabs, not the relay");
            }
        }
    }

    /// True when storage now names a different backend.
    fn take_url_change(&mut self, settings: &mut watch::Receiver<StoredSettings>) -> bool {
        let url = settings.borrow_and_update().backend_url().to_owned();
        if url == self.backend_url {
            return false;
        }
        info!("backend url updated: {url}");
        self.backend_url = url;
        true
    }

    /// Runs the relay until every runtime port is dropped.
    pub async fn run(mut self, connector: Arc<dyn Connector>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        let mut settings = self.storage.subscribe();
        let mut wait_first = false;

        loop {
            if wait_first {
                let ended = self.wait(RECONNECT_DELAY, &mut inbox, &mut settings).await;
                if ended == Ended::Shutdown {
                    break;
                }
            }
            wait_first = true;

            let link = match self.connect(connector.as_ref(), &mut inbox, &mut settings).await {
                Ok(link) => link,
                Err(Ended::Shutdown) => break,
                Err(Ended::UrlChanged) => {
                    wait_first = false;
                    continue;
                }
                Err(Ended::Closed) => continue,
            };

            match self.serve(link, &mut inbox, &mut settings).await {
                Ended::Shutdown => break,
                Ended::UrlChanged => wait_first = false,
                Ended::Closed => {}
            }
        }

        info!("relay stopping");
        self.link = None;
        self.set_connected(false);
    }

    async fn wait(
        &mut self,
        delay: Duration,
        inbox: &mut mpsc::UnboundedReceiver<Envelope>,
        settings: &mut watch::Receiver<StoredSettings>,
    ) -> Ended {
        let deadline = time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ended::Closed,
                msg = inbox.recv() => match msg {
                    Some(envelope) => self.on_runtime(envelope),
                    None => return Ended::Shutdown,
                },
                Ok(()) = settings.changed() => {
                    if self.take_url_change(settings) {
                        return Ended::UrlChanged;
                    }
                }
            }
        }
    }

    async fn connect(
        &mut self,
        connector: &dyn Connector,
        inbox: &mut mpsc::UnboundedReceiver<Envelope>,
        settings: &mut watch::Receiver<StoredSettings>,
    ) -> Result<Link, Ended> {
        info!("connecting to {}", self.backend_url);
        let attempt = connector.connect(&self.backend_url);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return result.map_err(|err| {
                        warn!("failed to connect: {err}");
                        self.set_connected(false);
                        Ended::Closed
                    });
                }
                msg = inbox.recv() => match msg {
                    Some(envelope) => self.on_runtime(envelope),
                    None => return Err(Ended::Shutdown),
                },
                Ok(()) = settings.changed() => {
                    if self.take_url_change(settings) {
                        return Err(Ended::UrlChanged);
                    }
                }
            }
        }
    }

    async fn serve(
        &mut self,
        link: Link,
        inbox: &mut mpsc::UnboundedReceiver<Envelope>,
        settings: &mut watch::Receiver<StoredSettings>,
    ) -> Ended {
        let Link {
            outbound,
            mut inbound,
        } = link;
        self.on_open(outbound);

        let mut tick = time::interval_at(Instant::now() + STATE_INTERVAL, STATE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ended = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        if self.on_frame(&text) == Flow::Close {
                            break Ended::Closed;
                        }
                    }
                    None => break Ended::Closed,
                },
                _ = tick.tick() => self.on_tick(),
                msg = inbox.recv() => match msg {
                    Some(envelope) => self.on_runtime(envelope),
                    None => break Ended::Shutdown,
                },
                Ok(()) = settings.changed() => {
                    if self.take_url_change(settings) {
                        break Ended::UrlChanged;
                    }
                }
            }
        };

        self.on_closed();
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        link::testing::{MockConnector, Remote},
        events::SystemAudio,
        runtime::{self, RuntimePort},
        tabs::{TabRegistry, WATCH_PAGE_PATTERN},
        volume::FakeVolume,
    };
    use url::Url;

    struct Harness {
        storage: Arc<ExtensionStorage>,
        tabs: Arc<TabRegistry>,
        port: RuntimePort,
        connector: MockConnector,
        remotes: mpsc::UnboundedReceiver<Remote>,
    }

    fn start() -> Harness {
        let storage = Arc::new(ExtensionStorage::in_memory());
        let tabs = Arc::new(TabRegistry::new());
        let (port, inbox) = runtime::channel();
        let (connector, remotes) = MockConnector::new();
        let session = RelaySession::new(
            storage.clone(),
            tabs.clone(),
            WATCH_PAGE_PATTERN.parse().unwrap(),
        );
        tokio::spawn(session.run(Arc::new(connector.clone()), inbox));
        Harness {
            storage,
            tabs,
            port,
            connector,
            remotes,
        }
    }

    fn state(title: &str, t: f64) -> PlaybackState {
        PlaybackState {
            title: title.into(),
            thumbnail_url: String::new(),
            current_time_seconds: t,
            duration_seconds: 300.0,
            is_playing: true,
            volume_percent: 100,
        }
    }

    fn watch_url() -> Url {
        Url::parse("https://www.youtube.com/watch?v=abc").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn joins_namespace_and_marks_connected() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.url, "http://localhost:5000");
        assert_eq!(remote.from_client.recv().await.unwrap(), "40/extension,");
        assert!(h.storage.settings().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_sends_latest_snapshot_unchanged() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        h.port
            .post(RuntimeMessage::VideoState { data: state("old", 1.0) })
            .unwrap();
        let latest = state("new", 2.5);
        h.port
            .post(RuntimeMessage::VideoState { data: latest.clone() })
            .unwrap();

        let frame = remote.from_client.recv().await.unwrap();
        let (event, payload) = EventCodec::new("/extension").decode(&frame).unwrap();
        assert_eq!(event, "video_state");
        assert_eq!(serde_json::from_value::<PlaybackState>(payload).unwrap(), latest);

        // nothing new arrives, so the same snapshot goes out again
        let again = remote.from_client.recv().await.unwrap();
        assert_eq!(again, frame);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_before_a_first_report() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        time::sleep(STATE_INTERVAL * 3).await;
        assert!(remote.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn answers_engine_pings() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        remote.to_client.send("2".into()).unwrap();
        assert_eq!(remote.from_client.recv().await.unwrap(), "3");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_once_per_closure_after_fixed_delay() {
        let mut h = start();
        let mut closed_at = Vec::new();

        for _ in 0..3 {
            let mut remote = h.remotes.recv().await.unwrap();
            remote.from_client.recv().await.unwrap();
            closed_at.push(Instant::now());
            drop(remote);
        }
        let _fourth = h.remotes.recv().await.unwrap();

        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 4);
        for (closed, retried) in closed_at.iter().zip(&attempts[1..]) {
            assert!(*retried >= *closed + RECONNECT_DELAY);
            assert!(*retried < *closed + RECONNECT_DELAY + Duration::from_millis(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closure_clears_connected_flag() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();
        assert!(h.storage.settings().connected);

        drop(remote);
        time::sleep(Duration::from_millis(10)).await;
        assert!(!h.storage.settings().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_frame_reaches_the_tab() {
        let mut h = start();
        let (_tab, mut tab_inbox) = h.tabs.open(watch_url(), false);
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        remote
            .to_client
            .send(r#"42/extension,["execute_command",{"action":"seek","value":75}]"#.into())
            .unwrap();

        assert_eq!(
            tab_inbox.recv().await.unwrap(),
            RuntimeMessage::ExecuteCommand {
                command: Command::Seek { value: 75.0 }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commands_without_tab_or_with_bad_shape_are_dropped() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        remote
            .to_client
            .send(r#"42/extension,["execute_command",{"action":"next"}]"#.into())
            .unwrap();
        remote.to_client.send("42/extension,[oops".into()).unwrap();
        remote
            .to_client
            .send(r#"42/extension,["execute_command",{"action":"warp"}]"#.into())
            .unwrap();

        // still connected: pings are still answered on the same link
        remote.to_client.send("2".into()).unwrap();
        assert_eq!(remote.from_client.recv().await.unwrap(), "3");
        assert_eq!(h.connector.attempts().len(), 1);
        assert!(h.storage.settings().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn url_change_reconnects_immediately() {
        let mut h = start();
        let mut remote = h.remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        let changed_at = Instant::now();
        h.storage.set_backend_url("http://10.0.0.2:5000").unwrap();

        let next = h.remotes.recv().await.unwrap();
        assert_eq!(next.url, "http://10.0.0.2:5000");
        assert_eq!(Instant::now(), changed_at);
        // the old link was closed
        assert!(remote.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_retried() {
        let (port, inbox) = runtime::channel();
        let (connector, remotes) = MockConnector::new();
        drop(remotes);
        let session = RelaySession::new(
            Arc::new(ExtensionStorage::in_memory()),
            Arc::new(TabRegistry::new()),
            WATCH_PAGE_PATTERN.parse().unwrap(),
        );
        tokio::spawn(session.run(Arc::new(connector.clone()), inbox));

        time::sleep(RECONNECT_DELAY * 2 + Duration::from_millis(1)).await;
        assert_eq!(connector.attempts().len(), 3);
        drop(port);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_port_stops_the_relay() {
        let storage = Arc::new(ExtensionStorage::in_memory());
        let (port, inbox) = runtime::channel();
        let (connector, mut remotes) = MockConnector::new();
        let session = RelaySession::new(
            storage.clone(),
            Arc::new(TabRegistry::new()),
            WATCH_PAGE_PATTERN.parse().unwrap(),
        );
        let task = tokio::spawn(session.run(Arc::new(connector), inbox));
        let mut remote = remotes.recv().await.unwrap();
        remote.from_client.recv().await.unwrap();

        drop(port);
        task.await.unwrap();
        assert!(remote.from_client.recv().await.is_none());
        assert!(!storage.settings().connected);
    }

    #[tokio::test]
    async fn test_connection_reports_backend_reachability() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(crate::backend::serve(
            listener,
            Arc::new(FakeVolume::new(SystemAudio::default())),
        ));
        let h = start();

        let reply = h
            .port
            .request(RuntimeMessage::TestConnection { url: base.clone() })
            .await
            .unwrap();
        assert_eq!(reply, RuntimeReply::Connected { connected: true });

        // the backend answers 404 under an unknown prefix
        let reply = h
            .port
            .request(RuntimeMessage::TestConnection {
                url: format!("{base}/nowhere"),
            })
            .await
            .unwrap();
        assert_eq!(reply, RuntimeReply::Connected { connected: false });
    }
}

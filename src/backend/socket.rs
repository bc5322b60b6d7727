//! Socket endpoint shared by the extension and the mobile pages.

use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    headers,
    response::IntoResponse,
    Extension, TypedHeader,
};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::hub::{HubError, HubHandle};
use crate::{
    codec::{EventCodec, Frame, Packet, PacketKind, ParseError},
    events::{names, BackendSnapshot, CommandEnvelope, PlaybackState},
};

pub const PING_INTERVAL: Duration = Duration::from_secs(25);
pub const PING_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_PAYLOAD: u64 = 1_000_000;

pub async fn socket_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    hub: Extension<HubHandle>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        debug!("`{}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |ws| handle_socket(ws, hub.0))
}

async fn handle_socket(mut socket: WebSocket, hub: HubHandle) {
    let (frames, mut outbox) = mpsc::unbounded_channel();
    let mut peer = Peer::new(hub, frames);

    if let Err(err) = socket.send(Message::Text(peer.open_frame())).await {
        info!("client disconnected {err}");
        return;
    }

    let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if peer.on_text(&text).await == Flow::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    info!("client disconnected {err}");
                    break;
                }
            },
            Some(frame) = outbox.recv() => {
                if let Err(err) = socket.send(Message::Text(frame)).await {
                    info!("client disconnected {err}");
                    break;
                }
            }
            Some(()) = peer.snapshot_changed() => peer.push_snapshot(),
            _ = ping.tick() => {
                if peer.last_pong.elapsed() > PING_INTERVAL + PING_TIMEOUT {
                    info!("{} missed its pong, closing", peer.sid);
                    break;
                }
                peer.send(Frame::Ping.to_string());
            }
        }
    }

    peer.leave_all();
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// One socket connection and the namespaces it has joined.
pub struct Peer {
    pub sid: String,
    hub: HubHandle,
    frames: mpsc::UnboundedSender<String>,
    extension: bool,
    mobile: Option<watch::Receiver<BackendSnapshot>>,
    last_pong: Instant,
}

impl Peer {
    pub fn new(hub: HubHandle, frames: mpsc::UnboundedSender<String>) -> Self {
        let sid = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        Self {
            sid,
            hub,
            frames,
            extension: false,
            mobile: None,
            last_pong: Instant::now(),
        }
    }

    pub fn open_frame(&self) -> String {
        Frame::Open(json!({
            "sid": self.sid,
            "upgrades": [],
            "pingInterval": PING_INTERVAL.as_millis() as u64,
            "pingTimeout": PING_TIMEOUT.as_millis() as u64,
            "maxPayload": MAX_PAYLOAD,
        }))
        .to_string()
    }

    fn send(&self, frame: String) {
        debug!("-> {} {frame}", self.sid);
        // the receiving half lives as long as the connection loop
        let _ = self.frames.send(frame);
    }

    fn send_packet(&self, packet: Packet) {
        self.send(Frame::from(packet).to_string());
    }

    fn emit<T: Serialize>(&self, namespace: &str, event: &str, payload: &T) {
        match Packet::event(namespace, event, payload) {
            Ok(packet) => self.send_packet(packet),
            Err(err) => warn!("failed encoding {event}: {err}"),
        }
    }

    fn ack(&self, namespace: &str, ack_id: Option<u64>, result: Result<(), HubError>) {
        let Some(id) = ack_id else {
            return;
        };
        let body = match result {
            Ok(()) => json!({"status": "success"}),
            Err(err) => json!({"status": "error", "message": err.to_string()}),
        };
        match Packet::ack(namespace, id, &body) {
            Ok(packet) => self.send_packet(packet),
            Err(err) => warn!("failed encoding ack: {err}"),
        }
    }

    /// Resolves when a new snapshot is available for a joined mobile.
    /// Never resolves otherwise.
    async fn snapshot_changed(&mut self) -> Option<()> {
        match self.mobile.as_mut() {
            Some(rx) => rx.changed().await.ok(),
            None => std::future::pending().await,
        }
    }

    fn push_snapshot(&mut self) {
        if let Some(rx) = self.mobile.as_mut() {
            let state = rx.borrow_and_update().state.clone();
            self.emit(names::MOBILE_NS, names::YOUTUBE_STATE, &state);
        }
    }

    pub async fn on_text(&mut self, text: &str) -> Flow {
        debug!("<- {} {text}", self.sid);
        match Frame::parse(text) {
            Ok(Frame::Pong) => self.last_pong = Instant::now(),
            Ok(Frame::Ping) => self.send(Frame::Pong.to_string()),
            Ok(Frame::Close) => return Flow::Close,
            Ok(Frame::Message(packet)) => self.on_packet(packet).await,
            Ok(Frame::Open(_)) | Ok(Frame::Noop) => {}
            Err(err) => warn!("dropping malformed frame from {}: {err}", self.sid),
        }
        Flow::Continue
    }

    async fn on_packet(&mut self, packet: Packet) {
        match packet.kind {
            PacketKind::Connect => self.join(&packet.namespace).await,
            PacketKind::Disconnect => self.leave(&packet.namespace),
            PacketKind::Event => self.on_event(packet),
            PacketKind::Ack | PacketKind::ConnectError => {}
        }
    }

    async fn join(&mut self, namespace: &str) {
        let accepted = Packet {
            kind: PacketKind::Connect,
            namespace: namespace.to_owned(),
            ack_id: None,
            data: Some(json!({"sid": self.sid})),
        };

        match namespace {
            names::EXTENSION_NS => {
                self.send_packet(accepted);
                self.hub.attach_extension(&self.sid, self.frames.clone());
                self.extension = true;
                self.emit(names::EXTENSION_NS, names::CONNECTED, &json!({"status": "success"}));
            }
            names::MOBILE_NS => {
                self.send_packet(accepted);
                let mut rx = self.hub.subscribe();
                rx.borrow_and_update();
                if self.mobile.replace(rx).is_none() {
                    self.hub.mobile_joined(&self.sid);
                }
                let status = self.hub.status().await;
                self.emit(names::MOBILE_NS, names::INITIAL_STATE, &status);
            }
            "/" => self.send_packet(accepted),
            other => {
                warn!("{} asked for unknown namespace {other}", self.sid);
                self.send_packet(Packet {
                    kind: PacketKind::ConnectError,
                    namespace: other.to_owned(),
                    ack_id: None,
                    data: Some(json!({"message": "Invalid namespace"})),
                });
            }
        }
    }

    fn leave(&mut self, namespace: &str) {
        match namespace {
            names::EXTENSION_NS if self.extension => {
                self.extension = false;
                self.hub.detach_extension(&self.sid);
            }
            names::MOBILE_NS if self.mobile.is_some() => {
                self.mobile = None;
                self.hub.mobile_left(&self.sid);
            }
            _ => {}
        }
    }

    pub fn leave_all(&mut self) {
        self.leave(names::EXTENSION_NS);
        self.leave(names::MOBILE_NS);
    }

    fn on_event(&mut self, packet: Packet) {
        let namespace = packet.namespace.clone();
        let ack_id = packet.ack_id;
        let joined = match namespace.as_str() {
            names::EXTENSION_NS => self.extension,
            names::MOBILE_NS => self.mobile.is_some(),
            _ => false,
        };
        if !joined {
            debug!("{} sent an event on {namespace} without joining", self.sid);
            return;
        }

        let (event, payload) = match EventCodec::new(namespace.as_str()).decode_packet(packet) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping malformed event from {}: {err}", self.sid);
                return;
            }
        };

        match (namespace.as_str(), event.as_str()) {
            (names::EXTENSION_NS, names::VIDEO_STATE) => {
                match serde_json::from_value::<PlaybackState>(payload) {
                    Ok(state) => {
                        self.hub.update_state(state);
                        self.ack(&namespace, ack_id, Ok(()));
                    }
                    Err(err) => self.bad_payload(&namespace, ack_id, &event, err.into()),
                }
            }
            (names::MOBILE_NS, names::YOUTUBE_COMMAND) => {
                match serde_json::from_value::<CommandEnvelope>(payload) {
                    Ok(CommandEnvelope { command }) => {
                        let result = self.hub.send_command(&command);
                        if let Err(err) = &result {
                            warn!("command {} not forwarded: {err}", command.action());
                        }
                        self.ack(&namespace, ack_id, result);
                    }
                    Err(err) => self.bad_payload(&namespace, ack_id, &event, err.into()),
                }
            }
            (_, other) => debug!("ignoring event {other} on {namespace}"),
        }
    }

    fn bad_payload(&self, namespace: &str, ack_id: Option<u64>, event: &str, err: ParseError) {
        warn!("bad {event} payload from {}: {err}", self.sid);
        if let Some(id) = ack_id {
            let body: Value = json!({"status": "error", "message": err.to_string()});
            match Packet::ack(namespace, id, &body) {
                Ok(packet) => self.send_packet(packet),
                Err(err) => warn!("failed encoding ack: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        backend::hub::Hub,
        events::{Command, StatusReport, SystemAudio},
        volume::FakeVolume,
    };

    fn peer(hub: &HubHandle) -> (Peer, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Peer::new(hub.clone(), tx), rx)
    }

    fn hub() -> HubHandle {
        Arc::new(Hub::new(Arc::new(FakeVolume::new(SystemAudio::default()))))
    }

    fn event(frame: &str, namespace: &str) -> (String, Value) {
        EventCodec::new(namespace).decode(frame).unwrap()
    }

    #[test]
    fn open_frame_announces_ping_schedule() {
        let hub = hub();
        let (peer, _rx) = peer(&hub);
        let Frame::Open(handshake) = Frame::parse(&peer.open_frame()).unwrap() else {
            panic!("expected open frame");
        };
        assert_eq!(handshake["sid"], json!(peer.sid));
        assert_eq!(handshake["pingInterval"], json!(25000));
        assert_eq!(handshake["pingTimeout"], json!(20000));
    }

    #[tokio::test]
    async fn extension_join_is_acknowledged() {
        let hub = hub();
        let (mut ext, mut rx) = peer(&hub);
        ext.on_text("40/extension,").await;

        assert_eq!(
            rx.recv().await.unwrap(),
            format!(r#"40/extension,{{"sid":"{}"}}"#, ext.sid)
        );
        let (name, payload) = event(&rx.recv().await.unwrap(), "/extension");
        assert_eq!(name, "connected");
        assert_eq!(payload, json!({"status": "success"}));
        assert!(hub.extension_connected());

        ext.leave_all();
        assert!(!hub.extension_connected());
    }

    #[tokio::test]
    async fn mobile_gets_initial_state_then_pushes() {
        let hub = hub();
        let (mut mobile, mut rx) = peer(&hub);
        mobile.on_text("40/mobile,").await;
        rx.recv().await.unwrap();

        let (name, payload) = event(&rx.recv().await.unwrap(), "/mobile");
        assert_eq!(name, "initial_state");
        let status: StatusReport = serde_json::from_value(payload).unwrap();
        assert_eq!(status.youtube.state, PlaybackState::placeholder());
        assert_eq!(status.system, SystemAudio::default());
        assert_eq!(hub.mobile_count(), 1);

        let (mut ext, _ext_rx) = peer(&hub);
        ext.on_text("40/extension,").await;
        ext.on_text(r#"42/extension,["video_state",{"title":"Song","thumbnail":"","current_time":3.0,"duration":9.0,"playing":true,"volume":70}]"#)
            .await;

        mobile.snapshot_changed().await.unwrap();
        mobile.push_snapshot();
        let (name, payload) = event(&rx.recv().await.unwrap(), "/mobile");
        assert_eq!(name, "youtube_state");
        assert_eq!(payload["title"], json!("Song"));
        assert_eq!(payload["volume"], json!(70));
        assert!(payload.get("last_update").is_none());
    }

    #[tokio::test]
    async fn mobile_command_reaches_extension_with_ack() {
        let hub = hub();
        let (mut ext, mut ext_rx) = peer(&hub);
        ext.on_text("40/extension,").await;
        ext_rx.recv().await.unwrap();
        ext_rx.recv().await.unwrap();

        let (mut mobile, mut rx) = peer(&hub);
        mobile.on_text("40/mobile,").await;
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        mobile
            .on_text(r#"42/mobile,7["youtube_command",{"command":{"action":"set-volume","value":40}}]"#)
            .await;

        let (name, payload) = event(&ext_rx.recv().await.unwrap(), "/extension");
        assert_eq!(name, "execute_command");
        assert_eq!(
            serde_json::from_value::<Command>(payload).unwrap(),
            Command::SetVolume { value: 40.0 }
        );
        assert_eq!(rx.recv().await.unwrap(), r#"43/mobile,7[{"status":"success"}]"#);
    }

    #[tokio::test]
    async fn command_without_extension_is_refused() {
        let hub = hub();
        let (mut mobile, mut rx) = peer(&hub);
        mobile.on_text("40/mobile,").await;
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        mobile
            .on_text(r#"42/mobile,1["youtube_command",{"command":{"action":"next"}}]"#)
            .await;
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"43/mobile,1[{"message":"Extension not connected","status":"error"}]"#
        );
    }

    #[tokio::test]
    async fn unknown_namespace_and_garbage() {
        let hub = hub();
        let (mut p, mut rx) = peer(&hub);
        p.on_text("40/admin,").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"44/admin,{"message":"Invalid namespace"}"#
        );

        assert_eq!(p.on_text("zz").await, Flow::Continue);
        // events before joining are ignored
        p.on_text(r#"42/extension,["video_state",{"title":"x"}]"#).await;
        assert_eq!(hub.snapshot().state, PlaybackState::placeholder());

        p.on_text("2").await;
        assert_eq!(rx.recv().await.unwrap(), "3");
        assert_eq!(p.on_text("1").await, Flow::Close);
    }
}

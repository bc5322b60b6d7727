//! Client side of the socket channel, reduced to two channels of text frames
//! so the session logic above it never touches the websocket directly.

use std::{future::Future, pin::Pin};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const SOCKET_QUERY: &str = "EIO=4&transport=websocket";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid backend url {0:?}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// An open connection. `inbound` yielding `None` means the socket closed;
/// dropping `outbound` closes it.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

pub trait Connector: Send + Sync {
    fn connect(&self, backend_url: &str) -> BoxFuture<'static, Result<Link, LinkError>>;
}

/// `http(s)://host[:port][/prefix]` to the socket endpoint under it.
pub fn socket_url(backend_url: &str) -> Result<Url, LinkError> {
    let invalid = || LinkError::InvalidUrl(backend_url.to_owned());
    let mut url = Url::parse(backend_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some(SOCKET_QUERY));
    Ok(url)
}

/// Connects with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, backend_url: &str) -> BoxFuture<'static, Result<Link, LinkError>> {
        let target = socket_url(backend_url);
        Box::pin(async move {
            let target = target?;
            debug!("connecting to {target}");
            let (socket, _) = tokio_tungstenite::connect_async(target.as_str()).await?;
            Ok(spawn_pump(socket))
        })
    }
}

/// Moves frames between the socket and the link's channels until either
/// side gives up.
pub fn spawn_pump<S>(socket: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!("websocket send failed: {err}");
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // tungstenite answers pings on its own
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket error: {err}");
                        break;
                    }
                }
            }
        }
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

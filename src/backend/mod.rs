//! The backend the relay and the remote controls meet at.

use std::{io, net::TcpListener, sync::Arc};

use axum::{
    handler::Handler,
    routing::{get, post},
    Extension, Router,
};
use tracing::info;

use crate::volume::VolumeControl;

pub mod cors;
pub mod hub;
pub mod routes;
pub mod socket;

pub use hub::{Hub, HubHandle};

pub fn router(hub: HubHandle) -> Router {
    let sockets = Router::new()
        .route("/socket.io/", get(socket::socket_handler))
        .layer(Extension(hub.clone()));

    Router::new()
        .route("/", get(routes::index))
        .route("/api/status", get(routes::get_status))
        .route("/api/system/volume", post(routes::set_system_volume))
        .route("/api/system/mute", post(routes::toggle_system_mute))
        .route("/api/youtube/play-pause", post(routes::youtube_play_pause))
        .route("/api/youtube/seek", post(routes::youtube_seek))
        .route("/api/youtube/set-volume", post(routes::youtube_set_volume))
        .route("/api/youtube/next", post(routes::youtube_next))
        .route("/api/youtube/previous", post(routes::youtube_previous))
        .fallback(routes::fallback.into_service())
        .layer(Extension(hub))
        .layer(cors::CorsLayer)
        .merge(sockets)
}

/// Serves the backend on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, volume: Arc<dyn VolumeControl>) -> io::Result<()> {
    let hub = Arc::new(Hub::new(volume));
    listener.set_nonblocking(true)?;
    info!("backend listening on {}", listener.local_addr()?);

    axum::Server::from_tcp(listener)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .serve(router(hub).into_make_service())
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

use std::{net::TcpListener, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use yt_remote::{
    backend,
    config::{Args, Command},
    events::SystemAudio,
    link::WsConnector,
    observer::Observer,
    player::{SimulatedPage, VideoInfo},
    popup,
    relay::RelaySession,
    remote::{RemoteController, RemoteView, UserAction},
    runtime,
    storage::ExtensionStorage,
    tabs::{TabRegistry, WATCH_PAGE_PATTERN},
    volume::{self, FakeVolume, VolumeControl},
};

/// How often the relay rereads the storage file for changes made by
/// `configure`.
const STORAGE_RELOAD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "yt_remote=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Serve {
            listen_addr,
            fake_audio,
        } => serve(&listen_addr, fake_audio).await,
        Command::Relay {
            storage,
            backend_url,
        } => relay(&storage, backend_url).await,
        Command::Remote { backend_url } => remote(&backend_url).await,
        Command::Configure { storage, url } => configure(&storage, &url).await,
    }
}

async fn serve(listen_addr: &str, fake_audio: bool) -> anyhow::Result<()> {
    info!("starting backend on {listen_addr}");
    let listener =
        TcpListener::bind(listen_addr).with_context(|| format!("binding {listen_addr}"))?;

    let volume: Arc<dyn VolumeControl> = if fake_audio {
        Arc::new(FakeVolume::new(SystemAudio::default()))
    } else {
        Arc::from(volume::detect())
    };

    tokio::select! {
        result = backend::serve(listener, volume) => result.context("backend failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn demo_playlist() -> Vec<VideoInfo> {
    [
        ("Big Buck Bunny", "aqz-KE-bpKQ", 635),
        ("Sintel", "eRsGyueVLvQ", 888),
        ("Tears of Steel", "R6MlUcmOul8", 734),
    ]
    .into_iter()
    .map(|(title, id, secs)| VideoInfo {
        title: title.to_owned(),
        thumbnail: format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"),
        duration: Duration::from_secs(secs),
    })
    .collect()
}

async fn relay(storage: &Path, backend_url: Option<String>) -> anyhow::Result<()> {
    let storage = Arc::new(
        ExtensionStorage::open(storage)
            .with_context(|| format!("opening storage {}", storage.display()))?,
    );
    if let Some(url) = backend_url {
        popup::validate_backend_url(&url)?;
        storage.set_backend_url(url.trim())?;
    }
    storage.spawn_reload(STORAGE_RELOAD);

    let tabs = Arc::new(TabRegistry::new());
    let (port, inbox) = runtime::channel();

    let page = SimulatedPage::new();
    page.set_playlist(demo_playlist());
    let (tab, tab_inbox) = tabs.open(
        Url::parse("https://www.youtube.com/watch?v=aqz-KE-bpKQ")?,
        true,
    );
    info!("opened watch page in tab {tab}");
    tokio::spawn(Observer::new(page, port).run(tab_inbox));

    let session = RelaySession::new(storage, tabs, WATCH_PAGE_PATTERN.parse()?);
    tokio::select! {
        _ = session.run(Arc::new(WsConnector), inbox) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn remote(backend_url: &str) -> anyhow::Result<()> {
    popup::validate_backend_url(backend_url)?;

    let render = Box::new(|view: &RemoteView| println!("{}", view.render()));
    let controller = RemoteController::new(backend_url.trim(), render);

    let (actions, actions_rx) = mpsc::unbounded_channel();
    let session = tokio::spawn(controller.run(Arc::new(WsConnector), actions_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "q" || line.trim() == "quit" => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<UserAction>() {
                    Ok(action) => {
                        if actions.send(action).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("{err}"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(actions);
    session.await?;
    Ok(())
}

async fn configure(storage: &Path, url: &str) -> anyhow::Result<()> {
    let storage = ExtensionStorage::open(storage)
        .with_context(|| format!("opening storage {}", storage.display()))?;
    let outcome = popup::save_settings(&storage, &reqwest::Client::new(), url).await?;
    println!("{}", outcome.message);
    Ok(())
}

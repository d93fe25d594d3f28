mod clock;
mod core;
mod detector;
mod error;
mod fade;
mod http;
mod mpv;
mod notify;
mod poller;
mod prefetch;
mod remote;
mod selector;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use deck_proto::config::Config;
use deck_proto::state::StateStore;
use deck_proto::timeline::TimelineLog;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{Engine, EngineEvent};
use crate::mpv::{MpvClient, MpvProcess, PlayerControl};
use crate::poller::Poller;
use crate::remote::{RcloneRemote, RemoteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging + stderr
    let data_dir = deck_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("deckd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,deck_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let state = Arc::new(StateStore::new());
    let timeline = Arc::new(TimelineLog::open(
        config.timeline.file.clone(),
        config.timeline.max_events,
    ));

    let mut mpv_process = if config.mpv.spawn {
        let volume = state.get().await.volume;
        Some(MpvProcess::spawn(&config.mpv.binary, &config.mpv.socket_path, volume).await?)
    } else {
        info!("Attaching to mpv at {:?}", config.mpv.socket_path);
        None
    };

    let player: Arc<dyn PlayerControl> = Arc::new(MpvClient::new(
        config.mpv.socket_path.clone(),
        config.mpv.ipc_timeout(),
    ));
    let remote: Arc<dyn RemoteStore> = Arc::new(RcloneRemote::new(&config.remote));

    // Every track switch funnels into the engine loop
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<EngineEvent>(64);

    let engine = Arc::new(Engine::new(
        config.clone(),
        player.clone(),
        remote,
        state.clone(),
        timeline.clone(),
        event_tx.clone(),
    ));
    engine.attach().await;

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push(tokio::spawn(clock::run_clock(
        state.clone(),
        Duration::from_millis(config.engine.clock_interval_ms),
        cancel.clone(),
    )));

    let poller = Poller::new(
        player,
        state.clone(),
        timeline,
        config.engine.clone(),
        event_tx,
    );
    workers.push(tokio::spawn(poller.run(
        Duration::from_millis(config.engine.poll_interval_ms),
        cancel.clone(),
    )));

    workers.push(tokio::spawn(prefetch::run_auto_cache(
        engine.state(),
        engine.catalog(),
        engine.prefetcher(),
        engine.auto_cache_flag(),
        Duration::from_secs(config.cache.auto_cache_interval_secs),
        cancel.clone(),
    )));

    if config.http.enabled {
        workers.push(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            engine.clone(),
            cancel.clone(),
        ));
    }

    let engine_loop = tokio::spawn(engine.run(event_rx, cancel.clone()));

    info!("deckd initialised, running event loop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = engine_loop.await {
        warn!("engine loop ended abnormally: {}", e);
    }
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("worker ended abnormally: {}", e);
        }
    }
    if let Some(process) = mpv_process.as_mut() {
        process.kill().await;
    }
    Ok(())
}

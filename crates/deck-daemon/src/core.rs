/// Engine: the advance pipeline and every user-facing operation.
///
/// Track switches (next/prev/random/play-index, manual or end-of-track) all
/// go through one event loop, `Engine::run`, so they execute one at a time.
/// Every switch bumps the State Store's track generation; an end-of-track
/// request carrying an older generation than the current one is stale and
/// dropped.  Other operations (volume, pause, seek, stop) act directly.
///
/// Nothing here holds the State Store lock across a socket call: read a
/// snapshot, talk to mpv, then mutate.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deck_proto::config::Config;
use deck_proto::protocol::{
    Direction, DownloadTask, NoticeCategory, SourceKind, StatusSnapshot, TimelineEvent,
};
use deck_proto::state::StateStore;
use deck_proto::timeline::TimelineLog;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::fade::FadeController;
use crate::mpv::{IpcError, PlayerControl};
use crate::notify::Notifier;
use crate::prefetch::Prefetcher;
use crate::remote::{list_local_cache, Catalog, RemoteStore};
use crate::selector;

// ── EngineEvent ───────────────────────────────────────────────────────────────

/// Who asked for a track switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOrigin {
    User,
    /// Raised by the poller for the track with this generation.
    EndOfTrack { generation: u64 },
}

pub type Reply = oneshot::Sender<Result<AdvanceOutcome>>;

/// All inputs into the engine loop.
#[derive(Debug)]
pub enum EngineEvent {
    Advance {
        direction: Direction,
        origin: AdvanceOrigin,
        reply: Option<Reply>,
    },
    PlayIndex {
        index: usize,
        reply: Reply,
    },
    #[allow(dead_code)]
    Shutdown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdvanceOutcome {
    pub previous_file: String,
    pub current_file: String,
    pub source: SourceKind,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncOutcome {
    pub cached_files: usize,
}

fn player_error(context: &str, e: IpcError) -> EngineError {
    EngineError::Player(format!("{}: {}", context, e))
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    config: Config,
    state: Arc<StateStore>,
    player: Arc<dyn PlayerControl>,
    remote: Arc<dyn RemoteStore>,
    catalog: Arc<Catalog>,
    prefetcher: Arc<Prefetcher>,
    fade: FadeController,
    notifier: Mutex<Notifier>,
    timeline: Arc<TimelineLog>,
    auto_cache: Arc<AtomicBool>,
    sync_running: Mutex<()>,
    events: mpsc::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        config: Config,
        player: Arc<dyn PlayerControl>,
        remote: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        timeline: Arc<TimelineLog>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let catalog = Arc::new(Catalog::new(
            remote.clone(),
            config.cache.dir.clone(),
            config.remote.extensions.clone(),
        ));
        let prefetcher = Arc::new(Prefetcher::new(
            config.cache.dir.clone(),
            remote.clone(),
            Duration::from_millis(config.cache.progress_poll_ms),
        ));
        let fade = FadeController::new(player.clone(), state.clone(), config.fade.steps);
        let notifier = Mutex::new(Notifier::new(&config.notify));
        let auto_cache = Arc::new(AtomicBool::new(config.cache.auto_cache_next));

        Self {
            config,
            state,
            player,
            remote,
            catalog,
            prefetcher,
            fade,
            notifier,
            timeline,
            auto_cache,
            sync_running: Mutex::new(()),
            events,
        }
    }

    pub fn state(&self) -> Arc<StateStore> {
        Arc::clone(&self.state)
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    pub fn prefetcher(&self) -> Arc<Prefetcher> {
        Arc::clone(&self.prefetcher)
    }

    pub fn auto_cache_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.auto_cache)
    }

    /// Prepare a freshly connected mpv: meter filter for silence detection,
    /// and our remembered volume.
    pub async fn attach(&self) {
        self.player.install_meter_filter().await;
        let volume = self.state.get().await.volume;
        if let Err(e) = self.player.set_volume(volume).await {
            debug!("engine: initial volume not applied: {}", e);
        }
    }

    /// Run the event loop until cancelled, a `Shutdown` arrives, or every
    /// sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<EngineEvent>, cancel: CancellationToken) {
        info!("engine: event loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                EngineEvent::Advance {
                    direction,
                    origin,
                    reply,
                } => {
                    if let AdvanceOrigin::EndOfTrack { generation } = origin {
                        let current = self.state.get().await.track_generation;
                        if current != generation {
                            debug!(
                                "engine: dropping stale end-of-track advance (generation {} != {})",
                                generation, current
                            );
                            continue;
                        }
                    }
                    let result = self.advance(direction, origin).await;
                    respond(reply, result);
                }
                EngineEvent::PlayIndex { index, reply } => {
                    let result = self.play_index(index).await;
                    respond(Some(reply), result);
                }
                EngineEvent::Shutdown => {
                    info!("engine: shutdown requested");
                    break;
                }
            }
        }
        info!("engine: event loop stopped");
    }

    // ── queued operations ─────────────────────────────────────────────────────

    /// Queue a user advance and wait for its outcome.
    pub async fn request_advance(&self, direction: Direction) -> Result<AdvanceOutcome> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::Advance {
                direction,
                origin: AdvanceOrigin::User,
                reply: Some(tx),
            })
            .await
            .map_err(|_| EngineError::Busy)?;
        rx.await.map_err(|_| EngineError::Busy)?
    }

    pub async fn request_play_index(&self, index: usize) -> Result<AdvanceOutcome> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::PlayIndex { index, reply: tx })
            .await
            .map_err(|_| EngineError::Busy)?;
        rx.await.map_err(|_| EngineError::Busy)?
    }

    /// Switch to the catalog neighbour of the current track.  Callers outside
    /// the event loop should use `request_advance`.
    pub async fn advance(&self, direction: Direction, origin: AdvanceOrigin) -> Result<AdvanceOutcome> {
        let result = async {
            let current = self.resolve_current().await;
            let files = self.catalog.snapshot().await;
            let target = selector::select(&current, &files, direction, &mut rand::thread_rng())?;
            info!(
                "engine: {} ({:?}) {:?} -> {:?}",
                direction.as_str(),
                origin,
                current,
                target
            );
            self.switch_to(&target, origin, direction.as_str()).await
        }
        .await;
        self.report(result).await
    }

    /// Play catalog entry `index` through the same pipeline as an advance.
    pub async fn play_index(&self, index: usize) -> Result<AdvanceOutcome> {
        let result = async {
            let files = self.catalog.snapshot().await;
            if files.is_empty() {
                return Err(EngineError::NoFilesAvailable);
            }
            let target = files.get(index).cloned().ok_or_else(|| {
                EngineError::NotFound(format!("no catalog entry {} ({} files)", index, files.len()))
            })?;
            info!("engine: play index {} -> {:?}", index, target);
            self.switch_to(&target, AdvanceOrigin::User, "play").await
        }
        .await;
        self.report(result).await
    }

    /// State Store, then mpv, then the last file we ever knew about.
    async fn resolve_current(&self) -> String {
        let current = self.state.get().await.current_file;
        if !current.is_empty() {
            return current;
        }
        if let Some(name) = self.player.get_property("filename").await.as_str() {
            return name.to_string();
        }
        self.state.last_known_file().await
    }

    /// fetch → fade out → load → unpause and verify → fade in → timeline.
    async fn switch_to(&self, target: &str, origin: AdvanceOrigin, action: &str) -> Result<AdvanceOutcome> {
        let before = self.state.get().await;
        let local = self.prefetcher.ensure_local(target).await?;

        let mut volume = before.volume;
        let mut silent = false;
        let manual = origin == AdvanceOrigin::User;
        if manual && self.config.fade.fade_out_on_manual_advance && before.should_be_playing() {
            match self.fade.fade_out(self.fade_out_duration()).await {
                Ok(from) => {
                    volume = from;
                    silent = true;
                }
                Err(e) => debug!("engine: fade-out skipped: {}", e),
            }
        }
        // The fade-in starts from zero, so the new track must not start loud.
        if !silent {
            match self.player.set_volume(0).await {
                Ok(()) => self.state.mutate(|s| s.volume = 0).await,
                Err(e) => debug!("engine: could not mute before load: {}", e),
            }
        }

        if let Err(e) = self.player.load_file(&local.path).await {
            self.restore_volume(volume).await;
            return Err(player_error("loadfile failed", e));
        }

        self.state
            .mutate(|s| {
                // A replay of the same file is still a new track.
                s.begin_track(target);
                s.set_paused(false);
            })
            .await;

        self.ensure_playing().await;
        self.player.install_meter_filter().await;

        if let Err(e) = self.fade.fade_in(self.fade_in_duration(), volume).await {
            debug!("engine: fade-in failed, setting volume directly: {}", e);
            self.restore_volume(volume).await;
        }

        let outcome = AdvanceOutcome {
            previous_file: before.current_file,
            current_file: target.to_string(),
            source: local.source,
            task_id: local.task_id,
        };
        let description = format!(
            "{} -> {}",
            if outcome.previous_file.is_empty() {
                "(none)"
            } else {
                &outcome.previous_file
            },
            outcome.current_file
        );
        let details = json!({
            "previous_file": outcome.previous_file,
            "current_file": outcome.current_file,
            "source": outcome.source,
            "task_id": outcome.task_id,
            "auto": !manual,
        });
        if let Err(e) = self.timeline.record(action, description, details).await {
            warn!("engine: timeline append failed: {:#}", e);
        }
        self.notice(format!("Playing {}", target), NoticeCategory::Playback).await;
        Ok(outcome)
    }

    /// mpv must end up playing after a switch.  It sometimes ignores the first
    /// unpause, so re-query and force once more.
    async fn ensure_playing(&self) {
        if let Err(e) = self.player.set_pause(false).await {
            warn!("engine: unpause failed: {}", e);
        }
        if self.player.get_property("pause").await.as_bool() == Some(true) {
            warn!("engine: mpv still paused after load, forcing unpause");
            if let Err(e) = self.player.set_pause(false).await {
                warn!("engine: second unpause failed: {}", e);
            }
        }
    }

    async fn restore_volume(&self, volume: u8) {
        if let Err(e) = self.player.set_volume(volume).await {
            debug!("engine: could not restore volume {}: {}", volume, e);
        }
        self.state.mutate(|s| s.volume = volume).await;
    }

    fn fade_in_duration(&self) -> Duration {
        Duration::from_millis(self.config.fade.fade_in_ms)
    }

    fn fade_out_duration(&self) -> Duration {
        Duration::from_millis(self.config.fade.fade_out_ms)
    }

    /// Surface a failed operation: log, remember, notify.
    async fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("engine: operation failed: {}", e);
            self.state.set_last_error(Some(e.to_string())).await;
            self.notice(e.to_string(), NoticeCategory::Error).await;
        }
        result
    }

    async fn notice(&self, message: impl Into<String>, category: NoticeCategory) {
        self.notifier.lock().await.notify(message, category);
    }

    // ── direct operations ─────────────────────────────────────────────────────

    /// Best-effort snapshot.  Never fails.
    pub async fn status(&self) -> StatusSnapshot {
        let (state, health) = self.state.snapshot().await;
        let notice = self.notifier.lock().await.current();
        StatusSnapshot {
            state,
            mpv_ready: health.mpv_ready,
            last_error: health.last_error,
            notice,
            auto_cache: self.auto_cache.load(Ordering::Relaxed),
        }
    }

    /// Set the volume, clamped to 0..=100.
    pub async fn set_volume(&self, value: i64) -> Result<u8> {
        let volume = value.clamp(0, 100) as u8;
        let result = self
            .player
            .set_volume(volume)
            .await
            .map_err(|e| player_error("set volume failed", e));
        self.report(result).await?;
        self.state.mutate(|s| s.volume = volume).await;
        info!("engine: volume {}", volume);
        self.notice(format!("Volume {}%", volume), NoticeCategory::Volume).await;
        Ok(volume)
    }

    pub async fn adjust_volume(&self, delta: i64) -> Result<u8> {
        let current = self.state.get().await.volume as i64;
        self.set_volume(current + delta).await
    }

    /// Flip pause.  With nothing loaded this starts playback instead.
    /// Returns whether playback is now paused.
    pub async fn toggle_pause(&self) -> Result<bool> {
        if self.state.get().await.current_file.is_empty() {
            self.request_advance(Direction::Next).await?;
            return Ok(false);
        }

        let result = self
            .player
            .cycle_pause()
            .await
            .map_err(|e| player_error("pause toggle failed", e));
        self.report(result).await?;

        let reported = self.player.get_property("pause").await.as_bool();
        let paused = self
            .state
            .mutate(|s| {
                let paused = reported.unwrap_or(!s.paused);
                s.set_paused(paused);
                s.last_update_time = Utc::now();
                paused
            })
            .await;

        let (action, label) = if paused { ("pause", "Paused") } else { ("resume", "Playing") };
        let file = self.state.get().await.current_file;
        if let Err(e) = self
            .timeline
            .record(action, file.clone(), json!({ "current_file": file }))
            .await
        {
            warn!("engine: timeline append failed: {:#}", e);
        }
        self.notice(label, NoticeCategory::Playback).await;
        Ok(paused)
    }

    /// Stop mpv and reset playback to startup defaults.  The last known file
    /// survives so a later advance can continue from it.
    pub async fn stop(&self) -> Result<()> {
        let stopped = self.player.stop().await;
        let previous = self.state.get().await.current_file;
        self.state.mutate(|s| s.reset(Utc::now())).await;
        info!("engine: stopped (was {:?})", previous);

        if let Err(e) = self
            .timeline
            .record("stop", previous.clone(), json!({ "previous_file": previous }))
            .await
        {
            warn!("engine: timeline append failed: {:#}", e);
        }
        self.notice("Stopped", NoticeCategory::Playback).await;
        let result = stopped.map_err(|e| player_error("stop failed", e));
        self.report(result).await
    }

    /// Absolute seek, clamped to the known duration.  Returns the position
    /// actually requested.
    pub async fn seek(&self, seconds: f64) -> Result<f64> {
        let result = async {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(EngineError::InvalidRequest(format!(
                    "invalid seek position {}",
                    seconds
                )));
            }
            let state = self.state.get().await;
            if state.current_file.is_empty() {
                return Err(EngineError::InvalidRequest("nothing is loaded".into()));
            }
            let target = if state.duration > 0.0 {
                seconds.min(state.duration)
            } else {
                seconds
            };
            self.player
                .seek_to(target)
                .await
                .map_err(|e| player_error("seek failed", e))?;
            Ok((state.current_file, target))
        }
        .await;
        let (file, target) = self.report(result).await?;

        self.state
            .mutate(|s| {
                s.position = target;
                s.last_update_time = Utc::now();
            })
            .await;
        if let Err(e) = self
            .timeline
            .record(
                "seek",
                format!("{} @ {:.1}s", file, target),
                json!({ "current_file": file, "position": target }),
            )
            .await
        {
            warn!("engine: timeline append failed: {:#}", e);
        }
        Ok(target)
    }

    pub async fn search(&self, query: &str) -> Vec<String> {
        self.catalog.search(query).await
    }

    pub async fn timeline(&self, limit: usize) -> Vec<TimelineEvent> {
        self.timeline.recent(limit).await
    }

    pub async fn clear_timeline(&self) -> Result<()> {
        self.timeline.clear().await?;
        info!("engine: timeline cleared");
        Ok(())
    }

    pub async fn downloads(&self) -> Vec<DownloadTask> {
        self.prefetcher.tasks().await
    }

    pub async fn download(&self, id: &str) -> Result<DownloadTask> {
        self.prefetcher
            .task(id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("download task {}", id)))
    }

    /// Copy the whole remote catalog into the cache.  Syncs run one at a time.
    pub async fn sync_cache(&self) -> Result<SyncOutcome> {
        let result = async {
            let _running = self.sync_running.lock().await;
            let dir = &self.config.cache.dir;
            info!("engine: syncing remote into {:?}", dir);
            self.notice("Syncing cache", NoticeCategory::Download).await;
            self.remote
                .sync_all(dir)
                .await
                .map_err(EngineError::FetchFailed)?;
            let cached_files = list_local_cache(dir, &self.config.remote.extensions).len();
            info!("engine: sync complete, {} files cached", cached_files);
            Ok(SyncOutcome { cached_files })
        }
        .await;
        let outcome = self.report(result).await?;

        if let Err(e) = self
            .timeline
            .record(
                "sync",
                format!("{} files cached", outcome.cached_files),
                json!({ "cached_files": outcome.cached_files }),
            )
            .await
        {
            warn!("engine: timeline append failed: {:#}", e);
        }
        self.notice(
            format!("Sync complete: {} files cached", outcome.cached_files),
            NoticeCategory::Download,
        )
        .await;
        Ok(outcome)
    }

    pub async fn set_auto_cache(&self, enabled: bool) -> bool {
        let previous = self.auto_cache.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!("engine: auto-cache-next {}", if enabled { "on" } else { "off" });
            if let Err(e) = self
                .timeline
                .record("auto_cache", enabled.to_string(), json!({ "enabled": enabled }))
                .await
            {
                warn!("engine: timeline append failed: {:#}", e);
            }
        }
        enabled
    }
}

fn respond(reply: Option<Reply>, result: Result<AdvanceOutcome>) {
    match reply {
        Some(tx) => {
            if tx.send(result).is_err() {
                debug!("engine: requester went away before the reply");
            }
        }
        None => {
            if let Err(e) = result {
                debug!("engine: unattended advance failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{EndOfTrackDetector, TickSignals};
    use crate::testing::{FakePlayer, FakeRemote};
    use deck_proto::protocol::{DownloadStatus, PlaybackState};
    use serde_json::json;

    struct Rig {
        engine: Arc<Engine>,
        player: Arc<FakePlayer>,
        remote: Arc<FakeRemote>,
        rx: Option<mpsc::Receiver<EngineEvent>>,
        dir: tempfile::TempDir,
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cache.dir = dir.join("cache");
        config.cache.progress_poll_ms = 10;
        config.timeline.file = dir.join("timeline.json");
        config.fade.steps = 2;
        config.fade.fade_in_ms = 20;
        config.fade.fade_out_ms = 10;
        config
    }

    fn rig_with(files: &[&str], state: PlaybackState) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let player = Arc::new(FakePlayer::new());
        let remote = Arc::new(FakeRemote::with_files(files));
        let timeline = Arc::new(TimelineLog::open(config.timeline.file.clone(), 100));
        let (tx, rx) = mpsc::channel(16);
        let engine = Arc::new(Engine::new(
            config,
            player.clone(),
            remote.clone(),
            Arc::new(StateStore::with_state(state)),
            timeline,
            tx,
        ));
        Rig {
            engine,
            player,
            remote,
            rx: Some(rx),
            dir,
        }
    }

    fn playing(file: &str) -> PlaybackState {
        let mut state = PlaybackState::default();
        state.begin_track(file);
        state.set_paused(false);
        state.volume = 70;
        state
    }

    fn abc() -> Vec<&'static str> {
        vec!["a.mp3", "b.mp3", "c.mp3"]
    }

    impl Rig {
        fn spawn_loop(&mut self) -> CancellationToken {
            let cancel = CancellationToken::new();
            let rx = self.rx.take().unwrap();
            tokio::spawn(self.engine.clone().run(rx, cancel.clone()));
            cancel
        }

        fn loaded(&self) -> Vec<String> {
            self.player
                .commands()
                .iter()
                .filter(|c| c[0] == "loadfile")
                .filter_map(|c| c[1].as_str().map(str::to_string))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_advance_next_wraps_around() {
        let rig = rig_with(&abc(), playing("b.mp3"));
        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.previous_file, "b.mp3");
        assert_eq!(out.current_file, "c.mp3");
        assert_eq!(out.source, SourceKind::Remote);

        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.current_file, "a.mp3");

        let state = rig.engine.state().get().await;
        assert_eq!(state.current_file, "a.mp3");
        assert!(state.playing && !state.paused);

        let loaded = rig.loaded();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].ends_with("cache/c.mp3"));

        let events = rig.engine.timeline(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, "next");
        assert_eq!(events[1].details["previous_file"], "c.mp3");
    }

    #[tokio::test]
    async fn test_next_then_prev_returns_to_start() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        let back = rig.engine.advance(Direction::Prev, AdvanceOrigin::User).await.unwrap();
        assert_eq!(back.current_file, "a.mp3");
    }

    #[tokio::test]
    async fn test_catalog_refetched_for_each_advance() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();

        rig.remote.set_files(&["a.mp3", "b.mp3", "b2.mp3", "c.mp3"]);
        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.current_file, "b2.mp3");
    }

    #[tokio::test]
    async fn test_current_resolved_from_player_when_store_empty() {
        let rig = rig_with(&abc(), PlaybackState::default());
        rig.player.set("filename", json!("b.mp3"));
        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.current_file, "c.mp3");
    }

    #[tokio::test]
    async fn test_empty_catalog_is_surfaced() {
        let rig = rig_with(&[], playing("a.mp3"));
        let err = rig
            .engine
            .advance(Direction::Next, AdvanceOrigin::User)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoFilesAvailable));
        assert!(rig.loaded().is_empty());

        let status = rig.engine.status().await;
        assert_eq!(status.last_error.as_deref(), Some("no files available"));
        assert_eq!(status.notice.unwrap().category, NoticeCategory::Error);
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_load() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.remote.fail_fetch("b.mp3", "rclone: connection reset");
        let err = rig
            .engine
            .advance(Direction::Next, AdvanceOrigin::User)
            .await
            .unwrap_err();
        match err {
            EngineError::FetchFailed(reason) => assert!(reason.contains("connection reset")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rig.loaded().is_empty());
        assert_eq!(rig.engine.state().get().await.current_file, "a.mp3");
        assert_eq!(rig.engine.state().get().await.volume, 70);
    }

    #[tokio::test]
    async fn test_cached_file_skips_remote() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        let cache = rig.dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("b.mp3"), b"cached").unwrap();

        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.source, SourceKind::Cache);
        assert_eq!(out.task_id, None);
        assert_eq!(rig.remote.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_sticky_pause_is_forced_off() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.player.ignore_unpause(1);
        rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();

        assert_eq!(rig.player.property("pause"), Some(json!(false)));
        let unpauses = rig
            .player
            .commands()
            .iter()
            .filter(|c| c[0] == "set_property" && c[1] == "pause" && c[2] == json!(false))
            .count();
        assert_eq!(unpauses, 2);
    }

    #[tokio::test]
    async fn test_advance_fades_back_to_prior_volume() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();

        let writes = rig.player.volume_writes();
        assert_eq!(writes, vec![35, 0, 35, 70]);
        assert_eq!(rig.engine.state().get().await.volume, 70);
    }

    #[tokio::test]
    async fn test_end_of_track_mutes_before_load() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        let generation = rig.engine.state().get().await.track_generation;
        rig.engine
            .advance(Direction::Next, AdvanceOrigin::EndOfTrack { generation })
            .await
            .unwrap();
        assert_eq!(rig.player.volume_writes(), vec![0, 35, 70]);

        // Muted before the load, faded in after it.
        let commands = rig.player.commands();
        let mute = commands
            .iter()
            .position(|c| c[0] == "set_property" && c[1] == "volume" && c[2] == json!(0))
            .unwrap();
        let load = commands.iter().position(|c| c[0] == "loadfile").unwrap();
        assert!(mute < load);
        assert_eq!(rig.engine.state().get().await.volume, 70);

        let events = rig.engine.timeline(1).await;
        assert_eq!(events[0].details["auto"], true);
    }

    #[tokio::test]
    async fn test_replaying_only_track_starts_new_generation() {
        let mut at_end = playing("a.mp3");
        at_end.duration = 180.0;
        at_end.position = 180.0;
        at_end.normalize();
        let rig = rig_with(&["a.mp3"], at_end);
        let mut detector = EndOfTrackDetector::new(Config::default().engine);
        let signals = TickSignals::default();

        let state = rig.engine.state().get().await;
        let first = detector.observe(&state, &signals).unwrap();
        let out = rig
            .engine
            .advance(
                Direction::Next,
                AdvanceOrigin::EndOfTrack {
                    generation: first.generation,
                },
            )
            .await
            .unwrap();
        assert_eq!(out.current_file, "a.mp3");

        let state = rig.engine.state().get().await;
        assert_eq!(state.track_generation, first.generation + 1);
        assert_eq!(state.position, 0.0);

        rig.engine
            .state()
            .mutate(|s| {
                s.duration = 180.0;
                s.position = 180.0;
            })
            .await;
        let state = rig.engine.state().get().await;
        let second = detector.observe(&state, &signals).unwrap();
        assert_eq!(second.generation, first.generation + 1);
    }

    #[tokio::test]
    async fn test_play_index_on_current_track_restarts_it() {
        let rig = rig_with(&abc(), playing("b.mp3"));
        let before = rig.engine.state().get().await.track_generation;
        let out = rig.engine.play_index(1).await.unwrap();
        assert_eq!(out.current_file, "b.mp3");
        assert_eq!(rig.engine.state().get().await.track_generation, before + 1);
    }

    #[tokio::test]
    async fn test_stale_end_of_track_is_dropped() {
        let mut rig = rig_with(&abc(), playing("a.mp3"));
        let cancel = rig.spawn_loop();
        let stale = rig.engine.state().get().await.track_generation;

        let out = rig.engine.request_advance(Direction::Next).await.unwrap();
        assert_eq!(out.current_file, "b.mp3");

        rig.engine
            .events
            .send(EngineEvent::Advance {
                direction: Direction::Next,
                origin: AdvanceOrigin::EndOfTrack { generation: stale },
                reply: None,
            })
            .await
            .unwrap();

        // Processed in order, so the stale request has been seen by now.
        let out = rig.engine.request_advance(Direction::Next).await.unwrap();
        assert_eq!(out.previous_file, "b.mp3");
        assert_eq!(out.current_file, "c.mp3");
        assert_eq!(rig.loaded().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_current_end_of_track_advances() {
        let mut rig = rig_with(&abc(), playing("a.mp3"));
        let cancel = rig.spawn_loop();
        let generation = rig.engine.state().get().await.track_generation;
        rig.engine
            .events
            .send(EngineEvent::Advance {
                direction: Direction::Next,
                origin: AdvanceOrigin::EndOfTrack { generation },
                reply: None,
            })
            .await
            .unwrap();

        let out = rig.engine.request_advance(Direction::Next).await.unwrap();
        assert_eq!(out.previous_file, "b.mp3");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_request_after_loop_stops_is_busy() {
        let mut rig = rig_with(&abc(), playing("a.mp3"));
        drop(rig.rx.take());
        let err = rig.engine.request_advance(Direction::Next).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy));
    }

    #[tokio::test]
    async fn test_play_index() {
        let mut rig = rig_with(&abc(), playing("a.mp3"));
        let cancel = rig.spawn_loop();
        let out = rig.engine.request_play_index(2).await.unwrap();
        assert_eq!(out.current_file, "c.mp3");

        let err = rig.engine.request_play_index(9).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        assert_eq!(rig.engine.set_volume(150).await.unwrap(), 100);
        assert_eq!(rig.engine.adjust_volume(-30).await.unwrap(), 70);
        assert_eq!(rig.engine.adjust_volume(-500).await.unwrap(), 0);
        assert_eq!(rig.player.volume_writes(), vec![100, 70, 0]);
        assert_eq!(rig.engine.state().get().await.volume, 0);
    }

    #[tokio::test]
    async fn test_volume_error_keeps_state() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.player.set_offline(true);
        let err = rig.engine.set_volume(20).await.unwrap_err();
        assert!(matches!(err, EngineError::Player(_)));
        assert_eq!(rig.engine.state().get().await.volume, 70);
    }

    #[tokio::test]
    async fn test_toggle_pause_follows_player() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        rig.player.set("pause", json!(false));
        assert!(rig.engine.toggle_pause().await.unwrap());
        assert!(rig.engine.state().get().await.paused);
        assert!(!rig.engine.toggle_pause().await.unwrap());
        assert!(rig.engine.state().get().await.playing);

        let actions: Vec<String> = rig
            .engine
            .timeline(10)
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["pause", "resume"]);
    }

    #[tokio::test]
    async fn test_stop_resets_but_remembers_file() {
        let rig = rig_with(&abc(), playing("b.mp3"));
        let before = rig.engine.state().get().await;
        rig.engine.stop().await.unwrap();

        let state = rig.engine.state().get().await;
        assert_eq!(state.current_file, "");
        assert!(state.paused && !state.playing);
        assert_eq!(state.track_generation, before.track_generation + 1);
        assert_eq!(rig.engine.state().last_known_file().await, "b.mp3");
        assert_eq!(rig.player.count("stop"), 1);

        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(out.current_file, "c.mp3");
    }

    #[tokio::test]
    async fn test_seek_clamps_to_duration() {
        let mut start = playing("a.mp3");
        start.duration = 100.0;
        let rig = rig_with(&abc(), start);

        assert_eq!(rig.engine.seek(250.0).await.unwrap(), 100.0);
        assert_eq!(rig.engine.seek(42.5).await.unwrap(), 42.5);
        assert_eq!(rig.engine.state().get().await.position, 42.5);
        assert!(matches!(
            rig.engine.seek(-1.0).await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert_eq!(rig.player.count("seek"), 2);
    }

    #[tokio::test]
    async fn test_downloads_are_listed() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        let out = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        let id = out.task_id.unwrap();

        let task = rig.engine.download(&id).await.unwrap();
        assert_eq!(task.filename, "b.mp3");
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(rig.engine.downloads().await.len(), 1);
        assert!(matches!(
            rig.engine.download("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_copies_catalog_into_cache() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        let out = rig.engine.sync_cache().await.unwrap();
        assert_eq!(out.cached_files, 3);
        assert!(rig.dir.path().join("cache/c.mp3").is_file());

        // Synced files are then served from the cache.
        let next = rig.engine.advance(Direction::Next, AdvanceOrigin::User).await.unwrap();
        assert_eq!(next.source, SourceKind::Cache);
        assert_eq!(rig.remote.fetch_count(), 0);

        let events = rig.engine.timeline(10).await;
        assert_eq!(events[0].action, "sync");
        assert_eq!(events[0].details["cached_files"], 3);
    }

    #[tokio::test]
    async fn test_sync_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let timeline = Arc::new(TimelineLog::open(config.timeline.file.clone(), 100));
        let (tx, _rx) = mpsc::channel(4);
        let engine = Engine::new(
            config,
            Arc::new(FakePlayer::new()),
            Arc::new(FakeRemote::unreachable()),
            Arc::new(StateStore::new()),
            timeline,
            tx,
        );

        let err = engine.sync_cache().await.unwrap_err();
        assert!(matches!(err, EngineError::FetchFailed(_)));
        let (_, health) = engine.state().snapshot().await;
        assert!(health.last_error.unwrap().contains("remote unreachable"));
        assert!(engine.timeline(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_cache_toggle_and_status() {
        let rig = rig_with(&abc(), playing("a.mp3"));
        assert!(!rig.engine.status().await.auto_cache);
        rig.engine.set_auto_cache(true).await;
        assert!(rig.engine.status().await.auto_cache);
        assert!(rig.engine.auto_cache_flag().load(Ordering::Relaxed));
    }
}

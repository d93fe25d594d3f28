//! Reconciliation poller.
//!
//! Every tick asks mpv for the properties we mirror, then folds the answers
//! that actually succeeded into the State Store.  A failed query means
//! "unknown", so the previously known value stays.  All socket I/O happens
//! before the store lock is taken.

use crate::core::{AdvanceOrigin, EngineEvent};
use crate::detector::{Detection, EndOfTrackDetector, TickSignals};
use crate::mpv::{meter_rms_db, PlayerControl, PropertyReply};
use chrono::Utc;
use deck_proto::config::EngineConfig;
use deck_proto::protocol::Direction;
use deck_proto::state::StateStore;
use deck_proto::timeline::TimelineLog;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw property replies gathered in one tick.
#[derive(Debug, Clone)]
pub struct Observation {
    pub pause: PropertyReply,
    pub volume: PropertyReply,
    pub filename: PropertyReply,
    pub path: PropertyReply,
    pub media_title: PropertyReply,
    pub duration: PropertyReply,
    pub time_pos: PropertyReply,
    pub playlist: PropertyReply,
    pub eof_reached: PropertyReply,
    pub idle_active: PropertyReply,
    pub meter: PropertyReply,
}

impl Observation {
    pub async fn query(player: &dyn PlayerControl) -> Self {
        Self {
            pause: player.get_property("pause").await,
            volume: player.get_property("volume").await,
            filename: player.get_property("filename").await,
            path: player.get_property("path").await,
            media_title: player.get_property("media-title").await,
            duration: player.get_property("duration").await,
            time_pos: player.get_property("time-pos").await,
            playlist: player.get_property("playlist").await,
            eof_reached: player.get_property("eof-reached").await,
            idle_active: player.get_property("idle-active").await,
            meter: player.get_property("af-metadata/meter").await,
        }
    }

    fn replies(&self) -> [&PropertyReply; 11] {
        [
            &self.pause,
            &self.volume,
            &self.filename,
            &self.path,
            &self.media_title,
            &self.duration,
            &self.time_pos,
            &self.playlist,
            &self.eof_reached,
            &self.idle_active,
            &self.meter,
        ]
    }

    pub fn any_success(&self) -> bool {
        self.replies().iter().any(|r| r.is_success())
    }

    pub fn first_failure(&self) -> Option<&str> {
        self.replies().iter().find_map(|r| r.failure())
    }

    /// `filename`, then the basename of `path`, then `media-title`.  `None`
    /// means "keep the last known value".
    pub fn resolved_filename(&self) -> Option<String> {
        if let Some(name) = self.filename.as_str() {
            return Some(name.to_string());
        }
        if let Some(path) = self.path.as_str() {
            let base = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);
            return Some(base.to_string());
        }
        self.media_title.as_str().map(str::to_string)
    }

    pub fn playlist_files(&self) -> Option<Vec<String>> {
        let entries = self.playlist.known()?.as_array()?;
        Some(
            entries
                .iter()
                .filter_map(|e| e.get("filename").and_then(|f| f.as_str()))
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn signals(&self) -> TickSignals {
        TickSignals {
            eof_reached: self.eof_reached.as_bool(),
            idle_active: self.idle_active.as_bool(),
            rms_db: self.meter.known().and_then(meter_rms_db),
        }
    }
}

pub struct Poller {
    player: Arc<dyn PlayerControl>,
    state: Arc<StateStore>,
    timeline: Arc<TimelineLog>,
    detector: EndOfTrackDetector,
    events: mpsc::Sender<EngineEvent>,
}

impl Poller {
    pub fn new(
        player: Arc<dyn PlayerControl>,
        state: Arc<StateStore>,
        timeline: Arc<TimelineLog>,
        config: EngineConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            player,
            state,
            timeline,
            detector: EndOfTrackDetector::new(config),
            events,
        }
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("poller: running every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("poller: tick failed: {:#}", e);
                    }
                }
            }
        }
        debug!("poller: worker stopped");
    }

    /// One reconciliation pass.  Returns the end-of-track detection, if any,
    /// after it has been handed to the engine.
    pub async fn tick(&mut self) -> anyhow::Result<Option<Detection>> {
        let generation = self.state.get().await.track_generation;
        let obs = Observation::query(self.player.as_ref()).await;
        self.apply(generation, obs).await
    }

    /// Fold an observation taken while the store was at `generation` into the
    /// store.  If the engine switched tracks in the meantime the readings may
    /// describe the old track, so the whole observation is dropped.
    async fn apply(&mut self, generation: u64, obs: Observation) -> anyhow::Result<Option<Detection>> {
        self.record_health(&obs).await;

        let resolved = obs.resolved_filename();
        let playlist = obs.playlist_files();
        let now = Utc::now();
        let applied = self
            .state
            .mutate(|s| {
                if s.track_generation != generation {
                    return None;
                }
                if let Some(paused) = obs.pause.as_bool() {
                    s.set_paused(paused);
                }
                if let Some(volume) = obs.volume.as_f64() {
                    s.volume = volume.round().clamp(0.0, 100.0) as u8;
                }
                let mut change = None;
                if let Some(name) = resolved {
                    if name != s.current_file {
                        change = Some((s.current_file.clone(), name.clone()));
                        s.begin_track(name);
                    }
                }
                if let Some(duration) = obs.duration.as_f64() {
                    s.duration = duration;
                }
                if let Some(position) = obs.time_pos.as_f64() {
                    s.position = position;
                    s.last_update_time = now;
                }
                if let Some(list) = playlist {
                    s.playlist = list;
                }
                Some(change)
            })
            .await;
        let Some(change) = applied else {
            debug!("poller: track switched during the poll, discarding readings");
            return Ok(None);
        };

        if let Some((previous, current)) = change {
            info!("poller: track changed {:?} -> {:?}", previous, current);
            self.timeline
                .record(
                    "play",
                    format!("{} -> {}", display_name(&previous), current),
                    json!({ "previous_file": previous, "current_file": current, "source": "poller" }),
                )
                .await?;
        }

        let snapshot = self.state.get().await;
        let Some(detection) = self.detector.observe(&snapshot, &obs.signals()) else {
            return Ok(None);
        };

        info!(
            "poller: end of track {:?} ({}), requesting advance",
            snapshot.current_file,
            detection.reason.as_str()
        );
        if detection.reason.completes_progress() {
            self.state
                .mutate(|s| {
                    if s.track_generation == detection.generation && s.duration > 0.0 {
                        s.force_complete();
                    }
                })
                .await;
        }
        let event = EngineEvent::Advance {
            direction: Direction::Next,
            origin: AdvanceOrigin::EndOfTrack {
                generation: detection.generation,
            },
            reply: None,
        };
        if self.events.send(event).await.is_err() {
            warn!("poller: engine loop is gone, advance dropped");
        }
        Ok(Some(detection))
    }

    async fn record_health(&self, obs: &Observation) {
        let ready = obs.any_success();
        self.state.set_mpv_ready(ready).await;
        if !ready {
            let reason = obs.first_failure().unwrap_or("mpv unreachable").to_string();
            debug!("poller: no property answered: {}", reason);
            self.state.set_last_error(Some(reason)).await;
        }
    }
}

fn display_name(file: &str) -> &str {
    if file.is_empty() {
        "(none)"
    } else {
        file
    }
}

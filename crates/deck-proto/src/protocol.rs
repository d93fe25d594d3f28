use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authoritative view of playback.  Owned by the State Store and only ever
/// mutated under its lock; everything else works on snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackState {
    /// Monotonic revision counter, bumped on every mutation.
    #[serde(default)]
    pub rev: u64,
    pub playing: bool,
    pub paused: bool,
    /// Empty when no track is loaded.
    pub current_file: String,
    pub volume: u8,
    pub position: f64,
    /// `0.0` means unknown.
    pub duration: f64,
    /// Derived from position/duration by `normalize`.  Never set directly.
    pub progress: f64,
    pub last_update_time: DateTime<Utc>,
    /// Bumped whenever `current_file` changes.  Used to drop stale
    /// end-of-track advance requests.
    #[serde(default)]
    pub track_generation: u64,
    #[serde(default)]
    pub playlist: Vec<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            rev: 0,
            playing: false,
            paused: true,
            current_file: String::new(),
            volume: 100,
            position: 0.0,
            duration: 0.0,
            progress: 0.0,
            last_update_time: Utc::now(),
            track_generation: 0,
            playlist: Vec::new(),
        }
    }
}

impl PlaybackState {
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.playing = !paused;
    }

    /// True when the engine expects audio to be flowing.
    pub fn should_be_playing(&self) -> bool {
        self.playing && !self.paused && !self.current_file.is_empty()
    }

    /// Switch to a new track: clears the per-track timeline and bumps the
    /// generation.  Duration becomes unknown until the next successful poll.
    pub fn begin_track(&mut self, file: impl Into<String>) {
        self.current_file = file.into();
        self.position = 0.0;
        self.duration = 0.0;
        self.track_generation += 1;
    }

    /// Back to startup defaults.  The generation keeps counting so that any
    /// in-flight end-of-track request for the old track is recognised as stale.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let generation = self.track_generation + 1;
        let rev = self.rev;
        let volume = self.volume;
        *self = Self {
            rev,
            volume,
            last_update_time: now,
            track_generation: generation,
            ..Self::default()
        };
    }

    /// Treat the current track as finished: position snaps to duration so
    /// progress reads exactly 100.
    pub fn force_complete(&mut self) {
        debug_assert!(self.duration > 0.0, "force_complete without a known duration");
        if self.duration > 0.0 {
            self.position = self.duration;
        }
        self.normalize();
    }

    /// Advance `position` by the wall-clock time elapsed since the last
    /// update, but only while playing.
    pub fn tick_clock(&mut self, now: DateTime<Utc>) {
        let elapsed_ms = (now - self.last_update_time).num_milliseconds().max(0);
        if self.should_be_playing() {
            self.position += elapsed_ms as f64 / 1000.0;
        }
        self.last_update_time = now;
        self.normalize();
    }

    /// Re-establish every invariant: clamp position, recompute progress.
    pub fn normalize(&mut self) {
        debug_assert_eq!(
            self.playing, !self.paused,
            "playing/paused out of sync: playing={} paused={}",
            self.playing, self.paused
        );
        self.playing = !self.paused;

        if !self.duration.is_finite() || self.duration < 0.0 {
            self.duration = 0.0;
        }
        if !self.position.is_finite() || self.position < 0.0 {
            self.position = 0.0;
        }
        if self.duration > 0.0 && self.position > self.duration {
            self.position = self.duration;
        }
        self.volume = self.volume.min(100);
        self.progress = if self.duration > 0.0 {
            (100.0 * self.position / self.duration).clamp(0.0, 100.0)
        } else {
            0.0
        };
    }
}

/// What the HTTP layer gets back from a status query.  Never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub state: PlaybackState,
    pub mpv_ready: bool,
    pub last_error: Option<String>,
    pub notice: Option<Notice>,
    pub auto_cache: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Prev,
    Random,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Next => "next",
            Direction::Prev => "prev",
            Direction::Random => "random",
        }
    }
}

/// Where a playable file came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Cache,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
}

/// Progress record for one remote fetch.  Retained until restart so that
/// clients can poll it after completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub current_size: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl DownloadTask {
    /// Completion percentage, `None` while the total size is unknown.
    pub fn percent(&self) -> Option<f64> {
        match self.status {
            DownloadStatus::Completed => Some(100.0),
            _ if self.total_size == 0 => None,
            _ => Some((100.0 * self.current_size as f64 / self.total_size as f64).min(100.0)),
        }
    }
}

/// One entry of the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeCategory {
    Playback,
    Volume,
    Download,
    Error,
    Info,
}

/// A user-facing status message with its own expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub message: String,
    pub category: NoticeCategory,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_initial_state_is_paused() {
        let state = PlaybackState::default();
        assert!(state.paused);
        assert!(!state.playing);
        assert!(state.current_file.is_empty());
        assert!(!state.should_be_playing());
    }

    #[test]
    fn test_normalize_clamps_position_and_progress() {
        let mut state = PlaybackState::default();
        state.set_paused(false);
        state.duration = 200.0;
        state.position = 250.0;
        state.normalize();
        assert_eq!(state.position, 200.0);
        assert_eq!(state.progress, 100.0);

        state.position = -3.0;
        state.normalize();
        assert_eq!(state.position, 0.0);
        assert_eq!(state.progress, 0.0);

        state.position = 50.0;
        state.normalize();
        assert!((state.progress - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_duration_gives_zero_progress() {
        let mut state = PlaybackState::default();
        state.position = 42.0;
        state.duration = 0.0;
        state.normalize();
        assert_eq!(state.position, 42.0);
        assert_eq!(state.progress, 0.0);
    }

    #[test]
    fn test_tick_clock_only_advances_while_playing() {
        let start = Utc::now();
        let mut state = PlaybackState {
            current_file: "a.mp3".into(),
            duration: 10.0,
            last_update_time: start,
            ..Default::default()
        };

        state.tick_clock(start + Duration::milliseconds(500));
        assert_eq!(state.position, 0.0, "paused track must not move");

        state.set_paused(false);
        state.tick_clock(start + Duration::milliseconds(1500));
        assert!((state.position - 1.0).abs() < 1e-9);
        assert!((state.progress - 10.0).abs() < 1e-9);

        state.tick_clock(start + Duration::seconds(60));
        assert_eq!(state.position, 10.0, "clamped to duration");
    }

    #[test]
    fn test_begin_track_and_reset() {
        let mut state = PlaybackState::default();
        state.set_paused(false);
        state.begin_track("a.mp3");
        state.duration = 30.0;
        state.position = 12.0;
        state.begin_track("b.mp3");
        assert_eq!(state.track_generation, 2);
        assert_eq!(state.position, 0.0);
        assert_eq!(state.duration, 0.0);

        state.volume = 40;
        state.reset(Utc::now());
        assert!(state.paused && !state.playing);
        assert!(state.current_file.is_empty());
        assert_eq!(state.volume, 40);
        assert_eq!(state.track_generation, 3);
    }

    #[test]
    fn test_force_complete() {
        let mut state = PlaybackState {
            duration: 180.0,
            position: 179.95,
            ..Default::default()
        };
        state.force_complete();
        assert_eq!(state.position, 180.0);
        assert_eq!(state.progress, 100.0);
    }

    #[test]
    #[should_panic(expected = "force_complete without a known duration")]
    fn test_force_complete_without_duration_fails_fast() {
        let mut state = PlaybackState::default();
        state.force_complete();
    }

    #[test]
    fn test_download_percent() {
        let mut task = DownloadTask {
            id: "t".into(),
            filename: "a.mp3".into(),
            total_size: 0,
            current_size: 10,
            status: DownloadStatus::Downloading,
            error: None,
            start_time: Utc::now(),
        };
        assert_eq!(task.percent(), None);
        task.total_size = 40;
        assert_eq!(task.percent(), Some(25.0));
        task.status = DownloadStatus::Completed;
        assert_eq!(task.percent(), Some(100.0));
    }

    #[test]
    fn test_status_snapshot_flattens_state() {
        let snapshot = StatusSnapshot {
            state: PlaybackState::default(),
            mpv_ready: true,
            last_error: None,
            notice: None,
            auto_cache: false,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["paused"], true);
        assert_eq!(json["mpv_ready"], true);
        assert_eq!(json["current_file"], "");
    }
}

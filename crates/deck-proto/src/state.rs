use crate::protocol::PlaybackState;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// How the external player looked on the most recent poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerHealth {
    pub mpv_ready: bool,
    pub last_error: Option<String>,
}

struct Inner {
    playback: PlaybackState,
    health: PlayerHealth,
    /// Survives `stop`, used as the last resort when resolving the current file.
    last_known_file: String,
}

/// Single lock around the playback record.
///
/// Mutations take a synchronous closure, so nothing can `.await` (and
/// therefore nothing can talk to mpv) while the lock is held.  Reads hand out
/// clones, never references.
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_state(PlaybackState::default())
    }

    pub fn with_state(playback: PlaybackState) -> Self {
        let last_known_file = playback.current_file.clone();
        Self {
            inner: RwLock::new(Inner {
                playback,
                health: PlayerHealth::default(),
                last_known_file,
            }),
        }
    }

    pub async fn get(&self) -> PlaybackState {
        self.inner.read().await.playback.clone()
    }

    /// Apply `f` under the write lock, then recompute derived fields.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut PlaybackState) -> R) -> R {
        let mut inner = self.inner.write().await;
        let result = f(&mut inner.playback);
        inner.playback.normalize();
        inner.playback.rev += 1;
        if !inner.playback.current_file.is_empty()
            && inner.playback.current_file != inner.last_known_file
        {
            inner.last_known_file = inner.playback.current_file.clone();
        }
        result
    }

    pub async fn health(&self) -> PlayerHealth {
        self.inner.read().await.health.clone()
    }

    pub async fn set_mpv_ready(&self, ready: bool) {
        self.inner.write().await.health.mpv_ready = ready;
    }

    pub async fn set_last_error(&self, error: Option<String>) {
        self.inner.write().await.health.last_error = error;
    }

    pub async fn last_known_file(&self) -> String {
        self.inner.read().await.last_known_file.clone()
    }

    /// Playback and health read under one lock acquisition.
    pub async fn snapshot(&self) -> (PlaybackState, PlayerHealth) {
        let inner = self.inner.read().await;
        (inner.playback.clone(), inner.health.clone())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutate_recomputes_progress_and_bumps_rev() {
        let store = StateStore::new();
        let rev = store.get().await.rev;
        store
            .mutate(|s| {
                s.duration = 100.0;
                s.position = 40.0;
            })
            .await;
        let state = store.get().await;
        assert_eq!(state.rev, rev + 1);
        assert!((state.progress - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = StateStore::new();
        let mut snapshot = store.get().await;
        snapshot.current_file = "changed.mp3".into();
        assert!(store.get().await.current_file.is_empty());
    }

    #[tokio::test]
    async fn test_last_known_file_survives_reset() {
        let store = StateStore::new();
        store.mutate(|s| s.begin_track("a.mp3")).await;
        store.mutate(|s| s.reset(chrono::Utc::now())).await;
        assert!(store.get().await.current_file.is_empty());
        assert_eq!(store.last_known_file().await, "a.mp3");
    }

    #[tokio::test]
    async fn test_health_is_separate_from_playback() {
        let store = StateStore::new();
        store.set_mpv_ready(true).await;
        store.set_last_error(Some("socket missing".into())).await;
        let (playback, health) = store.snapshot().await;
        assert!(health.mpv_ready);
        assert_eq!(health.last_error.as_deref(), Some("socket missing"));
        assert_eq!(playback.rev, 0);
    }
}

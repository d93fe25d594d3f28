//! Volume ramps.  Each step is written to mpv and mirrored into the State
//! Store so observers see the ramp rather than a jump.

use crate::mpv::{IpcError, PlayerControl};
use deck_proto::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Linear ramp from `start` to `end` in `steps` values.  The first value is
/// one step away from `start`, the last is exactly `end`.
pub fn ramp(start: u8, end: u8, steps: u32) -> Vec<u8> {
    let steps = steps.max(1);
    let (start, end) = (start.min(100) as f64, end.min(100) as f64);
    (1..=steps)
        .map(|i| {
            let v = start + (end - start) * i as f64 / steps as f64;
            v.round().clamp(0.0, 100.0) as u8
        })
        .collect()
}

pub struct FadeController {
    player: Arc<dyn PlayerControl>,
    state: Arc<StateStore>,
    steps: u32,
    /// Held for the length of a ramp so two fades never interleave.
    running: Mutex<()>,
}

impl FadeController {
    pub fn new(player: Arc<dyn PlayerControl>, state: Arc<StateStore>, steps: u32) -> Self {
        Self {
            player,
            state,
            steps: steps.max(1),
            running: Mutex::new(()),
        }
    }

    /// Ramp from silence up to `target`.
    pub async fn fade_in(&self, duration: Duration, target: u8) -> Result<(), IpcError> {
        self.run(0, target, duration).await
    }

    /// Ramp from the current volume down to silence.  Returns the volume the
    /// ramp started from.
    pub async fn fade_out(&self, duration: Duration) -> Result<u8, IpcError> {
        let start = self.state.get().await.volume;
        self.run(start, 0, duration).await?;
        Ok(start)
    }

    async fn run(&self, start: u8, end: u8, duration: Duration) -> Result<(), IpcError> {
        let _guard = self.running.lock().await;
        let values = ramp(start, end, self.steps);
        let pause = duration / self.steps;
        debug!("fade: {} -> {} over {:?}", start, end, duration);

        let last = values.len().saturating_sub(1);
        for (i, volume) in values.into_iter().enumerate() {
            self.player.set_volume(volume).await?;
            self.state.mutate(|s| s.volume = volume).await;
            if i < last {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(())
    }
}

/// Clock/interpolator: moves `position` forward at wall-clock rate between
/// polls so progress never freezes while mpv is slow to answer.
use deck_proto::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn run_clock(state: Arc<StateStore>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = chrono::Utc::now();
                state.mutate(|s| s.tick_clock(now)).await;
            }
        }
    }
    debug!("clock: worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_position_advances_only_while_playing() {
        let state = Arc::new(StateStore::new());
        state
            .mutate(|s| {
                s.begin_track("a.mp3");
                s.duration = 600.0;
            })
            .await;

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_clock(
            state.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(state.get().await.position, 0.0, "paused: no movement");

        state.mutate(|s| s.set_paused(false)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let moved = state.get().await;
        assert!(moved.position > 0.1, "position {}", moved.position);
        assert!(moved.position < 5.0);
        assert!(moved.progress > 0.0);

        cancel.cancel();
        worker.await.unwrap();
    }
}

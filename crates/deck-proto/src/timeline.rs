use crate::protocol::TimelineEvent;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Bounded audit log of state-changing operations.
///
/// Only the most recent `max_events` entries are kept.  The whole log is
/// rewritten as one JSON array after every append.
pub struct TimelineLog {
    path: PathBuf,
    max_events: usize,
    events: Mutex<VecDeque<TimelineEvent>>,
}

impl TimelineLog {
    /// Open the log at `path`, loading whatever was persisted before.  A
    /// missing or unreadable file starts an empty log.
    pub fn open(path: PathBuf, max_events: usize) -> Self {
        let max_events = max_events.max(1);
        let mut events: VecDeque<TimelineEvent> = Self::load(&path).into();
        while events.len() > max_events {
            events.pop_front();
        }
        Self {
            path,
            max_events,
            events: Mutex::new(events),
        }
    }

    pub async fn record(
        &self,
        action: &str,
        description: impl Into<String>,
        details: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.append(TimelineEvent {
            timestamp: Utc::now(),
            action: action.to_string(),
            description: description.into(),
            details,
        })
        .await
    }

    pub async fn append(&self, event: TimelineEvent) -> anyhow::Result<()> {
        let mut events = self.events.lock().await;
        debug!("timeline: {} {}", event.action, event.description);
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
        // Persist under the lock so concurrent appends land on disk in order.
        self.save(&events).await
    }

    /// Most recent `limit` events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<TimelineEvent> {
        let events = self.events.lock().await;
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut events = self.events.lock().await;
        events.clear();
        self.save(&events).await
    }

    async fn save(&self, events: &VecDeque<TimelineEvent>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list: Vec<&TimelineEvent> = events.iter().collect();
        let json = serde_json::to_string_pretty(&list)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    fn load(path: &Path) -> Vec<TimelineEvent> {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(events) = serde_json::from_str::<Vec<TimelineEvent>>(&content) {
                return events;
            }
        }
        Vec::new()
    }
}

//! Notification throttler.
//!
//! One notice is visible at a time.  Anything arriving inside the cooldown
//! window waits in a short queue, where a newer notice replaces an older
//! queued one of the same category.  Visible notices carry an expiry so
//! stale ones clear themselves.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deck_proto::config::NotifyConfig;
use deck_proto::protocol::{Notice, NoticeCategory};
use std::collections::VecDeque;
use tracing::debug;

pub struct Notifier {
    cooldown: ChronoDuration,
    display: ChronoDuration,
    max_pending: usize,
    current: Option<Notice>,
    pending: VecDeque<(String, NoticeCategory)>,
    last_emitted: Option<DateTime<Utc>>,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            cooldown: ChronoDuration::milliseconds(config.cooldown_ms as i64),
            display: ChronoDuration::milliseconds(config.display_ms as i64),
            max_pending: config.max_pending.max(1),
            current: None,
            pending: VecDeque::new(),
            last_emitted: None,
        }
    }

    pub fn notify(&mut self, message: impl Into<String>, category: NoticeCategory) {
        self.notify_at(message, category, Utc::now());
    }

    pub fn current(&mut self) -> Option<Notice> {
        self.current_at(Utc::now())
    }

    pub fn notify_at(
        &mut self,
        message: impl Into<String>,
        category: NoticeCategory,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        self.promote(now);
        if self.cooled_down(now) && self.pending.is_empty() {
            self.emit(message, category, now);
            return;
        }

        if let Some(slot) = self.pending.iter_mut().find(|(_, c)| *c == category) {
            slot.0 = message;
        } else {
            self.pending.push_back((message, category));
            if self.pending.len() > self.max_pending {
                self.pending.pop_front();
            }
        }
        debug!("notify: queued, {} pending", self.pending.len());
    }

    /// The visible notice at `now`, if it has not expired.
    pub fn current_at(&mut self, now: DateTime<Utc>) -> Option<Notice> {
        self.promote(now);
        if self.current.as_ref().is_some_and(|n| n.expires_at <= now) {
            self.current = None;
        }
        self.current.clone()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn cooled_down(&self, now: DateTime<Utc>) -> bool {
        self.last_emitted
            .map_or(true, |last| now - last >= self.cooldown)
    }

    fn promote(&mut self, now: DateTime<Utc>) {
        if !self.cooled_down(now) {
            return;
        }
        if let Some((message, category)) = self.pending.pop_front() {
            self.emit(message, category, now);
        }
    }

    fn emit(&mut self, message: String, category: NoticeCategory, now: DateTime<Utc>) {
        self.current = Some(Notice {
            message,
            category,
            created_at: now,
            expires_at: now + self.display,
        });
        self.last_emitted = Some(now);
    }
}

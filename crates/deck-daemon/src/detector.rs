//! End-of-track detection.
//!
//! mpv does not reliably tell us a track is over, so several independent
//! signals are checked every poll tick, in a fixed priority order.  The first
//! rule that holds wins.  A track fires at most once; the detector only
//! re-arms when the State Store reports a new track generation.

use deck_proto::config::EngineConfig;
use deck_proto::protocol::PlaybackState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EndOfFile,
    IdleWhilePlaying,
    ProgressComplete,
    StuckNearEnd,
    PositionStalled,
    Silence,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::EndOfFile => "eof-reached",
            EndReason::IdleWhilePlaying => "idle-while-playing",
            EndReason::ProgressComplete => "progress-complete",
            EndReason::StuckNearEnd => "stuck-near-end",
            EndReason::PositionStalled => "position-stalled",
            EndReason::Silence => "silence",
        }
    }

    /// Reasons derived from progress, after which progress should read 100.
    pub fn completes_progress(&self) -> bool {
        matches!(self, EndReason::ProgressComplete | EndReason::StuckNearEnd)
    }
}

/// Side-channel readings from one poll tick.  `None` means the query failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSignals {
    pub eof_reached: Option<bool>,
    pub idle_active: Option<bool>,
    pub rms_db: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub reason: EndReason,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    generation: u64,
    ticks_on_track: u32,
    prev_progress: Option<f64>,
    progress_repeats: u32,
    prev_position: Option<f64>,
    position_repeats: u32,
    silent_ticks: u32,
}

struct TickView<'a> {
    state: &'a PlaybackState,
    signals: &'a TickSignals,
    book: &'a Bookkeeping,
    config: &'a EngineConfig,
}

impl TickView<'_> {
    /// mpv's own flags lag behind a fresh `loadfile`; ignore them briefly.
    fn settled(&self) -> bool {
        self.book.ticks_on_track > self.config.grace_ticks
    }
}

type Rule = fn(&TickView<'_>) -> bool;

const RULES: &[(EndReason, Rule)] = &[
    (EndReason::EndOfFile, end_of_file),
    (EndReason::IdleWhilePlaying, idle_while_playing),
    (EndReason::ProgressComplete, progress_complete),
    (EndReason::StuckNearEnd, stuck_near_end),
    (EndReason::PositionStalled, position_stalled),
    (EndReason::Silence, sustained_silence),
];

fn end_of_file(v: &TickView<'_>) -> bool {
    v.settled() && v.signals.eof_reached == Some(true)
}

fn idle_while_playing(v: &TickView<'_>) -> bool {
    v.settled() && v.state.should_be_playing() && v.signals.idle_active == Some(true)
}

fn progress_complete(v: &TickView<'_>) -> bool {
    v.state.duration > 0.0 && v.state.progress >= v.config.complete_percent
}

fn stuck_near_end(v: &TickView<'_>) -> bool {
    v.state.should_be_playing()
        && v.state.duration > 0.0
        && v.state.progress > v.config.near_end_percent
        && v.book.progress_repeats >= 1
}

fn position_stalled(v: &TickView<'_>) -> bool {
    v.state.should_be_playing()
        && v.state.duration <= 0.0
        && v.state.position > 0.0
        && v.book.position_repeats >= v.config.stable_ticks
}

fn sustained_silence(v: &TickView<'_>) -> bool {
    v.state.should_be_playing()
        && v.state.position > v.config.silence_min_position_secs
        && v.book.silent_ticks >= v.config.silence_ticks
}

fn same(a: Option<f64>, b: f64) -> bool {
    a.map_or(false, |a| (a - b).abs() < 1e-6)
}

pub struct EndOfTrackDetector {
    config: EngineConfig,
    book: Bookkeeping,
    /// Generation we already fired for.
    fired_for: Option<u64>,
}

impl EndOfTrackDetector {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            book: Bookkeeping::default(),
            fired_for: None,
        }
    }

    /// Feed one poll tick.  Returns a detection at most once per track.
    pub fn observe(&mut self, state: &PlaybackState, signals: &TickSignals) -> Option<Detection> {
        if state.track_generation != self.book.generation {
            self.book = Bookkeeping {
                generation: state.track_generation,
                ..Default::default()
            };
        }
        self.update_bookkeeping(state, signals);

        if state.current_file.is_empty() || self.fired_for == Some(state.track_generation) {
            return None;
        }

        let view = TickView {
            state,
            signals,
            book: &self.book,
            config: &self.config,
        };
        let reason = RULES
            .iter()
            .find(|(_, rule)| rule(&view))
            .map(|(reason, _)| *reason)?;

        self.fired_for = Some(state.track_generation);
        self.book = Bookkeeping {
            generation: state.track_generation,
            ..Default::default()
        };
        Some(Detection {
            reason,
            generation: state.track_generation,
        })
    }

    fn update_bookkeeping(&mut self, state: &PlaybackState, signals: &TickSignals) {
        let book = &mut self.book;
        book.ticks_on_track = book.ticks_on_track.saturating_add(1);

        if same(book.prev_progress, state.progress) {
            book.progress_repeats += 1;
        } else {
            book.progress_repeats = 0;
        }
        book.prev_progress = Some(state.progress);

        if same(book.prev_position, state.position) {
            book.position_repeats += 1;
        } else {
            book.position_repeats = 0;
        }
        book.prev_position = Some(state.position);

        match signals.rms_db {
            Some(db) if db < self.config.silence_db => book.silent_ticks += 1,
            Some(_) => book.silent_ticks = 0,
            None => {}
        }
    }
}

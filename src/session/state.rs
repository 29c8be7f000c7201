use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::RecorderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    PreparingRecord,
    Recording,
    PreparingReplay,
    Replaying,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::PreparingRecord => "preparing_record",
            Phase::Recording => "recording",
            Phase::PreparingReplay => "preparing_replay",
            Phase::Replaying => "replaying",
        }
    }

    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Phase::Idle)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local replay position, in seconds, that stops advancing while paused.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReplayClock {
    running_since: Option<Instant>,
    banked: Duration,
    started: bool,
}

impl ReplayClock {
    pub(crate) fn start(&mut self, now: Instant) {
        self.banked = Duration::ZERO;
        self.running_since = Some(now);
        self.started = true;
    }

    pub(crate) fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.banked = self.banked.saturating_add(now.saturating_duration_since(since));
        }
    }

    pub(crate) fn resume(&mut self, now: Instant) {
        if self.started && self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// `None` until the replay has started.
    pub(crate) fn position(&self, now: Instant) -> Option<f64> {
        if !self.started {
            return None;
        }
        let running = self
            .running_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        Some(self.banked.saturating_add(running).as_secs_f64())
    }
}

/// Per-client session record. Everything except the recorder id and the
/// selected server is session scoped and cleared on return to idle.
#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    pub(crate) phase: Phase,
    pub(crate) recorder_id: RecorderId,
    pub(crate) selected_server: usize,
    pub(crate) paused: bool,
    pub(crate) replay_file: Option<String>,
    pub(crate) replay_clock: ReplayClock,
    pub(crate) start_replay_sent: bool,
}

impl SessionState {
    pub(crate) fn new(recorder_id: RecorderId) -> Self {
        Self {
            phase: Phase::Idle,
            recorder_id,
            selected_server: 0,
            paused: false,
            replay_file: None,
            replay_clock: ReplayClock::default(),
            start_replay_sent: false,
        }
    }

    pub(crate) fn reset_session_scope(&mut self) {
        self.phase = Phase::Idle;
        self.paused = false;
        self.replay_file = None;
        self.replay_clock = ReplayClock::default();
        self.start_replay_sent = false;
    }
}

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::info;

use crate::clock::Timestamp;

/// Echoes kept waiting before the oldest is forgotten.
const MAX_OUTSTANDING: usize = 16;

/// Round-trip timing through the room. Purely diagnostic.
#[derive(Debug, Default)]
pub struct LatencyMonitor {
    outstanding: BTreeSet<Timestamp>,
    last: Option<Duration>,
}

impl LatencyMonitor {
    /// Remembers a round-trip message that actually left this client.
    /// Only the newest `MAX_OUTSTANDING` unanswered sends are tracked.
    pub fn sent(&mut self, send_instant: Timestamp) {
        self.outstanding.insert(send_instant);
        while self.outstanding.len() > MAX_OUTSTANDING {
            self.outstanding.pop_first();
        }
    }

    /// Records the echo of our own round-trip message. Repeated deliveries
    /// and echoes of untracked sends are ignored.
    pub fn observe(&mut self, send_instant: Timestamp, now: Timestamp) -> Option<Duration> {
        if !self.outstanding.remove(&send_instant) {
            return None;
        }
        let elapsed = now.saturating_duration_since(send_instant);
        info!("Round trip through relay: {}ms", elapsed.as_millis());
        self.last = Some(elapsed);
        Some(elapsed)
    }

    #[must_use]
    pub const fn last(&self) -> Option<Duration> {
        self.last
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

//! Shared notion of "now" across participants.
//!
//! [`ClockSync`] adds a measured offset to the local system clock. The offset
//! is refreshed in the background from an SNTP server; reads never block and
//! keep using the last known offset when the time source is unreachable.
mod sntp;
mod timestamp;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arcshift::ArcShift;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use sntp::SntpSource;
pub use timestamp::Timestamp;

#[cfg(test)]
pub(crate) use manual::ManualClock;


/// Source of the shared session time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClockSample {
    offset_ms: i64,
    synced_at: Option<Timestamp>,
}

/// Local clock corrected by the last offset measured against a time source.
#[derive(Clone)]
pub struct ClockSync {
    sample: ArcShift<ClockSample>,
}

impl ClockSync {
    /// A clock with no correction; `now()` is the local system time.
    #[must_use]
    pub fn local() -> Self {
        Self {
            sample: ArcShift::new(ClockSample {
                offset_ms: 0,
                synced_at: None,
            }),
        }
    }

    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.sample.shared_get().offset_ms
    }

    #[must_use]
    pub fn last_synced(&self) -> Option<Timestamp> {
        self.sample.shared_get().synced_at
    }

    pub(crate) fn apply_offset(&mut self, offset_ms: i64) {
        let synced_at = system_now().offset_by(offset_ms);
        self.sample.rcu(|_current| ClockSample {
            offset_ms,
            synced_at: Some(synced_at),
        });
    }

    /// Queries `source` once, then every `interval`, updating the shared offset.
    ///
    /// Failures keep the previous offset.
    pub fn spawn_refresh(&self, source: SntpSource, interval: Duration) -> JoinHandle<()> {
        let mut clock = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut first = true;
            loop {
                ticker.tick().await;
                match source.query_offset().await {
                    Ok(offset_ms) => {
                        if first {
                            info!(
                                "Clock synced against {} (offset {}ms)",
                                source.addr(),
                                offset_ms
                            );
                        } else {
                            debug!("Clock offset {}ms from {}", offset_ms, source.addr());
                        }
                        clock.apply_offset(offset_ms);
                        first = false;
                    }
                    Err(err) => {
                        warn!(
                            "Clock sync failed ({}); keeping offset {}ms",
                            err,
                            clock.offset_ms()
                        );
                    }
                }
            }
        })
    }
}

impl Clock for ClockSync {
    fn now(&self) -> Timestamp {
        system_now().offset_by(self.offset_ms())
    }
}

pub(crate) fn system_now() -> Timestamp {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    Timestamp::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
}

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::clock::{Clock, Timestamp};
use crate::protocol::RecorderId;

use super::state::Phase;

/// A state change every member applies at the same scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransitionKind {
    StartRecording,
    EndRecording,
    StartReplay,
    EndReplay,
}

impl TransitionKind {
    /// Whether the transition may fire from `phase`.
    #[must_use]
    pub const fn accepts(self, phase: Phase) -> bool {
        match self {
            TransitionKind::StartRecording => matches!(phase, Phase::PreparingRecord),
            TransitionKind::EndRecording => matches!(phase, Phase::Recording),
            TransitionKind::StartReplay => matches!(phase, Phase::PreparingReplay),
            TransitionKind::EndReplay => {
                matches!(phase, Phase::Replaying | Phase::PreparingReplay)
            }
        }
    }

    #[must_use]
    pub const fn target_phase(self) -> Phase {
        match self {
            TransitionKind::StartRecording => Phase::Recording,
            TransitionKind::StartReplay => Phase::Replaying,
            TransitionKind::EndRecording | TransitionKind::EndReplay => Phase::Idle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransitionKind::StartRecording => "start_recording",
            TransitionKind::EndRecording => "end_recording",
            TransitionKind::StartReplay => "start_replay",
            TransitionKind::EndReplay => "end_replay",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    OnTime,
    /// The target had already passed on the first check.
    Late { by_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierFired {
    pub kind: TransitionKind,
    pub target: Timestamp,
    pub recorder_id: RecorderId,
    pub outcome: BarrierOutcome,
    pub fired_at: Timestamp,
}

/// Target instant for a transition requested now.
#[must_use]
pub fn schedule(clock: &dyn Clock, guard: Duration) -> Timestamp {
    clock.now().saturating_add(guard)
}

/// Sleeps in `poll` steps until `clock` reaches `target`.
///
/// Returns immediately with [`BarrierOutcome::Late`] when the target is
/// already behind on the first read. There is no timeout.
pub async fn wait_for_instant(clock: &dyn Clock, target: Timestamp, poll: Duration) -> BarrierOutcome {
    let now = clock.now();
    if now > target {
        return BarrierOutcome::Late {
            by_ms: now.as_millis().saturating_sub(target.as_millis()),
        };
    }
    loop {
        if clock.now() >= target {
            return BarrierOutcome::OnTime;
        }
        let remaining = target.saturating_duration_since(clock.now());
        tokio::time::sleep(remaining.min(poll)).await;
    }
}

struct PendingBarrier {
    target: Timestamp,
    recorder_id: RecorderId,
    abort: AbortHandle,
}

/// Armed barrier wait tasks, at most one per transition kind.
///
/// Firings are reported on the channel returned by [`BarrierScheduler::new`];
/// the receiver decides whether they still apply.
pub struct BarrierScheduler {
    clock: Arc<dyn Clock>,
    poll: Duration,
    pending: BTreeMap<TransitionKind, PendingBarrier>,
    fired_tx: mpsc::UnboundedSender<BarrierFired>,
}

impl BarrierScheduler {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        poll: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<BarrierFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                poll,
                pending: BTreeMap::new(),
                fired_tx,
            },
            fired_rx,
        )
    }

    /// Spawns the wait for `kind`. Returns `false` and keeps the existing
    /// wait when one is already pending for that kind.
    pub fn arm(&mut self, kind: TransitionKind, target: Timestamp, recorder_id: RecorderId) -> bool {
        if let Some(existing) = self.pending.get(&kind) {
            debug!(
                "{} already armed for {}; ignoring target {}",
                kind, existing.target, target
            );
            return false;
        }
        let clock = Arc::clone(&self.clock);
        let poll = self.poll;
        let fired_tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = wait_for_instant(clock.as_ref(), target, poll).await;
            let fired = BarrierFired {
                kind,
                target,
                recorder_id,
                outcome,
                fired_at: clock.now(),
            };
            if fired_tx.send(fired).is_err() {
                // Session loop is gone.
            }
        });
        debug!("Armed {} for {} (session {})", kind, target, recorder_id);
        self.pending.insert(
            kind,
            PendingBarrier {
                target,
                recorder_id,
                abort: handle.abort_handle(),
            },
        );
        true
    }

    /// Forgets the wait that produced `fired`. Firings from waits that were
    /// cancelled or replaced return `false`.
    pub fn complete(&mut self, fired: &BarrierFired) -> bool {
        let matches = self.pending.get(&fired.kind).is_some_and(|pending| {
            pending.target == fired.target && pending.recorder_id == fired.recorder_id
        });
        if matches {
            self.pending.remove(&fired.kind);
        }
        matches
    }

    pub fn cancel_all(&mut self) {
        for (kind, pending) in std::mem::take(&mut self.pending) {
            debug!("Cancelled {} armed for {}", kind, pending.target);
            pending.abort.abort();
        }
    }

    #[must_use]
    pub fn is_pending(&self, kind: TransitionKind) -> bool {
        self.pending.contains_key(&kind)
    }
}

impl Drop for BarrierScheduler {
    fn drop(&mut self) {
        for pending in self.pending.values() {
            pending.abort.abort();
        }
    }
}

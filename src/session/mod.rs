//! The session state machine and the task that runs it.
//!
//! Transitions that must happen everywhere at once (start/end recording,
//! start/end replay) are broadcast with a target instant on the shared
//! clock; every member, the sender included, arms a wait and applies the
//! transition when the instant arrives and the predecessor phase still holds.
mod barrier;
mod command;
mod control;
mod hooks;
mod latency;
mod peers;
mod protocol;
mod runner;
mod settings;
mod snapshot;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::clock::{ClockSync, SntpSource};
use crate::download::HttpFetcher;
use crate::error::AppResult;
use crate::shutdown::ShutdownReceiver;
use crate::transport::TcpTransport;

pub use barrier::{
    BarrierFired, BarrierOutcome, BarrierScheduler, TransitionKind, schedule, wait_for_instant,
};
pub use command::{SessionCommand, parse_command};
pub use hooks::{LoggingHooks, SessionHooks};
pub use latency::LatencyMonitor;
pub use peers::{PeerLiveState, PeerRegistry};
pub use protocol::SessionProtocol;
pub use runner::SessionRunner;
pub use settings::{
    DEFAULT_BARRIER_POLL, DEFAULT_CACHE_DIR, DEFAULT_GUARD_INTERVAL, DEFAULT_TICK_INTERVAL,
    SessionSettings,
};
pub use snapshot::{PeerSnapshot, SessionSnapshot};
pub use state::Phase;

#[cfg(test)]
mod tests;

pub const DEFAULT_CLOCK_REFRESH: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything `join` needs besides the protocol settings.
#[derive(Debug, Clone)]
pub struct ParticipantPlan {
    pub relay: String,
    pub settings: SessionSettings,
    pub time_server: Option<SntpSource>,
    pub clock_refresh: Duration,
    pub fetch_timeout: Duration,
}

/// Joins the room at `plan.relay` and runs the session with operator
/// commands from stdin until shutdown or `quit`.
///
/// # Errors
///
/// Returns an error when the relay cannot be joined, the HTTP client cannot
/// be built, or the room connection is lost.
pub async fn run_participant(plan: ParticipantPlan, shutdown: ShutdownReceiver) -> AppResult<()> {
    let clock = ClockSync::local();
    let refresh = plan
        .time_server
        .map(|source| clock.spawn_refresh(source, plan.clock_refresh));
    let fetcher = HttpFetcher::new(plan.fetch_timeout)?;
    let connection = TcpTransport::connect(&plan.relay, &plan.settings.name).await?;
    info!(
        "Session {} as '{}', guard interval {}ms",
        plan.settings.recorder_id,
        plan.settings.name,
        plan.settings.guard_interval.as_millis()
    );

    let (protocol, barriers) = SessionProtocol::new(
        plan.settings,
        Arc::new(clock),
        Box::new(connection.transport),
        &connection.members,
        Box::new(LoggingHooks),
        Arc::new(fetcher),
    );
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let stdin_task = control::spawn_stdin_commands(command_tx);
    let runner = SessionRunner::new(protocol, barriers, connection.events, command_rx);
    let result = runner.run(shutdown).await;

    stdin_task.abort();
    if let Some(handle) = refresh {
        handle.abort();
    }
    result
}

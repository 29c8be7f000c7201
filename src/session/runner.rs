use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::{AppError, AppResult, SessionError};
use crate::shutdown::ShutdownReceiver;
use crate::transport::TransportEvent;

use super::barrier::BarrierFired;
use super::command::SessionCommand;
use super::protocol::SessionProtocol;
use super::snapshot::SessionSnapshot;

/// The single task that owns a [`SessionProtocol`].
///
/// Selects over the tick, transport events, barrier firings, operator
/// commands and shutdown, and publishes a snapshot after each step.
pub struct SessionRunner {
    protocol: SessionProtocol,
    tick_interval: Duration,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    barriers: mpsc::UnboundedReceiver<BarrierFired>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionRunner {
    #[must_use]
    pub fn new(
        protocol: SessionProtocol,
        barriers: mpsc::UnboundedReceiver<BarrierFired>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let tick_interval = protocol.settings().tick_interval;
        let (snapshot_tx, _snapshot_rx) = watch::channel(protocol.snapshot());
        Self {
            protocol,
            tick_interval,
            events,
            barriers,
            commands,
            snapshot_tx,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Runs until shutdown, `quit`, or loss of the room connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the room connection is lost.
    pub async fn run(mut self, mut shutdown: ShutdownReceiver) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.protocol.tick() {
                        warn!("Tick failed: {}", err);
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break Err(AppError::session(SessionError::RelayConnectionClosed));
                    };
                    if let Err(err) = self.protocol.handle_transport_event(event) {
                        break Err(err);
                    }
                }
                Some(fired) = self.barriers.recv() => self.protocol.handle_barrier(fired),
                Some(command) = self.commands.recv() => {
                    if command == SessionCommand::Quit {
                        break Ok(());
                    }
                    self.apply_command(command);
                }
            }
            self.snapshot_tx.send_replace(self.protocol.snapshot());
        };

        self.protocol.shutdown();
        self.snapshot_tx.send_replace(self.protocol.snapshot());
        info!("Left session {}", self.protocol.recorder_id());
        result
    }

    fn apply_command(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::PrepareRecording => self.protocol.request_prepare_recording(),
            SessionCommand::StartRecording => self.protocol.request_start_recording(),
            SessionCommand::EndRecording => self.protocol.request_end_recording(),
            SessionCommand::StartDownload { replay_file } => {
                self.protocol.request_start_download(&replay_file)
            }
            SessionCommand::EndReplay => self.protocol.request_end_replay(),
            SessionCommand::SetPaused(paused) => self.protocol.request_set_paused(paused),
            SessionCommand::SwitchServer(index) => self.protocol.request_switch_server(index),
            SessionCommand::SelectSession(recorder_id) => {
                self.protocol.select_session(recorder_id)
            }
            SessionCommand::Preview(seconds) => {
                self.protocol.set_preview_time(seconds);
                Ok(())
            }
            SessionCommand::Ping => self.protocol.measure_round_trip(),
            SessionCommand::Status => {
                info!("{}", self.protocol.snapshot());
                Ok(())
            }
            SessionCommand::Quit => Ok(()),
        };
        if let Err(err) = result {
            warn!("{}", err);
        }
    }
}

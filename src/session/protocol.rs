use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::download::{ArtifactFetcher, DownloadCoordinator, validate_replay_name};
use crate::error::{AppError, AppResult, SessionError};
use crate::protocol::{Envelope, Member, ParticipantId, RecorderId, SessionMessage};
use crate::transport::{Transport, TransportEvent};

use super::barrier::{BarrierFired, BarrierOutcome, BarrierScheduler, TransitionKind, schedule};
use super::hooks::SessionHooks;
use super::latency::LatencyMonitor;
use super::peers::{PeerRegistry, TimedValue};
use super::settings::SessionSettings;
use super::snapshot::{PeerSnapshot, SessionSnapshot};
use super::state::{Phase, SessionState};

/// Last live values this client gossiped.
#[derive(Debug, Default)]
struct GossipState {
    preview: Option<TimedValue>,
    visible: BTreeSet<ParticipantId>,
}

/// One client's view of the session and the handlers that drive it.
///
/// Every mutation happens through `&mut self` on the runner task. Wait tasks
/// and fetch tasks only report back over channels.
pub struct SessionProtocol {
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    transport: Box<dyn Transport>,
    hooks: Box<dyn SessionHooks>,
    state: SessionState,
    peers: PeerRegistry,
    downloads: DownloadCoordinator,
    barriers: BarrierScheduler,
    latency: LatencyMonitor,
    gossip: GossipState,
}

impl SessionProtocol {
    /// Builds the protocol for a joined room. `members` is the roster
    /// received on join.
    #[must_use]
    pub fn new(
        settings: SessionSettings,
        clock: Arc<dyn Clock>,
        transport: Box<dyn Transport>,
        members: &[Member],
        hooks: Box<dyn SessionHooks>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<BarrierFired>) {
        let (barriers, barrier_rx) = BarrierScheduler::new(Arc::clone(&clock), settings.barrier_poll);
        let downloads = DownloadCoordinator::new(fetcher, settings.cache_dir.clone(), settings.retry);
        let mut peers = PeerRegistry::default();
        for member in members {
            peers.seat(member);
        }
        let state = SessionState::new(settings.recorder_id);
        (
            Self {
                settings,
                clock,
                transport,
                hooks,
                state,
                peers,
                downloads,
                barriers,
                latency: LatencyMonitor::default(),
                gossip: GossipState::default(),
            },
            barrier_rx,
        )
    }

    #[must_use]
    pub fn participant_id(&self) -> ParticipantId {
        self.transport.participant_id()
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.state.phase
    }

    #[must_use]
    pub const fn recorder_id(&self) -> RecorderId {
        self.state.recorder_id
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.state.paused
    }

    #[must_use]
    pub const fn selected_server(&self) -> usize {
        self.state.selected_server
    }

    #[must_use]
    pub const fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    #[must_use]
    pub const fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Every member reported done and the local artifacts are complete.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.peers.snapshot_ready() && self.downloads.is_complete()
    }

    /// Local replay position in seconds.
    #[must_use]
    pub fn replay_time(&self) -> Option<f64> {
        self.state.replay_clock.position(Instant::now())
    }

    /// Position to show for `peer` in a preview portal.
    #[must_use]
    pub fn portal_time(&self, peer: ParticipantId) -> Option<f64> {
        self.peers
            .get(peer)
            .and_then(|state| state.portal_time_at(Instant::now()))
    }

    /// Applies an inbound transport event.
    ///
    /// # Errors
    ///
    /// Returns the disconnect error when the room connection is lost, or a
    /// broadcast failure while reacting to the event.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> AppResult<()> {
        match event {
            TransportEvent::Delivered(envelope) => self.handle_envelope(envelope),
            TransportEvent::MemberJoined(member) => {
                info!("{} ({}) joined the room", member.name, member.participant_id);
                self.peers.seat(&member);
                self.gossip.visible.clear();
                Ok(())
            }
            TransportEvent::MemberLeft(participant_id) => {
                if let Some(peer) = self.peers.remove(participant_id) {
                    info!(
                        "{} ({}) left the room",
                        peer.name().unwrap_or("participant"),
                        participant_id
                    );
                }
                self.gossip.visible.remove(&participant_id);
                self.check_readiness()
            }
            TransportEvent::Disconnected(err) => Err(err),
        }
    }

    /// Dispatches one delivered session message.
    ///
    /// Messages stamped with another recorder id are dropped before any
    /// handler runs.
    ///
    /// # Errors
    ///
    /// Returns an error when a reaction cannot be broadcast.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> AppResult<()> {
        let Envelope { sender, message } = envelope;
        let current = self.state.recorder_id;
        if let Some(foreign) = message.recorder_id().filter(|id| *id != current) {
            debug!(
                "Dropping {} from {} for session {} (current {})",
                message.kind(),
                sender,
                foreign,
                current
            );
            return Ok(());
        }

        match message {
            SessionMessage::PrepareRecording { recorder_id } => {
                self.on_prepare_recording(recorder_id);
                Ok(())
            }
            SessionMessage::StartRecording {
                target,
                recorder_id,
            } => {
                self.barriers
                    .arm(TransitionKind::StartRecording, target, recorder_id);
                Ok(())
            }
            SessionMessage::EndRecording {
                target,
                recorder_id,
            } => {
                self.barriers
                    .arm(TransitionKind::EndRecording, target, recorder_id);
                Ok(())
            }
            SessionMessage::StartReplay {
                target,
                recorder_id,
            } => {
                if self.state.phase == Phase::PreparingReplay {
                    self.state.start_replay_sent = true;
                }
                self.barriers
                    .arm(TransitionKind::StartReplay, target, recorder_id);
                Ok(())
            }
            SessionMessage::EndReplay {
                target,
                recorder_id,
            } => {
                self.barriers.arm(TransitionKind::EndReplay, target, recorder_id);
                Ok(())
            }
            SessionMessage::StartDownload { replay_file, .. } => {
                self.on_start_download(&replay_file);
                self.check_readiness()
            }
            SessionMessage::UpdateDownloadStatus { download_done, .. } => {
                if self.state.phase != Phase::PreparingReplay {
                    return Ok(());
                }
                self.peers.upsert(sender).set_download_done(download_done);
                self.check_readiness()
            }
            SessionMessage::TogglePlayPause { paused, .. } => {
                self.on_toggle_pause(paused);
                Ok(())
            }
            SessionMessage::UpdateUserReplayTime { time, .. } => {
                self.peers.upsert(sender).set_replay_time(time, Instant::now());
                Ok(())
            }
            SessionMessage::UpdateUserPreviewTime { time, .. } => {
                self.peers
                    .upsert(sender)
                    .set_preview_time(time, Instant::now());
                Ok(())
            }
            SessionMessage::UpdateUserAudioLevel { level, .. } => {
                self.peers.upsert(sender).set_audio_level(level);
                Ok(())
            }
            SessionMessage::UpdateUserVisibility {
                target_peer,
                visible,
                ..
            } => {
                self.peers.set_visibility(sender, target_peer, visible);
                Ok(())
            }
            SessionMessage::SwitchSelectedServer { server_index, .. } => {
                self.on_switch_server(server_index);
                Ok(())
            }
            SessionMessage::RoundTrip { send_instant } => {
                if sender == self.participant_id() {
                    self.latency.observe(send_instant, self.clock.now());
                }
                Ok(())
            }
        }
    }

    /// Applies a barrier whose target instant arrived.
    ///
    /// Firings for another session, from a cancelled wait, or whose
    /// predecessor phase no longer holds are dropped.
    pub fn handle_barrier(&mut self, fired: BarrierFired) {
        if !self.barriers.complete(&fired) {
            debug!("Ignoring stale {} firing for {}", fired.kind, fired.target);
            return;
        }
        if fired.recorder_id != self.state.recorder_id {
            debug!(
                "Ignoring {} for session {} (current {})",
                fired.kind, fired.recorder_id, self.state.recorder_id
            );
            return;
        }
        if !fired.kind.accepts(self.state.phase) {
            debug!(
                "Ignoring {} while {}",
                fired.kind, self.state.phase
            );
            return;
        }
        if fired.kind == TransitionKind::StartReplay && !self.downloads.is_complete() {
            warn!("Ignoring start_replay: local artifacts are incomplete");
            return;
        }
        if let BarrierOutcome::Late { by_ms } = fired.outcome {
            warn!(
                "guard interval exceeded by {}ms for {}; applying now",
                by_ms, fired.kind
            );
        }

        let recorder_id = self.state.recorder_id;
        match fired.kind {
            TransitionKind::StartRecording => {
                self.state.phase = Phase::Recording;
                self.hooks.start_recording(recorder_id);
            }
            TransitionKind::EndRecording => {
                self.hooks.stop_recording(recorder_id);
                self.return_to_idle();
            }
            TransitionKind::StartReplay => {
                let now = Instant::now();
                self.state.phase = Phase::Replaying;
                self.state.replay_clock.start(now);
                if self.state.paused {
                    self.state.replay_clock.pause(now);
                }
                let file = self.state.replay_file.clone().unwrap_or_default();
                self.hooks.start_replay(&file);
            }
            TransitionKind::EndReplay => {
                if self.state.phase == Phase::Replaying {
                    self.hooks.stop_replay();
                }
                self.return_to_idle();
            }
        }
        info!(
            "{} at {} (target {}) -> {}",
            fired.kind, fired.fired_at, fired.target, self.state.phase
        );
    }

    /// Periodic work: download polling and readiness while preparing a
    /// replay, live-state gossip while replaying or previewing.
    ///
    /// # Errors
    ///
    /// Returns an error when a broadcast fails.
    pub fn tick(&mut self) -> AppResult<()> {
        match self.state.phase {
            Phase::PreparingReplay => {
                let still_downloading = self.downloads.poll_and_retry_failed();
                let download_done = !still_downloading && self.downloads.is_complete();
                self.broadcast(SessionMessage::UpdateDownloadStatus {
                    download_done,
                    recorder_id: self.state.recorder_id,
                })?;
                self.check_readiness()?;
            }
            Phase::Replaying => self.gossip_replay_state()?,
            Phase::Idle | Phase::PreparingRecord | Phase::Recording => {}
        }
        self.gossip_preview()
    }

    /// # Errors
    ///
    /// Returns an error outside `Idle` or when the broadcast fails.
    pub fn request_prepare_recording(&mut self) -> AppResult<()> {
        self.require_phase("prepare recording", &[Phase::Idle])?;
        self.broadcast(SessionMessage::PrepareRecording {
            recorder_id: self.state.recorder_id,
        })
    }

    /// # Errors
    ///
    /// Returns an error outside `PreparingRecord` or when the broadcast fails.
    pub fn request_start_recording(&mut self) -> AppResult<()> {
        self.require_phase("start recording", &[Phase::PreparingRecord])?;
        let target = schedule(self.clock.as_ref(), self.settings.guard_interval);
        self.broadcast(SessionMessage::StartRecording {
            target,
            recorder_id: self.state.recorder_id,
        })
    }

    /// # Errors
    ///
    /// Returns an error outside `Recording` or when the broadcast fails.
    pub fn request_end_recording(&mut self) -> AppResult<()> {
        self.require_phase("end recording", &[Phase::Recording])?;
        let target = schedule(self.clock.as_ref(), self.settings.guard_interval);
        self.broadcast(SessionMessage::EndRecording {
            target,
            recorder_id: self.state.recorder_id,
        })
    }

    /// # Errors
    ///
    /// Returns an error outside `Idle`, for an invalid replay name, without
    /// configured servers, or when the broadcast fails.
    pub fn request_start_download(&mut self, replay_file: &str) -> AppResult<()> {
        self.require_phase("start download", &[Phase::Idle])?;
        validate_replay_name(replay_file)?;
        self.selected_server_url()?;
        self.broadcast(SessionMessage::StartDownload {
            replay_file: replay_file.to_owned(),
            recorder_id: self.state.recorder_id,
        })
    }

    /// Ends the replay, or abandons it while artifacts are still downloading.
    ///
    /// # Errors
    ///
    /// Returns an error when no replay is active or the broadcast fails.
    pub fn request_end_replay(&mut self) -> AppResult<()> {
        self.require_phase("end replay", &[Phase::Replaying, Phase::PreparingReplay])?;
        let target = schedule(self.clock.as_ref(), self.settings.guard_interval);
        self.broadcast(SessionMessage::EndReplay {
            target,
            recorder_id: self.state.recorder_id,
        })
    }

    /// # Errors
    ///
    /// Returns an error while `Idle` or when the broadcast fails.
    pub fn request_set_paused(&mut self, paused: bool) -> AppResult<()> {
        if self.state.phase.is_idle() {
            return Err(AppError::session(SessionError::InvalidPhase {
                action: if paused { "pause" } else { "resume" },
                phase: self.state.phase.as_str(),
            }));
        }
        self.broadcast(SessionMessage::TogglePlayPause {
            paused,
            recorder_id: self.state.recorder_id,
        })
    }

    /// # Errors
    ///
    /// Returns an error for an index outside the configured servers or when
    /// the broadcast fails.
    pub fn request_switch_server(&mut self, server_index: usize) -> AppResult<()> {
        if server_index >= self.settings.servers.len() {
            return Err(AppError::session(SessionError::ServerIndexOutOfRange {
                index: server_index,
                count: self.settings.servers.len(),
            }));
        }
        self.broadcast(SessionMessage::SwitchSelectedServer {
            server_index,
            recorder_id: self.state.recorder_id,
        })
    }

    /// Sends a round-trip message; the result is logged when our own echo
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when the broadcast fails.
    pub fn measure_round_trip(&mut self) -> AppResult<()> {
        let send_instant = self.clock.now();
        self.broadcast(SessionMessage::RoundTrip { send_instant })?;
        self.latency.sent(send_instant);
        Ok(())
    }

    /// Switches this client to another session. Only allowed while `Idle`.
    ///
    /// # Errors
    ///
    /// Returns an error when a session is in progress.
    pub fn select_session(&mut self, recorder_id: RecorderId) -> AppResult<()> {
        if !self.state.phase.is_idle() {
            return Err(AppError::session(SessionError::SessionBusy {
                requested: recorder_id.get(),
                current: self.state.recorder_id.get(),
                phase: self.state.phase.as_str(),
            }));
        }
        if recorder_id != self.state.recorder_id {
            info!("Session {} -> {}", self.state.recorder_id, recorder_id);
            self.barriers.cancel_all();
            self.state.recorder_id = recorder_id;
            self.state.reset_session_scope();
            self.peers.clear_download_flags();
        }
        Ok(())
    }

    /// Starts gossiping a local preview position, or stops with `None`.
    pub fn set_preview_time(&mut self, seconds: Option<f64>) {
        self.gossip.preview = seconds.map(|value| TimedValue::new(value, Instant::now()));
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        let peers = self
            .peers
            .iter()
            .map(|(participant_id, peer)| PeerSnapshot {
                participant_id,
                name: peer.name().map(str::to_owned),
                replay_time: peer.replay_time_at(now),
                preview_time: peer.preview_time_at(now),
                portal_time: peer.portal_time_at(now),
                audio_level: peer.audio_level(),
                visible_to: peer.visible_to().iter().copied().collect(),
                download_done: peer.download_done(),
            })
            .collect();
        SessionSnapshot {
            participant_id: Some(self.participant_id()),
            phase: self.state.phase,
            recorder_id: self.state.recorder_id,
            paused: self.state.paused,
            selected_server: self.state.selected_server,
            replay_file: self.state.replay_file.clone(),
            replay_time: self.state.replay_clock.position(now),
            preview_time: self.gossip.preview.map(|preview| preview.extrapolate(now)),
            artifacts_downloaded: self.downloads.downloaded_count(),
            all_ready: self.all_ready(),
            round_trip: self.latency.last(),
            peers,
        }
    }

    /// Stops local effects and drops all session-scoped work.
    pub fn shutdown(&mut self) {
        let recorder_id = self.state.recorder_id;
        match self.state.phase {
            Phase::Recording => self.hooks.stop_recording(recorder_id),
            Phase::Replaying => self.hooks.stop_replay(),
            Phase::Idle | Phase::PreparingRecord | Phase::PreparingReplay => {}
        }
        if !self.state.phase.is_idle() {
            self.return_to_idle();
        }
        self.barriers.cancel_all();
        self.downloads.cancel();
    }

    fn on_prepare_recording(&mut self, recorder_id: RecorderId) {
        if self.state.phase != Phase::Idle {
            debug!("Ignoring prepare_recording while {}", self.state.phase);
            return;
        }
        self.state.phase = Phase::PreparingRecord;
        self.hooks.arm_recording(recorder_id);
        info!("Session {} preparing to record", recorder_id);
    }

    fn on_start_download(&mut self, replay_file: &str) {
        if self.state.phase != Phase::Idle {
            debug!("Ignoring start_download while {}", self.state.phase);
            return;
        }
        let server = match self.selected_server_url() {
            Ok(server) => server,
            Err(err) => {
                error!("Cannot download '{}': {}", replay_file, err);
                return;
            }
        };
        if let Err(err) = self.downloads.begin(server, replay_file) {
            error!("Cannot download '{}': {}", replay_file, err);
            return;
        }
        self.peers.clear_download_flags();
        self.state.phase = Phase::PreparingReplay;
        self.state.replay_file = Some(replay_file.to_owned());
        self.state.start_replay_sent = false;
        info!("Preparing replay of '{}'", replay_file);
    }

    fn on_toggle_pause(&mut self, paused: bool) {
        if self.state.phase.is_idle() || self.state.paused == paused {
            return;
        }
        let now = Instant::now();
        self.state.paused = paused;
        if paused {
            self.state.replay_clock.pause(now);
        } else {
            self.state.replay_clock.resume(now);
        }
        self.hooks.set_paused(paused);
    }

    fn on_switch_server(&mut self, server_index: usize) {
        let Some(server) = self.settings.servers.get(server_index).cloned() else {
            warn!(
                "Ignoring switch to server #{} ({} configured)",
                server_index,
                self.settings.servers.len()
            );
            return;
        };
        self.state.selected_server = server_index;
        info!("Selected artifact server #{} ({})", server_index, server);
        self.downloads.switch_server(server);
    }

    /// Broadcasts `StartReplay` once everyone is ready.
    ///
    /// Every member sees the same delivery order and therefore observes
    /// readiness on the same message; only the lowest seated participant
    /// initiates. A `StartReplay` seen from anyone also counts as sent.
    fn check_readiness(&mut self) -> AppResult<()> {
        if self.state.phase != Phase::PreparingReplay
            || self.state.start_replay_sent
            || self.peers.leader() != Some(self.participant_id())
            || !self.all_ready()
        {
            return Ok(());
        }
        self.state.start_replay_sent = true;
        let target = schedule(self.clock.as_ref(), self.settings.guard_interval);
        info!(
            "All {} member(s) ready; starting replay at {}",
            self.peers.len(),
            target
        );
        self.broadcast(SessionMessage::StartReplay {
            target,
            recorder_id: self.state.recorder_id,
        })
    }

    fn gossip_replay_state(&mut self) -> AppResult<()> {
        let recorder_id = self.state.recorder_id;
        if let Some(time) = self.replay_time() {
            self.broadcast(SessionMessage::UpdateUserReplayTime { time, recorder_id })?;
        }
        self.broadcast(SessionMessage::UpdateUserAudioLevel {
            level: self.hooks.audio_level(),
            recorder_id,
        })?;

        let visible = self.hooks.visible_peers();
        let changes: Vec<(ParticipantId, bool)> = visible
            .difference(&self.gossip.visible)
            .map(|peer| (*peer, true))
            .chain(
                self.gossip
                    .visible
                    .difference(&visible)
                    .map(|peer| (*peer, false)),
            )
            .collect();
        for (target_peer, now_visible) in changes {
            self.broadcast(SessionMessage::UpdateUserVisibility {
                target_peer,
                visible: now_visible,
                recorder_id,
            })?;
        }
        self.gossip.visible = visible;
        Ok(())
    }

    fn gossip_preview(&self) -> AppResult<()> {
        let Some(preview) = self.gossip.preview else {
            return Ok(());
        };
        self.broadcast(SessionMessage::UpdateUserPreviewTime {
            time: preview.extrapolate(Instant::now()),
            recorder_id: self.state.recorder_id,
        })
    }

    fn return_to_idle(&mut self) {
        self.barriers.cancel_all();
        self.downloads.cancel();
        self.peers.clear_download_flags();
        self.gossip.visible.clear();
        self.state.reset_session_scope();
    }

    fn selected_server_url(&self) -> AppResult<Url> {
        if self.settings.servers.is_empty() {
            return Err(AppError::session(SessionError::NoServers));
        }
        self.settings
            .servers
            .get(self.state.selected_server)
            .cloned()
            .ok_or(AppError::Session(SessionError::ServerIndexOutOfRange {
                index: self.state.selected_server,
                count: self.settings.servers.len(),
            }))
    }

    fn require_phase(&self, action: &'static str, allowed: &[Phase]) -> AppResult<()> {
        if allowed.contains(&self.state.phase) {
            return Ok(());
        }
        Err(AppError::session(SessionError::InvalidPhase {
            action,
            phase: self.state.phase.as_str(),
        }))
    }

    fn broadcast(&self, message: SessionMessage) -> AppResult<()> {
        debug!("Broadcasting {}", message.kind());
        self.transport.broadcast(message)
    }
}
